//! テキストフレーズテーブル行のパーサ
//!
//! サポートするすべての形式のフレーズテーブル行を解析します。
//! 行形式は次のとおりです:
//!
//! ```text
//! 原言語フレーズ ||| 目的言語フレーズ ||| n個の浮動小数点数 [名前=値 ...] [||| m個の浮動小数点数]
//! ```
//!
//! 3列目は前半が逆方向確率、後半が順方向確率です。3列目の末尾には
//! `名前=値`形式の名前付きフィールドを置けます。4列目は方向に分解
//! されないスコア列です。列数は最初のデータ行で確定し、以降の行で
//! 一致しない場合は致命的なフォーマットエラーになります。

use crate::common::PHRASE_SEP;
use crate::errors::{Result, TaiyakuError};

/// 1行を3〜4列に分割した結果
pub struct SplitLine<'a> {
    /// 原言語フレーズ
    pub src: &'a str,
    /// 目的言語フレーズ
    pub tgt: &'a str,
    /// スコア列（3列目）
    pub third: &'a str,
    /// 方向なしスコア列（4列目）。存在しない場合は`None`。
    pub fourth: Option<&'a str>,
}

/// フレーズテーブル行のパーサ
///
/// ファイルごとに1つ作り、行を順に与えます。最初のデータ行で列数を
/// 確定し、以降の行の検証に使います。エラーメッセージのために
/// ファイル名と行番号を保持します。
pub struct EntryParser {
    file: String,
    lineno: usize,
    third_count: Option<usize>,
    fourth_count: Option<usize>,
    nonfinite_count: usize,
}

impl EntryParser {
    /// 新しいパーサを作成します。
    ///
    /// # 引数
    ///
    /// * `file` - エラーメッセージに使う入力ファイル名
    pub fn new(file: &str) -> Self {
        Self {
            file: file.to_string(),
            lineno: 0,
            third_count: None,
            fourth_count: None,
            nonfinite_count: 0,
        }
    }

    /// 現在の行番号を返します。
    #[inline(always)]
    pub fn lineno(&self) -> usize {
        self.lineno
    }

    /// 3列目の数値フィールド数を返します。最初のデータ行の前は0です。
    #[inline(always)]
    pub fn third_count(&self) -> usize {
        self.third_count.unwrap_or(0)
    }

    /// 4列目の数値フィールド数を返します。
    #[inline(always)]
    pub fn fourth_count(&self) -> usize {
        self.fourth_count.unwrap_or(0)
    }

    /// 非有限値として0に置き換えた値の数を返します。
    #[inline(always)]
    pub fn nonfinite_count(&self) -> usize {
        self.nonfinite_count
    }

    /// 1行を列に分割します。
    ///
    /// # エラー
    ///
    /// ` ||| `区切りが2つ未満の場合、または原言語・目的言語フレーズが
    /// 空の場合にエラーを返します。
    pub fn split_line<'a>(&mut self, line: &'a str) -> Result<SplitLine<'a>> {
        self.lineno += 1;
        let Some((src, rest)) = line.split_once(PHRASE_SEP) else {
            return Err(self.format_error("bad format, expected two ||| separators"));
        };
        let Some((tgt, rest)) = rest.split_once(PHRASE_SEP) else {
            return Err(self.format_error("bad format, expected two ||| separators"));
        };
        let (third, fourth) = match rest.split_once(PHRASE_SEP) {
            Some((third, fourth)) => (third.trim(), Some(fourth.trim())),
            None => (rest.trim(), None),
        };
        let src = src.trim();
        let tgt = tgt.trim();
        if src.is_empty() {
            return Err(self.format_error("empty source phrase"));
        }
        if tgt.is_empty() {
            return Err(self.format_error("empty target phrase"));
        }
        Ok(SplitLine {
            src,
            tgt,
            third,
            fourth,
        })
    }

    /// 3列目を数値列に解析します。
    ///
    /// 末尾の`名前=値`フィールドは`handler`に渡されます。最初の呼び出しで
    /// 数値フィールド数が確定し、以降の行では一致が検証されます。
    ///
    /// # 引数
    ///
    /// * `third` - 3列目の文字列
    /// * `handler` - 名前付きフィールドを処理するコールバック
    pub fn parse_third<H>(&mut self, third: &str, mut handler: H) -> Result<Vec<f32>>
    where
        H: FnMut(&str, &str),
    {
        let mut tokens: Vec<&str> = third.split_whitespace().collect();
        match self.third_count {
            Some(expected) => {
                while tokens.len() > expected {
                    let token = *tokens.last().unwrap();
                    let Some((name, value)) = token.split_once('=') else {
                        return Err(self.format_error(format!(
                            "bad extra field ({}) in 3rd column",
                            token
                        )));
                    };
                    self.check_named_field(name, value)?;
                    handler(name, value);
                    tokens.pop();
                }
                if tokens.len() != expected {
                    return Err(self.format_error(format!(
                        "wrong number of 3rd column fields ({} instead of {})",
                        tokens.len(),
                        expected
                    )));
                }
            }
            None => {
                while let Some(token) = tokens.last() {
                    let Some((name, value)) = token.split_once('=') else {
                        break;
                    };
                    self.check_named_field(name, value)?;
                    handler(name, value);
                    tokens.pop();
                }
                self.third_count = Some(tokens.len());
            }
        }
        self.parse_numbers(&tokens)
    }

    /// 4列目を数値列に解析します。
    ///
    /// 列数は最初の行で確定し、以降の行では一致が検証されます。
    pub fn parse_fourth(&mut self, fourth: Option<&str>) -> Result<Vec<f32>> {
        let tokens: Vec<&str> = fourth
            .map(|f| f.split_whitespace().collect())
            .unwrap_or_default();
        match self.fourth_count {
            Some(expected) => {
                if tokens.len() != expected {
                    return Err(self.format_error(format!(
                        "wrong number of 4th column fields ({} instead of {})",
                        tokens.len(),
                        expected
                    )));
                }
            }
            None => {
                self.fourth_count = Some(tokens.len());
            }
        }
        self.parse_numbers(&tokens)
    }

    fn check_named_field(&self, name: &str, value: &str) -> Result<()> {
        if name.is_empty() || value.is_empty() {
            return Err(self.format_error(
                "empty name or value is not allowed in phrase table named fields",
            ));
        }
        Ok(())
    }

    fn parse_numbers(&mut self, tokens: &[&str]) -> Result<Vec<f32>> {
        let mut values = Vec::with_capacity(tokens.len());
        for token in tokens {
            let value: f32 = token.parse().map_err(|_| {
                self.format_error(format!("invalid number format ({})", token))
            })?;
            if value.is_finite() {
                values.push(value);
            } else {
                self.nonfinite_count += 1;
                values.push(0.0);
            }
        }
        Ok(values)
    }

    fn format_error<S: Into<String>>(&self, msg: S) -> TaiyakuError {
        TaiyakuError::invalid_format(
            self.file.clone(),
            format!("{} at line {}", msg.into(), self.lineno),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_line() {
        let mut parser = EntryParser::new("test");
        let line = parser.split_line("le chat ||| the cat ||| 0.5 0.5").unwrap();
        assert_eq!(line.src, "le chat");
        assert_eq!(line.tgt, "the cat");
        assert_eq!(line.third, "0.5 0.5");
        assert_eq!(line.fourth, None);
    }

    #[test]
    fn test_split_line_with_fourth_column() {
        let mut parser = EntryParser::new("test");
        let line = parser
            .split_line("le chat ||| the cat ||| 0.5 0.5 ||| 0.25")
            .unwrap();
        assert_eq!(line.third, "0.5 0.5");
        assert_eq!(line.fourth, Some("0.25"));
    }

    #[test]
    fn test_missing_separator_is_fatal() {
        let mut parser = EntryParser::new("test");
        assert!(parser.split_line("le chat ||| the cat").is_err());
        assert!(parser.split_line("le chat the cat").is_err());
    }

    #[test]
    fn test_empty_source_is_fatal() {
        let mut parser = EntryParser::new("test");
        assert!(parser.split_line(" ||| the cat ||| 0.5").is_err());
    }

    #[test]
    fn test_parse_third_with_named_fields() {
        let mut parser = EntryParser::new("test");
        let mut fields = vec![];
        let values = parser
            .parse_third("0.5 0.25 a=0_1 c=3,1", |name, value| {
                fields.push((name.to_string(), value.to_string()));
            })
            .unwrap();
        assert_eq!(values, vec![0.5, 0.25]);
        assert_eq!(
            fields,
            vec![("c".to_string(), "3,1".to_string()), ("a".to_string(), "0_1".to_string())],
        );
        assert_eq!(parser.third_count(), 2);
    }

    #[test]
    fn test_column_count_mismatch_is_fatal() {
        let mut parser = EntryParser::new("test");
        parser.parse_third("0.5 0.5", |_, _| {}).unwrap();
        assert!(parser.parse_third("0.5", |_, _| {}).is_err());
        assert!(parser.parse_third("0.5 0.5 0.5", |_, _| {}).is_err());
    }

    #[test]
    fn test_invalid_number_is_fatal() {
        let mut parser = EntryParser::new("test");
        assert!(parser.parse_third("0.5 abc", |_, _| {}).is_err());
    }

    #[test]
    fn test_nonfinite_becomes_zero_with_count() {
        let mut parser = EntryParser::new("test");
        let values = parser.parse_third("inf 0.5", |_, _| {}).unwrap();
        assert_eq!(values, vec![0.0, 0.5]);
        assert_eq!(parser.nonfinite_count(), 1);
    }

    #[test]
    fn test_fourth_count_fixed_by_first_line() {
        let mut parser = EntryParser::new("test");
        assert_eq!(parser.parse_fourth(Some("0.5 0.5")).unwrap().len(), 2);
        assert!(parser.parse_fourth(Some("0.5")).is_err());
        assert!(parser.parse_fourth(None).is_err());
    }
}
