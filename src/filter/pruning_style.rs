//! 枝刈りスタイル
//!
//! 原言語フレーズの単語数から、その葉に許される目的言語フレーズ数の
//! 上限Lへの純関数です。設定層からは記述子文字列で渡されます:
//!
//! - `"30"` — 定数制限30
//! - `"10w"` — 単語数に比例した制限（10 × 単語数）

use std::fmt;

use crate::errors::{Result, TaiyakuError};

/// 原言語フレーズの単語数から制限Lへの写像
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PruningStyle {
    /// 単語数によらない定数制限
    Constant(usize),
    /// 単語数に比例した制限
    PerWord(usize),
}

impl PruningStyle {
    /// 記述子文字列から枝刈りスタイルを解析します。
    ///
    /// # エラー
    ///
    /// 記述子が整数でも`<整数>w`でもない場合にエラーを返します。
    pub fn from_descriptor(descriptor: &str) -> Result<Self> {
        let descriptor = descriptor.trim();
        let (digits, per_word) = match descriptor.strip_suffix('w') {
            Some(digits) => (digits, true),
            None => (descriptor, false),
        };
        let value: usize = digits.parse().map_err(|_| {
            TaiyakuError::invalid_argument(
                "descriptor",
                format!(
                    "unsupported pruning style {:?}; expected an integer or <integer>w",
                    descriptor
                ),
            )
        })?;
        if per_word {
            Ok(Self::PerWord(value))
        } else {
            Ok(Self::Constant(value))
        }
    }

    /// 単語数に対する制限Lを返します。
    #[inline(always)]
    pub fn apply(&self, word_count: usize) -> usize {
        match self {
            Self::Constant(limit) => *limit,
            Self::PerWord(per_word) => per_word * word_count,
        }
    }
}

impl fmt::Display for PruningStyle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Constant(limit) => write!(f, "{}", limit),
            Self::PerWord(per_word) => write!(f, "{}w", per_word),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant() {
        let style = PruningStyle::from_descriptor("30").unwrap();
        assert_eq!(style, PruningStyle::Constant(30));
        assert_eq!(style.apply(1), 30);
        assert_eq!(style.apply(7), 30);
    }

    #[test]
    fn test_per_word() {
        let style = PruningStyle::from_descriptor("10w").unwrap();
        assert_eq!(style, PruningStyle::PerWord(10));
        assert_eq!(style.apply(1), 10);
        assert_eq!(style.apply(3), 30);
    }

    #[test]
    fn test_invalid_descriptor_is_fatal() {
        assert!(PruningStyle::from_descriptor("lots").is_err());
        assert!(PruningStyle::from_descriptor("w").is_err());
        assert!(PruningStyle::from_descriptor("").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for descriptor in ["30", "10w"] {
            let style = PruningStyle::from_descriptor(descriptor).unwrap();
            assert_eq!(style.to_string(), descriptor);
        }
    }
}
