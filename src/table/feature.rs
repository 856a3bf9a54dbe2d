//! フレーズテーブル素性の標準化インターフェース
//!
//! このモジュールは、形式の異なるフレーズテーブルをデコーダ素性として
//! 統一的に問い合わせるための抽象インターフェースと、テキスト形式の
//! テーブルをインメモリ部品として読み込む実装を提供します。
//!
//! 注意: [`PhraseTableFeature::find`]はテーブルに格納されたままの
//! 線形確率を返します。対数変換はコアテーブルへのマージ時
//! （[`crate::table::PhraseTable::lookup_span`]）に行われます。

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::Range;
use std::path::Path;

use crate::annotation::count::CountAnnotation;
use crate::annotation::{alignment, count};
use crate::errors::{Result, TaiyakuError};
use crate::phrase::CompactPhrase;
use crate::table::entry::EntryParser;
use crate::table::score::TargetPhraseTable;
use crate::trie::PhraseTrie;
use crate::vocab::Vocabulary;

/// フレーズテーブルをデコーダ素性として問い合わせる抽象インターフェース
///
/// 実装はそれぞれのストレージ形式（インメモリのテキストテーブル、
/// メモリマップされた事前構築インデックス、混合テーブル）を隠蔽します。
pub trait PhraseTableFeature {
    /// モデル名（通常はファイルパス）を返します。
    fn model_name(&self) -> &str;

    /// 逆方向・順方向モデルの数（3列目スコア数の半分）を返します。
    fn num_models(&self) -> usize;

    /// 方向なし（4列目）スコアの数を返します。
    fn num_adir(&self) -> usize;

    /// カウント値（`c=`）の数を返します。
    fn num_counts(&self) -> usize {
        0
    }

    /// アライメント（`a=`）が格納されているかどうかを返します。
    fn has_alignments(&self) -> bool {
        false
    }

    /// 次の問い合わせ群のための原文を設定します。
    fn new_src_sent(&mut self, sentence: &[String]);

    /// この素性とサブモデルが保持するキャッシュをすべて消去します。
    fn clear_cache(&mut self) {}

    /// 原言語フレーズを検索し、その目的言語フレーズとスコアを返します。
    ///
    /// # 引数
    ///
    /// * `range` - 直前に設定された原文の中での問い合わせ範囲
    /// * `vocab` - 目的言語フレーズの符号化に使う共有語彙
    ///
    /// # 戻り値
    ///
    /// 目的言語フレーズのテーブル。スコアは線形確率です。
    fn find(&mut self, range: Range<usize>, vocab: &mut Vocabulary) -> TargetPhraseTable;
}

/// テキスト形式のテーブルをインメモリで保持する素性
///
/// 混合テーブルの構成要素などで、テキスト形式の多確率テーブルを
/// 素性インターフェースの背後で使うための実装です。コアテーブルと
/// 異なり、スコアはファイルに書かれたままの線形確率で保持します。
pub struct TextTableFeature {
    model_name: String,
    table: PhraseTrie<TargetPhraseTable>,
    num_models: usize,
    num_adir: usize,
    num_counts: usize,
    has_alignments: bool,
    src_sent: Vec<String>,
}

impl TextTableFeature {
    /// テキスト形式の多確率テーブルを読み込みます。
    ///
    /// # 引数
    ///
    /// * `path` - テーブルファイルへのパス
    /// * `vocab` - 共有語彙
    ///
    /// # エラー
    ///
    /// ファイルが開けない場合、または行形式が不正な場合にエラーを
    /// 返します。
    pub fn open<P: AsRef<Path>>(path: P, vocab: &mut Vocabulary) -> Result<Self> {
        let path = path.as_ref();
        let model_name = path.to_string_lossy().into_owned();
        let file = File::open(path).map_err(|e| {
            TaiyakuError::invalid_argument(
                "path",
                format!("Failed to open phrase table file {}: {}", model_name, e),
            )
        })?;

        let mut parser = EntryParser::new(&model_name);
        let mut table = PhraseTrie::new();
        let mut num_counts = 0;
        let mut has_alignments = false;

        let mut src_ids: Vec<u32> = vec![];
        let mut prev_src = String::new();
        let mut prev_leaf = None;
        let mut tgt_phrase = CompactPhrase::new();
        let mut duplicate_count = 0usize;

        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let split = parser.split_line(&line)?;

            if prev_leaf.is_none() || split.src != prev_src {
                prev_src.clear();
                prev_src.push_str(split.src);
                src_ids.clear();
                src_ids.extend(split.src.split_whitespace().map(|w| vocab.add(w)));
                prev_leaf = Some(table.get_or_insert_id_with(&src_ids, TargetPhraseTable::new)?);
            }
            let leaf = table.leaf_mut(prev_leaf.unwrap());

            tgt_phrase.clear();
            for word in split.tgt.split_whitespace() {
                tgt_phrase.push(vocab.add(word));
            }
            let record = leaf.get_or_insert(&tgt_phrase);

            let mut named = vec![];
            let values = parser.parse_third(split.third, |name, value| {
                named.push((name.to_string(), value.to_string()));
            })?;
            let count = values.len();
            if count == 0 || count % 2 != 0 {
                return Err(TaiyakuError::invalid_format(
                    model_name.clone(),
                    format!(
                        "multi-prob phrase table must have an even, nonzero number of \
                         probability figures, got {}",
                        count
                    ),
                ));
            }
            let adir = parser.parse_fourth(split.fourth)?;
            if record.backward.is_empty() {
                record.backward.extend_from_slice(&values[..count / 2]);
                record.forward.extend_from_slice(&values[count / 2..]);
                record.adir = adir;
            } else {
                // 同一ファイル内の重複ペアは最初の出現が勝つ
                duplicate_count += 1;
            }

            for (name, value) in named.iter().rev() {
                record.annotations.init_annotation(name, value);
                if name == count::NAME {
                    if let Some(counts) = CountAnnotation::get(&record.annotations) {
                        num_counts = num_counts.max(counts.joint_counts.len());
                    }
                } else if name == alignment::NAME {
                    has_alignments = true;
                }
            }
        }

        if parser.lineno() == 0 {
            log::warn!(
                "[taiyaku] No data lines found in multi-prob phrase table {}",
                model_name
            );
        }
        if duplicate_count > 0 {
            log::warn!(
                "[taiyaku] {} duplicate phrase pairs found in {} - keeping the first \
                 occurrence of each",
                duplicate_count,
                model_name
            );
        }
        if parser.nonfinite_count() > 0 {
            log::warn!(
                "[taiyaku] {} non-finite scores found in {} - replaced with 0",
                parser.nonfinite_count(),
                model_name
            );
        }

        Ok(Self {
            model_name,
            table,
            num_models: parser.third_count() / 2,
            num_adir: parser.fourth_count(),
            num_counts,
            has_alignments,
            src_sent: vec![],
        })
    }
}

impl PhraseTableFeature for TextTableFeature {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn num_models(&self) -> usize {
        self.num_models
    }

    fn num_adir(&self) -> usize {
        self.num_adir
    }

    fn num_counts(&self) -> usize {
        self.num_counts
    }

    fn has_alignments(&self) -> bool {
        self.has_alignments
    }

    fn new_src_sent(&mut self, sentence: &[String]) {
        self.src_sent = sentence.to_vec();
    }

    fn find(&mut self, range: Range<usize>, vocab: &mut Vocabulary) -> TargetPhraseTable {
        let Some(tokens) = self.src_sent.get(range) else {
            return TargetPhraseTable::new();
        };
        let mut ids = Vec::with_capacity(tokens.len());
        for token in tokens {
            let id = vocab.index(token);
            if id == vocab.size() {
                // 未知語を含むフレーズはどのテーブルにも存在しない
                return TargetPhraseTable::new();
            }
            ids.push(id);
        }
        self.table.get(&ids).cloned().unwrap_or_default()
    }
}
