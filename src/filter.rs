//! フレーズペアの枝刈り・フィルタリング
//!
//! このモジュールは、原言語フレーズごとの目的言語テーブルをサイズ予算
//! 以下に縮小するためのビジタを提供します。ビジタはトライの葉ごとに
//! 適用され、制限`L = 枝刈りスタイル(原言語フレーズの単語数)`を
//! 使います。
//!
//! - [`HardFilterVisitor`]: スコア上位ちょうどL件をヒープ抽出で残す
//! - [`SoftFilterVisitor`]: 支配関係に基づく動的計画法のソフトフィルタ。
//!   純粋な上位K件カットでは失われる、低頻度だが高品質なパレート最適
//!   エントリを保存します。
//!
//! どちらのビジタもフィルタ前後のサイズヒストグラムを蓄積し、
//! 非常に大きなファイルを1パスで処理するためのストリーミングモード
//! （[`filter_multi_prob_online`]）をサポートします。

pub mod hard;
pub mod pruning_style;
pub mod soft;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use crate::common::{stable_hash, LOG_ALMOST_0};
use crate::errors::{Result, TaiyakuError};
use crate::phrase::{phrase_to_string, CompactPhrase};
use crate::table::entry::EntryParser;
use crate::table::score::{ScoreRecord, TargetPhraseTable};
use crate::table::PruningType;
use crate::vocab::Vocabulary;

pub use hard::HardFilterVisitor;
pub use pruning_style::PruningStyle;
pub use soft::SoftFilterVisitor;

/// 葉フィルタリングビジタの共通インターフェース
///
/// [`crate::table::PhraseTable::prune`]から葉ごとに一度呼ばれます。
pub trait TargetTableVisitor {
    /// 1つの葉をその場でフィルタリングします。
    ///
    /// # 引数
    ///
    /// * `vocab` - 目的言語フレーズの文字列化に使う語彙
    /// * `src_word_count` - 原言語フレーズの単語数
    /// * `table` - フィルタリング対象の葉
    fn visit(&mut self, vocab: &Vocabulary, src_word_count: usize, table: &mut TargetPhraseTable);

    /// フィルタ前後のヒストグラムを表示します。
    fn display_stats(&self, out: &mut dyn Write) -> io::Result<()>;

    /// これまでに残したエントリの総数を返します。
    fn num_kept(&self) -> usize;
}

/// 葉サイズの単純なヒストグラム
pub struct SizeHistogram {
    bin_width: usize,
    bins: BTreeMap<usize, usize>,
    count: usize,
}

impl SizeHistogram {
    /// 新しいヒストグラムを作成します。
    pub fn new(bin_width: usize) -> Self {
        Self {
            bin_width: bin_width.max(1),
            bins: BTreeMap::new(),
            count: 0,
        }
    }

    /// 1つの観測値を追加します。
    pub fn add(&mut self, size: usize) {
        *self.bins.entry(size / self.bin_width).or_insert(0) += 1;
        self.count += 1;
    }

    /// 観測値の総数を返します。
    pub fn count(&self) -> usize {
        self.count
    }

    /// ビンごとの度数を表示します。
    pub fn display(&self, out: &mut dyn Write, indent: &str) -> io::Result<()> {
        for (bin, count) in &self.bins {
            writeln!(
                out,
                "{}[{}, {}): {}",
                indent,
                bin * self.bin_width,
                (bin + 1) * self.bin_width,
                count
            )?;
        }
        Ok(())
    }
}

/// ビジタ共通の統計
pub(crate) struct FilterStats {
    pub(crate) unfiltered: SizeHistogram,
    pub(crate) filtered: SizeHistogram,
    pub(crate) num_kept: usize,
}

impl FilterStats {
    pub(crate) fn new() -> Self {
        Self {
            unfiltered: SizeHistogram::new(300),
            filtered: SizeHistogram::new(30),
            num_kept: 0,
        }
    }

    pub(crate) fn display(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "Histogram before filtering")?;
        self.unfiltered.display(out, "  ")?;
        writeln!(out, "Histogram after filtering")?;
        self.filtered.display(out, "  ")
    }
}

/// フィルタリング用に前処理された1エントリ
///
/// スコアベクトルをモデル数までパディングした複製と、決定的な順序付けの
/// ためのフィルタリングスコア・タイブレークキーを保持します。
pub(crate) struct RankedPhrase {
    pub(crate) phrase: CompactPhrase,
    pub(crate) record: ScoreRecord,
    /// モデル数までパディングされた順方向対数確率
    pub(crate) forward: Vec<f32>,
    /// モデル数までパディングされた逆方向対数確率
    pub(crate) backward: Vec<f32>,
    /// 枝刈りモードに応じたフィルタリングスコア
    pub(crate) score: f64,
    pub(crate) backward_sum: f64,
    pub(crate) hash: u32,
    pub(crate) tgt: String,
}

impl RankedPhrase {
    pub(crate) fn new(
        vocab: &Vocabulary,
        phrase: CompactPhrase,
        record: ScoreRecord,
        num_models: usize,
        log_almost_0: f32,
        pruning_type: PruningType,
    ) -> Self {
        let mut forward = record.forward.clone();
        forward.resize(num_models.max(forward.len()), log_almost_0);
        let mut backward = record.backward.clone();
        backward.resize(num_models.max(backward.len()), log_almost_0);

        let forward_sum: f64 = forward.iter().map(|v| f64::from(*v)).sum();
        let backward_sum: f64 = backward.iter().map(|v| f64::from(*v)).sum();
        let score = match pruning_type {
            PruningType::ForwardWeights => forward_sum,
            PruningType::BackwardWeights => backward_sum,
            PruningType::Combined => forward_sum + backward_sum,
            PruningType::External => 0.0,
        };
        let tgt = phrase_to_string(phrase.iter(), vocab);
        Self {
            hash: stable_hash(&tgt),
            tgt,
            phrase,
            record,
            forward,
            backward,
            score,
            backward_sum,
        }
    }

    /// 降順（良いものが先）の決定的な比較
    ///
    /// スコア、逆方向スコア（高い方を残す）、目的言語フレーズ文字列の
    /// 安定ハッシュ、辞書順の順でタイブレークします。挿入順に依存しない
    /// 安定した順序を保証します。
    pub(crate) fn cmp_desc(a: &Self, b: &Self) -> Ordering {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.backward_sum.total_cmp(&a.backward_sum))
            .then_with(|| a.hash.cmp(&b.hash))
            .then_with(|| a.tgt.cmp(&b.tgt))
    }
}

/// ソート済みの多確率ファイルをストリーミングでフィルタリングします。
///
/// 1つの原言語フレーズの目的言語テーブルを読み終えるたびに即座に
/// フィルタを適用し、残った行を出力へ書いて葉を破棄します。テーブル
/// 全体をメモリに保持しないため、非常に大きな単一パスのファイルを
/// フィルタリングできます。
///
/// 残された行は入力の生の行がそのまま書かれるため、数値の往復変換に
/// よる劣化はありません。
///
/// # 引数
///
/// * `path` - 原言語フレーズでソートされた多確率ファイル
/// * `visitor` - 適用するフィルタリングビジタ
/// * `out` - 残った行の書き出し先
pub fn filter_multi_prob_online<P, W>(
    path: P,
    visitor: &mut dyn TargetTableVisitor,
    mut out: W,
) -> Result<()>
where
    P: AsRef<Path>,
    W: Write,
{
    let path = path.as_ref();
    let model_name = path.to_string_lossy().into_owned();
    let file = File::open(path).map_err(|e| {
        TaiyakuError::invalid_argument(
            "path",
            format!("Failed to open phrase table file {}: {}", model_name, e),
        )
    })?;

    let mut vocab = Vocabulary::new();
    let mut parser = EntryParser::new(&model_name);
    let mut duplicate_count = 0usize;
    let mut zero_prob_count = 0usize;

    let mut cur_src = String::new();
    let mut cur_word_count = 0usize;
    let mut leaf = TargetPhraseTable::new();
    let mut raw_lines: Vec<(CompactPhrase, String)> = vec![];

    let mut flush = |vocab: &Vocabulary,
                     word_count: usize,
                     leaf: &mut TargetPhraseTable,
                     raw_lines: &mut Vec<(CompactPhrase, String)>,
                     out: &mut W|
     -> Result<()> {
        if leaf.is_empty() {
            return Ok(());
        }
        visitor.visit(vocab, word_count, leaf);
        for (phrase, line) in raw_lines.drain(..) {
            if leaf.get(&phrase).is_some() {
                writeln!(out, "{}", line)?;
            }
        }
        leaf.clear();
        Ok(())
    };

    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let split = parser.split_line(&line)?;

        if split.src != cur_src {
            flush(&vocab, cur_word_count, &mut leaf, &mut raw_lines, &mut out)?;
            cur_src.clear();
            cur_src.push_str(split.src);
            cur_word_count = split.src.split_whitespace().count();
        }

        let mut tgt_phrase = CompactPhrase::new();
        for word in split.tgt.split_whitespace() {
            tgt_phrase.push(vocab.add(word));
        }
        if leaf.get(&tgt_phrase).is_some() {
            duplicate_count += 1;
            continue;
        }

        let values = parser.parse_third(split.third, |_, _| {})?;
        if values.is_empty() || values.len() % 2 != 0 {
            return Err(TaiyakuError::invalid_format(
                model_name.clone(),
                format!(
                    "multi-prob phrase table must have an even, nonzero number of \
                     probability figures, got {}",
                    values.len()
                ),
            ));
        }
        parser.parse_fourth(split.fourth)?;

        let record = leaf.get_or_insert(&tgt_phrase);
        let model_count = values.len() / 2;
        for &v in &values[..model_count] {
            record.backward.push(if v <= 0.0 {
                zero_prob_count += 1;
                LOG_ALMOST_0
            } else {
                v.ln()
            });
        }
        for &v in &values[model_count..] {
            record.forward.push(if v <= 0.0 {
                zero_prob_count += 1;
                LOG_ALMOST_0
            } else {
                v.ln()
            });
        }
        raw_lines.push((tgt_phrase, line));
    }
    flush(&vocab, cur_word_count, &mut leaf, &mut raw_lines, &mut out)?;

    if zero_prob_count > 0 {
        log::warn!(
            "[taiyaku] {} zero or negative probabilities found in {} - treated as \
             missing entries",
            zero_prob_count,
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
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_bins() {
        let mut hist = SizeHistogram::new(10);
        hist.add(3);
        hist.add(7);
        hist.add(15);
        assert_eq!(hist.count(), 3);
        let mut out = Vec::new();
        hist.display(&mut out, "  ").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("[0, 10): 2"));
        assert!(text.contains("[10, 20): 1"));
    }

    #[test]
    fn test_cmp_desc_is_deterministic() {
        let mut vocab = Vocabulary::new();
        let mut make = |tgt: &str, forward: f32, backward: f32| {
            let phrase: CompactPhrase = tgt.split_whitespace().map(|w| vocab.add(w)).collect();
            let record = ScoreRecord {
                forward: vec![forward],
                backward: vec![backward],
                ..Default::default()
            };
            RankedPhrase::new(
                &vocab,
                phrase,
                record,
                1,
                LOG_ALMOST_0,
                PruningType::ForwardWeights,
            )
        };
        let a = make("aardvark", -1.0, -1.0);
        let b = make("banana", -2.0, -1.0);
        // スコアが高い方が先
        assert_eq!(RankedPhrase::cmp_desc(&a, &b), Ordering::Less);
        // スコアが同じなら逆方向スコアが高い方が先
        let c = make("cherry", -1.0, -0.5);
        assert_eq!(RankedPhrase::cmp_desc(&c, &a), Ordering::Less);
        // 完全に同じスコアでも全順序が定まる
        let d = make("durian", -1.0, -1.0);
        assert_ne!(RankedPhrase::cmp_desc(&a, &d), Ordering::Equal);
    }
}
