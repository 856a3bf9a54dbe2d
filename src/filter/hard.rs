//! ハードフィルタ（上位L件の選択）
//!
//! 葉のサイズが制限Lを超える場合、各エントリのフィルタリングスコアを
//! 計算し、スコア上位ちょうどL件をヒープ抽出（O(n log L)）で残します。
//! タイブレークは逆方向スコア、目的言語フレーズの安定ハッシュ、辞書順の
//! 順で行い、挿入順に依存しない決定的な出力を保証します。

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io::{self, Write};

use crate::filter::pruning_style::PruningStyle;
use crate::filter::{FilterStats, RankedPhrase, TargetTableVisitor};
use crate::table::score::TargetPhraseTable;
use crate::table::PruningType;
use crate::vocab::Vocabulary;

/// ヒープ要素のラッパー
///
/// [`BinaryHeap`]は最大要素を取り出すため、「悪い方が大きい」順序を
/// 与えることで、ヒープから悪いエントリが先に追い出されます。
struct HeapEntry(RankedPhrase);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        RankedPhrase::cmp_desc(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // cmp_descはLessで「良い」を意味するので、そのまま使うと
        // ヒープの最大要素が最悪のエントリになる
        RankedPhrase::cmp_desc(&self.0, &other.0)
    }
}

/// スコア上位ちょうどL件を残すハードフィルタ
pub struct HardFilterVisitor {
    pruning_type: PruningType,
    pruning_style: PruningStyle,
    num_models: usize,
    log_almost_0: f32,
    stats: FilterStats,
}

impl HardFilterVisitor {
    /// 新しいハードフィルタビジタを作成します。
    ///
    /// # 引数
    ///
    /// * `pruning_type` - フィルタリングスコアの計算方法
    /// * `pruning_style` - 原言語フレーズの単語数から制限Lへの写像
    /// * `num_models` - テキスト翻訳モデルの数。エントリによってベクトル
    ///   長が異なるため、この数までパディングして比較します。
    /// * `log_almost_0` - 欠損値のパディングに使う対数値
    pub fn new(
        pruning_type: PruningType,
        pruning_style: PruningStyle,
        num_models: usize,
        log_almost_0: f32,
    ) -> Self {
        Self {
            pruning_type,
            pruning_style,
            num_models,
            log_almost_0,
            stats: FilterStats::new(),
        }
    }
}

impl TargetTableVisitor for HardFilterVisitor {
    fn visit(&mut self, vocab: &Vocabulary, src_word_count: usize, table: &mut TargetPhraseTable) {
        if table.is_empty() {
            return;
        }
        self.stats.unfiltered.add(table.len());

        let limit = self.pruning_style.apply(src_word_count);
        if self.pruning_type != PruningType::External && table.len() > limit && limit > 0 {
            let entries = table.drain_entries();
            let mut heap = BinaryHeap::with_capacity(limit + 1);
            for (phrase, record) in entries {
                heap.push(HeapEntry(RankedPhrase::new(
                    vocab,
                    phrase,
                    record,
                    self.num_models,
                    self.log_almost_0,
                    self.pruning_type,
                )));
                if heap.len() > limit {
                    heap.pop();
                }
            }
            for HeapEntry(ranked) in heap {
                table.insert(ranked.phrase, ranked.record);
            }
        }

        self.stats.num_kept += table.len();
        self.stats.filtered.add(table.len());
    }

    fn display_stats(&self, out: &mut dyn Write) -> io::Result<()> {
        self.stats.display(out)
    }

    fn num_kept(&self) -> usize {
        self.stats.num_kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phrase::CompactPhrase;
    use crate::table::score::ScoreRecord;

    fn build_leaf(vocab: &mut Vocabulary, entries: &[(&str, f32, f32)]) -> TargetPhraseTable {
        let mut table = TargetPhraseTable::new();
        for (tgt, backward, forward) in entries {
            let phrase: CompactPhrase = tgt.split_whitespace().map(|w| vocab.add(w)).collect();
            let record = table.get_or_insert(&phrase);
            record.backward.push(*backward);
            record.forward.push(*forward);
        }
        table
    }

    fn kept_targets(vocab: &Vocabulary, table: &TargetPhraseTable) -> Vec<String> {
        let mut targets: Vec<String> = table
            .iter()
            .map(|(p, _)| crate::phrase::phrase_to_string(p.iter(), vocab))
            .collect();
        targets.sort();
        targets
    }

    #[test]
    fn test_keeps_top_l_by_forward_score() {
        let mut vocab = Vocabulary::new();
        let mut table = build_leaf(
            &mut vocab,
            &[
                ("a", -1.0, -5.0),
                ("b", -1.0, -1.0),
                ("c", -1.0, -2.0),
                ("d", -1.0, -4.0),
                ("e", -1.0, -3.0),
            ],
        );
        let mut visitor = HardFilterVisitor::new(
            PruningType::ForwardWeights,
            PruningStyle::Constant(3),
            1,
            crate::common::LOG_ALMOST_0,
        );
        visitor.visit(&vocab, 1, &mut table);
        assert_eq!(table.len(), 3);
        assert_eq!(kept_targets(&vocab, &table), vec!["b", "c", "e"]);
        assert_eq!(visitor.num_kept(), 3);
    }

    #[test]
    fn test_ties_broken_by_backward_score() {
        let mut vocab = Vocabulary::new();
        let mut table = build_leaf(
            &mut vocab,
            &[
                ("a", -5.0, -1.0),
                ("b", -2.0, -1.0),
                ("c", -4.0, -1.0),
            ],
        );
        let mut visitor = HardFilterVisitor::new(
            PruningType::ForwardWeights,
            PruningStyle::Constant(1),
            1,
            crate::common::LOG_ALMOST_0,
        );
        visitor.visit(&vocab, 1, &mut table);
        assert_eq!(kept_targets(&vocab, &table), vec!["b"]);
    }

    #[test]
    fn test_deterministic_across_runs() {
        // 同一入力に対して2回実行すると同一の保持集合になる
        let run = || {
            let mut vocab = Vocabulary::new();
            let mut table = build_leaf(
                &mut vocab,
                &[
                    ("x y", -1.0, -1.0),
                    ("y x", -1.0, -1.0),
                    ("z w", -1.0, -1.0),
                    ("w z", -1.0, -1.0),
                ],
            );
            let mut visitor = HardFilterVisitor::new(
                PruningType::ForwardWeights,
                PruningStyle::Constant(2),
                1,
                crate::common::LOG_ALMOST_0,
            );
            visitor.visit(&vocab, 2, &mut table);
            kept_targets(&vocab, &table)
        };
        let first = run();
        let second = run();
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
    }

    #[test]
    fn test_ten_entries_limit_three() {
        let mut vocab = Vocabulary::new();
        let entries: Vec<(String, f32, f32)> = (0..10)
            .map(|i| (format!("t{}", i), -1.0, -(i as f32) - 1.0))
            .collect();
        let refs: Vec<(&str, f32, f32)> =
            entries.iter().map(|(t, b, f)| (t.as_str(), *b, *f)).collect();
        let mut table = build_leaf(&mut vocab, &refs);
        let mut visitor = HardFilterVisitor::new(
            PruningType::ForwardWeights,
            PruningStyle::Constant(3),
            1,
            crate::common::LOG_ALMOST_0,
        );
        visitor.visit(&vocab, 1, &mut table);
        assert_eq!(kept_targets(&vocab, &table), vec!["t0", "t1", "t2"]);
    }

    #[test]
    fn test_small_leaf_is_untouched() {
        let mut vocab = Vocabulary::new();
        let mut table = build_leaf(&mut vocab, &[("a", -1.0, -1.0), ("b", -1.0, -2.0)]);
        let mut visitor = HardFilterVisitor::new(
            PruningType::ForwardWeights,
            PruningStyle::Constant(5),
            1,
            crate::common::LOG_ALMOST_0,
        );
        visitor.visit(&vocab, 1, &mut table);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_external_pruning_is_a_noop() {
        let mut vocab = Vocabulary::new();
        let mut table = build_leaf(
            &mut vocab,
            &[("a", -1.0, -1.0), ("b", -1.0, -2.0), ("c", -1.0, -3.0)],
        );
        let mut visitor = HardFilterVisitor::new(
            PruningType::External,
            PruningStyle::Constant(1),
            1,
            crate::common::LOG_ALMOST_0,
        );
        visitor.visit(&vocab, 1, &mut table);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_backward_weights_mode() {
        let mut vocab = Vocabulary::new();
        let mut table = build_leaf(
            &mut vocab,
            &[("a", -1.0, -9.0), ("b", -3.0, -1.0), ("c", -2.0, -1.0)],
        );
        let mut visitor = HardFilterVisitor::new(
            PruningType::BackwardWeights,
            PruningStyle::Constant(1),
            1,
            crate::common::LOG_ALMOST_0,
        );
        visitor.visit(&vocab, 1, &mut table);
        assert_eq!(kept_targets(&vocab, &table), vec!["a"]);
    }
}
