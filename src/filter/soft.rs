//! ソフトフィルタ（支配関係に基づく動的計画法）
//!
//! 単純な上位K件カットではなく、支配関係に基づいてエントリを
//! 選別します。エントリをフィルタリングスコアの降順にソートし、
//! 上位L件は無条件に残します。以降の各エントリiは、iより上位で
//! まだ残っているエントリのうちiを**支配**する（順方向スコアが
//! 成分ごとに≧、逆方向スコアが成分ごとに≦で、すべて等しいわけでは
//! ない）ものの数がLに達した場合に限り捨てられます。
//!
//! 支配数の判定は早期打ち切り付きのスキャンと、エントリごとの累積
//! 支配数によって行われ、実用上は二乗より良い挙動になります。
//! これにより、純粋な上位K件カットでは失われる、パレート最適な
//! 低頻度・高品質エントリが保存されます。

use std::io::{self, Write};

use crate::filter::pruning_style::PruningStyle;
use crate::filter::{FilterStats, RankedPhrase, TargetTableVisitor};
use crate::table::score::TargetPhraseTable;
use crate::table::PruningType;
use crate::vocab::Vocabulary;

/// 支配関係に基づくソフトフィルタ
pub struct SoftFilterVisitor {
    pruning_type: PruningType,
    pruning_style: PruningStyle,
    num_models: usize,
    log_almost_0: f32,
    stats: FilterStats,
}

impl SoftFilterVisitor {
    /// 新しいソフトフィルタビジタを作成します。
    ///
    /// 引数の意味は[`crate::filter::HardFilterVisitor::new`]と同じです。
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

/// `a`が`b`に支配されているかどうかを判定します。
///
/// `b`が`a`を支配するのは、順方向スコアが成分ごとに`b ≧ a`、かつ
/// 逆方向スコアが成分ごとに`b ≦ a`で、すべてが等しいわけではない
/// 場合です。両ベクトルが完全に等しい場合は、ソート順と一致する
/// ハッシュ・辞書順のタイブレークで決めます。これにより、スコアが
/// 同一のエントリ同士では必ず上位側が下位側を支配し、順序は決定的に
/// なります。
fn dominated(a: &RankedPhrase, b: &RankedPhrase) -> bool {
    let mut all_equal = true;
    for (x, y) in a.forward.iter().zip(b.forward.iter()) {
        if x > y {
            return false;
        }
        if x < y {
            all_equal = false;
        }
    }
    for (x, y) in a.backward.iter().zip(b.backward.iter()) {
        if x < y {
            return false;
        }
        if x > y {
            all_equal = false;
        }
    }
    if !all_equal {
        return true;
    }
    a.hash.cmp(&b.hash).then_with(|| a.tgt.cmp(&b.tgt)) == std::cmp::Ordering::Greater
}

impl TargetTableVisitor for SoftFilterVisitor {
    fn visit(&mut self, vocab: &Vocabulary, src_word_count: usize, table: &mut TargetPhraseTable) {
        if table.is_empty() {
            return;
        }
        self.stats.unfiltered.add(table.len());

        let limit = self.pruning_style.apply(src_word_count);
        if self.pruning_type != PruningType::External && table.len() > limit && limit > 0 {
            let mut phrases: Vec<RankedPhrase> = table
                .drain_entries()
                .into_iter()
                .map(|(phrase, record)| {
                    RankedPhrase::new(
                        vocab,
                        phrase,
                        record,
                        self.num_models,
                        self.log_almost_0,
                        self.pruning_type,
                    )
                })
                .collect();
            phrases.sort_by(RankedPhrase::cmp_desc);

            let n = phrases.len();
            let mut counts = vec![0usize; n];
            let mut keep = vec![true; n];
            for i in limit..n {
                let mut count = 0usize;
                for j in (0..i).rev() {
                    if keep[j] && dominated(&phrases[i], &phrases[j]) {
                        count += 1;
                        // jを支配している残存エントリは、推移律によって
                        // iも支配する
                        if count + counts[j] >= limit {
                            count = limit;
                        }
                    }
                    // 既にLに達したか、残りすべてが支配してもLに届かない
                    // なら打ち切る
                    if count >= limit || count + j < limit {
                        break;
                    }
                }
                keep[i] = count < limit;
                counts[i] = count;
            }

            for (i, ranked) in phrases.into_iter().enumerate() {
                if keep[i] {
                    table.insert(ranked.phrase, ranked.record);
                }
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
    use crate::common::LOG_ALMOST_0;
    use crate::phrase::CompactPhrase;

    fn build_leaf(
        vocab: &mut Vocabulary,
        entries: &[(&str, &[f32], &[f32])],
    ) -> TargetPhraseTable {
        let mut table = TargetPhraseTable::new();
        for (tgt, backward, forward) in entries {
            let phrase: CompactPhrase = tgt.split_whitespace().map(|w| vocab.add(w)).collect();
            let record = table.get_or_insert(&phrase);
            record.backward.extend_from_slice(backward);
            record.forward.extend_from_slice(forward);
        }
        table
    }

    fn contains(vocab: &Vocabulary, table: &TargetPhraseTable, tgt: &str) -> bool {
        let phrase: CompactPhrase = tgt.split_whitespace().map(|w| vocab.index(w)).collect();
        table.get(&phrase).is_some()
    }

    #[test]
    fn test_pareto_optimal_entry_survives() {
        let mut vocab = Vocabulary::new();
        // cは順方向スコアが最低だが逆方向スコアも最低なので、どの
        // エントリにも支配されない。ハードフィルタなら失われる
        // パレート最適エントリがソフトフィルタでは残る
        let mut table = build_leaf(
            &mut vocab,
            &[
                ("a", &[-3.0], &[-1.0]),
                ("b", &[-2.5], &[-1.5]),
                ("c", &[-9.0], &[-5.0]),
            ],
        );
        let mut visitor = SoftFilterVisitor::new(
            PruningType::ForwardWeights,
            PruningStyle::Constant(1),
            1,
            LOG_ALMOST_0,
        );
        visitor.visit(&vocab, 1, &mut table);
        assert!(contains(&vocab, &table, "a"));
        assert!(contains(&vocab, &table, "c"));
        // bはaに支配される（順方向も劣り、逆方向も上回る）
        assert!(!contains(&vocab, &table, "b"));
    }

    #[test]
    fn test_dominated_entries_are_discarded() {
        let mut vocab = Vocabulary::new();
        // dはa・bの両方に支配される
        let mut table = build_leaf(
            &mut vocab,
            &[
                ("a", &[-1.0], &[-1.0]),
                ("b", &[-2.0], &[-1.5]),
                ("d", &[-0.5], &[-4.0]),
            ],
        );
        let mut visitor = SoftFilterVisitor::new(
            PruningType::ForwardWeights,
            PruningStyle::Constant(2),
            1,
            LOG_ALMOST_0,
        );
        visitor.visit(&vocab, 1, &mut table);
        assert_eq!(table.len(), 2);
        assert!(!contains(&vocab, &table, "d"));
    }

    #[test]
    fn test_dominance_invariant() {
        // 残されたエントリはどれも、他の残されたエントリL個以上に
        // 支配されない
        let mut vocab = Vocabulary::new();
        let entries: Vec<(String, Vec<f32>, Vec<f32>)> = (0..12)
            .map(|i| {
                let f = -((i % 4) as f32) - 1.0;
                let b = -((i / 4) as f32) - 1.0;
                (format!("w{}", i), vec![b], vec![f])
            })
            .collect();
        let refs: Vec<(&str, &[f32], &[f32])> = entries
            .iter()
            .map(|(t, b, f)| (t.as_str(), b.as_slice(), f.as_slice()))
            .collect();
        let mut table = build_leaf(&mut vocab, &refs);
        let limit = 3;
        let mut visitor = SoftFilterVisitor::new(
            PruningType::ForwardWeights,
            PruningStyle::Constant(limit),
            1,
            LOG_ALMOST_0,
        );
        visitor.visit(&vocab, 1, &mut table);

        let kept: Vec<RankedPhrase> = table
            .drain_entries()
            .into_iter()
            .map(|(p, r)| {
                RankedPhrase::new(
                    &vocab,
                    p,
                    r,
                    1,
                    LOG_ALMOST_0,
                    PruningType::ForwardWeights,
                )
            })
            .collect();
        for a in &kept {
            let dominators = kept
                .iter()
                .filter(|b| !std::ptr::eq(*b, a) && dominated(a, b))
                .count();
            assert!(dominators < limit, "{} has {} dominators", a.tgt, dominators);
        }
    }

    #[test]
    fn test_small_leaf_is_untouched() {
        let mut vocab = Vocabulary::new();
        let mut table = build_leaf(&mut vocab, &[("a", &[-1.0], &[-1.0])]);
        let mut visitor = SoftFilterVisitor::new(
            PruningType::ForwardWeights,
            PruningStyle::Constant(3),
            1,
            LOG_ALMOST_0,
        );
        visitor.visit(&vocab, 1, &mut table);
        assert_eq!(table.len(), 1);
    }
}
