//! 動的混合テーブル
//!
//! このモジュールは、複数の構成テーブルを問い合わせ時に線形結合する
//! 仮想テーブルを提供します。構成テーブルと列ごとの重みは重みファイル
//! で指定します:
//!
//! ```text
//! taiyaku mixture v1
//! # コメント行と空行は無視される
//! component-a.tpi<TAB>0.7 0.7 0.7
//! component-b<TAB>0.3 0.3 0.3
//! ```
//!
//! 各行は構成テーブルのパス、タブ、空白区切りの重み列です。重みは
//! `2×モデル数 + 方向なしスコア数`個が必要で、すべての構成テーブルは
//! 同じ列数を持たなければなりません。違反は問い合わせが始まる前の
//! 検証時に致命的エラーになります。
//!
//! 検索はすべての構成テーブルに問い合わせ、いずれかが返した目的言語
//! フレーズの和集合を作り、各出力スコア列を`Σ_i weight[i][col] *
//! component_i.score[col]`として計算します（フレーズを返さなかった
//! 構成テーブルの寄与は0）。途中の蓄積はすべてf64精度で行い、最後に
//! だけf32へ落とします。構成テーブルごとに単精度で積み上げると丸めが
//! 累積するためです。

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::Range;
use std::path::Path;

use hashbrown::HashMap;

use crate::annotation::alignment::AlignmentAnnotation;
use crate::annotation::count::CountAnnotation;
use crate::errors::{Result, TaiyakuError};
use crate::index::IndexFeature;
use crate::phrase::CompactPhrase;
use crate::table::feature::{PhraseTableFeature, TextTableFeature};
use crate::table::score::TargetPhraseTable;
use crate::vocab::Vocabulary;

/// 混合テーブルの重みファイルの先頭行
pub const MIXTURE_MAGIC: &str = "taiyaku mixture v1";

/// 複数の構成テーブルのスコアを重み付き和で結合する仮想テーブル
pub struct MixtureTable {
    model_name: String,
    components: Vec<Box<dyn PhraseTableFeature>>,
    /// 構成テーブルごとの出力列あたりの重み
    weights: Vec<Vec<f64>>,
    num_models: usize,
    num_adir: usize,
    num_counts: usize,
    has_alignments: bool,
}

impl MixtureTable {
    /// 重みファイルから混合テーブルを開きます。
    ///
    /// 構成テーブルのパスは重みファイルのディレクトリからの相対パスと
    /// して解決されます。すべての構成テーブルが開かれ、列数の一貫性が
    /// 検証されます。
    ///
    /// # エラー
    ///
    /// マジック行がない場合、行形式が不正な場合、重み数と構成テーブルの
    /// 列数が一致しない場合、構成テーブルが開けない場合にエラーを
    /// 返します。
    pub fn open<P: AsRef<Path>>(path: P, vocab: &mut Vocabulary) -> Result<Self> {
        let path = path.as_ref();
        let model_name = path.to_string_lossy().into_owned();
        let file = File::open(path).map_err(|e| {
            TaiyakuError::invalid_argument(
                "path",
                format!("Failed to open mixture file {}: {}", model_name, e),
            )
        })?;
        let dir = path.parent();

        let mut lines = BufReader::new(file).lines();
        let first_line = match lines.next() {
            Some(line) => line?,
            None => String::new(),
        };
        if first_line != MIXTURE_MAGIC {
            return Err(TaiyakuError::invalid_format(
                model_name,
                format!("should start with magic line {:?}", MIXTURE_MAGIC),
            ));
        }

        let mut component_paths = vec![];
        let mut weights: Vec<Vec<f64>> = vec![];
        let mut column_count = 0usize;
        for line in lines {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((component, weights_str)) = line.split_once('\t') else {
                return Err(TaiyakuError::invalid_format(
                    model_name.clone(),
                    format!(
                        "invalid line {:?}; each line should have a component model name, \
                         a tab, and a space separated list of weights",
                        line
                    ),
                ));
            };
            let component = component.trim();
            let component_path = match dir {
                Some(dir) if !Path::new(component).is_absolute() => dir.join(component),
                _ => Path::new(component).to_path_buf(),
            };
            component_paths.push(component_path);

            let mut component_weights = vec![];
            for token in weights_str.split_whitespace() {
                let weight: f64 = token.parse().map_err(|_| {
                    TaiyakuError::invalid_format(
                        model_name.clone(),
                        format!("cannot convert weight {:?} on line {:?}", token, line),
                    )
                })?;
                component_weights.push(weight);
            }
            if component_weights.is_empty() {
                return Err(TaiyakuError::invalid_format(
                    model_name.clone(),
                    format!("line {:?} has no weights", line),
                ));
            }
            if column_count == 0 {
                column_count = component_weights.len();
            } else if component_weights.len() != column_count {
                return Err(TaiyakuError::invalid_format(
                    model_name.clone(),
                    format!(
                        "line {:?} has a different number of weights than previous lines",
                        line
                    ),
                ));
            }
            weights.push(component_weights);
        }

        if component_paths.is_empty() {
            return Err(TaiyakuError::invalid_format(model_name, "has no components"));
        }

        let mut components: Vec<Box<dyn PhraseTableFeature>> = vec![];
        for component_path in &component_paths {
            components.push(open_component(component_path, vocab)?);
        }

        let num_models = components[0].num_models();
        let num_adir = components[0].num_adir();
        let mut num_counts = 0;
        let mut has_alignments = false;
        for component in &components {
            if 2 * component.num_models() + component.num_adir() != column_count {
                return Err(TaiyakuError::invalid_format(
                    model_name.clone(),
                    format!(
                        "component {} has the wrong number of columns for the weights \
                         provided ({} columns, {} weights)",
                        component.model_name(),
                        2 * component.num_models() + component.num_adir(),
                        column_count
                    ),
                ));
            }
            if component.num_models() != num_models || component.num_adir() != num_adir {
                return Err(TaiyakuError::invalid_format(
                    model_name.clone(),
                    format!(
                        "component {} has a different number of 3rd or 4th column scores \
                         than the first component",
                        component.model_name()
                    ),
                ));
            }
            num_counts = num_counts.max(component.num_counts());
            has_alignments |= component.has_alignments();
        }

        Ok(Self {
            model_name,
            components,
            weights,
            num_models,
            num_adir,
            num_counts,
            has_alignments,
        })
    }
}

/// 構成テーブルを拡張子でディスパッチして開きます。
fn open_component(path: &Path, vocab: &mut Vocabulary) -> Result<Box<dyn PhraseTableFeature>> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("tpi") => Ok(Box::new(IndexFeature::open(path)?)),
        Some("mixtm") => Ok(Box::new(MixtureTable::open(path, vocab)?)),
        _ => Ok(Box::new(TextTableFeature::open(path, vocab)?)),
    }
}

/// f64精度の中間アキュムレータ
struct MixAccumulator {
    backward: Vec<f64>,
    forward: Vec<f64>,
    adir: Vec<f64>,
    counts: Option<CountAnnotation>,
    alignment: Option<AlignmentAnnotation>,
}

impl MixAccumulator {
    fn new(num_models: usize, num_adir: usize) -> Self {
        Self {
            backward: vec![0.0; num_models],
            forward: vec![0.0; num_models],
            adir: vec![0.0; num_adir],
            counts: None,
            alignment: None,
        }
    }
}

impl PhraseTableFeature for MixtureTable {
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
        for component in self.components.iter_mut() {
            component.new_src_sent(sentence);
        }
    }

    fn clear_cache(&mut self) {
        for component in self.components.iter_mut() {
            component.clear_cache();
        }
    }

    fn find(&mut self, range: Range<usize>, vocab: &mut Vocabulary) -> TargetPhraseTable {
        let num_models = self.num_models;
        let num_adir = self.num_adir;
        let mut accumulators: HashMap<CompactPhrase, MixAccumulator> = HashMap::new();

        for (i, component) in self.components.iter_mut().enumerate() {
            let result = component.find(range.clone(), vocab);
            let weights = &self.weights[i];
            for (tgt, record) in result.iter() {
                let acc = accumulators
                    .entry(tgt.clone())
                    .or_insert_with(|| MixAccumulator::new(num_models, num_adir));
                for j in 0..num_models {
                    let b = record.backward.get(j).copied().unwrap_or(0.0);
                    let f = record.forward.get(j).copied().unwrap_or(0.0);
                    acc.backward[j] += f64::from(b) * weights[j];
                    acc.forward[j] += f64::from(f) * weights[j + num_models];
                }
                for j in 0..num_adir {
                    let a = record.adir.get(j).copied().unwrap_or(0.0);
                    acc.adir[j] += f64::from(a) * weights[j + 2 * num_models];
                }
                if let Some(counts) = CountAnnotation::get(&record.annotations) {
                    acc.counts
                        .get_or_insert_with(CountAnnotation::default)
                        .update_counts(&counts.joint_counts);
                }
                if acc.alignment.is_none() {
                    // アライメントは最初に提供した構成テーブルが勝つ
                    if let Some(alignment) = AlignmentAnnotation::get(&record.annotations) {
                        acc.alignment = Some(alignment.clone());
                    }
                }
            }
        }

        let mut table = TargetPhraseTable::new();
        for (tgt, acc) in accumulators {
            let record = table.get_or_insert(&tgt);
            record.backward = acc.backward.iter().map(|v| *v as f32).collect();
            record.forward = acc.forward.iter().map(|v| *v as f32).collect();
            record.adir = acc.adir.iter().map(|v| *v as f32).collect();
            if let Some(counts) = acc.counts {
                record
                    .annotations
                    .set(CountAnnotation::type_id(), Box::new(counts));
            }
            if let Some(alignment) = acc.alignment {
                record
                    .annotations
                    .set(AlignmentAnnotation::type_id(), Box::new(alignment));
            }
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        write!(file, "{}", content).unwrap();
        path
    }

    fn setup_components(dir: &Path) -> std::path::PathBuf {
        write_file(
            dir,
            "a.txt",
            "le chat ||| the cat ||| 0.5 0.4 c=2\nle chat ||| the hat ||| 0.1 0.2\n",
        );
        write_file(dir, "b.txt", "le chat ||| the cat ||| 0.3 0.6 c=4 a=0_1\n");
        write_file(
            dir,
            "mix.mixtm",
            &format!("{}\na.txt\t0.75 0.5\nb.txt\t0.25 0.5\n", MIXTURE_MAGIC),
        )
    }

    #[test]
    fn test_mixture_weighted_sum() {
        let dir = tempfile::tempdir().unwrap();
        let mix_path = setup_components(dir.path());
        let mut vocab = Vocabulary::new();
        let mut mixture = MixtureTable::open(&mix_path, &mut vocab).unwrap();
        assert_eq!(mixture.num_models(), 1);
        assert_eq!(mixture.num_adir(), 0);
        assert_eq!(mixture.num_counts(), 1);
        assert!(mixture.has_alignments());

        mixture.new_src_sent(&["le".to_string(), "chat".to_string()]);
        let result = mixture.find(0..2, &mut vocab);
        assert_eq!(result.len(), 2);

        let cat: CompactPhrase = ["the", "cat"].iter().map(|w| vocab.index(w)).collect();
        let record = result.get(&cat).unwrap();
        // 両方の構成テーブルにあるフレーズは重み付き和
        assert!((record.backward[0] - (0.75 * 0.5 + 0.25 * 0.3) as f32).abs() < 1e-6);
        assert!((record.forward[0] - (0.5 * 0.4 + 0.5 * 0.6) as f32).abs() < 1e-6);
        // カウントは加算、アライメントは最初に見つかったもの
        assert_eq!(
            CountAnnotation::get(&record.annotations).unwrap().joint_counts,
            vec![6.0]
        );
        assert_eq!(
            AlignmentAnnotation::get(&record.annotations).unwrap().alignment(),
            "0_1"
        );
    }

    #[test]
    fn test_mixture_linearity_for_single_component_phrase() {
        let dir = tempfile::tempdir().unwrap();
        let mix_path = setup_components(dir.path());
        let mut vocab = Vocabulary::new();
        let mut mixture = MixtureTable::open(&mix_path, &mut vocab).unwrap();
        mixture.new_src_sent(&["le".to_string(), "chat".to_string()]);
        let result = mixture.find(0..2, &mut vocab);

        // ちょうど1つの構成テーブルだけが返すフレーズの出力列jは
        // weight[j] * score[j]に等しい
        let hat: CompactPhrase = ["the", "hat"].iter().map(|w| vocab.index(w)).collect();
        let record = result.get(&hat).unwrap();
        assert!((record.backward[0] - (0.75 * 0.1) as f32).abs() < 1e-7);
        assert!((record.forward[0] - (0.5 * 0.2) as f32).abs() < 1e-7);
    }

    #[test]
    fn test_missing_magic_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.txt", "le ||| the ||| 0.5 0.5\n");
        let path = write_file(dir.path(), "bad.mixtm", "a.txt\t1.0 1.0\n");
        let mut vocab = Vocabulary::new();
        assert!(MixtureTable::open(&path, &mut vocab).is_err());
    }

    #[test]
    fn test_wrong_weight_count_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.txt", "le ||| the ||| 0.5 0.5\n");
        let path = write_file(
            dir.path(),
            "bad.mixtm",
            &format!("{}\na.txt\t1.0 1.0 1.0\n", MIXTURE_MAGIC),
        );
        let mut vocab = Vocabulary::new();
        assert!(MixtureTable::open(&path, &mut vocab).is_err());
    }

    #[test]
    fn test_inconsistent_components_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.txt", "le ||| the ||| 0.5 0.5\n");
        write_file(dir.path(), "b.txt", "le ||| the ||| 0.5 0.4 0.3 0.2\n");
        let path = write_file(
            dir.path(),
            "bad.mixtm",
            &format!("{}\na.txt\t1.0 1.0\nb.txt\t1.0 1.0\n", MIXTURE_MAGIC),
        );
        let mut vocab = Vocabulary::new();
        assert!(MixtureTable::open(&path, &mut vocab).is_err());
    }

    #[test]
    fn test_no_components_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "empty.mixtm", &format!("{}\n", MIXTURE_MAGIC));
        let mut vocab = Vocabulary::new();
        assert!(MixtureTable::open(&path, &mut vocab).is_err());
    }
}
