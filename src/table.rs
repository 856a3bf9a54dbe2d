//! フレーズテーブルのコア
//!
//! このモジュールは、原言語フレーズから目的言語フレーズテーブルへの
//! インメモリトライを所有し、テキスト形式のモデルファイルの読み込み、
//! 複数ファイル間のスコアのマージ、原文スパンに対するフレーズ検索を
//! 提供します。
//!
//! # 数値の取り扱い
//!
//! すべての確率は内部では対数空間で保持します。線形確率との変換は
//! 取り込み時（`convert_from_read`に相当）とテキスト書き出し時
//! （`convert_to_write`に相当）にのみ行われます。0以下の確率は対数に
//! 変換できないため「ほぼゼロ」の番兵に置き換えられ、ファイルごとに
//! 1回だけ集約警告が出ます。番兵値はテキストに書き戻すとき、ちょうど
//! `0`として出力されます。
//!
//! # 複数ファイルのマージ
//!
//! 同じ（原言語, 目的言語）ペアが後のファイルに現れた場合、それまでに
//! 蓄積されたスコアベクトルは置き換えられず*延長*されます。各ファイルは
//! backward/forwardベクトルの次のスライスを提供し、あるファイルに
//! 現れないペアはそのファイルのスライス分だけ番兵で埋められます。

pub mod entry;
pub mod feature;
pub mod score;

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::ops::Range;
use std::path::Path;
use std::str::FromStr;

use crate::annotation::count;
use crate::annotation::PhrasePairAnnotator;
use crate::common::{shielded_log, LOG_ALMOST_0, NUM_LEXDIS_SCORES, PHRASE_SEP};
use crate::errors::{Result, TaiyakuError};
use crate::index::IndexFeature;
use crate::mixture::MixtureTable;
use crate::phrase::{phrase_to_string, CompactPhrase};
use crate::table::entry::EntryParser;
use crate::table::feature::{PhraseTableFeature, TextTableFeature};
use crate::table::score::{ScoreRecord, TargetPhraseTable};
use crate::trie::PhraseTrie;
use crate::vocab::Vocabulary;

/// 枝刈りの種類
///
/// フレーズペアのフィルタリングスコアをどのスコアベクトルから計算するかを
/// 指定します。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum PruningType {
    /// 順方向確率の対数線形結合で枝刈りする（デフォルト）
    #[default]
    ForwardWeights,
    /// 逆方向確率の対数線形結合で枝刈りする
    BackwardWeights,
    /// 順方向と逆方向の両方の結合で枝刈りする
    Combined,
    /// 枝刈りは上位層（デコーダ）が行う。このテーブルでは枝刈りしない。
    External,
}

impl FromStr for PruningType {
    type Err = TaiyakuError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "forward-weights" => Ok(Self::ForwardWeights),
            "backward-weights" => Ok(Self::BackwardWeights),
            "combined" => Ok(Self::Combined),
            "full" => Ok(Self::External),
            _ => Err(TaiyakuError::invalid_argument(
                "pruning_type",
                format!(
                    "unsupported pruning type {:?}; expected one of forward-weights, \
                     backward-weights, combined, full",
                    s
                ),
            )),
        }
    }
}

/// フレーズ翻訳モデルのストア
///
/// 1回のデコーディング実行のためにモデル読み込みフェーズで一度だけ
/// 構築され、以降はほぼ読み取り専用として扱われます。取り込み・検索・
/// 枝刈りはいずれも同期的で、内部でスレッドを起動することはありません。
pub struct PhraseTable {
    /// 原言語・目的言語で共有する語彙
    vocab: Vocabulary,

    /// 原言語フレーズから目的言語フレーズテーブルへのマッピング。
    /// テキスト形式のテーブル由来の情報だけを含みます。
    text_table: PhraseTrie<TargetPhraseTable>,

    /// 登録順を保持するアノテータのレジストリ
    annotators: Vec<Box<dyn PhrasePairAnnotator>>,

    /// テキスト以外の形式のテーブル（外部インデックス・混合テーブル）
    features: Vec<Box<dyn PhraseTableFeature>>,

    /// これまでに読み込んだテキストファイルの数
    num_text_files_read: usize,

    /// テキストファイルから読み込んだ翻訳モデルの数
    num_text_trans_models: usize,

    /// テキストファイルから読み込んだ方向なしモデルの数
    num_text_adir_models: usize,

    /// 読み込まれた翻訳モデルの総数（外部テーブル分を含む）
    num_trans_models: usize,

    /// 読み込まれた方向なしモデルの総数
    num_adir_models: usize,

    /// 読み込まれた語彙化歪みモデルの総数
    num_lexdis_models: usize,

    /// 枝刈りの種類
    pruning_type: PruningType,

    /// 既知フレーズ限定モードでの入力文数
    num_sents: usize,

    /// 欠損・確率0のエントリに使う対数値
    log_almost_0: f32,

    backward_description: String,
    forward_description: String,
    adir_description: String,
    lexdis_description: String,

    /// 現在の原文（問い合わせ用）
    src_sent: Vec<String>,
    src_sent_ids: Vec<u32>,
}

impl Default for PhraseTable {
    fn default() -> Self {
        Self::new(PruningType::default(), false)
    }
}

impl PhraseTable {
    /// 新しい空のフレーズテーブルを作成します。
    ///
    /// # 引数
    ///
    /// * `pruning_type` - 枝刈りの種類
    /// * `append_joint_counts` - 異なる入力テーブル由来の結合カウントを
    ///   要素ごとに加算する代わりに連結するかどうか
    pub fn new(pruning_type: PruningType, append_joint_counts: bool) -> Self {
        count::set_append_joint_counts(append_joint_counts);
        Self {
            vocab: Vocabulary::new(),
            text_table: PhraseTrie::new(),
            annotators: vec![],
            features: vec![],
            num_text_files_read: 0,
            num_text_trans_models: 0,
            num_text_adir_models: 0,
            num_trans_models: 0,
            num_adir_models: 0,
            num_lexdis_models: 0,
            pruning_type,
            num_sents: 0,
            log_almost_0: LOG_ALMOST_0,
            backward_description: String::new(),
            forward_description: String::new(),
            adir_description: String::new(),
            lexdis_description: String::new(),
            src_sent: vec![],
            src_sent_ids: vec![],
        }
    }

    /// 欠損・確率0のエントリに使う対数値を設定します。
    pub fn set_log_almost_zero(&mut self, value: f32) {
        self.log_almost_0 = value;
    }

    /// 現在の「ほぼゼロ」の対数値を返します。
    #[inline(always)]
    pub fn log_almost_zero(&self) -> f32 {
        self.log_almost_0
    }

    /// 語彙への参照を返します。
    #[inline(always)]
    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    /// 語彙への可変参照を返します。
    #[inline(always)]
    pub fn vocab_mut(&mut self) -> &mut Vocabulary {
        &mut self.vocab
    }

    /// 枝刈りの種類を返します。
    #[inline(always)]
    pub fn pruning_type(&self) -> PruningType {
        self.pruning_type
    }

    /// これまでに読み込んだテキストファイルの数を返します。
    #[inline(always)]
    pub fn num_text_files_read(&self) -> usize {
        self.num_text_files_read
    }

    /// テキスト由来の翻訳モデルの数を返します。
    #[inline(always)]
    pub fn num_text_trans_models(&self) -> usize {
        self.num_text_trans_models
    }

    /// 翻訳モデルの総数を返します。
    #[inline(always)]
    pub fn num_trans_models(&self) -> usize {
        self.num_trans_models
    }

    /// 方向なしモデルの総数を返します。
    #[inline(always)]
    pub fn num_adir_models(&self) -> usize {
        self.num_adir_models
    }

    /// 語彙化歪みモデルの総数を返します。
    #[inline(always)]
    pub fn num_lexdis_models(&self) -> usize {
        self.num_lexdis_models
    }

    /// フレーズテーブルの読み込み中に初期化すべき注釈型を登録します。
    ///
    /// 注釈はアノテータが登録された順に作成されます。あるアノテータが
    /// 別の注釈の初期化を前提とする場合は、そちらを先に登録して
    /// ください。同じ名前のアノテータを複数回登録した場合は、最後の
    /// インスタンスだけが（最初の登録位置で）保持されます。
    pub fn register_annotator(&mut self, annotator: Box<dyn PhrasePairAnnotator>) {
        if let Some(pos) = self
            .annotators
            .iter()
            .position(|a| a.name() == annotator.name())
        {
            self.annotators[pos] = annotator;
        } else {
            self.annotators.push(annotator);
        }
    }

    /// 登録済みアノテータへのアクセスを返します。
    pub fn annotators(&self) -> &[Box<dyn PhrasePairAnnotator>] {
        &self.annotators
    }

    /// 多確率フレーズテーブルファイルを読み込みます。
    ///
    /// 各行の確率部は偶数個の確率を空白区切りで含み、前半が逆方向確率
    /// p(原言語|目的言語)、後半が順方向確率p(目的言語|原言語)です。
    /// すべての行は同じ個数の確率を持たなければなりません。
    ///
    /// 0以下の確率は不正（対数を取れない）であり、番兵値に置き換えた
    /// 上で、ファイルごとに1回だけ警告します。
    ///
    /// # 引数
    ///
    /// * `path` - ファイルパス
    /// * `limit_phrases` - すべての翻訳を格納する代わりに、既にテーブルに
    ///   存在する原言語フレーズの翻訳だけを付加するかどうか
    ///
    /// # 戻り値
    ///
    /// ファイルの確率列数
    ///
    /// # エラー
    ///
    /// ファイルが開けない場合、行形式が不正な場合、確率列数が奇数または
    /// 0の場合、外部テーブルを開いた後に呼ばれた場合にエラーを返します。
    pub fn read_multi_prob<P: AsRef<Path>>(
        &mut self,
        path: P,
        limit_phrases: bool,
    ) -> Result<usize> {
        let (col_count, _) = self.read_text_file(path.as_ref(), TextFileKind::MultiProb, limit_phrases)?;
        Ok(col_count)
    }

    /// 語彙化歪みモデルファイルを読み込みます。
    ///
    /// 行形式は多確率テーブルと同じですが、3列目はちょうど6個の方向
    /// スコアでなければなりません。目的言語フレーズに未知語を含む行は
    /// 主テーブルのどのペアとも一致し得ないため読み飛ばされ、語彙には
    /// 追加されません。
    pub fn read_lexicalized_dist<P: AsRef<Path>>(
        &mut self,
        path: P,
        limit_phrases: bool,
    ) -> Result<usize> {
        let (col_count, _) =
            self.read_text_file(path.as_ref(), TextFileKind::LexicalizedDist, limit_phrases)?;
        Ok(col_count)
    }

    fn read_text_file(
        &mut self,
        path: &Path,
        kind: TextFileKind,
        limit_phrases: bool,
    ) -> Result<(usize, usize)> {
        if !self.features.is_empty() {
            return Err(TaiyakuError::invalid_state(
                "all text phrase tables must be loaded before any external table is opened",
                path.to_string_lossy(),
            ));
        }
        let model_name = path.to_string_lossy().into_owned();
        let file = File::open(path).map_err(|e| {
            TaiyakuError::invalid_argument(
                "path",
                format!("Failed to open phrase table file {}: {}", model_name, e),
            )
        })?;
        log::info!("[taiyaku] loading phrase table from {}", model_name);

        let num_text = self.num_text_trans_models;
        let num_text_adir = self.num_text_adir_models;
        let lexdis_base = self.num_lexdis_models * NUM_LEXDIS_SCORES;
        let la0 = self.log_almost_0;

        let mut parser = EntryParser::new(&model_name);
        let mut zero_prob_count = 0usize;
        let mut duplicate_count = 0usize;
        let mut oov_target_count = 0usize;
        let mut num_kept = 0usize;

        let mut src_ids: Vec<u32> = vec![];
        let mut src_tokens: Vec<String> = vec![];
        let mut prev_src = String::new();
        let mut prev_leaf: Option<Option<u32>> = None;
        let mut tgt_phrase = CompactPhrase::new();
        let mut named: Vec<(String, String)> = vec![];

        let Self {
            ref mut vocab,
            ref mut text_table,
            ref annotators,
            ..
        } = *self;

        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let split = parser.split_line(&line)?;

            // 原言語が直前の行から変わっていなければ葉を再利用する
            if prev_leaf.is_none() || split.src != prev_src {
                prev_src.clear();
                prev_src.push_str(split.src);
                src_tokens.clear();
                src_tokens.extend(split.src.split_whitespace().map(str::to_string));
                src_ids.clear();
                for token in &src_tokens {
                    src_ids.push(vocab.add(token));
                }
                let leaf = if limit_phrases {
                    text_table.leaf_id(&src_ids)
                } else {
                    Some(text_table.get_or_insert_id_with(&src_ids, TargetPhraseTable::new)?)
                };
                prev_leaf = Some(leaf);
            }
            let Some(leaf_id) = prev_leaf.unwrap() else {
                // 既知フレーズ限定モード: 未知の原言語フレーズは読み飛ばす
                continue;
            };

            named.clear();
            let values = parser.parse_third(split.third, |name, value| {
                named.push((name.to_string(), value.to_string()));
            })?;
            match kind {
                TextFileKind::MultiProb => {
                    if values.is_empty() || values.len() % 2 != 0 {
                        return Err(TaiyakuError::invalid_format(
                            model_name.clone(),
                            format!(
                                "multi-prob phrase table must have an even, nonzero number \
                                 of probability figures, got {}",
                                values.len()
                            ),
                        ));
                    }
                }
                TextFileKind::LexicalizedDist => {
                    if values.len() != NUM_LEXDIS_SCORES {
                        return Err(TaiyakuError::invalid_format(
                            model_name.clone(),
                            format!(
                                "lexicalized distortion table must have exactly {} scores, \
                                 got {}",
                                NUM_LEXDIS_SCORES,
                                values.len()
                            ),
                        ));
                    }
                }
            }
            let adir_values = parser.parse_fourth(split.fourth)?;

            tgt_phrase.clear();
            match kind {
                TextFileKind::MultiProb => {
                    for word in split.tgt.split_whitespace() {
                        tgt_phrase.push(vocab.add(word));
                    }
                }
                TextFileKind::LexicalizedDist => {
                    // 歪みモデルは語彙に新しい単語を追加しない
                    let mut oov = false;
                    for word in split.tgt.split_whitespace() {
                        let id = vocab.index(word);
                        if id == vocab.size() {
                            oov = true;
                            break;
                        }
                        tgt_phrase.push(id);
                    }
                    if oov {
                        oov_target_count += 1;
                        continue;
                    }
                }
            }

            let record = text_table.leaf_mut(leaf_id).get_or_insert(&tgt_phrase);
            let mut convert = |x: f32| {
                if x <= 0.0 {
                    zero_prob_count += 1;
                    la0
                } else {
                    x.ln()
                }
            };

            match kind {
                TextFileKind::MultiProb => {
                    let model_count = values.len() / 2;
                    if record.backward.len() > num_text || record.forward.len() > num_text {
                        // このファイル内で2度目の出現: 最初の出現が勝つ
                        duplicate_count += 1;
                    } else {
                        num_kept += 1;
                        record.pad_models(num_text, la0);
                        record.backward.reserve(model_count);
                        record.forward.reserve(model_count);
                        for &v in &values[..model_count] {
                            record.backward.push(convert(v));
                        }
                        for &v in &values[model_count..] {
                            record.forward.push(convert(v));
                        }
                        if !adir_values.is_empty() {
                            record.pad_adir(num_text_adir, la0);
                            for &v in &adir_values {
                                record.adir.push(convert(v));
                            }
                        }
                    }
                }
                TextFileKind::LexicalizedDist => {
                    if record.lexdis.len() > lexdis_base {
                        duplicate_count += 1;
                    } else {
                        num_kept += 1;
                        if record.lexdis.len() < lexdis_base {
                            record.lexdis.resize(lexdis_base, la0);
                        }
                        for &v in &values {
                            record.lexdis.push(convert(v));
                        }
                    }
                }
            }

            for (name, value) in named.iter().rev() {
                record.annotations.init_annotation(name, value);
            }

            if !annotators.is_empty() {
                let token_refs: Vec<&str> = src_tokens.iter().map(|s| s.as_str()).collect();
                for annotator in annotators.iter() {
                    annotator.annotate(record, &token_refs, &tgt_phrase, vocab);
                }
            }
        }

        log::info!(
            "[taiyaku] {} lines read, {} entries kept from {}",
            parser.lineno(),
            num_kept,
            model_name
        );
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
        if oov_target_count > 0 {
            log::warn!(
                "[taiyaku] {} entries with out-of-vocabulary target words skipped in {}",
                oov_target_count,
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

        // ファイル単位のモデル数をカウンタと説明文に反映する
        self.num_text_files_read += 1;
        match kind {
            TextFileKind::MultiProb => {
                let model_count = parser.third_count() / 2;
                for i in 0..model_count {
                    self.backward_description.push_str(&format!(
                        "TranslationModel:{}(col={})\n",
                        model_name, i
                    ));
                    self.forward_description.push_str(&format!(
                        "ForwardTranslationModel:{}(col={})\n",
                        model_name,
                        i + model_count
                    ));
                }
                for i in 0..parser.fourth_count() {
                    self.adir_description.push_str(&format!(
                        "AdirectionalModel:{}(col={})\n",
                        model_name, i
                    ));
                }
                self.num_text_trans_models += model_count;
                self.num_trans_models += model_count;
                self.num_text_adir_models += parser.fourth_count();
                self.num_adir_models += parser.fourth_count();
            }
            TextFileKind::LexicalizedDist => {
                self.lexdis_description
                    .push_str(&format!("LexicalizedDistortionModel:{}\n", model_name));
                self.num_lexdis_models += 1;
            }
        }
        Ok((parser.third_count(), parser.fourth_count()))
    }

    /// 与えられたフレーズとそのすべてのプレフィックスをテーブルに追加します。
    ///
    /// `limit_phrases = true`で`read_multi_prob`を呼ぶ前に、翻訳対象の
    /// フレーズをあらかじめ投入するために使います。
    ///
    /// # 引数
    ///
    /// * `tokens` - 単語の配列として表されたフレーズ
    /// * `sent_no` - このフレーズが追加される入力文の番号
    pub fn add_phrase(&mut self, tokens: &[&str], sent_no: usize) -> Result<()> {
        let mut ids = Vec::with_capacity(tokens.len());
        for token in tokens {
            ids.push(self.vocab.add(token));
        }
        for len in (1..=ids.len()).rev() {
            let leaf = self
                .text_table
                .get_or_insert_with(&ids[..len], TargetPhraseTable::new)?;
            leaf.input_sent_set.insert(sent_no);
        }
        Ok(())
    }

    /// 翻訳対象のすべての文をテーブルに追加します。
    ///
    /// 既知フレーズ限定モードのための語彙事前投入パスです。各文のすべての
    /// スパンがプレフィックスとして投入され、文ごとの出現ビットセットが
    /// 構築されます。登録済みアノテータにも文が通知されます。
    pub fn add_source_sentences(&mut self, sentences: &[Vec<String>]) -> Result<()> {
        self.num_sents = sentences.len();
        for (sent_no, sentence) in sentences.iter().enumerate() {
            let tokens: Vec<&str> = sentence.iter().map(|s| s.as_str()).collect();
            for start in 0..tokens.len() {
                self.add_phrase(&tokens[start..], sent_no)?;
            }
        }
        for annotator in self.annotators.iter_mut() {
            annotator.add_source_sentences(sentences);
        }
        Ok(())
    }

    /// 既知フレーズ限定モードでの入力文数を返します。
    #[inline(always)]
    pub fn num_sents(&self) -> usize {
        self.num_sents
    }

    /// テーブルが与えられた原言語フレーズを含むかどうかを返します。
    ///
    /// テキストテーブル（トライ）だけを調べ、外部テーブルは調べません。
    pub fn contains_src_phrase(&self, tokens: &[&str]) -> bool {
        let mut ids = Vec::with_capacity(tokens.len());
        for token in tokens {
            let id = self.vocab.index(token);
            if id == self.vocab.size() {
                return false;
            }
            ids.push(id);
        }
        self.text_table.contains_key(&ids)
    }

    /// 1つのフレーズペアのスコアレコードを探します。
    ///
    /// 語彙に新しい単語を追加しません。どちらかのフレーズに未知語が
    /// 含まれる場合は見つかりません。
    pub fn phrase_pair(&self, src: &str, tgt: &str) -> Option<&ScoreRecord> {
        let mut src_ids = vec![];
        for word in src.split_whitespace() {
            let id = self.vocab.index(word);
            if id == self.vocab.size() {
                return None;
            }
            src_ids.push(id);
        }
        let leaf = self.text_table.get(&src_ids)?;
        let mut tgt_phrase = CompactPhrase::new();
        for word in tgt.split_whitespace() {
            let id = self.vocab.index(word);
            if id == self.vocab.size() {
                return None;
            }
            tgt_phrase.push(id);
        }
        leaf.get(&tgt_phrase)
    }

    /// テキスト以外の形式のフレーズテーブルを開きます。
    ///
    /// 拡張子でディスパッチします: `.tpi`はメモリマップされたフレーズ
    /// インデックス、`.mixtm`は混合テーブル、それ以外はテキスト形式の
    /// テーブルとしてインメモリ部品に読み込みます。
    ///
    /// テキスト形式のテーブル（[`read_multi_prob`]）はすべて、最初の
    /// 外部テーブルを開く前に読み込まれていなければなりません。
    ///
    /// [`read_multi_prob`]: Self::read_multi_prob
    pub fn open_table<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let feature: Box<dyn PhraseTableFeature> =
            match path.extension().and_then(|e| e.to_str()) {
                Some("tpi") => Box::new(IndexFeature::open(path)?),
                Some("mixtm") => Box::new(MixtureTable::open(path, &mut self.vocab)?),
                _ => Box::new(TextTableFeature::open(path, &mut self.vocab)?),
            };
        let model_name = feature.model_name().to_string();
        let num_models = feature.num_models();
        let num_adir = feature.num_adir();
        for i in 0..num_models {
            self.backward_description
                .push_str(&format!("TranslationModel:{}(col={})\n", model_name, i));
            self.forward_description.push_str(&format!(
                "ForwardTranslationModel:{}(col={})\n",
                model_name,
                i + num_models
            ));
        }
        for i in 0..num_adir {
            self.adir_description
                .push_str(&format!("AdirectionalModel:{}(col={})\n", model_name, i));
        }
        self.num_trans_models += num_models;
        self.num_adir_models += num_adir;
        self.features.push(feature);
        Ok(())
    }

    /// フレーズテーブルモデル全体の人間可読な説明を返します。
    ///
    /// # 引数
    ///
    /// * `forward_weights` - 順方向TM素性がモデルで使われるかどうか
    pub fn describe_phrase_tables(&self, forward_weights: bool) -> String {
        let mut description = self.backward_description.clone();
        if forward_weights {
            description.push_str(&self.forward_description);
        }
        description.push_str(&self.adir_description);
        description
    }

    /// 語彙化歪みテーブルの説明を返します。
    pub fn describe_lexdis_tables(&self) -> String {
        self.lexdis_description.clone()
    }

    /// 次の問い合わせ群のための原文を設定します。
    ///
    /// 原文の単語は語彙に追加され、開かれているすべての外部テーブルにも
    /// 文が通知されます。
    pub fn new_source_sentence<S: AsRef<str>>(&mut self, tokens: &[S]) {
        self.src_sent = tokens.iter().map(|t| t.as_ref().to_string()).collect();
        self.src_sent_ids.clear();
        for token in &self.src_sent {
            self.src_sent_ids.push(self.vocab.add(token));
        }
        for feature in self.features.iter_mut() {
            feature.new_src_sent(&self.src_sent);
        }
    }

    /// このテーブルとサブモデルが保持するキャッシュをすべて消去します。
    pub fn clear_cache(&mut self) {
        for feature in self.features.iter_mut() {
            feature.clear_cache();
        }
    }

    /// 原文スパンの全フレーズ翻訳を、全テーブルから取得してマージします。
    ///
    /// インメモリトライの結果と、開かれている各外部テーブルの結果を
    /// 1つの目的言語フレーズテーブルに統合します。各ソースのbackward/
    /// forward/adirベクトルは、互いに重ならない事前割り当ての列オフセット
    /// （テキストモデルが先、続いて各外部テーブルが読み込み順）に
    /// 配置され、欠けている列は番兵で埋められます。複数ソース由来の
    /// カウントとアライメントは、それぞれの型固有の更新ポリシーで
    /// 結合されます。
    ///
    /// # 引数
    ///
    /// * `range` - [`new_source_sentence`]で設定した原文の中のスパン
    ///
    /// # 戻り値
    ///
    /// マージされたテーブル。どのテーブルにも候補がなければ`None`。
    ///
    /// [`new_source_sentence`]: Self::new_source_sentence
    pub fn lookup_span(&mut self, range: Range<usize>) -> Option<TargetPhraseTable> {
        if range.start >= range.end || range.end > self.src_sent_ids.len() {
            return None;
        }
        let num_text = self.num_text_trans_models;
        let num_text_adir = self.num_text_adir_models;
        let total_models = self.num_trans_models;
        let total_adir = self.num_adir_models;
        let la0 = self.log_almost_0;

        let mut merged = self
            .text_table
            .get(&self.src_sent_ids[range.clone()])
            .cloned()
            .unwrap_or_default();
        for (_, record) in merged.iter_mut() {
            record.pad_models(num_text, la0);
            record.pad_adir(num_text_adir, la0);
        }

        let Self {
            ref mut vocab,
            ref mut features,
            ref annotators,
            ref src_sent,
            ..
        } = *self;

        let mut col_offset = num_text;
        let mut adir_offset = num_text_adir;
        let mut new_pairs: Vec<CompactPhrase> = vec![];
        for feature in features.iter_mut() {
            let num_models = feature.num_models();
            let num_adir = feature.num_adir();
            let result = feature.find(range.clone(), vocab);
            for (tgt, rec) in result.iter() {
                let is_new = merged.get(tgt).is_none();
                let record = merged.get_or_insert(tgt);
                record.pad_models(col_offset, la0);
                for i in 0..num_models {
                    let b = rec.backward.get(i).copied().unwrap_or(0.0);
                    let f = rec.forward.get(i).copied().unwrap_or(0.0);
                    record.backward.push(shielded_log(b, la0));
                    record.forward.push(shielded_log(f, la0));
                }
                record.pad_adir(adir_offset, la0);
                for i in 0..num_adir {
                    let a = rec.adir.get(i).copied().unwrap_or(0.0);
                    record.adir.push(shielded_log(a, la0));
                }
                record.annotations.merge_from(&rec.annotations);
                if is_new {
                    new_pairs.push(tgt.clone());
                }
            }
            col_offset += num_models;
            adir_offset += num_adir;
        }

        if !annotators.is_empty() && !new_pairs.is_empty() {
            let token_refs: Vec<&str> =
                src_sent[range].iter().map(|s| s.as_str()).collect();
            for tgt in &new_pairs {
                let record = merged.get_or_insert(tgt);
                for annotator in annotators.iter() {
                    annotator.annotate(record, &token_refs, tgt, vocab);
                }
            }
        }

        for (_, record) in merged.iter_mut() {
            record.pad_models(total_models, la0);
            record.pad_adir(total_adir, la0);
        }

        if merged.is_empty() {
            None
        } else {
            Some(merged)
        }
    }

    /// トライから多確率翻訳テーブルをテキスト形式で書き出します。
    ///
    /// 葉の中の目的言語フレーズは辞書順で出力されるため、出力は挿入順に
    /// 依存せず決定的です。番兵値はちょうど`0`として出力されます。
    pub fn write<W: Write>(&self, mut out: W) -> Result<()> {
        let mut io_error: Option<std::io::Error> = None;
        self.text_table.traverse(|prefix, leaf| {
            if io_error.is_some() {
                return;
            }
            let src = phrase_to_string(prefix.iter().copied(), &self.vocab);
            let mut entries: Vec<(String, &ScoreRecord)> = leaf
                .iter()
                .map(|(phrase, record)| {
                    (phrase_to_string(phrase.iter(), &self.vocab), record)
                })
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (tgt, record) in entries {
                if let Err(e) = self.write_entry(&mut out, &src, &tgt, record) {
                    io_error = Some(e);
                    return;
                }
            }
        });
        match io_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn write_entry(
        &self,
        out: &mut dyn Write,
        src: &str,
        tgt: &str,
        record: &ScoreRecord,
    ) -> std::io::Result<()> {
        write!(out, "{}{}{}{}", src, PHRASE_SEP, tgt, PHRASE_SEP)?;
        for i in 0..self.num_text_trans_models {
            if i > 0 {
                write!(out, " ")?;
            }
            let v = record.backward.get(i).copied().unwrap_or(self.log_almost_0);
            write!(out, "{}", self.convert_to_write(v))?;
        }
        for i in 0..self.num_text_trans_models {
            let v = record.forward.get(i).copied().unwrap_or(self.log_almost_0);
            write!(out, " {}", self.convert_to_write(v))?;
        }
        record.annotations.write(out)?;
        if self.num_text_adir_models > 0 {
            write!(out, "{}", PHRASE_SEP)?;
            for i in 0..self.num_text_adir_models {
                if i > 0 {
                    write!(out, " ")?;
                }
                let v = record.adir.get(i).copied().unwrap_or(self.log_almost_0);
                write!(out, "{}", self.convert_to_write(v))?;
            }
        }
        writeln!(out)
    }

    /// 格納値を書き出し用の線形確率に変換します。
    ///
    /// 番兵値はちょうど0になり、微小な正の値として書かれることは
    /// ありません。
    #[inline(always)]
    fn convert_to_write(&self, value: f32) -> f32 {
        if value == self.log_almost_0 {
            0.0
        } else {
            value.exp()
        }
    }

    /// フレーズテーブルファイルの確率列数を、読み込まずに数えます。
    ///
    /// # 戻り値
    ///
    /// 行あたりの確率数。データ行がない場合は0。
    pub fn count_prob_columns<P: AsRef<Path>>(path: P) -> Result<usize> {
        let (third, _) = Self::count_columns(path.as_ref())?;
        Ok(third)
    }

    /// フレーズテーブルファイルの方向なしスコア列数を数えます。
    pub fn count_adir_score_columns<P: AsRef<Path>>(path: P) -> Result<usize> {
        let (_, fourth) = Self::count_columns(path.as_ref())?;
        Ok(fourth)
    }

    fn count_columns(path: &Path) -> Result<(usize, usize)> {
        let model_name = path.to_string_lossy().into_owned();
        let file = File::open(path).map_err(|e| {
            TaiyakuError::invalid_argument(
                "path",
                format!("Failed to open phrase table file {}: {}", model_name, e),
            )
        })?;
        let mut parser = EntryParser::new(&model_name);
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let split = parser.split_line(&line)?;
            let values = parser.parse_third(split.third, |_, _| {})?;
            let adir_values = parser.parse_fourth(split.fourth)?;
            return Ok((values.len(), adir_values.len()));
        }
        log::warn!(
            "[taiyaku] No data lines found in multi-prob phrase table {}",
            model_name
        );
        Ok((0, 0))
    }

    /// テーブル全体に枝刈りビジタを適用します。
    ///
    /// トライの全葉を深さ優先で訪問し、葉ごとにビジタを呼びます。
    /// サイズ予算に合わせてテーブルを縮小するデコーディング前の
    /// パスとして使います。
    pub fn prune(&mut self, visitor: &mut dyn crate::filter::TargetTableVisitor) {
        self.visit_leaves_mut(|vocab, word_count, leaf| visitor.visit(vocab, word_count, leaf));
    }

    /// 全葉をフィルタリングビジタで可変訪問します。
    ///
    /// ビジタは語彙、原言語フレーズの単語数、葉を受け取ります。
    pub(crate) fn visit_leaves_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(&Vocabulary, usize, &mut TargetPhraseTable),
    {
        let Self {
            ref vocab,
            ref mut text_table,
            ..
        } = *self;
        text_table.traverse_mut(|prefix, leaf| f(vocab, prefix.len(), leaf));
    }

    pub(crate) fn trie(&self) -> &PhraseTrie<TargetPhraseTable> {
        &self.text_table
    }
}

/// テキストファイルの種類
#[derive(Clone, Copy, Eq, PartialEq)]
enum TextFileKind {
    /// `src ||| tgt ||| 逆方向確率 順方向確率 [||| 方向なしスコア]`
    MultiProb,
    /// `src ||| tgt ||| pm ps pd nm ns nd`
    LexicalizedDist,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_table(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn lookup_single(
        table: &mut PhraseTable,
        sent: &[&str],
        range: Range<usize>,
        tgt: &str,
    ) -> ScoreRecord {
        table.new_source_sentence(sent);
        let result = table.lookup_span(range).unwrap();
        let phrase: CompactPhrase = tgt
            .split_whitespace()
            .map(|w| table.vocab().index(w))
            .collect();
        result.get(&phrase).unwrap().clone()
    }

    #[test]
    fn test_single_model_lookup() {
        let file = write_table(&["le chat ||| the cat ||| 0.5 0.5"]);
        let mut table = PhraseTable::default();
        assert_eq!(table.read_multi_prob(file.path(), false).unwrap(), 2);
        let record = lookup_single(&mut table, &["le", "chat"], 0..2, "the cat");
        assert_eq!(record.backward.len(), 1);
        assert_eq!(record.forward.len(), 1);
        assert!((record.backward[0] - 0.5f32.ln()).abs() < 1e-6);
        assert!((record.forward[0] - 0.5f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_merge_extends_score_vectors() {
        // 3モデルのファイルに続けて2モデルのファイルを読むと、
        // 両方に現れるペアのベクトル長は5になる
        let file_a = write_table(&["le chat ||| the cat ||| 0.1 0.2 0.3 0.4 0.5 0.6"]);
        let file_b = write_table(&[
            "le chat ||| the cat ||| 0.7 0.8 0.9 0.1",
            "le chat ||| the hat ||| 0.2 0.3 0.4 0.5",
        ]);
        let mut table = PhraseTable::default();
        table.read_multi_prob(file_a.path(), false).unwrap();
        table.read_multi_prob(file_b.path(), false).unwrap();
        assert_eq!(table.num_text_trans_models(), 5);

        let record = lookup_single(&mut table, &["le", "chat"], 0..2, "the cat");
        assert_eq!(record.backward.len(), 5);
        assert_eq!(record.forward.len(), 5);
        // ファイルAのスライスが先、ファイルBのスライスが後
        assert!((record.backward[0] - 0.1f32.ln()).abs() < 1e-6);
        assert!((record.backward[3] - 0.7f32.ln()).abs() < 1e-6);
        assert!((record.forward[2] - 0.6f32.ln()).abs() < 1e-6);
        assert!((record.forward[4] - 0.1f32.ln()).abs() < 1e-6);

        // ファイルBにしかないペアは、ファイルAのスライスが番兵で埋まる
        let record = lookup_single(&mut table, &["le", "chat"], 0..2, "the hat");
        assert_eq!(record.backward.len(), 5);
        assert_eq!(record.backward[0], LOG_ALMOST_0);
        assert_eq!(record.backward[1], LOG_ALMOST_0);
        assert_eq!(record.backward[2], LOG_ALMOST_0);
        assert!((record.backward[3] - 0.2f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_zero_prob_becomes_sentinel() {
        let file = write_table(&["le ||| the ||| 0 0.5"]);
        let mut table = PhraseTable::default();
        table.read_multi_prob(file.path(), false).unwrap();
        let record = lookup_single(&mut table, &["le"], 0..1, "the");
        assert_eq!(record.backward[0], LOG_ALMOST_0);
        assert!((record.forward[0] - 0.5f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_duplicate_pair_first_wins() {
        let file = write_table(&[
            "le ||| the ||| 0.5 0.5",
            "le ||| the ||| 0.1 0.1",
        ]);
        let mut table = PhraseTable::default();
        table.read_multi_prob(file.path(), false).unwrap();
        let record = lookup_single(&mut table, &["le"], 0..1, "the");
        assert_eq!(record.backward.len(), 1);
        assert!((record.backward[0] - 0.5f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_odd_prob_count_is_fatal() {
        let file = write_table(&["le ||| the ||| 0.5 0.5 0.5"]);
        let mut table = PhraseTable::default();
        assert!(table.read_multi_prob(file.path(), false).is_err());
    }

    #[test]
    fn test_bad_format_is_fatal() {
        let file = write_table(&["le ||| the"]);
        let mut table = PhraseTable::default();
        assert!(table.read_multi_prob(file.path(), false).is_err());
    }

    #[test]
    fn test_limit_phrases_keeps_only_known_sources() {
        let file = write_table(&[
            "le chat ||| the cat ||| 0.5 0.5",
            "la maison ||| the house ||| 0.5 0.5",
        ]);
        let mut table = PhraseTable::default();
        table
            .add_source_sentences(&[vec!["le".to_string(), "chat".to_string()]])
            .unwrap();
        table.read_multi_prob(file.path(), true).unwrap();
        assert!(table.phrase_pair("le chat", "the cat").is_some());
        assert!(table.phrase_pair("la maison", "the house").is_none());
    }

    #[test]
    fn test_add_phrase_marks_sentence_bitset() {
        let mut table = PhraseTable::default();
        table.add_phrase(&["le", "chat"], 3).unwrap();
        let ids: Vec<u32> = ["le", "chat"]
            .iter()
            .map(|w| table.vocab().index(w))
            .collect();
        let leaf = table.trie().get(&ids).unwrap();
        assert!(leaf.input_sent_set.contains(3));
        assert!(!leaf.input_sent_set.contains(2));
        // プレフィックスも追加されている
        assert!(table.contains_src_phrase(&["le"]));
    }

    #[test]
    fn test_lexicalized_dist() {
        let pt = write_table(&["le ||| the ||| 0.5 0.5"]);
        let ld = write_table(&["le ||| the ||| 0.1 0.2 0.3 0.1 0.2 0.3"]);
        let mut table = PhraseTable::default();
        table.read_multi_prob(pt.path(), false).unwrap();
        table.read_lexicalized_dist(ld.path(), false).unwrap();
        assert_eq!(table.num_lexdis_models(), 1);
        let record = table.phrase_pair("le", "the").unwrap();
        assert_eq!(record.lexdis.len(), NUM_LEXDIS_SCORES);
        assert!((record.lexdis[0] - 0.1f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_lexicalized_dist_wrong_count_is_fatal() {
        let ld = write_table(&["le ||| the ||| 0.1 0.2"]);
        let mut table = PhraseTable::default();
        assert!(table.read_lexicalized_dist(ld.path(), false).is_err());
    }

    #[test]
    fn test_write_round_trip_with_sentinel() {
        let file = write_table(&[
            "le chat ||| the cat ||| 0.5 0.5",
            "le chat ||| the hat ||| 0 0.25",
        ]);
        let mut table = PhraseTable::default();
        table.read_multi_prob(file.path(), false).unwrap();
        let mut out = Vec::new();
        table.write(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        // 目的言語フレーズは辞書順
        assert!(lines[0].starts_with("le chat ||| the cat ||| "));
        assert!(lines[1].starts_with("le chat ||| the hat ||| 0 "));
        // 番兵はちょうど0として書かれる
        let fields: Vec<&str> = lines[1].split(" ||| ").collect();
        assert_eq!(fields[2].split(' ').next().unwrap(), "0");
    }

    #[test]
    fn test_annotations_survive_ingestion() {
        use crate::annotation::alignment::AlignmentAnnotation;
        use crate::annotation::count::CountAnnotation;
        let file = write_table(&["le ||| the ||| 0.5 0.5 a=0 c=3,1"]);
        let mut table = PhraseTable::default();
        table.read_multi_prob(file.path(), false).unwrap();
        let record = table.phrase_pair("le", "the").unwrap();
        assert_eq!(
            AlignmentAnnotation::get(&record.annotations).unwrap().alignment(),
            "0"
        );
        assert_eq!(
            CountAnnotation::get(&record.annotations).unwrap().joint_counts,
            vec![3.0, 1.0]
        );
    }

    #[test]
    fn test_unknown_annotation_is_kept() {
        use crate::annotation::UnknownAnnotation;
        let file = write_table(&["le ||| the ||| 0.5 0.5 myfield=xyz"]);
        let mut table = PhraseTable::default();
        table.read_multi_prob(file.path(), false).unwrap();
        let record = table.phrase_pair("le", "the").unwrap();
        assert_eq!(
            UnknownAnnotation::get("myfield", &record.annotations)
                .unwrap()
                .value(),
            "xyz"
        );
    }

    #[test]
    fn test_pruning_type_from_str() {
        assert_eq!(
            "forward-weights".parse::<PruningType>().unwrap(),
            PruningType::ForwardWeights
        );
        assert_eq!(
            "backward-weights".parse::<PruningType>().unwrap(),
            PruningType::BackwardWeights
        );
        assert_eq!("combined".parse::<PruningType>().unwrap(), PruningType::Combined);
        assert_eq!("full".parse::<PruningType>().unwrap(), PruningType::External);
        assert!("bogus".parse::<PruningType>().is_err());
    }

    #[test]
    fn test_count_prob_columns() {
        let file = write_table(&["le ||| the ||| 0.5 0.4 0.3 0.2 ||| 0.1"]);
        assert_eq!(PhraseTable::count_prob_columns(file.path()).unwrap(), 4);
        assert_eq!(PhraseTable::count_adir_score_columns(file.path()).unwrap(), 1);
    }

    #[test]
    fn test_text_tables_must_precede_external_tables() {
        let component = write_table(&["le ||| the ||| 0.5 0.5"]);
        let text = write_table(&["chat ||| cat ||| 0.5 0.5"]);
        let mut table = PhraseTable::default();
        table.open_table(component.path()).unwrap();
        assert!(table.read_multi_prob(text.path(), false).is_err());
    }
}
