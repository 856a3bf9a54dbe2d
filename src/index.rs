//! メモリマップされた外部フレーズインデックス
//!
//! このモジュールは、事前構築されたディスク常駐のソート済みフレーズ
//! インデックスを提供します。インデックスは一度開けば、テーブル全体を
//! メモリに読み込むことなく何度でも検索できます。ランダムアクセスは
//! OSのページキャッシュが吸収するため、巨大なモデルの検索も実質的に
//! ファイルサイズに比例しないコストで済みます。
//!
//! ファイル形式はマジックバイトのヘッダ、16バイト境界までのパディング、
//! それに続くrkyvアーカイブです。読み込みはメモリマッピングによる
//! ゼロコピーアクセスで、アーカイブの検証に失敗した場合はアライメント
//! 済みヒープバッファへのコピーにフォールバックします。

use std::fs::File;
use std::io::{Read, Write};
use std::ops::{Deref, Range};
use std::path::Path;

use hashbrown::HashMap;
use memmap2::Mmap;
use rkyv::rancor::Error;
use rkyv::util::AlignedVec;
use rkyv::{
    access, api::serialize_using, ser::allocator::Arena, ser::sharing::Share,
    ser::writer::IoWriter, ser::Serializer, util::with_arena, Archive, Deserialize,
    Serialize,
};

use crate::annotation::alignment::AlignmentAnnotation;
use crate::annotation::count::CountAnnotation;
use crate::errors::{Result, TaiyakuError};
use crate::phrase::CompactPhrase;
use crate::table::entry::EntryParser;
use crate::table::feature::PhraseTableFeature;
use crate::table::score::TargetPhraseTable;
use crate::vocab::Vocabulary;

/// フレーズインデックスファイルを識別するマジックバイト
///
/// 末尾の"0.1"はファイルフォーマットのバージョンを示し、クレートの
/// セマンティックバージョンからは切り離されています。
pub const INDEX_MAGIC: &[u8] = b"TaiyakuPhraseIndex 0.1\n";

const INDEX_MAGIC_LEN: usize = INDEX_MAGIC.len();
const RKYV_ALIGNMENT: usize = 16;
const PADDING_LEN: usize = (RKYV_ALIGNMENT - (INDEX_MAGIC_LEN % RKYV_ALIGNMENT)) % RKYV_ALIGNMENT;
const DATA_START: usize = INDEX_MAGIC_LEN + PADDING_LEN;

/// インデックスの1エントリ
///
/// スコアはテキストテーブルと同じ線形確率で格納されます。
#[derive(Archive, Serialize, Deserialize)]
pub struct IndexEntry {
    /// 目的言語フレーズ
    target: String,
    /// 逆方向確率が先、順方向確率が後（合わせて2×モデル数）
    probs: Vec<f32>,
    /// 方向なしスコア
    adir: Vec<f32>,
    /// 結合カウント（ない場合は空）
    counts: Vec<f32>,
    /// アライメント（ない場合は空文字列）
    alignment: String,
}

/// フレーズインデックスの内部データ
///
/// 原言語フレーズ文字列をソート済みで保持し、フレーズごとのエントリは
/// 並行する範囲テーブルで引きます。
#[derive(Archive, Serialize, Deserialize)]
pub struct PhraseIndexInner {
    /// ソート済みの原言語フレーズ文字列
    sources: Vec<String>,
    /// `sources[i]`のエントリは`entries[offsets[i]..offsets[i+1]]`
    offsets: Vec<u32>,
    entries: Vec<IndexEntry>,
    num_models: u32,
    num_adir: u32,
    num_counts: u32,
    has_alignments: bool,
}

impl PhraseIndexInner {
    /// インデックスをrkyv形式でライターにシリアライズします。
    ///
    /// この関数の出力バイナリは[`PhraseIndex::from_path`]などの読み込み
    /// メソッドが期待する形式です。
    ///
    /// # エラー
    ///
    /// ライターへの書き込みに失敗した場合、またはシリアライゼーションで
    /// エラーが発生した場合にエラーを返します。
    pub fn write<W>(&self, mut wtr: W) -> Result<()>
    where
        W: Write,
    {
        wtr.write_all(INDEX_MAGIC)?;

        let padding_bytes = vec![0xFF; PADDING_LEN];
        wtr.write_all(&padding_bytes)?;

        with_arena(|arena: &mut Arena| {
            let writer = IoWriter::new(&mut wtr);
            let mut serializer = Serializer::new(writer, arena.acquire(), Share::new());
            serialize_using::<_, Error>(self, &mut serializer)
        })
        .map_err(|e| {
            TaiyakuError::invalid_state("rkyv serialization failed".to_string(), e.to_string())
        })?;

        Ok(())
    }

    /// インデックスをファイルにアトミックに書き出します。
    ///
    /// 同じディレクトリの一時ファイルに書いてから`persist`で置き換える
    /// ため、書き込み途中のファイルが観測されることはありません。
    pub fn write_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let dir = path.parent().ok_or_else(|| {
            TaiyakuError::invalid_argument("path", "Output path must have a parent directory.")
        })?;
        let mut temp_file = tempfile::NamedTempFile::new_in(dir)?;
        self.write(&mut temp_file)?;
        temp_file.as_file().sync_all()?;
        temp_file.persist(path)?;
        Ok(())
    }
}

/// メモリバッファ（mmapまたはヒープ）を保持するラッパー
#[allow(dead_code)]
enum IndexBuffer {
    Mmap(Mmap),
    Aligned(AlignedVec<16>),
}

/// 読み取り専用のフレーズインデックス
///
/// ゼロコピーデシリアライゼーションによって読み込まれたインデックス
/// です。バッファとアーカイブされたデータへの参照を保持します。
pub struct PhraseIndex {
    _buffer: IndexBuffer,
    data: &'static ArchivedPhraseIndexInner,
}

impl Deref for PhraseIndex {
    type Target = ArchivedPhraseIndexInner;
    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl PhraseIndex {
    /// メモリマッピングを使用してファイルパスからインデックスを開きます。
    ///
    /// アーカイブの検証はマップされたバイト列に対して行われ、マッピングが
    /// アライメント要件を満たさない場合はアライメント済みヒープバッファへ
    /// コピーして再検証します。
    ///
    /// # エラー
    ///
    /// ファイルが開けない場合、マジックナンバーが一致しない場合、
    /// アーカイブが破損している場合にエラーを返します。
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| {
            TaiyakuError::invalid_argument("path", format!("Failed to open index file: {}", e))
        })?;
        let mut magic = [0u8; INDEX_MAGIC_LEN];
        file.read_exact(&mut magic)?;

        if !magic.starts_with(INDEX_MAGIC) {
            return Err(TaiyakuError::invalid_argument(
                "path",
                "The magic number of the input index mismatches.",
            ));
        }

        let mmap = unsafe { Mmap::map(&file)? };

        let Some(data_bytes) = &mmap.get(DATA_START..) else {
            return Err(TaiyakuError::invalid_argument(
                "path",
                "Index file too small or corrupted.",
            ));
        };

        match access::<ArchivedPhraseIndexInner, Error>(data_bytes) {
            Ok(archived) => {
                // SAFETY: バッファはdataと同じ構造体が所有し続ける
                let data: &'static ArchivedPhraseIndexInner = unsafe { &*(archived as *const _) };
                Ok(Self {
                    _buffer: IndexBuffer::Mmap(mmap),
                    data,
                })
            }
            Err(_) => {
                let mut aligned_bytes = AlignedVec::with_capacity(data_bytes.len());
                aligned_bytes.extend_from_slice(data_bytes);

                let archived =
                    access::<ArchivedPhraseIndexInner, Error>(&aligned_bytes).map_err(|e| {
                        TaiyakuError::invalid_state(
                            "rkyv validation failed. The index file may be corrupted or \
                             incompatible."
                                .to_string(),
                            e.to_string(),
                        )
                    })?;

                // SAFETY: AlignedVecが正しいアライメントを保証する
                let data: &'static ArchivedPhraseIndexInner = unsafe { &*(archived as *const _) };
                Ok(Self {
                    _buffer: IndexBuffer::Aligned(aligned_bytes),
                    data,
                })
            }
        }
    }

    /// すべてのデータをヒープバッファに読み込んで、リーダーから
    /// インデックスを作成します。
    ///
    /// ファイルパスが利用できない場合のフォールバックです。
    pub fn read<R: Read>(mut rdr: R) -> Result<Self> {
        let mut magic = [0; INDEX_MAGIC_LEN];
        rdr.read_exact(&mut magic)?;

        if !magic.starts_with(INDEX_MAGIC) {
            return Err(TaiyakuError::invalid_argument(
                "rdr",
                "The magic number of the input index mismatches.",
            ));
        }

        let mut padding_buf = vec![0; PADDING_LEN];
        rdr.read_exact(&mut padding_buf)?;

        let mut buffer = Vec::new();
        rdr.read_to_end(&mut buffer)?;

        let mut aligned_bytes = AlignedVec::with_capacity(buffer.len());
        aligned_bytes.extend_from_slice(&buffer);

        let archived = access::<ArchivedPhraseIndexInner, Error>(&aligned_bytes).map_err(|e| {
            TaiyakuError::invalid_state(
                "rkyv validation failed. The index file may be corrupted or incompatible."
                    .to_string(),
                e.to_string(),
            )
        })?;

        // SAFETY: AlignedVecが正しいアライメントを保証する
        let data: &'static ArchivedPhraseIndexInner = unsafe { &*(archived as *const _) };

        Ok(Self {
            _buffer: IndexBuffer::Aligned(aligned_bytes),
            data,
        })
    }

    /// インデックスファイルのメモリマップサイズを返します。
    ///
    /// 問題があった場合は0を返します。
    pub fn memmap_size<P: AsRef<Path>>(path: P) -> u64 {
        std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
    }
}

impl ArchivedPhraseIndexInner {
    /// 逆方向・順方向モデルの数を返します。
    #[inline(always)]
    pub fn num_models(&self) -> usize {
        self.num_models.to_native() as usize
    }

    /// 方向なしスコアの数を返します。
    #[inline(always)]
    pub fn num_adir(&self) -> usize {
        self.num_adir.to_native() as usize
    }

    /// カウント値の数を返します。
    #[inline(always)]
    pub fn num_counts(&self) -> usize {
        self.num_counts.to_native() as usize
    }

    /// アライメントが格納されているかどうかを返します。
    #[inline(always)]
    pub fn has_alignments(&self) -> bool {
        self.has_alignments
    }

    /// 格納されている原言語フレーズの数を返します。
    #[inline(always)]
    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    /// 原言語フレーズ文字列でエントリを検索します。
    ///
    /// ソート済みフレーズ列に対する二分探索です。
    pub fn lookup(&self, source: &str) -> &[ArchivedIndexEntry] {
        match self
            .sources
            .binary_search_by(|s| s.as_str().cmp(source))
        {
            Ok(idx) => {
                let start = self.offsets[idx].to_native() as usize;
                let end = self.offsets[idx + 1].to_native() as usize;
                &self.entries[start..end]
            }
            Err(_) => &[],
        }
    }
}

/// フレーズインデックスを構築するビルダー
///
/// エントリは原言語フレーズの昇順で追加しなければなりません。通常は
/// ソート済みのテキストフレーズテーブルから[`from_text_file`]で
/// 構築します。
///
/// [`from_text_file`]: Self::from_text_file
pub struct PhraseIndexBuilder {
    num_models: usize,
    num_adir: usize,
    num_counts: usize,
    has_alignments: bool,
    sources: Vec<String>,
    offsets: Vec<u32>,
    entries: Vec<IndexEntry>,
}

impl PhraseIndexBuilder {
    /// 新しいビルダーを作成します。
    ///
    /// # 引数
    ///
    /// * `num_models` - 逆方向・順方向モデルの数
    /// * `num_adir` - 方向なしスコアの数
    pub fn new(num_models: usize, num_adir: usize) -> Self {
        Self {
            num_models,
            num_adir,
            num_counts: 0,
            has_alignments: false,
            sources: vec![],
            offsets: vec![],
            entries: vec![],
        }
    }

    /// エントリを追加します。
    ///
    /// # 引数
    ///
    /// * `source` - 原言語フレーズ。直前のエントリと同じか、それより
    ///   辞書順で大きくなければなりません。
    /// * `target` - 目的言語フレーズ
    /// * `probs` - 線形確率。逆方向が先、順方向が後で、長さは
    ///   2×モデル数でなければなりません。
    /// * `adir` - 方向なしスコア
    /// * `counts` - 結合カウント（ない場合は空）
    /// * `alignment` - アライメント
    pub fn add_entry(
        &mut self,
        source: &str,
        target: &str,
        probs: &[f32],
        adir: &[f32],
        counts: &[f32],
        alignment: Option<&str>,
    ) -> Result<()> {
        if probs.len() != 2 * self.num_models {
            return Err(TaiyakuError::invalid_argument(
                "probs",
                format!(
                    "expected {} probabilities, got {}",
                    2 * self.num_models,
                    probs.len()
                ),
            ));
        }
        if adir.len() != self.num_adir {
            return Err(TaiyakuError::invalid_argument(
                "adir",
                format!("expected {} adirectional scores, got {}", self.num_adir, adir.len()),
            ));
        }
        if self.sources.last().map(|s| s.as_str()) != Some(source) {
            if let Some(last) = self.sources.last() {
                if source < last.as_str() {
                    return Err(TaiyakuError::invalid_argument(
                        "source",
                        format!(
                            "source phrases must be added in ascending order; {:?} came \
                             after {:?}",
                            source, last
                        ),
                    ));
                }
            }
            self.sources.push(source.to_string());
            self.offsets.push(self.entries.len() as u32);
        }
        self.num_counts = self.num_counts.max(counts.len());
        self.has_alignments |= alignment.is_some();
        self.entries.push(IndexEntry {
            target: target.to_string(),
            probs: probs.to_vec(),
            adir: adir.to_vec(),
            counts: counts.to_vec(),
            alignment: alignment.unwrap_or_default().to_string(),
        });
        Ok(())
    }

    /// インデックスを確定します。
    pub fn build(mut self) -> PhraseIndexInner {
        self.offsets.push(self.entries.len() as u32);
        PhraseIndexInner {
            sources: self.sources,
            offsets: self.offsets,
            entries: self.entries,
            num_models: self.num_models as u32,
            num_adir: self.num_adir as u32,
            num_counts: self.num_counts as u32,
            has_alignments: self.has_alignments,
        }
    }

    /// ソート済みのテキスト形式フレーズテーブルからインデックスを
    /// 構築します。
    ///
    /// # エラー
    ///
    /// 行形式が不正な場合、確率列数が奇数または0の場合、原言語フレーズが
    /// ソートされていない場合にエラーを返します。
    pub fn from_text_file<P: AsRef<Path>>(path: P) -> Result<PhraseIndexInner> {
        use std::io::{BufRead, BufReader};

        let path = path.as_ref();
        let model_name = path.to_string_lossy().into_owned();
        let file = File::open(path).map_err(|e| {
            TaiyakuError::invalid_argument(
                "path",
                format!("Failed to open phrase table file {}: {}", model_name, e),
            )
        })?;

        let mut parser = EntryParser::new(&model_name);
        let mut builder: Option<PhraseIndexBuilder> = None;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let split = parser.split_line(&line)?;
            let mut counts: Vec<f32> = vec![];
            let mut alignment: Option<String> = None;
            let values = parser.parse_third(split.third, |name, value| {
                if name == crate::annotation::count::NAME {
                    counts = CountAnnotation::parse(value).joint_counts;
                } else if name == crate::annotation::alignment::NAME {
                    alignment = Some(value.to_string());
                }
            })?;
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
            let adir_values = parser.parse_fourth(split.fourth)?;
            let builder = builder.get_or_insert_with(|| {
                PhraseIndexBuilder::new(values.len() / 2, adir_values.len())
            });
            builder.add_entry(
                split.src,
                split.tgt,
                &values,
                &adir_values,
                &counts,
                alignment.as_deref(),
            )?;
        }
        match builder {
            Some(builder) => Ok(builder.build()),
            None => Err(TaiyakuError::invalid_format(
                model_name,
                "no data lines found",
            )),
        }
    }
}

/// メモリマップされたインデックスをデコーダ素性として公開するアダプタ
///
/// スパンごとの検索結果は文単位でキャッシュされ、[`clear_cache`]または
/// 次の文の設定で破棄されます。
///
/// [`clear_cache`]: PhraseTableFeature::clear_cache
pub struct IndexFeature {
    model_name: String,
    index: PhraseIndex,
    src_sent: Vec<String>,
    cache: HashMap<(usize, usize), TargetPhraseTable>,
}

impl IndexFeature {
    /// インデックスファイルを開きます。
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        Ok(Self {
            model_name: path.to_string_lossy().into_owned(),
            index: PhraseIndex::from_path(path)?,
            src_sent: vec![],
            cache: HashMap::new(),
        })
    }

    /// 開いたインデックスへの参照を返します。
    pub fn index(&self) -> &PhraseIndex {
        &self.index
    }
}

impl PhraseTableFeature for IndexFeature {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn num_models(&self) -> usize {
        self.index.num_models()
    }

    fn num_adir(&self) -> usize {
        self.index.num_adir()
    }

    fn num_counts(&self) -> usize {
        self.index.num_counts()
    }

    fn has_alignments(&self) -> bool {
        self.index.has_alignments()
    }

    fn new_src_sent(&mut self, sentence: &[String]) {
        self.src_sent = sentence.to_vec();
        self.cache.clear();
    }

    fn clear_cache(&mut self) {
        self.cache.clear();
    }

    fn find(&mut self, range: Range<usize>, vocab: &mut Vocabulary) -> TargetPhraseTable {
        let key = (range.start, range.end);
        if let Some(cached) = self.cache.get(&key) {
            return cached.clone();
        }
        let Some(tokens) = self.src_sent.get(range) else {
            return TargetPhraseTable::new();
        };
        let source = tokens.join(" ");
        let mut table = TargetPhraseTable::new();
        for entry in self.index.lookup(&source) {
            let mut phrase = CompactPhrase::new();
            for word in entry.target.as_str().split_whitespace() {
                phrase.push(vocab.add(word));
            }
            let record = table.get_or_insert(&phrase);
            let num_models = self.index.num_models();
            for i in 0..num_models {
                record
                    .backward
                    .push(entry.probs.get(i).map(|p| p.to_native()).unwrap_or(0.0));
                record.forward.push(
                    entry
                        .probs
                        .get(i + num_models)
                        .map(|p| p.to_native())
                        .unwrap_or(0.0),
                );
            }
            for p in entry.adir.iter() {
                record.adir.push(p.to_native());
            }
            if !entry.counts.is_empty() {
                let counts: Vec<f32> = entry.counts.iter().map(|c| c.to_native()).collect();
                record.annotations.set(
                    CountAnnotation::type_id(),
                    Box::new(CountAnnotation {
                        joint_counts: counts,
                    }),
                );
            }
            if !entry.alignment.is_empty() {
                record.annotations.set(
                    AlignmentAnnotation::type_id(),
                    Box::new(AlignmentAnnotation::new(entry.alignment.as_str())),
                );
            }
        }
        self.cache.insert(key, table.clone());
        table
    }
}
