//! フレーズペアごとのスコアレコードとトライの葉構造

use std::io::{self, Write};

use hashbrown::HashMap;

use crate::annotation::AnnotationList;
use crate::phrase::CompactPhrase;

/// 1つのフレーズペアに対するスコアレコード
///
/// 各スコアベクトルは独立した複数モデルからの値を保持します。不変条件:
/// 1つのレコード内で`backward.len() == forward.len()`であり、これは
/// それまでにマージされたテキスト由来モデルの数に等しくなります。
/// 欠損値は不在のまま放置されず、新しいモデルをマージする前に
/// 「ほぼゼロ」の番兵でパディングされます。
#[derive(Default, Clone)]
pub struct ScoreRecord {
    /// 各モデルのP(原言語|目的言語)（対数空間）
    pub backward: Vec<f32>,

    /// 各モデルのP(目的言語|原言語)（対数空間）
    pub forward: Vec<f32>,

    /// 方向に分解されないモデル固有スコア（対数空間)
    pub adir: Vec<f32>,

    /// 語彙化歪みモデルごとの6方向スコア（対数空間）
    pub lexdis: Vec<f32>,

    /// 各素性が残した注釈
    pub annotations: AnnotationList,
}

impl ScoreRecord {
    /// すべての値をリセットします。再利用する前に呼んでください。
    pub fn clear(&mut self) {
        self.backward.clear();
        self.forward.clear();
        self.adir.clear();
        self.lexdis.clear();
        self.annotations.clear();
    }

    /// backward/forwardベクトルを`n`モデル分まで番兵でパディングします。
    pub fn pad_models(&mut self, n: usize, log_almost_0: f32) {
        if self.backward.len() < n {
            self.backward.resize(n, log_almost_0);
        }
        if self.forward.len() < n {
            self.forward.resize(n, log_almost_0);
        }
    }

    /// adirベクトルを`n`列まで番兵でパディングします。
    pub fn pad_adir(&mut self, n: usize, log_almost_0: f32) {
        if self.adir.len() < n {
            self.adir.resize(n, log_almost_0);
        }
    }

    /// デバッグ用にレコードの内容をASCII形式で表示します。
    pub fn print(&self, out: &mut dyn Write) -> io::Result<()> {
        write!(out, "backward:")?;
        for p in &self.backward {
            write!(out, " {}", p)?;
        }
        write!(out, " forward:")?;
        for p in &self.forward {
            write!(out, " {}", p)?;
        }
        if !self.adir.is_empty() {
            write!(out, " adir:")?;
            for p in &self.adir {
                write!(out, " {}", p)?;
            }
        }
        writeln!(out)?;
        self.annotations.display(out)
    }
}

/// 入力文集合のビットセット
///
/// フィルタリング（既知フレーズ限定）モードで、原言語フレーズが
/// どの入力文に現れるかを記録します。
#[derive(Default, Clone)]
pub struct SentenceBitSet {
    bits: Vec<u64>,
}

impl SentenceBitSet {
    /// 文番号のビットを立てます。
    pub fn insert(&mut self, sent_no: usize) {
        let word = sent_no / 64;
        if self.bits.len() <= word {
            self.bits.resize(word + 1, 0);
        }
        self.bits[word] |= 1u64 << (sent_no % 64);
    }

    /// 文番号のビットが立っているかどうかを返します。
    #[inline(always)]
    pub fn contains(&self, sent_no: usize) -> bool {
        self.bits
            .get(sent_no / 64)
            .is_some_and(|w| w & (1u64 << (sent_no % 64)) != 0)
    }

    /// 立っているビットの数を返します。
    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// ビットが1つも立っていないかどうかを返します。
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }
}

/// トライの葉構造: 目的言語フレーズからスコアレコードへのマップ
///
/// 目的言語フレーズごとにレコードは一意です。再挿入は複製を作らず、
/// 既存レコードへのマージになります。
#[derive(Default, Clone)]
pub struct TargetPhraseTable {
    map: HashMap<CompactPhrase, ScoreRecord>,

    /// 原言語フレーズが現れる入力文の集合。
    /// 既知フレーズ限定モードでのみ使われ、それ以外では空のままです。
    pub input_sent_set: SentenceBitSet,
}

impl TargetPhraseTable {
    /// 新しい空のテーブルを作成します。
    pub fn new() -> Self {
        Self::default()
    }

    /// 目的言語フレーズのレコードを取得し、なければ作成します。
    pub fn get_or_insert(&mut self, phrase: &CompactPhrase) -> &mut ScoreRecord {
        self.map.entry(phrase.clone()).or_default()
    }

    /// 目的言語フレーズのレコードを取得します。
    #[inline(always)]
    pub fn get(&self, phrase: &CompactPhrase) -> Option<&ScoreRecord> {
        self.map.get(phrase)
    }

    /// レコードを直接挿入します。既存のレコードは置き換えられます。
    pub fn insert(&mut self, phrase: CompactPhrase, record: ScoreRecord) {
        self.map.insert(phrase, record);
    }

    /// エントリ数を返します。
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// テーブルが空かどうかを返します。
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// 全エントリを走査するイテレータを返します。
    pub fn iter(&self) -> impl Iterator<Item = (&CompactPhrase, &ScoreRecord)> {
        self.map.iter()
    }

    /// 全エントリを可変走査するイテレータを返します。
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&CompactPhrase, &mut ScoreRecord)> {
        self.map.iter_mut()
    }

    /// 全エントリを取り出し、テーブルを空にします。
    pub fn drain_entries(&mut self) -> Vec<(CompactPhrase, ScoreRecord)> {
        self.map.drain().collect()
    }

    /// 内容を消去します。
    ///
    /// ストリーミングフィルタリングでは、フラッシュ済みの葉をこれで
    /// 即座に解放してメモリを抑えます。
    pub fn clear(&mut self) {
        self.map.clear();
    }
}
