//! フレーズペア注釈システム
//!
//! このモジュールは、独立した素性がフレーズペアごとに名前付き・型付きの
//! メタデータを付与するための、開かれた拡張可能な仕組みを提供します。
//! ストア本体は注釈の具体型を知りません。
//!
//! 注釈型は名前で識別され、プロセス全体で共有されるレジストリから
//! 単調に割り当てられる小さな整数IDを持ちます。名前からIDへの対応は
//! 恒久的で、すべての[`AnnotationList`]インスタンスが共有します。
//!
//! 既知の注釈型:
//!
//! - `a=` — 単語アライメント（[`alignment::AlignmentAnnotation`]）
//! - `c=` — 結合カウント（[`count::CountAnnotation`]）
//! - それ以外の名前は汎用の文字列注釈として保持されます。未知の名前を
//!   持つフィールドは失敗せず、値がそのまま保存されます。

pub mod alignment;
pub mod count;

use std::any::Any;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, RwLock};

use crate::annotation::alignment::AlignmentAnnotation;
use crate::annotation::count::CountAnnotation;
use crate::phrase::CompactPhrase;
use crate::table::score::ScoreRecord;
use crate::vocab::Vocabulary;

/// 注釈型レジストリ
///
/// プロセス全体で1つだけ存在し、注釈名に恒久的なIDを割り当てます。
/// IDが再利用されることはありません。
static REGISTRY: LazyLock<RwLock<Vocabulary>> = LazyLock::new(|| RwLock::new(Vocabulary::new()));

/// 注釈名に対応する型IDを返します。初出の名前はその場で登録されます。
pub fn annotation_type_id(name: &str) -> u32 {
    if let Some(id) = {
        let registry = REGISTRY.read().unwrap();
        let id = registry.index(name);
        (id < registry.size()).then_some(id)
    } {
        return id;
    }
    REGISTRY.write().unwrap().add(name)
}

/// 型IDに対応する注釈名を返します。
pub fn annotation_type_name(type_id: u32) -> String {
    REGISTRY.read().unwrap().word(type_id).to_string()
}

/// すべての注釈型が実装するトレイト
///
/// 各実装型は以下を備えます:
///
/// - 文字列からの構築（ファクトリ[`create_annotation`]経由）
/// - 新しい文字列値による更新。更新の意味論は型ごとに定義されます
///   （加算、連結、置換、警告して最後の値を保持、など）。
/// - ディープコピー（[`clone_box`](PhrasePairAnnotation::clone_box)）
/// - 人間可読な表示とテキストフレーズテーブル形式への書き出し
pub trait PhrasePairAnnotation: Any {
    /// 注釈の値を新しい文字列値で更新します。
    ///
    /// フレーズテーブルの読み込み中に同じフレーズペアを複数回見たとき
    /// 呼ばれます。意味論は型ごとに異なります。
    fn update_value(&mut self, value: &str);

    /// この注釈のディープコピーを作成します。
    fn clone_box(&self) -> Box<dyn PhrasePairAnnotation>;

    /// テキストフレーズテーブル形式で書かれる値を返します。
    ///
    /// テキスト形式に現れない注釈は`None`を返します。
    fn text_value(&self) -> Option<String> {
        None
    }

    /// デバッグ用に注釈の内容を1行で表示します。
    fn display(&self, _out: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }

    /// テキストフレーズテーブル形式で注釈を書き出します。
    ///
    /// テキスト形式にフィールドとして現れる注釈型だけがオーバーライド
    /// します。
    fn write(&self, _out: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }

    /// ダウンキャストのための`Any`参照を返します。
    fn as_any(&self) -> &dyn Any;

    /// ダウンキャストのための可変`Any`参照を返します。
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl Clone for Box<dyn PhrasePairAnnotation> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// `write()`のためのヘルパ。` name=value`の形式で出力します。
pub fn write_helper(out: &mut dyn Write, name: &str, value: &str) -> io::Result<()> {
    write!(out, " {}={}", name, value)
}

/// 名前と値の文字列から注釈インスタンスを作成するファクトリ
///
/// 名前に応じて適切な具象コンストラクタにディスパッチします。
/// 認識されない名前は失敗せず、汎用の[`UnknownAnnotation`]になります。
/// モデルファイル中の未知の名前付きフィールドは捨てられずに保持されます。
pub fn create_annotation(key: &str, value: &str) -> Box<dyn PhrasePairAnnotation> {
    if key == alignment::NAME {
        Box::new(AlignmentAnnotation::new(value))
    } else if key == count::NAME {
        Box::new(CountAnnotation::parse(value))
    } else {
        Box::new(UnknownAnnotation::new(key, value))
    }
}

static UNKNOWN_UPDATE_WARNED: AtomicBool = AtomicBool::new(false);

/// 未知の名前付きフィールドのための汎用文字列注釈
///
/// 結合の意味論が定義されていないため、更新時はプロセス全体で一度だけ
/// 警告を出し、最後に見た値を保持します。
pub struct UnknownAnnotation {
    name: String,
    value: String,
}

impl UnknownAnnotation {
    /// 新しいインスタンスを作成します。
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    /// 保持している値を返します。
    pub fn value(&self) -> &str {
        &self.value
    }

    /// リストから名前で未知注釈を取得します。
    pub fn get<'a>(name: &str, list: &'a AnnotationList) -> Option<&'a UnknownAnnotation> {
        let type_id = annotation_type_id(name);
        list.get(type_id)
            .and_then(|a| a.as_any().downcast_ref::<UnknownAnnotation>())
    }
}

impl PhrasePairAnnotation for UnknownAnnotation {
    fn update_value(&mut self, value: &str) {
        if !UNKNOWN_UPDATE_WARNED.swap(true, Ordering::Relaxed) {
            log::warn!(
                "[taiyaku] Unknown annotation type {} found in multiple phrase tables; \
                 combination semantics are not defined, keeping the last value seen. \
                 Printing this message only once for all occurrences and all unknown \
                 annotation types.",
                self.name
            );
        }
        self.value = value.to_string();
    }

    fn clone_box(&self) -> Box<dyn PhrasePairAnnotation> {
        Box::new(UnknownAnnotation::new(&self.name, &self.value))
    }

    fn text_value(&self) -> Option<String> {
        Some(self.value.clone())
    }

    fn display(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "\tUnknown annotation    {}={}", self.name, self.value)
    }

    fn write(&self, out: &mut dyn Write) -> io::Result<()> {
        write_helper(out, &self.name, &self.value)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// フレーズペアごとの注釈コンテナ
///
/// 登録順で保持され、登録済み注釈型ごとに高々1つのインスタンスを
/// 持ちます。通常はこの型を直接使わず、各注釈型の型付きアクセサを
/// 経由してください。
#[derive(Default, Clone)]
pub struct AnnotationList {
    annotations: Vec<Option<Box<dyn PhrasePairAnnotation>>>,
}

impl AnnotationList {
    /// 新しい空のリストを作成します。
    pub fn new() -> Self {
        Self::default()
    }

    /// 型IDで注釈を取得します。
    pub fn get(&self, type_id: u32) -> Option<&dyn PhrasePairAnnotation> {
        self.annotations
            .get(type_id as usize)
            .and_then(|a| a.as_deref())
    }

    /// 型IDで注釈への可変参照を取得します。
    pub fn get_mut(&mut self, type_id: u32) -> Option<&mut Box<dyn PhrasePairAnnotation>> {
        self.annotations
            .get_mut(type_id as usize)
            .and_then(|a| a.as_mut())
    }

    /// 型IDの位置に注釈を設定します。既存の注釈は破棄されます。
    pub fn set(&mut self, type_id: u32, annotation: Box<dyn PhrasePairAnnotation>) {
        let idx = type_id as usize;
        if self.annotations.len() <= idx {
            self.annotations.resize_with(idx + 1, || None);
        }
        self.annotations[idx] = Some(annotation);
    }

    /// 注釈を`key=value`表現から初期化します。
    ///
    /// 既存の注釈があればその型固有の更新ポリシーが適用され、
    /// なければファクトリで新規作成されます。
    pub fn init_annotation(&mut self, key: &str, value: &str) {
        let type_id = annotation_type_id(key);
        if let Some(existing) = self.get_mut(type_id) {
            existing.update_value(value);
        } else {
            self.set(type_id, create_annotation(key, value));
        }
    }

    /// 別のリストの内容をこのリストにマージします。
    ///
    /// 相手側にだけある注釈はディープコピーされ、両方にある注釈は
    /// 型固有の更新ポリシー（加算、警告して最後を保持、など）で
    /// 結合されます。
    pub fn merge_from(&mut self, other: &AnnotationList) {
        for (type_id, annotation) in other.annotations.iter().enumerate() {
            let Some(annotation) = annotation else {
                continue;
            };
            let type_id = type_id as u32;
            if let Some(existing) = self.get_mut(type_id) {
                if let Some(value) = annotation.text_value() {
                    existing.update_value(&value);
                }
            } else {
                self.set(type_id, annotation.clone_box());
            }
        }
    }

    /// すべての注釈を破棄します。
    pub fn clear(&mut self) {
        self.annotations.clear();
    }

    /// 注釈が1つもないかどうかを返します。
    pub fn is_empty(&self) -> bool {
        self.annotations.iter().all(|a| a.is_none())
    }

    /// 人間可読な形式で内容を表示します。
    pub fn display(&self, out: &mut dyn Write) -> io::Result<()> {
        for annotation in self.annotations.iter().flatten() {
            annotation.display(out)?;
        }
        Ok(())
    }

    /// テキストフレーズテーブル形式で全注釈を書き出します。
    pub fn write(&self, out: &mut dyn Write) -> io::Result<()> {
        for annotation in self.annotations.iter().flatten() {
            annotation.write(out)?;
        }
        Ok(())
    }
}

/// フレーズテーブル読み込み時に注釈を初期化するコールバック
///
/// アノテータは取り込まれる各フレーズペアについて一度呼ばれ、生の
/// 原言語トークンと目的言語フレーズを調べて注釈を付与・更新します。
/// 対訳文脈素性やスパース素性のサイドチャネルは、取り込みループが
/// それらを知ることなく、この仕組みで注入されます。
///
/// 外部テーブル経由で発見されたペアについても同じコールバックが
/// 呼ばれます。
pub trait PhrasePairAnnotator {
    /// このアノテータが作成する注釈の名前を返します。
    fn name(&self) -> &str;

    /// 初期化に原文が必要なアノテータはこれをオーバーライドします。
    fn add_source_sentences(&mut self, _sentences: &[Vec<String>]) {}

    /// 1つのフレーズペアに注釈を付与します。
    ///
    /// # 引数
    ///
    /// * `record` - 注釈を付けるスコアレコード
    /// * `src_tokens` - 原言語フレーズの生トークン
    /// * `tgt_phrase` - 語彙ID列で表された目的言語フレーズ
    /// * `vocab` - IDから単語への逆引きに使う語彙
    fn annotate(
        &self,
        record: &mut ScoreRecord,
        src_tokens: &[&str],
        tgt_phrase: &CompactPhrase,
        vocab: &Vocabulary,
    );
}
