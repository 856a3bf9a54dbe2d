//! 単語アライメント注釈
//!
//! フレーズテーブルの`a=`フィールドから読み込まれる、フレーズペア内の
//! 単語アライメントを保持する注釈です。テキスト表現は原言語の単語ごとの
//! 目的言語位置集合で、集合は`_`で区切り、集合内の位置は`,`で区切り、
//! 空集合は`-`と書きます（例: `a=0,1_2_-`）。

use std::any::Any;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::LazyLock;

use crate::annotation::{
    annotation_type_id, write_helper, AnnotationList, PhrasePairAnnotation,
};

/// この注釈型の名前
pub const NAME: &str = "a";

static TYPE_ID: LazyLock<u32> = LazyLock::new(|| annotation_type_id(NAME));

static DUPLICATE_WARNED: AtomicBool = AtomicBool::new(false);

/// 単語アライメント注釈
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlignmentAnnotation {
    alignment: String,
}

impl AlignmentAnnotation {
    /// テキスト表現から新しいインスタンスを作成します。
    pub fn new(alignment: &str) -> Self {
        Self {
            alignment: alignment.to_string(),
        }
    }

    /// この注釈型の恒久的な型IDを返します。
    #[inline(always)]
    pub fn type_id() -> u32 {
        *TYPE_ID
    }

    /// アライメントのテキスト表現を返します。
    #[inline(always)]
    pub fn alignment(&self) -> &str {
        &self.alignment
    }

    /// リストからアライメント注釈を取得します。
    pub fn get(list: &AnnotationList) -> Option<&AlignmentAnnotation> {
        list.get(Self::type_id())
            .and_then(|a| a.as_any().downcast_ref::<AlignmentAnnotation>())
    }

    /// アライメントを原言語単語ごとの目的言語位置集合に復号します。
    ///
    /// 同じ（アライメント, 原言語長）の組はデコーディング中に同じフレーズ
    /// ペアへ繰り返し問い合わせられるため、呼び出し側が所有する単一スロット
    /// のメモ[`AlignmentCache`]を経由して返します。
    ///
    /// # 引数
    ///
    /// * `src_len` - 原言語フレーズの単語数
    /// * `cache` - 呼び出し側が所有するデコードキャッシュ
    ///
    /// # 戻り値
    ///
    /// 長さ`src_len`の、原言語単語ごとの目的言語位置集合
    pub fn alignment_sets<'c>(
        &self,
        src_len: usize,
        cache: &'c mut AlignmentCache,
    ) -> &'c [Vec<u32>] {
        if !cache.matches(&self.alignment, src_len) {
            cache.key = Some((self.alignment.clone(), src_len));
            cache.sets.clear();
            for part in self.alignment.split('_').take(src_len) {
                let mut set = vec![];
                if part != "-" && !part.is_empty() {
                    for pos in part.split(',') {
                        match pos.parse::<u32>() {
                            Ok(p) => set.push(p),
                            Err(_) => {
                                static PARSE_WARNED: AtomicBool = AtomicBool::new(false);
                                if !PARSE_WARNED.swap(true, Ordering::Relaxed) {
                                    log::warn!(
                                        "[taiyaku] Invalid alignment link {:?} in alignment {:?}; \
                                         ignoring it. Printing this message only once.",
                                        pos,
                                        self.alignment
                                    );
                                }
                            }
                        }
                    }
                }
                cache.sets.push(set);
            }
            cache.sets.resize(src_len, vec![]);
        }
        &cache.sets
    }
}

impl PhrasePairAnnotation for AlignmentAnnotation {
    /// 重複したアライメントは一度だけ警告し、最後に見た値を保持します。
    fn update_value(&mut self, value: &str) {
        if value != self.alignment && !DUPLICATE_WARNED.swap(true, Ordering::Relaxed) {
            log::warn!(
                "[taiyaku] Duplicate alignment for the same phrase pair with different \
                 values; keeping the last value seen. Printing this message only once.",
            );
        }
        self.alignment = value.to_string();
    }

    fn clone_box(&self) -> Box<dyn PhrasePairAnnotation> {
        Box::new(self.clone())
    }

    fn text_value(&self) -> Option<String> {
        Some(self.alignment.clone())
    }

    fn display(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "\tAlignment             {}", self.alignment)
    }

    fn write(&self, out: &mut dyn Write) -> io::Result<()> {
        write_helper(out, NAME, &self.alignment)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// アライメント復号結果の単一スロットメモ
///
/// （アライメント文字列, 原言語長）をキーとし、最後に復号した結果を
/// 保持します。隠れたプロセス全体の可変状態ではなく、呼び出し側が
/// 所有することで、繰り返し利用時も挙動が決定的になります。
#[derive(Default)]
pub struct AlignmentCache {
    key: Option<(String, usize)>,
    sets: Vec<Vec<u32>>,
}

impl AlignmentCache {
    /// 新しい空のキャッシュを作成します。
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    fn matches(&self, alignment: &str, src_len: usize) -> bool {
        self.key
            .as_ref()
            .is_some_and(|(a, l)| a == alignment && *l == src_len)
    }
}
