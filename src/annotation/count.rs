//! 結合カウント注釈
//!
//! フレーズテーブルの`c=`フィールドから読み込まれる、フレーズペアの
//! 結合カウント列を保持する注釈です。テキスト表現はカンマ区切りの
//! 数値列です（例: `c=3,1`）。
//!
//! 更新ポリシーは取り込みモードに依存します。デフォルトでは要素ごとの
//! 加算、連結モードでは新しいカウント列を末尾に追加します。

use std::any::Any;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::LazyLock;

use crate::annotation::{
    annotation_type_id, write_helper, AnnotationList, PhrasePairAnnotation,
};

/// この注釈型の名前
pub const NAME: &str = "c";

static TYPE_ID: LazyLock<u32> = LazyLock::new(|| annotation_type_id(NAME));

/// 連結モードのフラグ
///
/// 異なる入力テーブル由来のカウントを要素ごとに加算する（デフォルト）か、
/// 連結するかを制御します。テーブルの読み込みを始める前に設定して
/// ください。
static APPEND_MODE: AtomicBool = AtomicBool::new(false);

/// カウントの更新を連結モードにするかどうかを設定します。
pub fn set_append_joint_counts(append: bool) {
    APPEND_MODE.store(append, Ordering::Relaxed);
}

/// 結合カウント注釈
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CountAnnotation {
    /// 結合カウント列
    pub joint_counts: Vec<f32>,
}

impl CountAnnotation {
    /// カンマ区切りのテキスト表現からインスタンスを作成します。
    ///
    /// 数値として解釈できない要素は0として扱い、一度だけ警告します。
    pub fn parse(value: &str) -> Self {
        let mut counts = vec![];
        for token in value.split(',') {
            match token.parse::<f32>() {
                Ok(c) if c.is_finite() => counts.push(c),
                _ => {
                    static PARSE_WARNED: AtomicBool = AtomicBool::new(false);
                    if !PARSE_WARNED.swap(true, Ordering::Relaxed) {
                        log::warn!(
                            "[taiyaku] Invalid count value {:?} in count field {:?}; \
                             using 0. Printing this message only once.",
                            token,
                            value
                        );
                    }
                    counts.push(0.0);
                }
            }
        }
        Self {
            joint_counts: counts,
        }
    }

    /// この注釈型の恒久的な型IDを返します。
    #[inline(always)]
    pub fn type_id() -> u32 {
        *TYPE_ID
    }

    /// リストからカウント注釈を取得します。
    pub fn get(list: &AnnotationList) -> Option<&CountAnnotation> {
        list.get(Self::type_id())
            .and_then(|a| a.as_any().downcast_ref::<CountAnnotation>())
    }

    /// リストからカウント注釈を取得し、なければ空で作成します。
    pub fn get_or_create(list: &mut AnnotationList) -> &mut CountAnnotation {
        let type_id = Self::type_id();
        if list.get(type_id).is_none() {
            list.set(type_id, Box::new(CountAnnotation::default()));
        }
        list.get_mut(type_id)
            .and_then(|a| a.as_any_mut().downcast_mut::<CountAnnotation>())
            .unwrap()
    }

    /// 別のカウント列をこの注釈に結合します。
    ///
    /// 現在のモードに応じて要素ごとに加算するか、末尾に連結します。
    pub fn update_counts(&mut self, counts: &[f32]) {
        if APPEND_MODE.load(Ordering::Relaxed) {
            self.joint_counts.extend_from_slice(counts);
        } else {
            if self.joint_counts.len() < counts.len() {
                self.joint_counts.resize(counts.len(), 0.0);
            }
            for (acc, c) in self.joint_counts.iter_mut().zip(counts.iter()) {
                *acc += c;
            }
        }
    }

    fn format(&self) -> String {
        let mut s = String::new();
        for (i, c) in self.joint_counts.iter().enumerate() {
            if i > 0 {
                s.push(',');
            }
            s.push_str(&c.to_string());
        }
        s
    }
}

impl PhrasePairAnnotation for CountAnnotation {
    fn update_value(&mut self, value: &str) {
        let other = CountAnnotation::parse(value);
        self.update_counts(&other.joint_counts);
    }

    fn clone_box(&self) -> Box<dyn PhrasePairAnnotation> {
        Box::new(self.clone())
    }

    fn text_value(&self) -> Option<String> {
        Some(self.format())
    }

    fn display(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "\tJoint counts          {}", self.format())
    }

    fn write(&self, out: &mut dyn Write) -> io::Result<()> {
        write_helper(out, NAME, &self.format())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
