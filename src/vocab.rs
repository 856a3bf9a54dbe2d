//! 語彙の管理
//!
//! このモジュールは、単語文字列と稠密な整数IDを相互に変換する
//! 語彙テーブルを提供します。原言語と目的言語の両方の単語が
//! 1つの語彙を共有します。

use hashbrown::HashMap;

/// 単語文字列と整数IDの双方向マッピング
///
/// IDは挿入順に0から割り当てられ、語彙の生存期間中は安定で、
/// 再利用されることはありません。未知語の検索は例外ではなく、
/// 現在のサイズに等しい番兵値で「不在」を表します。
#[derive(Default, Clone)]
pub struct Vocabulary {
    words: Vec<String>,
    map: HashMap<String, u32>,
}

impl Vocabulary {
    /// 新しい空の語彙を作成します。
    pub fn new() -> Self {
        Self::default()
    }

    /// 単語を追加し、そのIDを返します。
    ///
    /// この操作は冪等です。既に存在する単語に対しては既存のIDを返し、
    /// 新しい単語には現在のサイズに等しい次のIDを割り当てます。
    ///
    /// # 引数
    ///
    /// * `word` - 追加する単語
    ///
    /// # 戻り値
    ///
    /// 単語のID
    pub fn add(&mut self, word: &str) -> u32 {
        if let Some(&id) = self.map.get(word) {
            return id;
        }
        let id = self.words.len() as u32;
        self.words.push(word.to_string());
        self.map.insert(word.to_string(), id);
        id
    }

    /// 単語のIDを取得します。
    ///
    /// # 戻り値
    ///
    /// 単語のID。存在しない場合は`size()`に等しい番兵値。
    #[inline(always)]
    pub fn index(&self, word: &str) -> u32 {
        self.map.get(word).copied().unwrap_or_else(|| self.size())
    }

    /// IDに対応する単語を取得します。
    ///
    /// # 引数
    ///
    /// * `id` - 単語のID。`size()`未満でなければなりません。
    #[inline(always)]
    pub fn word(&self, id: u32) -> &str {
        &self.words[id as usize]
    }

    /// これまでに追加された相異なる単語の数を返します。
    #[inline(always)]
    pub fn size(&self) -> u32 {
        self.words.len() as u32
    }

    /// 語彙が空かどうかを返します。
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// すべての単語を挿入順に走査するイテレータを返します。
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.words.iter().map(|w| w.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_is_idempotent() {
        let mut voc = Vocabulary::new();
        let a = voc.add("chat");
        let b = voc.add("maison");
        assert_eq!(voc.add("chat"), a);
        assert_eq!(voc.add("maison"), b);
        assert_eq!(voc.size(), 2);
    }

    #[test]
    fn test_index_of_added_word_equals_add() {
        let mut voc = Vocabulary::new();
        for w in ["le", "chat", "le", "chien"] {
            let id = voc.add(w);
            assert_eq!(voc.index(w), id);
        }
    }

    #[test]
    fn test_index_missing_is_size() {
        let mut voc = Vocabulary::new();
        voc.add("le");
        assert_eq!(voc.index("chat"), voc.size());
        assert_eq!(voc.index("chat"), 1);
    }

    #[test]
    fn test_word_round_trip() {
        let mut voc = Vocabulary::new();
        let id = voc.add("chat");
        assert_eq!(voc.word(id), "chat");
    }

    #[test]
    fn test_ids_are_stable() {
        let mut voc = Vocabulary::new();
        let a = voc.add("a");
        for i in 0..100 {
            voc.add(&format!("w{}", i));
        }
        assert_eq!(voc.add("a"), a);
        assert_eq!(voc.index("a"), a);
    }
}
