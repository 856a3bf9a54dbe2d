//! 語彙ID列をキーとするトライ構造
//!
//! このモジュールは、原言語フレーズ（語彙IDの列）から葉ペイロードへの
//! 汎用的なプレフィックスキー付き連想コンテナを提供します。
//!
//! 本番モデルではノード数が数千万に達するため、ノードあたりのメモリ
//! オーバーヘッドを抑える設計を採用しています:
//!
//! - 各ノードはキーでソートされたエントリ配列を1本だけ持ち、検索は
//!   二分探索で行います（ノードごとのハッシュテーブルは使いません）。
//! - 子ノードと葉はポインタではなく、トライが所有するプール（アリーナ）
//!   への32ビットインデックスで参照します。64ビット環境ではこれだけで
//!   リンク1本あたりのサイズが半減します。
//! - エントリ配列は使用数を別途保持せず、未使用スロットを予約キー
//!   [`NO_KEY`]で埋めます。二分探索は末尾の番兵をそのまま許容します。
//! - 配列の再割り当ては1.05倍ずつ成長させ、無駄なスラックを約5%に
//!   抑えます。

use crate::errors::{Result, TaiyakuError};

/// 「キーではない」ことを表す予約キー値
///
/// この値以上のキー要素を挿入することはできません。語彙IDがここまで
/// 達した場合はモデルのキー空間あふれであり、即座に致命的エラーとして
/// 報告されます。
pub const NO_KEY: u32 = u32::MAX;

/// 子・葉インデックスの「なし」を表す番兵
const NO_INDEX: u32 = u32::MAX;

/// エントリ配列の成長係数
///
/// 2倍成長では未使用領域が25%前後残る。1.4倍で約15%、1.2倍で約8%、
/// 1.1倍で4〜5%。時間コストはわずかなので1.05を使う。
const GROWTH_FACTOR: f64 = 1.05;

/// ノード内の1エントリ
///
/// キー要素と、子ノード・葉それぞれへのプールインデックスを保持します。
#[derive(Clone, Copy)]
struct TrieEntry {
    key: u32,
    child: u32,
    leaf: u32,
}

const VACANT: TrieEntry = TrieEntry {
    key: NO_KEY,
    child: NO_INDEX,
    leaf: NO_INDEX,
};

/// トライの内部ノード
///
/// エントリはキー昇順でソートされ、末尾の未使用スロットは[`VACANT`]で
/// 埋められています。使用数は保持せず、必要なときに二分探索で求めます。
struct TrieNode {
    entries: Box<[TrieEntry]>,
}

impl TrieNode {
    fn new() -> Self {
        Self {
            entries: Box::new([]),
        }
    }

    /// keyが存在する、または挿入されるべき位置を返します。
    #[inline(always)]
    fn position(&self, key: u32) -> usize {
        self.entries.partition_point(|e| e.key < key)
    }

    /// 使用中のエントリ数を返します。
    ///
    /// 実キーはすべて`NO_KEY`未満なので、番兵は配列末尾に連続して並びます。
    #[inline(always)]
    fn used(&self) -> usize {
        self.entries.partition_point(|e| e.key != NO_KEY)
    }

    /// keyを探し、なければ挿入して、その位置を返します。
    fn insert_key(&mut self, key: u32) -> usize {
        let pos = self.position(key);
        if pos < self.entries.len() && self.entries[pos].key == key {
            return pos;
        }
        let used = self.used();
        if used == self.entries.len() {
            self.grow();
        }
        for i in (pos..used).rev() {
            self.entries[i + 1] = self.entries[i];
        }
        self.entries[pos] = TrieEntry {
            key,
            child: NO_INDEX,
            leaf: NO_INDEX,
        };
        pos
    }

    fn grow(&mut self) {
        let cap = self.entries.len();
        let new_cap = std::cmp::max(cap + 1, (cap as f64 * GROWTH_FACTOR).ceil() as usize);
        let mut new_entries = vec![VACANT; new_cap].into_boxed_slice();
        new_entries[..cap].copy_from_slice(&self.entries);
        self.entries = new_entries;
    }

    /// keyのエントリを探します。
    #[inline(always)]
    fn find(&self, key: u32) -> Option<&TrieEntry> {
        let pos = self.position(key);
        if pos < self.entries.len() && self.entries[pos].key == key {
            Some(&self.entries[pos])
        } else {
            None
        }
    }
}

/// 語彙ID列から葉値`T`への連想コンテナ
///
/// 深さdのノードはdトークンのプレフィックスに対応し、相異なる
/// プレフィックスごとにノードは1つだけ存在します（構造共有）。
/// あるフレーズがそこで終わるように挿入された場合に限り、その
/// エントリは葉値を持ちます。
pub struct PhraseTrie<T> {
    /// ノードプール。インデックス0がルートです。
    nodes: Vec<TrieNode>,
    /// 葉プール。エントリからは32ビットインデックスで参照されます。
    leaves: Vec<T>,
}

impl<T> Default for PhraseTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PhraseTrie<T> {
    /// 新しい空のトライを作成します。
    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode::new()],
            leaves: vec![],
        }
    }

    fn check_key(key: &[u32]) -> Result<()> {
        if key.is_empty() {
            return Err(TaiyakuError::invalid_argument(
                "key",
                "empty key sequences are not allowed in the trie.",
            ));
        }
        for &elem in key {
            if elem >= NO_KEY {
                return Err(TaiyakuError::invalid_argument(
                    "key",
                    format!("key element {} overflows the trie key space.", elem),
                ));
            }
        }
        Ok(())
    }

    /// キーに対応する葉のプールIDを返し、なければ`default`で作成します。
    ///
    /// 返されるIDはトライの生存期間中安定で、[`leaf_mut`]で葉を再取得
    /// できます。同じ原言語フレーズが連続するストリーム読み込みでは、
    /// このIDをキャッシュすることで再探索を省けます。
    ///
    /// # エラー
    ///
    /// キーが空の場合、またはキー要素が表現可能な範囲を超える場合に
    /// エラーを返します。
    ///
    /// [`leaf_mut`]: Self::leaf_mut
    pub fn get_or_insert_id_with<F>(&mut self, key: &[u32], default: F) -> Result<u32>
    where
        F: FnOnce() -> T,
    {
        Self::check_key(key)?;
        let mut node = 0usize;
        for &k in &key[..key.len() - 1] {
            let pos = self.nodes[node].insert_key(k);
            let child = self.nodes[node].entries[pos].child;
            node = if child == NO_INDEX {
                let child_id = self.nodes.len() as u32;
                self.nodes.push(TrieNode::new());
                self.nodes[node].entries[pos].child = child_id;
                child_id as usize
            } else {
                child as usize
            };
        }
        let pos = self.nodes[node].insert_key(key[key.len() - 1]);
        if self.nodes[node].entries[pos].leaf == NO_INDEX {
            let leaf_id = self.leaves.len() as u32;
            self.leaves.push(default());
            self.nodes[node].entries[pos].leaf = leaf_id;
        }
        Ok(self.nodes[node].entries[pos].leaf)
    }

    /// キーに対応する葉への可変参照を返し、なければ`default`で作成します。
    pub fn get_or_insert_with<F>(&mut self, key: &[u32], default: F) -> Result<&mut T>
    where
        F: FnOnce() -> T,
    {
        let id = self.get_or_insert_id_with(key, default)?;
        Ok(&mut self.leaves[id as usize])
    }

    /// キーに対応する葉のプールIDを返します。
    pub fn leaf_id(&self, key: &[u32]) -> Option<u32> {
        if key.is_empty() {
            return None;
        }
        let mut node = 0usize;
        for &k in &key[..key.len() - 1] {
            let entry = self.nodes[node].find(k)?;
            if entry.child == NO_INDEX {
                return None;
            }
            node = entry.child as usize;
        }
        let entry = self.nodes[node].find(key[key.len() - 1])?;
        if entry.leaf == NO_INDEX {
            None
        } else {
            Some(entry.leaf)
        }
    }

    /// キーに対応する葉への参照を返します。
    #[inline(always)]
    pub fn get(&self, key: &[u32]) -> Option<&T> {
        self.leaf_id(key).map(|id| &self.leaves[id as usize])
    }

    /// キーに対応する葉への可変参照を返します。
    #[inline(always)]
    pub fn get_mut(&mut self, key: &[u32]) -> Option<&mut T> {
        self.leaf_id(key).map(|id| &mut self.leaves[id as usize])
    }

    /// キーが葉として存在するかどうかを返します。
    #[inline(always)]
    pub fn contains_key(&self, key: &[u32]) -> bool {
        self.leaf_id(key).is_some()
    }

    /// プールIDから葉への参照を取得します。
    #[inline(always)]
    pub fn leaf(&self, id: u32) -> &T {
        &self.leaves[id as usize]
    }

    /// プールIDから葉への可変参照を取得します。
    #[inline(always)]
    pub fn leaf_mut(&mut self, id: u32) -> &mut T {
        &mut self.leaves[id as usize]
    }

    /// 葉の総数を返します。
    #[inline(always)]
    pub fn num_leaves(&self) -> usize {
        self.leaves.len()
    }

    /// ノードの総数を返します。
    #[inline(always)]
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// 全ノードで割り当てられたエントリスロットの総数を返します。
    pub fn allocated_entries(&self) -> usize {
        self.nodes.iter().map(|n| n.entries.len()).sum()
    }

    /// 全ノードで使用中のエントリスロットの総数を返します。
    pub fn used_entries(&self) -> usize {
        self.nodes.iter().map(|n| n.used()).sum()
    }

    /// 深さ優先で全葉を訪問します。
    ///
    /// 各ノードの子はキー昇順で訪問されます。ビジタは蓄積されたキー
    /// プレフィックスと葉値を受け取ります。
    pub fn traverse<F>(&self, mut visitor: F)
    where
        F: FnMut(&[u32], &T),
    {
        let mut prefix = Vec::new();
        self.walk(0, &mut prefix, &mut visitor);
    }

    fn walk<F>(&self, node: usize, prefix: &mut Vec<u32>, visitor: &mut F)
    where
        F: FnMut(&[u32], &T),
    {
        let used = self.nodes[node].used();
        for i in 0..used {
            let entry = self.nodes[node].entries[i];
            prefix.push(entry.key);
            if entry.leaf != NO_INDEX {
                visitor(prefix, &self.leaves[entry.leaf as usize]);
            }
            if entry.child != NO_INDEX {
                self.walk(entry.child as usize, prefix, visitor);
            }
            prefix.pop();
        }
    }

    /// 深さ優先で全葉を可変訪問します。
    ///
    /// フィルタリングビジタのように葉をその場で書き換える用途に使います。
    pub fn traverse_mut<F>(&mut self, mut visitor: F)
    where
        F: FnMut(&[u32], &mut T),
    {
        let mut prefix = Vec::new();
        let Self { nodes, leaves } = self;
        walk_mut(nodes, leaves, 0, &mut prefix, &mut visitor);
    }
}

fn walk_mut<T, F>(
    nodes: &[TrieNode],
    leaves: &mut [T],
    node: usize,
    prefix: &mut Vec<u32>,
    visitor: &mut F,
) where
    F: FnMut(&[u32], &mut T),
{
    let used = nodes[node].used();
    for i in 0..used {
        let entry = nodes[node].entries[i];
        prefix.push(entry.key);
        if entry.leaf != NO_INDEX {
            visitor(prefix, &mut leaves[entry.leaf as usize]);
        }
        if entry.child != NO_INDEX {
            walk_mut(nodes, leaves, entry.child as usize, prefix, visitor);
        }
        prefix.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_find() {
        let mut trie = PhraseTrie::new();
        *trie.get_or_insert_with(&[1, 2, 3], || 0).unwrap() = 42;
        assert_eq!(trie.get(&[1, 2, 3]), Some(&42));
        assert_eq!(trie.get(&[1, 2]), None);
        assert_eq!(trie.get(&[1, 2, 3, 4]), None);
        assert_eq!(trie.get(&[2]), None);
    }

    #[test]
    fn test_reinsert_returns_same_leaf() {
        let mut trie = PhraseTrie::new();
        let a = trie.get_or_insert_id_with(&[5, 6], || 1).unwrap();
        let b = trie.get_or_insert_id_with(&[5, 6], || 2).unwrap();
        assert_eq!(a, b);
        assert_eq!(trie.leaf(a), &1);
        assert_eq!(trie.num_leaves(), 1);
    }

    #[test]
    fn test_prefix_sharing() {
        let mut trie = PhraseTrie::new();
        trie.get_or_insert_with(&[1, 2], || ()).unwrap();
        trie.get_or_insert_with(&[1, 3], || ()).unwrap();
        trie.get_or_insert_with(&[1], || ()).unwrap();
        // プレフィックス[1]のノードは1つだけ: ルートと[1]の下の1ノード
        assert_eq!(trie.num_nodes(), 2);
        assert_eq!(trie.num_leaves(), 3);
    }

    #[test]
    fn test_empty_key_is_an_error() {
        let mut trie: PhraseTrie<u32> = PhraseTrie::new();
        assert!(trie.get_or_insert_with(&[], || 0).is_err());
        assert_eq!(trie.get(&[]), None);
    }

    #[test]
    fn test_key_space_overflow_is_an_error() {
        let mut trie: PhraseTrie<u32> = PhraseTrie::new();
        assert!(trie.get_or_insert_with(&[NO_KEY], || 0).is_err());
        assert!(trie.get_or_insert_with(&[1, NO_KEY, 2], || 0).is_err());
    }

    #[test]
    fn test_traverse_in_ascending_key_order() {
        let mut trie = PhraseTrie::new();
        for key in [[3u32, 1], [1, 9], [1, 2], [2, 5]] {
            trie.get_or_insert_with(&key, || ()).unwrap();
        }
        let mut seen = vec![];
        trie.traverse(|prefix, _| seen.push(prefix.to_vec()));
        assert_eq!(
            seen,
            vec![vec![1, 2], vec![1, 9], vec![2, 5], vec![3, 1]],
        );
    }

    #[test]
    fn test_traverse_mut_rewrites_leaves() {
        let mut trie = PhraseTrie::new();
        trie.get_or_insert_with(&[1], || 10).unwrap();
        trie.get_or_insert_with(&[2], || 20).unwrap();
        trie.traverse_mut(|_, leaf| *leaf += 1);
        assert_eq!(trie.get(&[1]), Some(&11));
        assert_eq!(trie.get(&[2]), Some(&21));
    }

    #[test]
    fn test_many_keys_stay_sorted_with_bounded_slack() {
        let mut trie = PhraseTrie::new();
        // 逆順で挿入してもソート順を保つ
        for i in (0..500u32).rev() {
            trie.get_or_insert_with(&[i * 7 % 499], || ()).unwrap();
        }
        let mut seen = vec![];
        trie.traverse(|prefix, _| seen.push(prefix[0]));
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(seen, sorted);
        assert!(trie.allocated_entries() >= trie.used_entries());
    }
}
