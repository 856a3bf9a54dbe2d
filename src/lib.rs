//! # Taiyaku
//!
//! Taiyakuは、フレーズベース統計的機械翻訳デコーダのための
//! フレーズ翻訳モデルストアです。
//!
//! ## 概要
//!
//! このライブラリは、原言語フレーズ（原言語トークンの短い順序列）に
//! 対して、既知のすべての目的言語翻訳候補を、複数の独立したモデル由来の
//! 確率スコアとともに返すストアを提供します。ストアは異種形式の
//! ディスク上モデルファイル（テキスト形式・メモリマップされた
//! 事前構築インデックス）から構築でき、サイズ予算に合わせた縮小を
//! サポートします。
//!
//! ## 主な機能
//!
//! - **トライキーのストア**: 整数符号化された原言語フレーズの
//!   プレフィックスを、目的言語フレーズごとのスコアレコードへ写像
//!   します。ノードはソート済み配列と二分探索で表現され、子と葉は
//!   プールへの32ビットインデックスで参照されます。
//! - **開かれた注釈機構**: 独立した素性が型付きメタデータ
//!   （アライメント、カウント、任意の文字列）をフレーズペアに付与
//!   できます。ストアは注釈の具体型を知りません。
//! - **取り込みとマージ**: 同じフレーズペアに言及する複数のテキスト・
//!   外部モデルのスコアを結合します。
//! - **混合テーブル**: 複数のテーブルを問い合わせ時に線形結合する
//!   仮想テーブル。
//! - **枝刈り**: ハード（上位L件）とソフト（支配関係DP）の2つの
//!   フィルタでテーブルをサイズ予算以下に縮小します。
//!
//! ## 使用例
//!
//! ```
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use std::io::Write;
//! use taiyaku::PhraseTable;
//!
//! let mut file = tempfile::NamedTempFile::new()?;
//! writeln!(file, "le chat ||| the cat ||| 0.5 0.5")?;
//! file.flush()?;
//!
//! let mut table = PhraseTable::default();
//! table.read_multi_prob(file.path(), false)?;
//!
//! table.new_source_sentence(&["le", "chat"]);
//! let candidates = table.lookup_span(0..2).unwrap();
//! assert_eq!(candidates.len(), 1);
//! # Ok(())
//! # }
//! ```

/// 共通の定数とユーティリティ
pub mod common;

/// エラー型の定義
pub mod errors;

/// 語彙の管理
pub mod vocab;

/// フレーズの内部表現
pub mod phrase;

/// 語彙ID列をキーとするトライ構造
pub mod trie;

/// フレーズペア注釈システム
pub mod annotation;

/// フレーズテーブルのコア
pub mod table;

/// メモリマップされた外部フレーズインデックス
pub mod index;

/// 動的混合テーブル
pub mod mixture;

/// フレーズペアの枝刈り・フィルタリング
pub mod filter;


// Re-exports
pub use filter::{HardFilterVisitor, PruningStyle, SoftFilterVisitor};
pub use index::{PhraseIndex, PhraseIndexBuilder};
pub use mixture::MixtureTable;
pub use table::{PhraseTable, PruningType};
pub use vocab::Vocabulary;

/// このライブラリのバージョン番号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
