//! 共通の定数とユーティリティ
//!
//! フレーズテーブルの各コンポーネントで共有される定数と、
//! スコア計算のための小さなヘルパー関数を提供します。

/// テキスト形式のフレーズテーブルで項目を区切るトークン
pub const PHRASE_SEP: &str = " ||| ";

/// 欠損エントリおよび確率0のエントリに使う対数値のデフォルト
///
/// 0以下の確率は対数に変換できないため、この番兵値で置き換えられます。
/// テキストへ書き戻す際には、この値はちょうど`0`として出力されます。
pub const LOG_ALMOST_0: f32 = -18.0;

/// サイズ制限なしを表す値
pub const NO_SIZE_LIMIT: usize = usize::MAX;

/// 語彙化歪みモデル1つあたりの方向スコア数
pub const NUM_LEXDIS_SCORES: usize = 6;

/// 32/64ビット間で安定な文字列ハッシュ
///
/// フィルタリング時のタイブレークに使用します。プラットフォームや
/// 挿入順序に依存しない決定的な順序付けのため、ハッシュ値は
/// 実行間で安定していなければなりません。
#[inline(always)]
pub fn stable_hash(s: &str) -> u32 {
    s.bytes()
        .fold(0u32, |h, b| h.wrapping_mul(37).wrapping_add(u32::from(b)))
}

/// `x <= 0`でない限り`ln(x)`を返し、そうでなければ`log_almost_0`を返します。
#[inline(always)]
pub fn shielded_log(x: f32, log_almost_0: f32) -> f32 {
    if x <= 0.0 {
        log_almost_0
    } else {
        x.ln()
    }
}

/// 重みベクトルとスコアベクトルの内積
///
/// 蓄積はf64精度で行います。短い方の長さで打ち切ります。
#[inline(always)]
pub fn dot_product(weights: &[f64], scores: &[f32]) -> f64 {
    weights
        .iter()
        .zip(scores.iter())
        .map(|(w, s)| w * f64::from(*s))
        .sum()
}
