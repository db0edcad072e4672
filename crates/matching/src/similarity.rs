//! Pure 0–1 similarity functions. Every score returned here is clamped into
//! [0, 1] and depends only on its arguments.

use expenseflow_core::{clamp_unit, Currency};

use crate::alias::MerchantAliasIndex;
use crate::util::{edit_similarity, normalize, significant_words};

/// Two words count as the same when their edit similarity reaches this.
pub const WORD_MATCH_THRESHOLD: f64 = 0.8;

/// Added to whole-string similarity when the pair is a known merchant alias.
pub const ALIAS_BOOST: f64 = 0.2;

/// Floor of the in-tolerance band; differences inside the band degrade
/// linearly from 0.95 down to this value.
const TOLERANCE_BAND_FLOOR: f64 = 0.8;
const TOLERANCE_BAND_CEILING: f64 = 0.95;

/// `|a − b| / max(a, b)` on magnitudes; zero when both are zero.
pub fn relative_difference(a: f64, b: f64) -> f64 {
    let (a, b) = (a.abs(), b.abs());
    let max = a.max(b);
    if max == 0.0 {
        return 0.0;
    }
    (a - b).abs() / max
}

/// Amount closeness. Equal amounts score 1.0; inside `tolerance` the score
/// degrades from 0.95 to 0.8; beyond it the score is `1 − relative
/// difference`, never above the band floor.
pub fn amount_score(a: f64, b: f64, tolerance: f64) -> f64 {
    let rel = relative_difference(a, b);
    if rel <= f64::EPSILON {
        return 1.0;
    }
    if rel <= tolerance {
        let span = TOLERANCE_BAND_CEILING - TOLERANCE_BAND_FLOOR;
        return clamp_unit(TOLERANCE_BAND_CEILING - span * (rel / tolerance));
    }
    clamp_unit((1.0 - rel).min(TOLERANCE_BAND_FLOOR))
}

/// Date proximity by absolute day gap.
pub fn date_score(days_apart: i64) -> f64 {
    let d = days_apart.abs();
    match d {
        0 => 1.0,
        1 => 0.9,
        2..=7 => 0.7 - (d - 2) as f64 * 0.04,
        8..=29 => 0.5 * (30 - d) as f64 / 23.0,
        _ => 0.0,
    }
}

/// Fraction of significant words of the shorter side that have a close
/// counterpart on the other side.
pub fn token_score(a: &str, b: &str) -> f64 {
    let (na, nb) = (normalize(a), normalize(b));
    let (wa, wb) = (significant_words(&na), significant_words(&nb));
    if wa.is_empty() || wb.is_empty() {
        return 0.0;
    }
    let (source, target) = if wa.len() <= wb.len() { (wa, wb) } else { (wb, wa) };
    let matched = source
        .iter()
        .filter(|w| target.iter().any(|t| edit_similarity(w, t) >= WORD_MATCH_THRESHOLD))
        .count();
    matched as f64 / source.len() as f64
}

/// Merchant/description similarity: the larger of whole-string edit
/// similarity (boosted for known aliases) and word-level overlap.
pub fn text_score(a: &str, b: &str, aliases: Option<&MerchantAliasIndex>) -> f64 {
    let (na, nb) = (normalize(a), normalize(b));
    if na.is_empty() || nb.is_empty() {
        return 0.0;
    }
    let mut whole = edit_similarity(&na, &nb);
    if aliases.is_some_and(|idx| idx.are_aliases(&na, &nb)) {
        whole += ALIAS_BOOST;
    }
    clamp_unit(whole.max(token_score(a, b)))
}

/// 1.0 for identical currencies, 0.8 for a configured compatible pair
/// (either order), 0.5 otherwise.
pub fn currency_score(a: &Currency, b: &Currency, compatible: &[(Currency, Currency)]) -> f64 {
    if a == b {
        return 1.0;
    }
    let paired = compatible
        .iter()
        .any(|(x, y)| (x == a && y == b) || (x == b && y == a));
    if paired {
        0.8
    } else {
        0.5
    }
}

/// Distinct significant words longer than two characters, in order of first
/// appearance, at most `limit` of them.
pub fn extract_keywords(text: &str, limit: usize) -> Vec<String> {
    let normalized = normalize(text);
    let mut keywords: Vec<String> = Vec::new();
    for word in significant_words(&normalized) {
        if keywords.len() >= limit {
            break;
        }
        if word.chars().count() > 2 && !keywords.iter().any(|k| k == word) {
            keywords.push(word.to_string());
        }
    }
    keywords
}

/// Share of `source` keywords with a close match in `target`.
pub fn keyword_score(source: &[String], target: &[String]) -> f64 {
    match (source.is_empty(), target.is_empty()) {
        (true, true) => 0.5,
        (true, false) | (false, true) => 0.1,
        (false, false) => {
            let matched = source
                .iter()
                .filter(|k| {
                    target
                        .iter()
                        .any(|t| edit_similarity(k, t) >= WORD_MATCH_THRESHOLD)
                })
                .count();
            matched as f64 / source.len() as f64
        }
    }
}
