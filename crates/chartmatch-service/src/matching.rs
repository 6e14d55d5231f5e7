//! Pure similarity scoring between chart entries and catalog candidates.
//!
//! Everything in here is deterministic and side-effect free: identical inputs always
//! yield the identical score. This is what makes cached [`ScoredMatch`] values reusable
//! across runs.

use strsim::normalized_levenshtein;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use crate::types::{ChartEntry, MatchCandidate};

/// Window over which the duration sub-score decays linearly to zero.
pub const DURATION_TOLERANCE_SECS: f64 = 5.0;

/// Canonicalizes a title or artist string for comparison.
///
/// Lowercases, strips diacritics (NFKD, combining marks removed), folds punctuation
/// into spaces and collapses whitespace runs, so that `"Beyoncé"` and `"beyonce"`
/// compare equal.
pub fn canonicalize(input: &str) -> String {
    let folded: String = input
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized edit-distance similarity over canonicalized inputs, in `0.0..=1.0`.
pub fn string_similarity(a: &str, b: &str) -> f64 {
    let a = canonicalize(a);
    let b = canonicalize(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    normalized_levenshtein(&a, &b)
}

/// Duration closeness score: `1.0` at zero difference, decaying linearly to `0.0` at
/// [`DURATION_TOLERANCE_SECS`] and beyond.
pub fn duration_score(chart_secs: u32, candidate_secs: u32) -> f64 {
    let diff = chart_secs.abs_diff(candidate_secs) as f64;
    (1.0 - diff / DURATION_TOLERANCE_SECS).max(0.0)
}

/// Combined similarity between a chart entry and one catalog candidate.
///
/// Equal-weight mean of title similarity, artist similarity and duration closeness.
pub fn score(entry: &ChartEntry, candidate: &MatchCandidate) -> f64 {
    let title = string_similarity(&entry.title, &candidate.title);
    let artist = string_similarity(&entry.artist, &candidate.artist);
    let duration = duration_score(entry.duration_secs, candidate.duration_secs);

    (title + artist + duration) / 3.0
}

/// Stable cache key for a chart entry, derived from its canonicalized signature.
///
/// Scrambled case, punctuation or diacritics in the chart data do not change the key,
/// so re-crawls of the same chart hit the same cache rows.
pub fn entry_signature(entry: &ChartEntry) -> String {
    format!(
        "{}|{}|{}",
        canonicalize(&entry.title),
        canonicalize(&entry.artist),
        entry.duration_secs
    )
}
