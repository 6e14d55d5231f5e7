//! Core data types shared across the engine.

use serde::{Deserialize, Serialize};

/// One ranked item of the external chart.
///
/// Produced by the chart-parsing collaborator, consumed read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartEntry {
    /// Song title as published on the chart.
    pub title: String,
    /// Display artist string as published on the chart.
    pub artist: String,
    /// Track duration in seconds.
    pub duration_secs: u32,
    /// 1-based chart position.
    pub rank: u32,
}

/// A single search result from the catalog API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    /// Stable catalog identifier (e.g. a track URI).
    pub catalog_id: String,
    /// Track title according to the catalog.
    pub title: String,
    /// Artist according to the catalog.
    pub artist: String,
    /// Track duration in seconds according to the catalog.
    pub duration_secs: u32,
    /// Normalized popularity in `0.0..=1.0`.
    pub popularity: f64,
}

/// A catalog candidate together with its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMatch {
    /// The winning candidate.
    pub candidate: MatchCandidate,
    /// Combined similarity score in `0.0..=1.0`.
    pub score: f64,
}

/// The reconciliation outcome for a single chart entry.
///
/// `best_match` is `None` both when the search came back empty and when no candidate
/// cleared the minimum-confidence threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEntry {
    /// The chart entry this outcome belongs to.
    pub entry: ChartEntry,
    /// The best catalog match, if a confident one was found.
    pub best_match: Option<ScoredMatch>,
}
