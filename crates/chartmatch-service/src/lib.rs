//! The chartmatch reconciliation engine.
//!
//! This crate turns an externally sourced ranked music chart into a best-effort ordered
//! mapping onto catalog identifiers, surviving two independent sources of network
//! flakiness along the way:
//!
//! - The chart source is only reliably reachable through a rotating pool of third-party
//!   proxies of rapidly changing quality. The [`proxies`] module finds a working egress
//!   path with bounded latency and caches it.
//! - Each chart entry has to be resolved against a catalog search API and fuzzy-scored.
//!   The [`resolver`] module fans searches out over a bounded worker pool and avoids
//!   repeat searches through a persistent TTL cache with request coalescing.
//!
//! Chart parsing, spreadsheet export and the catalog API client itself are collaborators
//! plugged in through the trait seams in [`proxies`] and [`resolver`].

pub mod caching;
pub mod config;
pub mod logging;
pub mod matching;
pub mod proxies;
pub mod resolver;
pub mod types;
pub mod utils;
