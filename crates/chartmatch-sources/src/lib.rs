//! Configuration types for proxy-list sources.
//!
//! A proxy-list source is a public endpoint returning candidate proxy
//! addresses of unknown quality. Sources only describe *where* and *in
//! which shape* candidates can be found; fetching and validating them is
//! the service's concern.

#![warn(missing_docs)]

mod sources;

pub use sources::*;
