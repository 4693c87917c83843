//! Locally cached reference data (teams, matches, scoring config, form template).
//!
//! The cache serves the last good snapshot regardless of age; staleness only
//! decides whether a background refresh should be attempted.

mod cache;
mod types;

pub use cache::{CacheSource, RefreshOutcome, ReferenceCache};
pub use types::{Match, ReferenceSnapshot, Team};
