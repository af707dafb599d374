//! Foreground detection: background model, mask cleanup and blob extraction.
//!
//! Detection has no notion of identity; associating blobs across frames is
//! the tracker's job.

pub mod candidate;
pub mod detector;

pub use candidate::{nearest_candidate, AreaBand, Candidate};
pub use detector::{extract_candidates, DetectorConfig, OrganismDetector};
