//! Incremental panorama stitching from the camera stream.

pub mod accumulator;
pub mod blend;
pub mod canvas;
pub mod error;
pub mod features;
pub mod translation_solver;

pub use accumulator::{CropRect, StitchAccumulator, StitchConfig, StitchOutcome};
pub use canvas::StitchCanvas;
pub use error::StitchError;
pub use features::{Correspondence, FeatureMatcher, FeatureSet};
pub use translation_solver::{estimate_translation, TranslationEstimate, TranslationSolverConfig};
