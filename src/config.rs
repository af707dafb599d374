//! Aggregate runtime configuration.
//!
//! Every section has working defaults; a JSON file only needs the fields it
//! changes, e.g. `{"servo": {"deadzone_px": 30}, "stage": {"port": "COM3"}}`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::detection::DetectorConfig;
use crate::servo::ServoConfig;
use crate::stage::StageConfig;
use crate::stitching::StitchConfig;
use crate::tracking::TrackerConfig;

/// Frame pipeline settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frames queued for the tracking worker before the oldest is dropped.
    pub tracking_queue: usize,
    /// Frames queued for the stitch worker before the oldest is dropped.
    pub stitch_queue: usize,
    /// Spacing of synthesized timestamps for image directories, seconds.
    pub frame_interval_s: f64,
    /// Where stitched results are written.
    pub output_dir: PathBuf,
}

impl PipelineConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(self.frame_interval_s.max(0.0))
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tracking_queue: 2,
            stitch_queue: 4,
            frame_interval_s: 1.0 / 30.0,
            output_dir: PathBuf::from("stitched"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    pub detector: DetectorConfig,
    pub tracker: TrackerConfig,
    pub servo: ServoConfig,
    pub stage: StageConfig,
    pub stitch: StitchConfig,
    pub pipeline: PipelineConfig,
}

impl ScopeConfig {
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))
    }
}
