//! Incremental frame-to-frame stitching.
//!
//! Each frame is registered against the previous one only; offsets chain
//! from there, so drift accumulates and is never corrected.

use nalgebra::Vector2;
use opencv::core::{Mat, Rect, StsUnmatchedFormats, CV_8U};
use opencv::prelude::*;
use serde::Deserialize;
use tracing::{debug, info};

use crate::io::Frame;

use super::canvas::StitchCanvas;
use super::error::StitchError;
use super::features::FeatureMatcher;
use super::translation_solver::{estimate_translation, TranslationSolverConfig};

/// Region of the camera frame that gets stitched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CropRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StitchConfig {
    /// ORB features per frame.
    pub n_features: i32,
    /// Cross-checked matches needed before trying to register.
    pub min_matches: usize,
    /// Inliers needed to accept a registration.
    pub min_inliers: usize,
    pub solver: TranslationSolverConfig,
    /// Width of the blend ramp at frame borders.
    pub feather_px: usize,
    /// Largest canvas side, in pixels.
    pub max_canvas_dim: i32,
    pub crop: Option<CropRect>,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            n_features: 1000,
            min_matches: 10,
            min_inliers: 10,
            solver: TranslationSolverConfig::default(),
            feather_px: 32,
            max_canvas_dim: 8000,
            crop: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StitchOutcome {
    /// First frame; became the canvas.
    Seeded,
    /// Registered and blended. `offset` is relative to the previous frame.
    Blended { offset: Vector2<f64>, inliers: usize },
}

pub struct StitchAccumulator {
    config: StitchConfig,
    matcher: FeatureMatcher,
    canvas: Option<StitchCanvas>,
    skipped: usize,
}

impl StitchAccumulator {
    pub fn new(config: StitchConfig) -> Result<Self, StitchError> {
        let matcher = FeatureMatcher::new(config.n_features)?;
        Ok(Self {
            config,
            matcher,
            canvas: None,
            skipped: 0,
        })
    }

    pub fn config(&self) -> &StitchConfig {
        &self.config
    }

    pub fn canvas(&self) -> Option<&StitchCanvas> {
        self.canvas.as_ref()
    }

    pub fn skipped_frames(&self) -> usize {
        self.skipped
    }

    /// Drop the canvas; the next frame seeds a new one.
    pub fn reset(&mut self) {
        self.canvas = None;
        self.skipped = 0;
    }

    /// Register `frame` and blend it in. On any error the canvas is left
    /// exactly as it was.
    pub fn ingest(&mut self, frame: &Frame) -> Result<StitchOutcome, StitchError> {
        let result = self.register(frame);
        if let Err(e) = &result {
            if e.is_registration_failure() {
                self.skipped += 1;
                debug!("Stitch skipped frame {}: {}", frame.seq, e);
            }
        }
        result
    }

    /// Canvas cropped to covered pixels, if any frame was committed.
    pub fn cropped_canvas(&self) -> Result<Option<Mat>, StitchError> {
        self.canvas.as_ref().map(StitchCanvas::cropped).transpose()
    }

    fn register(&mut self, frame: &Frame) -> Result<StitchOutcome, StitchError> {
        let image = self.prepare(&frame.image)?;
        let features = self.matcher.detect(&image)?;

        let Some(canvas) = self.canvas.as_mut() else {
            info!(
                "Stitch canvas seeded with frame {} ({}x{}, {} features)",
                frame.seq,
                image.cols(),
                image.rows(),
                features.len()
            );
            self.canvas = Some(StitchCanvas::seed(&image, features)?);
            return Ok(StitchOutcome::Seeded);
        };

        if image.typ() != canvas.image().typ() {
            return Err(opencv::Error::new(
                StsUnmatchedFormats,
                "frame pixel format differs from canvas",
            )
            .into());
        }

        let matches = self.matcher.match_sets(&canvas.last_features, &features)?;
        if matches.len() < self.config.min_matches {
            return Err(StitchError::NotEnoughFeatures {
                found: matches.len(),
                required: self.config.min_matches,
            });
        }

        // Where the new frame's origin sits in the previous frame.
        let displacements: Vec<Vector2<f64>> = matches.iter().map(|m| m.prev - m.curr).collect();
        let estimate = estimate_translation(&displacements, &self.config.solver);
        let found = estimate.as_ref().map_or(0, |e| e.num_inliers());
        let Some(estimate) = estimate.filter(|_| found >= self.config.min_inliers) else {
            return Err(StitchError::NotEnoughInliers {
                found,
                required: self.config.min_inliers,
            });
        };

        let target = canvas.last_offset() + estimate.offset;
        canvas.commit(
            &image,
            features,
            target,
            self.config.feather_px,
            self.config.max_canvas_dim,
        )?;
        debug!(
            "Stitched frame {} at offset ({:.1}, {:.1}) with {} inliers; canvas {}x{}",
            frame.seq,
            estimate.offset.x,
            estimate.offset.y,
            found,
            canvas.width(),
            canvas.height()
        );
        Ok(StitchOutcome::Blended {
            offset: estimate.offset,
            inliers: found,
        })
    }

    /// Apply the crop and return a continuous 8-bit copy.
    fn prepare(&self, image: &Mat) -> Result<Mat, StitchError> {
        if image.depth() != CV_8U {
            return Err(opencv::Error::new(StsUnmatchedFormats, "stitching expects 8-bit frames").into());
        }
        let full = Rect::new(0, 0, image.cols(), image.rows());
        let rect = match self.config.crop {
            Some(c) => intersect(Rect::new(c.x, c.y, c.width, c.height), full),
            None => full,
        };
        if rect.width <= 0 || rect.height <= 0 || rect == full {
            return Ok(image.try_clone()?);
        }
        Ok(Mat::roi(image, rect)?.try_clone()?)
    }
}

fn intersect(a: Rect, b: Rect) -> Rect {
    let x0 = a.x.max(b.x);
    let y0 = a.y.max(b.y);
    let x1 = (a.x + a.width).min(b.x + b.width);
    let y1 = (a.y + a.height).min(b.y + b.height);
    Rect::new(x0, y0, (x1 - x0).max(0), (y1 - y0).max(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::CV_8UC1;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Random 4x4-pixel blocks: plenty of corners for ORB.
    fn texture(rows: i32, cols: i32, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        let block_cols = (cols as usize + 3) / 4;
        let block_rows = (rows as usize + 3) / 4;
        let blocks: Vec<u8> = (0..block_cols * block_rows).map(|_| rng.gen()).collect();
        let mut out = vec![0u8; (rows * cols) as usize];
        for y in 0..rows as usize {
            for x in 0..cols as usize {
                out[y * cols as usize + x] = blocks[(y / 4) * block_cols + x / 4];
            }
        }
        out
    }

    fn crop_frame(tex: &[u8], tex_cols: i32, x: i32, y: i32, w: i32, h: i32, seq: u64) -> Frame {
        let mut img = Mat::zeros(h, w, CV_8UC1).unwrap().to_mat().unwrap();
        let data = img.data_bytes_mut().unwrap();
        for row in 0..h as usize {
            let src = (row + y as usize) * tex_cols as usize + x as usize;
            data[row * w as usize..(row + 1) * w as usize].copy_from_slice(&tex[src..src + w as usize]);
        }
        Frame::new(img, seq * 33_000_000, seq)
    }

    fn blank_frame(rows: i32, cols: i32, seq: u64) -> Frame {
        Frame::new(Mat::zeros(rows, cols, CV_8UC1).unwrap().to_mat().unwrap(), 0, seq)
    }

    #[test]
    fn test_overlapping_frames_register_at_offset() {
        let tex = texture(300, 400, 7);
        let mut acc = StitchAccumulator::new(StitchConfig::default()).unwrap();

        assert_eq!(acc.ingest(&crop_frame(&tex, 400, 0, 0, 320, 240, 0)).unwrap(), StitchOutcome::Seeded);
        let outcome = acc.ingest(&crop_frame(&tex, 400, 40, 24, 320, 240, 1)).unwrap();

        match outcome {
            StitchOutcome::Blended { offset, inliers } => {
                assert!((offset - Vector2::new(40.0, 24.0)).norm() < 1.0, "offset {:?}", offset);
                assert!(inliers >= 10);
            }
            other => panic!("expected blend, got {:?}", other),
        }
        let canvas = acc.canvas().unwrap();
        assert!((canvas.width() - 360).abs() <= 1);
        assert!((canvas.height() - 264).abs() <= 1);
        assert_eq!(canvas.frame_count(), 2);
        let t = canvas.transform();
        assert!((t[(0, 2)] - 40.0).abs() < 1.0);
        assert!((t[(1, 2)] - 24.0).abs() < 1.0);
    }

    #[test]
    fn test_no_overlap_leaves_canvas_untouched() {
        let first = crop_frame(&texture(240, 320, 1), 320, 0, 0, 320, 240, 0);
        let mut acc = StitchAccumulator::new(StitchConfig::default()).unwrap();
        acc.ingest(&first).unwrap();
        let before = acc.canvas().unwrap().image().data_bytes().unwrap().to_vec();

        let err = acc.ingest(&blank_frame(240, 320, 1)).unwrap_err();
        assert!(err.is_registration_failure());

        let unrelated = crop_frame(&texture(240, 320, 99), 320, 0, 0, 320, 240, 2);
        let err = acc.ingest(&unrelated).unwrap_err();
        assert!(err.is_registration_failure(), "{}", err);

        let canvas = acc.canvas().unwrap();
        assert_eq!(canvas.image().data_bytes().unwrap(), before.as_slice());
        assert_eq!(canvas.frame_count(), 1);
        assert_eq!(acc.skipped_frames(), 2);
    }

    #[test]
    fn test_canvas_overflow_is_a_skip() {
        let tex = texture(300, 400, 3);
        let config = StitchConfig {
            max_canvas_dim: 330,
            ..StitchConfig::default()
        };
        let mut acc = StitchAccumulator::new(config).unwrap();
        acc.ingest(&crop_frame(&tex, 400, 0, 0, 320, 240, 0)).unwrap();
        let err = acc.ingest(&crop_frame(&tex, 400, 40, 24, 320, 240, 1)).unwrap_err();
        assert!(matches!(err, StitchError::CanvasOverflow { .. }));
        assert_eq!(acc.canvas().unwrap().width(), 320);
    }

    #[test]
    fn test_crop_and_reset() {
        let tex = texture(240, 320, 5);
        let config = StitchConfig {
            crop: Some(CropRect {
                x: 20,
                y: 10,
                width: 200,
                height: 150,
            }),
            ..StitchConfig::default()
        };
        let mut acc = StitchAccumulator::new(config).unwrap();
        acc.ingest(&crop_frame(&tex, 320, 0, 0, 320, 240, 0)).unwrap();
        let canvas = acc.canvas().unwrap();
        assert_eq!((canvas.width(), canvas.height()), (200, 150));
        assert_eq!(canvas.content_bounds(), Some(Rect::new(0, 0, 200, 150)));

        acc.reset();
        assert!(acc.canvas().is_none());
        assert!(acc.cropped_canvas().unwrap().is_none());
    }

    #[test]
    fn test_intersect() {
        let full = Rect::new(0, 0, 100, 80);
        assert_eq!(intersect(Rect::new(90, 70, 50, 50), full), Rect::new(90, 70, 10, 10));
        assert_eq!(intersect(Rect::new(200, 0, 10, 10), full).width, 0);
    }
}
