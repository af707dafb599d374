//! Background-subtraction organism detector.
//!
//! Pipeline per frame:
//! 1. MOG2 background model -> foreground mask (model updates every call)
//! 2. Threshold away shadow pixels
//! 3. Morphological opening with a small elliptical kernel
//! 4. External contours, filtered by the area band
//! 5. Centroid of each surviving contour from image moments

use anyhow::Result;
use nalgebra::Point2;
use opencv::core::{Mat, Point, Ptr, Size, Vector, BORDER_CONSTANT};
use opencv::imgproc;
use opencv::prelude::*;
use opencv::video::{self, BackgroundSubtractorMOG2};
use serde::Deserialize;
use tracing::debug;

use crate::io::Frame;

use super::candidate::{AreaBand, Candidate};

/// MOG2 marks shadows with 127 and foreground with 255.
const FOREGROUND_THRESHOLD: f64 = 200.0;

/// Detector configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Number of frames the background model remembers.
    pub history: i32,
    /// Squared Mahalanobis distance for a pixel to count as background.
    pub var_threshold: f64,
    /// Let MOG2 label shadows (they are discarded afterwards).
    pub detect_shadows: bool,
    /// Fixed learning rate in (0, 1]. `None` uses `1 / history`.
    pub learning_rate: Option<f64>,
    /// Side of the elliptical opening kernel, in pixels.
    pub kernel_size: i32,
    /// Accepted contour areas.
    pub area_band: AreaBand,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            history: 500,
            var_threshold: 50.0,
            detect_shadows: true,
            learning_rate: None,
            kernel_size: 5,
            area_band: AreaBand::default(),
        }
    }
}

/// Stateful detector. Owns its background model; one instance per stream.
pub struct OrganismDetector {
    config: DetectorConfig,
    background: Ptr<BackgroundSubtractorMOG2>,
    kernel: Mat,
    /// Cleaned mask of the last processed frame, kept for overlays.
    last_mask: Mat,
}

impl OrganismDetector {
    pub fn new(config: DetectorConfig) -> Result<Self> {
        let background = video::create_background_subtractor_mog2(
            config.history,
            config.var_threshold,
            config.detect_shadows,
        )?;
        let kernel = imgproc::get_structuring_element(
            imgproc::MORPH_ELLIPSE,
            Size::new(config.kernel_size, config.kernel_size),
            Point::new(-1, -1),
        )?;
        Ok(Self {
            config,
            background,
            kernel,
            last_mask: Mat::default(),
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Detect foreground candidates in `frame`.
    ///
    /// The background model learns from every frame, whether or not anything
    /// is being tracked.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<Candidate>> {
        let mask = self.foreground_mask(&frame.image)?;
        let candidates = extract_candidates(&mask, &self.config.area_band, frame.seq)?;
        debug!(
            "Frame {}: {} candidates in area band",
            frame.seq,
            candidates.len()
        );
        self.last_mask = mask;
        Ok(candidates)
    }

    /// Foreground mask of the last frame after opening.
    pub fn last_mask(&self) -> &Mat {
        &self.last_mask
    }

    /// Forget the learned background (e.g. after the stage moved a lot or
    /// the illumination changed). The next frames relearn it.
    pub fn reset_background(&mut self) -> Result<()> {
        self.background = video::create_background_subtractor_mog2(
            self.config.history,
            self.config.var_threshold,
            self.config.detect_shadows,
        )?;
        Ok(())
    }

    fn foreground_mask(&mut self, image: &Mat) -> Result<Mat> {
        let learning_rate = self.config.learning_rate.unwrap_or(-1.0);

        let mut raw = Mat::default();
        self.background.apply(image, &mut raw, learning_rate)?;

        let mut binary = Mat::default();
        imgproc::threshold(
            &raw,
            &mut binary,
            FOREGROUND_THRESHOLD,
            255.0,
            imgproc::THRESH_BINARY,
        )?;

        let mut opened = Mat::default();
        imgproc::morphology_ex(
            &binary,
            &mut opened,
            imgproc::MORPH_OPEN,
            &self.kernel,
            Point::new(-1, -1),
            1,
            BORDER_CONSTANT,
            imgproc::morphology_default_border_value()?,
        )?;
        Ok(opened)
    }
}

/// Turn a binary mask into candidates: external contours whose area lies in
/// `band`, each reduced to its moment centroid.
pub fn extract_candidates(mask: &Mat, band: &AreaBand, frame_seq: u64) -> Result<Vec<Candidate>> {
    let mut contours = Vector::<Vector<Point>>::new();
    imgproc::find_contours(
        mask,
        &mut contours,
        imgproc::RETR_EXTERNAL,
        imgproc::CHAIN_APPROX_SIMPLE,
        Point::new(0, 0),
    )?;

    let mut candidates = Vec::new();
    for contour in contours.iter() {
        let area = imgproc::contour_area(&contour, false)?;
        if !band.contains(area) {
            continue;
        }
        let m = imgproc::moments(&contour, false)?;
        if m.m00 == 0.0 {
            continue;
        }
        let centroid = Point2::new(m.m10 / m.m00, m.m01 / m.m00);
        candidates.push(Candidate::new(centroid, area, frame_seq));
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{CV_8UC1, CV_8UC3};

    fn blank(rows: i32, cols: i32, typ: i32) -> Mat {
        Mat::zeros(rows, cols, typ).unwrap().to_mat().unwrap()
    }

    fn fill_rect(img: &mut Mat, x: i32, y: i32, w: i32, h: i32, value: u8) {
        let cols = img.cols() as usize;
        let channels = img.channels() as usize;
        let data = img.data_bytes_mut().unwrap();
        for row in y..y + h {
            for col in x..x + w {
                let base = (row as usize * cols + col as usize) * channels;
                for c in 0..channels {
                    data[base + c] = value;
                }
            }
        }
    }

    #[test]
    fn test_area_band_boundaries_on_mask() {
        // Contour area of a filled w x h rectangle is (w-1)(h-1).
        let mut mask = blank(200, 200, CV_8UC1);
        fill_rect(&mut mask, 10, 10, 10, 12, 255); // 99
        fill_rect(&mut mask, 60, 10, 11, 11, 255); // 100
        fill_rect(&mut mask, 10, 100, 20, 22, 255); // 399
        fill_rect(&mut mask, 100, 100, 21, 21, 255); // 400

        let band = AreaBand::new(100.0, 399.0);
        let candidates = extract_candidates(&mask, &band, 7).unwrap();

        let mut areas: Vec<f64> = candidates.iter().map(|c| c.area).collect();
        areas.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(areas, vec![100.0, 399.0]);
        assert!(candidates.iter().all(|c| c.frame_seq == 7));
    }

    #[test]
    fn test_centroid_from_moments() {
        let mut mask = blank(100, 100, CV_8UC1);
        fill_rect(&mut mask, 20, 30, 11, 21, 255);
        let candidates = extract_candidates(&mask, &AreaBand::new(1.0, 10_000.0), 0).unwrap();
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0].centroid;
        assert!((c.x - 25.0).abs() < 1e-6);
        assert!((c.y - 40.0).abs() < 1e-6);
    }

    #[test]
    fn test_detects_new_blob_against_learned_background() {
        let mut detector = OrganismDetector::new(DetectorConfig::default()).unwrap();

        for seq in 0..5 {
            let frame = Frame::new(blank(240, 320, CV_8UC3), seq * 33, seq);
            let candidates = detector.detect(&frame).unwrap();
            // The very first frame is all foreground, which the area band rejects.
            assert!(candidates.is_empty(), "frame {} produced candidates", seq);
        }

        let mut image = blank(240, 320, CV_8UC3);
        fill_rect(&mut image, 150, 100, 30, 30, 255);
        let frame = Frame::new(image, 5 * 33, 5);
        let candidates = detector.detect(&frame).unwrap();

        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert!((c.centroid.x - 164.5).abs() < 1.5);
        assert!((c.centroid.y - 114.5).abs() < 1.5);
        assert!(detector.last_mask().rows() == 240);
    }

    #[test]
    fn test_reset_background_relearns_from_scratch() {
        let mut detector = OrganismDetector::new(DetectorConfig::default()).unwrap();
        for seq in 0..5 {
            detector
                .detect(&Frame::new(blank(240, 320, CV_8UC3), 0, seq))
                .unwrap();
        }
        detector.reset_background().unwrap();

        // A fresh model sees the whole frame as foreground, which the area
        // band rejects, so the blob is not reported yet.
        let mut image = blank(240, 320, CV_8UC3);
        fill_rect(&mut image, 150, 100, 30, 30, 255);
        assert!(detector.detect(&Frame::new(image, 0, 5)).unwrap().is_empty());
    }

    #[test]
    fn test_opening_removes_specks() {
        let mut detector = OrganismDetector::new(DetectorConfig::default()).unwrap();
        for seq in 0..5 {
            detector
                .detect(&Frame::new(blank(120, 160, CV_8UC3), 0, seq))
                .unwrap();
        }
        let mut image = blank(120, 160, CV_8UC3);
        fill_rect(&mut image, 40, 40, 2, 2, 255);
        let candidates = detector.detect(&Frame::new(image, 0, 5)).unwrap();
        assert!(candidates.is_empty());
    }
}
