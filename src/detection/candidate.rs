//! Per-frame foreground candidates.

use nalgebra::Point2;
use serde::Deserialize;

/// A foreground blob detected in one frame. Recomputed every frame; carries
/// no identity across frames.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Centroid from image moments, in pixels.
    pub centroid: Point2<f64>,
    /// Contour area in px².
    pub area: f64,
    /// Sequence number of the frame this blob came from.
    pub frame_seq: u64,
}

impl Candidate {
    pub fn new(centroid: Point2<f64>, area: f64, frame_seq: u64) -> Self {
        Self {
            centroid,
            area,
            frame_seq,
        }
    }

    pub fn distance_to(&self, point: &Point2<f64>) -> f64 {
        nalgebra::distance(&self.centroid, point)
    }
}

/// Inclusive contour-area band `[min_area, max_area]`.
///
/// Excludes both noise specks and whole-frame lighting changes.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct AreaBand {
    pub min_area: f64,
    pub max_area: f64,
}

impl AreaBand {
    pub fn new(min_area: f64, max_area: f64) -> Self {
        Self { min_area, max_area }
    }

    pub fn contains(&self, area: f64) -> bool {
        area >= self.min_area && area <= self.max_area
    }
}

impl Default for AreaBand {
    fn default() -> Self {
        Self {
            min_area: 50.0,
            max_area: 3000.0,
        }
    }
}

/// Index and distance of the candidate closest to `point`.
pub fn nearest_candidate(candidates: &[Candidate], point: &Point2<f64>) -> Option<(usize, f64)> {
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| (i, c.distance_to(point)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_area_band_edges() {
        let band = AreaBand::default();
        assert!(!band.contains(49.0));
        assert!(band.contains(50.0));
        assert!(band.contains(3000.0));
        assert!(!band.contains(3001.0));
    }

    #[test]
    fn test_nearest_candidate() {
        let candidates = vec![
            Candidate::new(Point2::new(10.0, 10.0), 100.0, 1),
            Candidate::new(Point2::new(50.0, 50.0), 100.0, 1),
            Candidate::new(Point2::new(200.0, 10.0), 100.0, 1),
        ];
        let (idx, dist) = nearest_candidate(&candidates, &Point2::new(45.0, 50.0)).unwrap();
        assert_eq!(idx, 1);
        assert!((dist - 5.0).abs() < 1e-9);

        assert!(nearest_candidate(&[], &Point2::new(0.0, 0.0)).is_none());
    }
}
