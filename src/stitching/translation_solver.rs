//! Robust translation between two frames from keypoint correspondences.
//!
//! One correspondence fixes a translation, so each hypothesis is a single
//! displacement. All displacements are tried when there are few enough;
//! otherwise a seeded sample is drawn so results stay reproducible. The
//! winner is refined by the per-axis median of its inliers.

use nalgebra::Vector2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranslationSolverConfig {
    /// Hypotheses evaluated when sampling.
    pub max_iterations: usize,
    /// Max distance, in pixels, between a displacement and the model.
    pub inlier_threshold_px: f64,
    pub seed: u64,
}

impl Default for TranslationSolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            inlier_threshold_px: 3.0,
            seed: 0x5eed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranslationEstimate {
    pub offset: Vector2<f64>,
    /// Indices of inlier displacements.
    pub inliers: Vec<usize>,
}

impl TranslationEstimate {
    pub fn num_inliers(&self) -> usize {
        self.inliers.len()
    }
}

/// Best-supported translation, or `None` for an empty input. The caller
/// decides whether the inlier count is enough.
pub fn estimate_translation(
    displacements: &[Vector2<f64>],
    config: &TranslationSolverConfig,
) -> Option<TranslationEstimate> {
    let n = displacements.len();
    if n == 0 {
        return None;
    }

    let threshold = config.inlier_threshold_px;
    let mut best: Option<TranslationEstimate> = None;
    let mut consider = |hypothesis: Vector2<f64>| {
        let inliers = find_inliers(displacements, &hypothesis, threshold);
        if best.as_ref().map_or(true, |b| inliers.len() > b.inliers.len()) {
            best = Some(TranslationEstimate {
                offset: hypothesis,
                inliers,
            });
        }
    };

    if n <= config.max_iterations {
        displacements.iter().for_each(|d| consider(*d));
    } else {
        let mut rng = StdRng::seed_from_u64(config.seed);
        for _ in 0..config.max_iterations {
            consider(displacements[rng.gen_range(0..n)]);
        }
    }

    let mut best = best?;

    let inlier_set: Vec<Vector2<f64>> = best.inliers.iter().map(|&i| displacements[i]).collect();
    let refined = Vector2::new(
        median(inlier_set.iter().map(|d| d.x).collect()),
        median(inlier_set.iter().map(|d| d.y).collect()),
    );
    let refined_inliers = find_inliers(displacements, &refined, threshold);
    if refined_inliers.len() >= best.inliers.len() {
        best.offset = refined;
        best.inliers = refined_inliers;
    }
    Some(best)
}

fn find_inliers(displacements: &[Vector2<f64>], model: &Vector2<f64>, threshold: f64) -> Vec<usize> {
    displacements
        .iter()
        .enumerate()
        .filter(|(_, d)| (*d - model).norm() <= threshold)
        .map(|(i, _)| i)
        .collect()
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noisy_set(truth: Vector2<f64>, inliers: usize, outliers: usize, seed: u64) -> Vec<Vector2<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut out = Vec::new();
        for _ in 0..inliers {
            out.push(truth + Vector2::new(rng.gen_range(-0.5..0.5), rng.gen_range(-0.5..0.5)));
        }
        for _ in 0..outliers {
            out.push(Vector2::new(rng.gen_range(-300.0..300.0), rng.gen_range(-300.0..300.0)));
        }
        out
    }

    #[test]
    fn test_recovers_translation_with_outliers() {
        let truth = Vector2::new(42.0, -17.0);
        let data = noisy_set(truth, 40, 60, 1);
        let est = estimate_translation(&data, &TranslationSolverConfig::default()).unwrap();
        assert!((est.offset - truth).norm() < 0.5);
        assert!(est.num_inliers() >= 40);
    }

    #[test]
    fn test_sampled_path_is_reproducible() {
        let truth = Vector2::new(-5.0, 80.0);
        let data = noisy_set(truth, 300, 400, 2);
        let config = TranslationSolverConfig {
            max_iterations: 100,
            ..TranslationSolverConfig::default()
        };
        let a = estimate_translation(&data, &config).unwrap();
        let b = estimate_translation(&data, &config).unwrap();
        assert_eq!(a.offset, b.offset);
        assert_eq!(a.inliers, b.inliers);
        assert!((a.offset - truth).norm() < 0.5);
    }

    #[test]
    fn test_empty_input() {
        assert!(estimate_translation(&[], &TranslationSolverConfig::default()).is_none());
    }

    #[test]
    fn test_median() {
        assert_eq!(median(vec![3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(vec![4.0, 1.0, 2.0, 3.0]), 2.5);
    }
}
