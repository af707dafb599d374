use nalgebra::Point2;
use opencv::core::{DMatch, KeyPoint, Mat, Ptr, Vector, NORM_HAMMING};
use opencv::features2d::{self, BFMatcher};
use opencv::prelude::*;

/// ORB keypoints and their binary descriptors for one frame.
#[derive(Clone)]
pub struct FeatureSet {
    pub keypoints: Vector<KeyPoint>,
    pub descriptors: Mat,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// A keypoint pair: the same scene point in the previous and the current
/// frame, in each frame's pixel coordinates.
#[derive(Debug, Clone, Copy)]
pub struct Correspondence {
    pub prev: Point2<f64>,
    pub curr: Point2<f64>,
    pub distance: f32,
}

pub struct FeatureMatcher {
    orb: Ptr<features2d::ORB>,
    matcher: BFMatcher,
}

impl FeatureMatcher {
    pub fn new(n_features: i32) -> opencv::Result<Self> {
        let orb = features2d::ORB::create(
            n_features,
            1.2,
            8,
            31,
            0,
            2,
            features2d::ORB_ScoreType::HARRIS_SCORE,
            31,
            20,
        )?;
        // Cross-check keeps only mutual best matches.
        let matcher = BFMatcher::new(NORM_HAMMING, true)?;
        Ok(Self { orb, matcher })
    }

    pub fn detect(&mut self, image: &Mat) -> opencv::Result<FeatureSet> {
        let mut keypoints = Vector::<KeyPoint>::new();
        let mut descriptors = Mat::default();
        let mask = Mat::default();
        self.orb
            .detect_and_compute(image, &mask, &mut keypoints, &mut descriptors, false)?;
        Ok(FeatureSet {
            keypoints,
            descriptors,
        })
    }

    pub fn match_sets(&self, prev: &FeatureSet, curr: &FeatureSet) -> opencv::Result<Vec<Correspondence>> {
        if prev.is_empty() || curr.is_empty() {
            return Ok(Vec::new());
        }
        let mut matches = Vector::<DMatch>::new();
        self.matcher
            .train_match(&prev.descriptors, &curr.descriptors, &mut matches, &Mat::default())?;

        let mut out = Vec::with_capacity(matches.len());
        for m in matches.iter() {
            let p = prev.keypoints.get(m.query_idx as usize)?.pt();
            let c = curr.keypoints.get(m.train_idx as usize)?.pt();
            out.push(Correspondence {
                prev: Point2::new(p.x as f64, p.y as f64),
                curr: Point2::new(c.x as f64, c.y as f64),
                distance: m.distance,
            });
        }
        Ok(out)
    }
}
