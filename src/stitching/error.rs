use thiserror::Error;

#[derive(Debug, Error)]
pub enum StitchError {
    #[error("not enough feature matches: {found} < {required}")]
    NotEnoughFeatures { found: usize, required: usize },

    #[error("not enough inlier matches: {found} < {required}")]
    NotEnoughInliers { found: usize, required: usize },

    #[error("canvas would grow to {width}x{height}, over the {max} px limit")]
    CanvasOverflow { width: i32, height: i32, max: i32 },

    #[error(transparent)]
    OpenCv(#[from] opencv::Error),
}

impl StitchError {
    /// Frame skipped, canvas untouched; the stream can continue.
    pub fn is_registration_failure(&self) -> bool {
        !matches!(self, StitchError::OpenCv(_))
    }
}
