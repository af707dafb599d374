//! Camera frames and the frame-source seam.
//!
//! Acquisition itself lives outside this crate: anything that can hand out
//! `(pixels, timestamp, sequence)` triples implements [`FrameSource`].

use anyhow::Result;
use nalgebra::Point2;
use opencv::core::Mat;
use opencv::prelude::*;

/// An immutable BGR frame with its capture metadata.
pub struct Frame {
    pub image: Mat,
    /// Capture timestamp in nanoseconds.
    pub timestamp_ns: u64,
    /// Monotonically increasing sequence number assigned by the source.
    pub seq: u64,
}

impl Frame {
    pub fn new(image: Mat, timestamp_ns: u64, seq: u64) -> Self {
        Self {
            image,
            timestamp_ns,
            seq,
        }
    }

    pub fn width(&self) -> i32 {
        self.image.cols()
    }

    pub fn height(&self) -> i32 {
        self.image.rows()
    }

    /// Pixel center used as the servo set-point (integer division, like the
    /// overlay crosshair).
    pub fn center(&self) -> Point2<f64> {
        Point2::new((self.width() / 2) as f64, (self.height() / 2) as f64)
    }

    /// Deep copy, used when one frame fans out to several consumers.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            image: self.image.try_clone()?,
            timestamp_ns: self.timestamp_ns,
            seq: self.seq,
        })
    }
}

/// Supplier of frames. May stall or skip; `Ok(None)` means the stream ended.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}
