//! The growing panorama buffer.

use nalgebra::{Matrix3, Vector2};
use opencv::core::{Mat, Rect};
use opencv::prelude::*;

use super::blend::{blend_into, PixelView};
use super::error::StitchError;
use super::features::FeatureSet;

pub struct StitchCanvas {
    image: Mat,
    /// One byte per pixel, non-zero once any frame covered it.
    coverage: Vec<u8>,
    /// Top-left of the first frame, in canvas pixels.
    origin: Vector2<f64>,
    /// Top-left of the last registered frame, in canvas pixels.
    last_offset: Vector2<f64>,
    pub(crate) last_features: FeatureSet,
    frames: usize,
}

impl StitchCanvas {
    /// Seed a canvas with its first frame. `image` must be continuous 8-bit.
    pub(crate) fn seed(image: &Mat, features: FeatureSet) -> Result<Self, StitchError> {
        let image = image.try_clone()?;
        let pixels = (image.rows() * image.cols()) as usize;
        Ok(Self {
            image,
            coverage: vec![1; pixels],
            origin: Vector2::zeros(),
            last_offset: Vector2::zeros(),
            last_features: features,
            frames: 1,
        })
    }

    pub fn image(&self) -> &Mat {
        &self.image
    }

    pub fn width(&self) -> i32 {
        self.image.cols()
    }

    pub fn height(&self) -> i32 {
        self.image.rows()
    }

    /// Frames committed so far, the seed included.
    pub fn frame_count(&self) -> usize {
        self.frames
    }

    /// Accumulated translation of the last frame relative to the first one,
    /// as a homogeneous 2D transform. Never revised after the fact.
    pub fn transform(&self) -> Matrix3<f64> {
        let t = self.last_offset - self.origin;
        Matrix3::new(1.0, 0.0, t.x, 0.0, 1.0, t.y, 0.0, 0.0, 1.0)
    }

    pub fn last_offset(&self) -> Vector2<f64> {
        self.last_offset
    }

    /// Bounding box of covered pixels.
    pub fn content_bounds(&self) -> Option<Rect> {
        let cols = self.width() as usize;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (usize::MAX, usize::MAX, 0, 0);
        for (i, _) in self.coverage.iter().enumerate().filter(|(_, c)| **c != 0) {
            let (x, y) = (i % cols, i / cols);
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        if min_x == usize::MAX {
            return None;
        }
        Some(Rect::new(
            min_x as i32,
            min_y as i32,
            (max_x - min_x + 1) as i32,
            (max_y - min_y + 1) as i32,
        ))
    }

    /// Deep copy of the canvas cropped to its content.
    pub fn cropped(&self) -> Result<Mat, StitchError> {
        match self.content_bounds() {
            Some(rect) => Ok(Mat::roi(&self.image, rect)?.try_clone()?),
            None => Ok(self.image.try_clone()?),
        }
    }

    /// Commit a registered frame whose top-left lands at `offset` (canvas
    /// pixels, before any growth). Grows the canvas as needed; on error
    /// nothing is modified.
    pub(crate) fn commit(
        &mut self,
        image: &Mat,
        features: FeatureSet,
        offset: Vector2<f64>,
        feather_px: usize,
        max_dim: i32,
    ) -> Result<(), StitchError> {
        let px = offset.x.round() as i32;
        let py = offset.y.round() as i32;
        let (left, top) = self.grow_to_fit(px, py, image.cols(), image.rows(), max_dim)?;
        let shift = Vector2::new(left as f64, top as f64);

        let view = PixelView {
            data: image.data_bytes()?,
            cols: image.cols() as usize,
            rows: image.rows() as usize,
            channels: image.channels() as usize,
        };
        let canvas_cols = self.width() as usize;
        blend_into(
            self.image.data_bytes_mut()?,
            canvas_cols,
            &mut self.coverage,
            &view,
            ((px + left) as usize, (py + top) as usize),
            feather_px,
        );

        self.last_offset = offset + shift;
        self.last_features = features;
        self.frames += 1;
        Ok(())
    }

    /// Enlarge the canvas so a `w`x`h` frame at (px, py) fits. Returns how
    /// far existing content moved right and down.
    fn grow_to_fit(&mut self, px: i32, py: i32, w: i32, h: i32, max_dim: i32) -> Result<(i32, i32), StitchError> {
        let (cw, ch) = (self.width(), self.height());
        let left = (-px).max(0);
        let top = (-py).max(0);
        let new_w = (cw + left).max(px + left + w);
        let new_h = (ch + top).max(py + top + h);
        if left == 0 && top == 0 && new_w == cw && new_h == ch {
            return Ok((0, 0));
        }
        if new_w > max_dim || new_h > max_dim {
            return Err(StitchError::CanvasOverflow {
                width: new_w,
                height: new_h,
                max: max_dim,
            });
        }

        let mut grown = Mat::zeros(new_h, new_w, self.image.typ())?.to_mat()?;
        let mut coverage = vec![0u8; (new_w * new_h) as usize];
        let px_bytes = self.image.channels() as usize;
        {
            let src = self.image.data_bytes()?;
            let dst = grown.data_bytes_mut()?;
            let row_bytes = cw as usize * px_bytes;
            for row in 0..ch as usize {
                let s = row * row_bytes;
                let d = ((row + top as usize) * new_w as usize + left as usize) * px_bytes;
                dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);

                let cs = row * cw as usize;
                let cd = (row + top as usize) * new_w as usize + left as usize;
                coverage[cd..cd + cw as usize].copy_from_slice(&self.coverage[cs..cs + cw as usize]);
            }
        }

        self.image = grown;
        self.coverage = coverage;
        let shift = Vector2::new(left as f64, top as f64);
        self.origin += shift;
        self.last_offset += shift;
        Ok((left, top))
    }
}
