//! Feathered alpha blending of a frame into the canvas.
//!
//! Pixels the canvas has never covered are copied. Covered pixels are mixed
//! with the frame's weight, which ramps from ~0 at the frame border to 1 at
//! `feather_px` inside it, so the seam fades out across the overlap band.

/// Interleaved 8-bit pixel buffer view.
pub struct PixelView<'a> {
    pub data: &'a [u8],
    pub cols: usize,
    pub rows: usize,
    pub channels: usize,
}

/// Weight of the incoming frame at (x, y).
pub fn feather_weight(x: usize, y: usize, cols: usize, rows: usize, feather_px: usize) -> f32 {
    if feather_px == 0 {
        return 1.0;
    }
    let edge = x.min(y).min(cols - 1 - x).min(rows - 1 - y);
    ((edge + 1) as f32 / feather_px as f32).min(1.0)
}

/// Blend `frame` into `canvas` with its top-left corner at `origin`.
/// `coverage` holds one byte per canvas pixel, non-zero once covered.
///
/// The frame must lie inside the canvas.
pub fn blend_into(
    canvas: &mut [u8],
    canvas_cols: usize,
    coverage: &mut [u8],
    frame: &PixelView<'_>,
    origin: (usize, usize),
    feather_px: usize,
) {
    let ch = frame.channels;
    let (ox, oy) = origin;
    for y in 0..frame.rows {
        for x in 0..frame.cols {
            let cov_idx = (oy + y) * canvas_cols + ox + x;
            let dst = cov_idx * ch;
            let src = (y * frame.cols + x) * ch;
            let src_px = &frame.data[src..src + ch];
            let dst_px = &mut canvas[dst..dst + ch];

            if coverage[cov_idx] == 0 {
                dst_px.copy_from_slice(src_px);
                coverage[cov_idx] = 1;
                continue;
            }

            let alpha = feather_weight(x, y, frame.cols, frame.rows, feather_px);
            for (d, s) in dst_px.iter_mut().zip(src_px) {
                let mixed = alpha * *s as f32 + (1.0 - alpha) * *d as f32;
                *d = mixed.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feather_ramp() {
        assert_eq!(feather_weight(0, 5, 10, 10, 4), 0.25);
        assert_eq!(feather_weight(3, 5, 10, 10, 4), 1.0);
        assert_eq!(feather_weight(9, 5, 10, 10, 4), 0.25);
        assert_eq!(feather_weight(0, 0, 10, 10, 0), 1.0);
    }

    #[test]
    fn test_uncovered_copied_covered_mixed() {
        // 1x4 canvas, left half already covered with 100.
        let mut canvas = vec![100u8, 100, 0, 0];
        let mut coverage = vec![1u8, 1, 0, 0];
        let frame_data = vec![200u8; 4];
        let frame = PixelView {
            data: &frame_data,
            cols: 4,
            rows: 1,
            channels: 1,
        };

        blend_into(&mut canvas, 4, &mut coverage, &frame, (0, 0), 2);

        // A single row is all border: every covered pixel gets weight 0.5.
        assert_eq!(canvas, vec![150, 150, 200, 200]);
        assert_eq!(coverage, vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_blending_identical_content_is_lossless() {
        let mut canvas = vec![17u8, 99, 250, 3, 17, 99, 250, 3];
        let mut coverage = vec![1u8; 2];
        let frame_data = canvas.clone();
        let frame = PixelView {
            data: &frame_data,
            cols: 2,
            rows: 1,
            channels: 4,
        };
        blend_into(&mut canvas, 2, &mut coverage, &frame, (0, 0), 8);
        assert_eq!(canvas, frame_data);
    }
}
