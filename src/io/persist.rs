use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use opencv::core::{Mat, Vector};
use opencv::imgcodecs;
use opencv::prelude::*;
use tracing::info;

use crate::stitching::StitchCanvas;

/// File name used for a stitched result.
pub fn canvas_file_name(timestamp: u64) -> String {
    format!("stitched_microscope_{}.png", timestamp)
}

/// Write the canvas, cropped to its covered region, to
/// `dir/stitched_microscope_<timestamp>.png`.
pub fn save_canvas(canvas: &StitchCanvas, dir: &Path, timestamp: u64) -> Result<PathBuf> {
    save_stitched(&canvas.cropped()?, dir, timestamp)
}

/// Write an already-cropped stitched image under the same naming scheme.
pub fn save_stitched(image: &Mat, dir: &Path, timestamp: u64) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(canvas_file_name(timestamp));

    let path_str = path
        .to_str()
        .with_context(|| format!("Non UTF-8 output path {:?}", path))?;
    let written = imgcodecs::imwrite(path_str, image, &Vector::new())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    if !written {
        bail!("OpenCV refused to write {}", path.display());
    }
    info!(
        "Saved stitched image {}x{} to {}",
        image.cols(),
        image.rows(),
        path.display()
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::Frame;
    use crate::stitching::{StitchAccumulator, StitchConfig};
    use opencv::core::{Scalar, CV_8UC3};
    use opencv::imgcodecs::IMREAD_UNCHANGED;

    #[test]
    fn test_save_canvas_names_and_writes_file() {
        let image = Mat::new_rows_cols_with_default(48, 64, CV_8UC3, Scalar::all(90.0)).unwrap();
        let mut acc = StitchAccumulator::new(StitchConfig::default()).unwrap();
        acc.ingest(&Frame::new(image, 0, 0)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("results");
        let path = save_canvas(acc.canvas().unwrap(), &out, 1_700_000_000).unwrap();

        assert_eq!(path, out.join("stitched_microscope_1700000000.png"));
        let back = imgcodecs::imread(path.to_str().unwrap(), IMREAD_UNCHANGED).unwrap();
        assert_eq!((back.cols(), back.rows()), (64, 48));
    }
}
