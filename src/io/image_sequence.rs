use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use csv::ReaderBuilder;
use opencv::imgcodecs::{self, IMREAD_COLOR};
use opencv::prelude::*;
use tracing::{info, warn};

use super::frame::{Frame, FrameSource};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

#[derive(Debug, Clone)]
pub struct ImageEntry {
    pub timestamp_ns: u64,
    pub path: PathBuf,
}

/// Replays a directory of images as a camera stream.
///
/// If the directory holds a `data.csv` index (`timestamp_ns,filename` per
/// line, `#` comments allowed) it defines order and timestamps. Otherwise
/// every image file is used in file-name order, stamped `frame_interval`
/// apart.
pub struct ImageSequenceSource {
    entries: Vec<ImageEntry>,
    next: usize,
}

impl ImageSequenceSource {
    pub fn open<P: AsRef<Path>>(dir: P, frame_interval: Duration) -> Result<Self> {
        let dir = dir.as_ref();
        let index = dir.join("data.csv");
        let entries = if index.is_file() {
            load_index(dir, &index)?
        } else {
            scan_directory(dir, frame_interval)?
        };
        if entries.is_empty() {
            bail!("No images found in {}", dir.display());
        }
        info!("Image sequence {}: {} frames", dir.display(), entries.len());
        Ok(Self { entries, next: 0 })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ImageEntry] {
        &self.entries
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(entry) = self.entries.get(self.next) else {
            return Ok(None);
        };
        let seq = self.next as u64;
        self.next += 1;

        let path = entry
            .path
            .to_str()
            .with_context(|| format!("Non UTF-8 image path {:?}", entry.path))?;
        let image = imgcodecs::imread(path, IMREAD_COLOR)
            .with_context(|| format!("Failed to read image {:?}", entry.path))?;
        if image.empty() {
            bail!("Could not decode image {:?}", entry.path);
        }
        Ok(Some(Frame::new(image, entry.timestamp_ns, seq)))
    }
}

fn load_index(dir: &Path, csv_path: &Path) -> Result<Vec<ImageEntry>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .from_path(csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;

    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 2 {
            continue;
        }
        let timestamp_ns: u64 = rec[0]
            .trim()
            .parse()
            .with_context(|| format!("Bad timestamp {:?} in {}", &rec[0], csv_path.display()))?;
        entries.push(ImageEntry {
            timestamp_ns,
            path: dir.join(rec[1].trim()),
        });
    }
    Ok(entries)
}

fn scan_directory(dir: &Path, frame_interval: Duration) -> Result<Vec<ImageEntry>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image {
            paths.push(path);
        } else if path.is_file() {
            warn!("Skipping non-image file {}", path.display());
        }
    }
    paths.sort();

    let step = frame_interval.as_nanos() as u64;
    Ok(paths
        .into_iter()
        .enumerate()
        .map(|(i, path)| ImageEntry {
            timestamp_ns: i as u64 * step,
            path,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Mat, Scalar, Vector, CV_8UC3};

    fn write_image(path: &Path, value: f64) {
        let img = Mat::new_rows_cols_with_default(20, 30, CV_8UC3, Scalar::all(value)).unwrap();
        assert!(imgcodecs::imwrite(path.to_str().unwrap(), &img, &Vector::new()).unwrap());
    }

    #[test]
    fn test_directory_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("b.png"), 20.0);
        write_image(&dir.path().join("a.png"), 10.0);
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut source = ImageSequenceSource::open(dir.path(), Duration::from_millis(100)).unwrap();
        assert_eq!(source.len(), 2);

        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(first.timestamp_ns, 0);
        assert_eq!(first.width(), 30);
        assert_eq!(first.image.at_2d::<opencv::core::Vec3b>(0, 0).unwrap().0, [10u8, 10, 10]);

        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(second.seq, 1);
        assert_eq!(second.timestamp_ns, 100_000_000);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_csv_index_defines_order_and_time() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("x.png"), 1.0);
        write_image(&dir.path().join("y.png"), 2.0);
        std::fs::write(
            dir.path().join("data.csv"),
            "#timestamp [ns],filename\n5000,y.png\n9000,x.png\n",
        )
        .unwrap();

        let source = ImageSequenceSource::open(dir.path(), Duration::from_millis(33)).unwrap();
        let entries = source.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].timestamp_ns, 5000);
        assert!(entries[0].path.ends_with("y.png"));
    }

    #[test]
    fn test_empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageSequenceSource::open(dir.path(), Duration::from_millis(33)).is_err());
    }
}
