//! Frame acquisition seam and on-disk input/output.

pub mod frame;
pub mod image_sequence;
pub mod persist;

pub use frame::{Frame, FrameSource};
pub use image_sequence::{ImageEntry, ImageSequenceSource};
pub use persist::{canvas_file_name, save_canvas, save_stitched};
