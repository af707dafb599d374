//! State shared between the caller and the worker threads.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use opencv::core::Mat;
use parking_lot::Mutex;

use crate::tracking::TrackingUpdate;

pub struct SharedState {
    /// Detection and tracking run only while set.
    pub tracking_enabled: AtomicBool,
    /// Mirror of the servo controller's switch, for display.
    pub auto_centering: AtomicBool,
    /// Frames go to the stitch worker only while set.
    pub stitching_enabled: AtomicBool,
    /// The stitch worker starts a fresh canvas on its next frame.
    pub stitch_reset_requested: AtomicBool,
    pub shutdown_requested: AtomicBool,

    /// Latest stitched canvas, cropped to content.
    pub preview: Mutex<Option<Mat>>,
    pub last_update: Mutex<Option<TrackingUpdate>>,
    /// Servo controller summary after its latest decision.
    pub servo_status: Mutex<String>,

    pub frames_received: AtomicU64,
    pub frames_dropped: AtomicU64,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_tracking_enabled(&self) -> bool {
        self.tracking_enabled.load(Ordering::SeqCst)
    }

    pub fn is_stitching_enabled(&self) -> bool {
        self.stitching_enabled.load(Ordering::SeqCst)
    }

    pub fn is_auto_centering(&self) -> bool {
        self.auto_centering.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Returns whether a reset was pending, clearing it.
    pub fn take_stitch_reset(&self) -> bool {
        self.stitch_reset_requested.swap(false, Ordering::SeqCst)
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            tracking_enabled: AtomicBool::new(false),
            auto_centering: AtomicBool::new(false),
            stitching_enabled: AtomicBool::new(false),
            stitch_reset_requested: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            preview: Mutex::new(None),
            last_update: Mutex::new(None),
            servo_status: Mutex::new(String::new()),
            frames_received: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }
}
