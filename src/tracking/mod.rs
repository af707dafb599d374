//! Organism tracking: the lock, its history and the Idle/Tracking state
//! machine that associates per-frame candidates with the lock.

pub mod lock;
pub mod result;
pub mod state;
pub mod tracker;

pub use lock::{HistoryRing, Lock, LockId, TrackPoint};
pub use result::TrackingUpdate;
pub use state::{ReleaseReason, TrackerState};
pub use tracker::{LockError, Tracker, TrackerConfig};
