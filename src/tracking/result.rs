//! Per-frame tracker output.
//!
//! These events feed the servo controller and the UI overlay.

use nalgebra::Point2;

use super::lock::LockId;
use super::state::ReleaseReason;

/// Outcome of a tracker update or an explicit lock change.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackingUpdate {
    /// No lock exists; nothing was matched.
    Idle,
    /// A new lock was created by click-to-track.
    Locked {
        lock_id: LockId,
        position: Point2<f64>,
    },
    /// The lock matched a candidate this frame.
    Tracking {
        lock_id: LockId,
        position: Point2<f64>,
        frame_seq: u64,
    },
    /// No acceptable candidate this frame; the lock is still alive.
    NotFound {
        lock_id: LockId,
        last_position: Point2<f64>,
        misses: u32,
    },
    /// Too many consecutive misses. The lock has been destroyed.
    Lost {
        lock_id: LockId,
        last_position: Point2<f64>,
    },
    /// The lock was destroyed on request.
    Released {
        lock_id: LockId,
        reason: ReleaseReason,
    },
}

impl TrackingUpdate {
    /// Current target position, if this update carries a fresh one.
    pub fn position(&self) -> Option<Point2<f64>> {
        match self {
            TrackingUpdate::Locked { position, .. } | TrackingUpdate::Tracking { position, .. } => {
                Some(*position)
            }
            _ => None,
        }
    }

    /// Events that must halt the stage: loss, reset and stop.
    pub fn requires_stop(&self) -> bool {
        matches!(
            self,
            TrackingUpdate::Lost { .. } | TrackingUpdate::Released { .. }
        )
    }

    pub fn lock_id(&self) -> Option<LockId> {
        match self {
            TrackingUpdate::Idle => None,
            TrackingUpdate::Locked { lock_id, .. }
            | TrackingUpdate::Tracking { lock_id, .. }
            | TrackingUpdate::NotFound { lock_id, .. }
            | TrackingUpdate::Lost { lock_id, .. }
            | TrackingUpdate::Released { lock_id, .. } => Some(*lock_id),
        }
    }
}
