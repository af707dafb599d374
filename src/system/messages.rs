//! Messages exchanged with the worker threads.
//!
//! `ControlMsg` flows from the UI layer into the tracking worker;
//! `StatusEvent` flows out of every worker for display.

use std::fmt;

use nalgebra::Point2;

use crate::servo::Suppression;
use crate::stage::StagePosition;
use crate::tracking::{LockId, TrackingUpdate};

/// Requests handled by the tracking worker between frames.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMsg {
    /// Click-to-track at a frame pixel.
    LockOn(Point2<f64>),
    ResetTracking,
    /// Forget the learned background, e.g. after the illumination changed.
    ResetBackground,
    SetAutoCentering(bool),
    ToggleAutoCentering,
    /// Release the lock after tracking mode was switched off.
    StopTracking,
}

#[derive(Debug, Clone)]
pub enum StatusEvent {
    LockAcquired { lock_id: LockId, position: Point2<f64> },
    LockFailed { reason: String },
    /// Tracker output for one processed frame.
    Tracking { seq: u64, update: TrackingUpdate },
    TargetLost { lock_id: LockId, last_position: Point2<f64> },
    AutoCentering { enabled: bool },
    ServoCommandSent { token: String, position: StagePosition },
    ServoSuppressed { reason: Suppression },
    /// A directive was discarded: the motor was still busy, or a stop
    /// was issued before it reached the wire.
    ServoCommandDropped { token: String },
    StageFailure { message: String, fatal: bool },
    StopSent,
    FrameSkipped { seq: u64, reason: String },
    CanvasUpdated { frames: usize, width: i32, height: i32 },
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::LockAcquired { lock_id, position } => write!(
                f,
                "Tracking {} at ({:.0}, {:.0})",
                lock_id, position.x, position.y
            ),
            StatusEvent::LockFailed { reason } => write!(f, "Lock failed: {}", reason),
            StatusEvent::Tracking { update, .. } => match update {
                TrackingUpdate::Tracking { position, .. } => {
                    write!(f, "Target at ({:.0}, {:.0})", position.x, position.y)
                }
                TrackingUpdate::NotFound { misses, .. } => {
                    write!(f, "Target not found ({} missed)", misses)
                }
                other => write!(f, "{:?}", other),
            },
            StatusEvent::TargetLost { lock_id, last_position } => write!(
                f,
                "Lost {} near ({:.0}, {:.0}); click to re-acquire",
                lock_id, last_position.x, last_position.y
            ),
            StatusEvent::AutoCentering { enabled } => write!(
                f,
                "Auto-centering {}",
                if *enabled { "ON" } else { "OFF" }
            ),
            StatusEvent::ServoCommandSent { token, position } => {
                write!(f, "Motor {} -> {}", token, position)
            }
            StatusEvent::ServoSuppressed { reason } => match reason {
                Suppression::RateLimited { remaining } => {
                    write!(f, "Motor ready in {:.1}s", remaining.as_secs_f64())
                }
                other => write!(f, "Holding position ({:?})", other),
            },
            StatusEvent::ServoCommandDropped { token } => {
                write!(f, "Motor command {} dropped", token)
            }
            StatusEvent::StageFailure { message, fatal } => {
                if *fatal {
                    write!(f, "STAGE DISCONNECTED: {}", message)
                } else {
                    write!(f, "Stage error: {}", message)
                }
            }
            StatusEvent::StopSent => write!(f, "Stop sent"),
            StatusEvent::FrameSkipped { seq, reason } => {
                write!(f, "Stitch skipped frame {}: {}", seq, reason)
            }
            StatusEvent::CanvasUpdated { frames, width, height } => {
                write!(f, "Canvas {}x{} from {} frames", width, height, frames)
            }
        }
    }
}
