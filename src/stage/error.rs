use std::io;
use std::time::Duration;

use thiserror::Error;

use super::state::{SoftLimits, StagePosition};

/// Failures of a single motor-link request.
///
/// Everything except `Disconnected` and `NotConnected` leaves the link
/// usable; the position estimate is never advanced by a failed request.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("no acknowledgement for `{command}` within {waited:?}")]
    Timeout { command: String, waited: Duration },

    #[error("firmware rejected `{command}`: {reason}")]
    Firmware { command: String, reason: String },

    #[error("`{command}` would move the stage to {target}, outside {limits}")]
    BoundaryViolation {
        command: String,
        target: StagePosition,
        limits: SoftLimits,
    },

    #[error("wait for `{command}` preempted by emergency stop")]
    Preempted { command: String },

    #[error("`{command}` was decided before an emergency stop and not sent")]
    Superseded { command: String },

    #[error("serial channel lost: {0}")]
    Disconnected(#[source] io::Error),

    #[error("motor link is not connected")]
    NotConnected,

    #[error("unexpected reply to `{command}`: {reply}")]
    UnexpectedReply { command: String, reply: String },
}

impl StageError {
    /// The channel itself is gone; automatic servoing must halt until a
    /// reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StageError::Disconnected(_) | StageError::NotConnected)
    }
}
