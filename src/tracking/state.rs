//! Tracker state machine.

/// State of the single-target tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerState {
    /// No lock. Waiting for a click-to-track.
    #[default]
    Idle,
    /// A lock exists and is updated every frame.
    Tracking,
}

/// Why a lock was released without being lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// User asked to pick a new organism.
    Reset,
    /// Tracking mode was switched off.
    Stopped,
}
