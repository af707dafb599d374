//! Single-target tracker: click-to-track lock-on, nearest-centroid
//! association with a jump limit, and loss detection.
//!
//! Association is single-hypothesis. When two organisms cross, the lock
//! follows whichever centroid is nearer, which can swap identities.

use nalgebra::Point2;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::detection::{nearest_candidate, Candidate};

use super::lock::{Lock, LockId};
use super::result::TrackingUpdate;
use super::state::{ReleaseReason, TrackerState};

/// Tracker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Maximum click-to-centroid distance accepted by `lock_on`, in pixels.
    pub capture_radius: f64,
    /// Maximum centroid displacement between frames for the same organism.
    pub jump_limit: f64,
    /// Consecutive not-found frames that invalidate the lock.
    pub max_misses: u32,
    /// Capacity of the centroid history ring.
    pub history_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            capture_radius: 100.0,
            jump_limit: 100.0,
            max_misses: 3,
            history_capacity: 50,
        }
    }
}

/// Failure to acquire a lock.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LockError {
    #[error("no candidate near click at ({:.0}, {:.0}); nearest is {}", .point.x, .point.y, describe_nearest(.nearest))]
    NoCandidateNear {
        point: Point2<f64>,
        nearest: Option<f64>,
    },
}

fn describe_nearest(nearest: &Option<f64>) -> String {
    match nearest {
        Some(d) => format!("{:.1}px away", d),
        None => "absent".to_string(),
    }
}

/// Tracker instance. Holds at most one lock.
pub struct Tracker {
    config: TrackerConfig,
    state: TrackerState,
    lock: Option<Lock>,
    /// Counter for lock identity tokens.
    next_lock_id: u64,
    /// Candidates of the most recent frame, used to resolve clicks.
    latest_candidates: Vec<Candidate>,
    latest_seq: u64,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            state: TrackerState::Idle,
            lock: None,
            next_lock_id: 0,
            latest_candidates: Vec::new(),
            latest_seq: 0,
        }
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn lock(&self) -> Option<&Lock> {
        self.lock.as_ref()
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Candidates seen in the most recent frame.
    pub fn latest_candidates(&self) -> &[Candidate] {
        &self.latest_candidates
    }

    /// Process the candidates of one frame.
    pub fn update(&mut self, candidates: &[Candidate], frame_seq: u64) -> TrackingUpdate {
        self.latest_candidates = candidates.to_vec();
        self.latest_seq = frame_seq;

        let Some(lock) = self.lock.as_mut() else {
            return TrackingUpdate::Idle;
        };

        let best = nearest_candidate(candidates, &lock.position);
        match best {
            Some((idx, distance)) if distance <= self.config.jump_limit => {
                let position = candidates[idx].centroid;
                lock.accept(position, frame_seq);
                return TrackingUpdate::Tracking {
                    lock_id: lock.id,
                    position,
                    frame_seq,
                };
            }
            Some((_, distance)) => {
                debug!(
                    "{}: best candidate {:.1}px away exceeds jump limit {:.0}px",
                    lock.id, distance, self.config.jump_limit
                );
            }
            None => {}
        }

        lock.misses += 1;
        if lock.misses < self.config.max_misses {
            return TrackingUpdate::NotFound {
                lock_id: lock.id,
                last_position: lock.position,
                misses: lock.misses,
            };
        }

        let lock_id = lock.id;
        let last_position = lock.position;
        warn!(
            "{} lost after {} frames without a match (last at {:.0}, {:.0})",
            lock_id, self.config.max_misses, last_position.x, last_position.y
        );
        self.destroy_lock();
        TrackingUpdate::Lost {
            lock_id,
            last_position,
        }
    }

    /// Lock onto the candidate nearest to `point` among the latest candidates.
    ///
    /// On failure the tracker is left untouched.
    pub fn lock_on(&mut self, point: Point2<f64>) -> Result<TrackingUpdate, LockError> {
        let nearest = nearest_candidate(&self.latest_candidates, &point);
        let (idx, distance) = match nearest {
            Some((idx, d)) if d <= self.config.capture_radius => (idx, d),
            other => {
                return Err(LockError::NoCandidateNear {
                    point,
                    nearest: other.map(|(_, d)| d),
                });
            }
        };

        let candidate = self.latest_candidates[idx].clone();
        let lock_id = self.issue_lock_id();
        if let Some(previous) = self.lock.take() {
            debug!("{} replaced by {}", previous.id, lock_id);
        }

        info!(
            "{} acquired at ({:.0}, {:.0}), {:.1}px from click, area {:.0}px²",
            lock_id, candidate.centroid.x, candidate.centroid.y, distance, candidate.area
        );
        let position = candidate.centroid;
        self.lock = Some(Lock::new(
            lock_id,
            position,
            self.latest_seq,
            self.config.history_capacity,
        ));
        self.state = TrackerState::Tracking;
        Ok(TrackingUpdate::Locked { lock_id, position })
    }

    /// Drop the lock at the user's request. Returns the release event when
    /// a lock existed.
    pub fn reset(&mut self) -> Option<TrackingUpdate> {
        self.release(ReleaseReason::Reset)
    }

    /// Drop the lock because tracking mode ended.
    pub fn stop(&mut self) -> Option<TrackingUpdate> {
        self.release(ReleaseReason::Stopped)
    }

    fn release(&mut self, reason: ReleaseReason) -> Option<TrackingUpdate> {
        // Invalidate the token space even when idle, so late clicks can't
        // resurrect an old identity.
        self.next_lock_id += 1;
        let lock = self.lock.as_ref()?;
        let lock_id = lock.id;
        info!("{} released ({:?})", lock_id, reason);
        self.destroy_lock();
        Some(TrackingUpdate::Released { lock_id, reason })
    }

    fn destroy_lock(&mut self) {
        if let Some(lock) = self.lock.as_mut() {
            lock.alive = false;
        }
        self.lock = None;
        self.state = TrackerState::Idle;
    }

    fn issue_lock_id(&mut self) -> LockId {
        self.next_lock_id += 1;
        LockId::new(self.next_lock_id)
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(x: f64, y: f64, seq: u64) -> Candidate {
        Candidate::new(Point2::new(x, y), 200.0, seq)
    }

    fn locked_at(x: f64, y: f64) -> Tracker {
        let mut tracker = Tracker::default();
        tracker.update(&[cand(x, y, 0)], 0);
        tracker.lock_on(Point2::new(x, y)).unwrap();
        tracker
    }

    #[test]
    fn test_update_without_lock_is_idle() {
        let mut tracker = Tracker::default();
        let update = tracker.update(&[cand(10.0, 10.0, 1)], 1);
        assert_eq!(update, TrackingUpdate::Idle);
        assert_eq!(tracker.state(), TrackerState::Idle);
    }

    #[test]
    fn test_lock_on_picks_nearest_candidate() {
        let mut tracker = Tracker::default();
        tracker.update(&[cand(100.0, 100.0, 3), cand(140.0, 100.0, 3)], 3);

        let update = tracker.lock_on(Point2::new(130.0, 105.0)).unwrap();
        assert_eq!(update.position(), Some(Point2::new(140.0, 100.0)));
        assert_eq!(tracker.state(), TrackerState::Tracking);
        assert_eq!(tracker.lock().unwrap().history.len(), 1);
    }

    #[test]
    fn test_lock_on_fails_without_nearby_candidate() {
        let mut tracker = Tracker::default();
        tracker.update(&[cand(400.0, 400.0, 1)], 1);

        let err = tracker.lock_on(Point2::new(10.0, 10.0)).unwrap_err();
        match err {
            LockError::NoCandidateNear { nearest, .. } => assert!(nearest.unwrap() > 100.0),
        }
        assert!(tracker.lock().is_none());
        assert_eq!(tracker.state(), TrackerState::Idle);

        let mut empty = Tracker::default();
        assert!(empty.lock_on(Point2::new(0.0, 0.0)).is_err());
    }

    #[test]
    fn test_jump_limit_rejects_far_candidate() {
        let mut tracker = locked_at(100.0, 100.0);
        let update = tracker.update(&[cand(250.0, 100.0, 1)], 1);
        assert!(matches!(update, TrackingUpdate::NotFound { misses: 1, .. }));
        assert_eq!(tracker.lock().unwrap().position, Point2::new(100.0, 100.0));
    }

    #[test]
    fn test_three_misses_lose_lock() {
        let mut tracker = locked_at(100.0, 100.0);

        let first = tracker.update(&[], 1);
        assert!(matches!(first, TrackingUpdate::NotFound { misses: 1, .. }));
        let second = tracker.update(&[cand(300.0, 300.0, 2)], 2);
        assert!(matches!(second, TrackingUpdate::NotFound { misses: 2, .. }));
        assert!(tracker.lock().is_some());

        let third = tracker.update(&[], 3);
        assert!(matches!(third, TrackingUpdate::Lost { .. }));
        assert!(third.requires_stop());
        assert!(tracker.lock().is_none());
        assert_eq!(tracker.state(), TrackerState::Idle);
    }

    #[test]
    fn test_match_resets_miss_counter() {
        let mut tracker = locked_at(100.0, 100.0);
        tracker.update(&[], 1);
        tracker.update(&[], 2);
        let update = tracker.update(&[cand(110.0, 95.0, 3)], 3);
        assert!(matches!(update, TrackingUpdate::Tracking { frame_seq: 3, .. }));

        let lock = tracker.lock().unwrap();
        assert_eq!(lock.misses, 0);
        assert_eq!(lock.history.len(), 2);
        assert_eq!(lock.position, Point2::new(110.0, 95.0));
    }

    #[test]
    fn test_reset_releases_and_reissues_identity() {
        let mut tracker = locked_at(50.0, 50.0);
        let first_id = tracker.lock().unwrap().id;

        let released = tracker.reset().unwrap();
        assert!(matches!(
            released,
            TrackingUpdate::Released {
                reason: ReleaseReason::Reset,
                ..
            }
        ));
        assert!(tracker.reset().is_none());

        tracker.update(&[cand(50.0, 50.0, 5)], 5);
        tracker.lock_on(Point2::new(50.0, 50.0)).unwrap();
        assert_ne!(tracker.lock().unwrap().id, first_id);
    }

    #[test]
    fn test_new_click_replaces_active_lock() {
        let mut tracker = locked_at(50.0, 50.0);
        let first_id = tracker.lock().unwrap().id;

        tracker.update(&[cand(52.0, 50.0, 1), cand(200.0, 120.0, 1)], 1);
        let update = tracker.lock_on(Point2::new(198.0, 121.0)).unwrap();
        match update {
            TrackingUpdate::Locked { lock_id, position } => {
                assert_ne!(lock_id, first_id);
                assert_eq!(position, Point2::new(200.0, 120.0));
            }
            other => panic!("expected a new lock, got {:?}", other),
        }
        let lock = tracker.lock().unwrap();
        assert_eq!(lock.history.len(), 1);
        assert_eq!(lock.misses, 0);
        assert_eq!(tracker.state(), TrackerState::Tracking);
    }

    #[test]
    fn test_stop_reports_stopped() {
        let mut tracker = locked_at(50.0, 50.0);
        let update = tracker.stop().unwrap();
        assert!(matches!(
            update,
            TrackingUpdate::Released {
                reason: ReleaseReason::Stopped,
                ..
            }
        ));
    }
}
