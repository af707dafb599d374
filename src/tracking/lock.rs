//! The tracked-organism lock and its centroid history.

use std::collections::VecDeque;

use nalgebra::Point2;

/// Identity token of a lock. A fresh token is issued on every lock-on, so a
/// stale token never matches the current lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(u64);

impl LockId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for LockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lock#{}", self.0)
    }
}

/// One accepted observation of the locked organism.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackPoint {
    pub position: Point2<f64>,
    pub frame_seq: u64,
}

/// Fixed-capacity ring of recent observations; the oldest is overwritten.
#[derive(Debug, Clone)]
pub struct HistoryRing {
    points: VecDeque<TrackPoint>,
    capacity: usize,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, point: TrackPoint) {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &TrackPoint> {
        self.points.iter()
    }

    pub fn latest(&self) -> Option<&TrackPoint> {
        self.points.back()
    }
}

/// State of the single tracked organism.
#[derive(Debug, Clone)]
pub struct Lock {
    pub id: LockId,
    /// Last accepted centroid.
    pub position: Point2<f64>,
    pub history: HistoryRing,
    /// Consecutive frames without an acceptable match.
    pub misses: u32,
    pub alive: bool,
}

impl Lock {
    pub fn new(id: LockId, position: Point2<f64>, frame_seq: u64, history_capacity: usize) -> Self {
        let mut history = HistoryRing::new(history_capacity);
        history.push(TrackPoint {
            position,
            frame_seq,
        });
        Self {
            id,
            position,
            history,
            misses: 0,
            alive: true,
        }
    }

    /// Record an accepted match.
    pub fn accept(&mut self, position: Point2<f64>, frame_seq: u64) {
        self.position = position;
        self.history.push(TrackPoint {
            position,
            frame_seq,
        });
        self.misses = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_ring_overwrites_oldest() {
        let mut ring = HistoryRing::new(3);
        for i in 0..5u64 {
            ring.push(TrackPoint {
                position: Point2::new(i as f64, 0.0),
                frame_seq: i,
            });
        }
        assert_eq!(ring.len(), 3);
        let xs: Vec<f64> = ring.iter().map(|p| p.position.x).collect();
        assert_eq!(xs, vec![2.0, 3.0, 4.0]);
    }
}
