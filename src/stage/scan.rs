//! Lawnmower auto-scan over a grid of stage positions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::servo::AxisDir;

use super::error::StageError;
use super::link::MotorLink;
use super::protocol::MoveToken;
use super::state::StagePosition;

/// Boustrophedon pattern: right along even rows, left along odd rows, one
/// step up between rows. Started from home, every position stays in the
/// non-negative quadrant the default soft limits allow.
pub fn lawnmower_pattern(steps_per_row: usize, rows: usize) -> Vec<MoveToken> {
    let right = MoveToken::new(AxisDir::Stay, AxisDir::Positive);
    let left = MoveToken::new(AxisDir::Stay, AxisDir::Negative);
    let next_row = MoveToken::new(AxisDir::Positive, AxisDir::Stay);

    let mut pattern = Vec::new();
    for row in 0..rows {
        let horizontal = if row % 2 == 0 { right } else { left };
        pattern.extend(std::iter::repeat(horizontal).take(steps_per_row.saturating_sub(1)));
        if row + 1 < rows {
            pattern.push(next_row);
        }
    }
    pattern
}

#[derive(Debug, Clone, Copy)]
pub struct ScanProgress {
    pub completed: usize,
    pub total: usize,
    pub position: StagePosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub completed: usize,
    pub total: usize,
    pub cancelled: bool,
}

pub struct AutoScan;

impl AutoScan {
    /// Execute `pattern`, waiting `settle` after each acknowledged move.
    /// `on_progress` runs once before the first move and after every move;
    /// the stage is settled at that point, so it is where frames get
    /// captured.
    pub fn run<F>(
        link: &MotorLink,
        pattern: &[MoveToken],
        settle: Duration,
        cancel: &AtomicBool,
        mut on_progress: F,
    ) -> Result<ScanReport, StageError>
    where
        F: FnMut(ScanProgress),
    {
        let total = pattern.len();
        let state = link.state();
        if state.origin_set() && state.position() != StagePosition::default() {
            warn!(
                "Scan starting at {} instead of home; continuing",
                state.position()
            );
        }
        info!("Auto-scan started: {} moves", total);

        on_progress(ScanProgress {
            completed: 0,
            total,
            position: state.position(),
        });

        for (i, token) in pattern.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                return Self::cancelled(link, i, total);
            }
            let position = link.send_move(*token)?;
            if !sleep_unless_cancelled(settle, cancel) {
                return Self::cancelled(link, i + 1, total);
            }
            on_progress(ScanProgress {
                completed: i + 1,
                total,
                position,
            });
        }

        info!("Auto-scan complete");
        Ok(ScanReport {
            completed: total,
            total,
            cancelled: false,
        })
    }

    fn cancelled(link: &MotorLink, completed: usize, total: usize) -> Result<ScanReport, StageError> {
        info!("Auto-scan cancelled after {}/{} moves", completed, total);
        link.emergency_stop()?;
        Ok(ScanReport {
            completed,
            total,
            cancelled: true,
        })
    }
}

/// Returns false if cancelled during the wait.
fn sleep_unless_cancelled(duration: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(10)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::link::StageConfig;
    use crate::stage::sim::SimulatedFirmware;

    fn tokens(pattern: &[MoveToken]) -> Vec<String> {
        pattern.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_lawnmower_pattern() {
        assert_eq!(
            tokens(&lawnmower_pattern(3, 3)),
            vec!["SR", "SR", "US", "SL", "SL", "US", "SR", "SR"]
        );
        assert_eq!(tokens(&lawnmower_pattern(1, 2)), vec!["US"]);
        assert!(lawnmower_pattern(5, 0).is_empty());
    }

    #[test]
    fn test_scan_visits_every_position() {
        let fw = SimulatedFirmware::new();
        let (w, r) = fw.channel();
        let link = MotorLink::new(
            w,
            r,
            StageConfig {
                ack_timeout_s: 0.2,
                boot_delay_s: 0.0,
                ..StageConfig::default()
            },
        );
        let pattern = lawnmower_pattern(3, 2);
        let cancel = AtomicBool::new(false);
        let mut visited = Vec::new();

        let report = AutoScan::run(&link, &pattern, Duration::ZERO, &cancel, |p| {
            visited.push(p.position)
        })
        .unwrap();

        assert_eq!(report.completed, 5);
        assert!(!report.cancelled);
        assert_eq!(visited.len(), 6);
        assert_eq!(visited[2], StagePosition::new(200, 0));
        assert_eq!(visited[3], StagePosition::new(200, 100));
        assert_eq!(*visited.last().unwrap(), StagePosition::new(0, 100));
    }

    #[test]
    fn test_scan_from_home_stays_inside_limits() {
        let fw = SimulatedFirmware::new();
        let (w, r) = fw.channel();
        let link = MotorLink::new(
            w,
            r,
            StageConfig {
                ack_timeout_s: 0.2,
                boot_delay_s: 0.0,
                ..StageConfig::default()
            },
        );
        link.set_origin();
        let pattern = lawnmower_pattern(3, 3);
        let cancel = AtomicBool::new(false);
        let mut visited = Vec::new();

        let report = AutoScan::run(&link, &pattern, Duration::ZERO, &cancel, |p| {
            visited.push(p.position)
        })
        .unwrap();

        assert_eq!(report.completed, pattern.len());
        assert_eq!(fw.received().len(), pattern.len());
        assert!(visited.iter().all(|p| p.x >= 0 && p.y >= 0));
        assert_eq!(*visited.last().unwrap(), StagePosition::new(200, 200));
    }

    #[test]
    fn test_cancel_sends_stop() {
        let fw = SimulatedFirmware::new();
        let (w, r) = fw.channel();
        let link = MotorLink::new(w, r, StageConfig::default());
        let cancel = AtomicBool::new(true);

        let report = AutoScan::run(&link, &lawnmower_pattern(4, 4), Duration::ZERO, &cancel, |_| {})
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.completed, 0);
        assert_eq!(fw.received(), vec!["SS".to_string()]);
    }
}
