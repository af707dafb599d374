//! Visual-servo controller.
//!
//! Turns tracker output into bounded, rate-limited stage directives:
//! - error = target - frame center, per axis
//! - global deadzone: no command while both axes are inside it
//! - per-axis threshold: an axis moves only if its own error exceeds it
//! - pixel error -> steps via per-axis calibration, clamped per command
//! - minimum interval between movement commands; stops bypass it

use std::time::{Duration, Instant};

use nalgebra::{Point2, Vector2};
use serde::Deserialize;
use tracing::{debug, info};

use crate::tracking::TrackingUpdate;

use super::command::{AxisDir, ServoCommand};

/// Servo configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServoConfig {
    /// No command while both |error_x| and |error_y| are below this.
    pub deadzone_px: f64,
    /// An axis moves only when its |error| exceeds this.
    pub axis_threshold_px: f64,
    /// Calibration: image pixels per motor step, X axis.
    pub pixels_per_step_x: f64,
    /// Calibration: image pixels per motor step, Y axis.
    pub pixels_per_step_y: f64,
    /// Upper bound on steps requested by a single command.
    pub max_steps_per_command: u32,
    /// Minimum time between movement commands, in seconds.
    pub min_command_interval_s: f64,
}

impl ServoConfig {
    pub fn min_command_interval(&self) -> Duration {
        Duration::from_secs_f64(self.min_command_interval_s.max(0.0))
    }
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            deadzone_px: 50.0,
            axis_threshold_px: 30.0,
            pixels_per_step_x: 2.0,
            pixels_per_step_y: 2.0,
            max_steps_per_command: 5,
            min_command_interval_s: 3.0,
        }
    }
}

/// Why no command was produced. None of these is a failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Suppression {
    /// Auto-centering is off.
    Disabled,
    /// No fresh target position this frame.
    NoTarget,
    /// Both axes inside the global deadzone.
    Deadzone,
    /// Outside the deadzone but no single axis past its threshold.
    AxisThreshold,
    /// Too soon after the previous movement command.
    RateLimited { remaining: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServoDecision {
    Command(ServoCommand),
    Suppressed(Suppression),
}

impl ServoDecision {
    pub fn command(self) -> Option<ServoCommand> {
        match self {
            ServoDecision::Command(cmd) => Some(cmd),
            ServoDecision::Suppressed(_) => None,
        }
    }
}

/// Servo controller. Owns the rate-limit clock and the auto-centering switch.
pub struct ServoController {
    config: ServoConfig,
    enabled: bool,
    last_command_at: Option<Instant>,
    commands_emitted: u64,
    last_decision: Option<ServoDecision>,
}

impl ServoController {
    pub fn new(config: ServoConfig) -> Self {
        Self {
            config,
            enabled: false,
            last_command_at: None,
            commands_emitted: 0,
            last_decision: None,
        }
    }

    pub fn config(&self) -> &ServoConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Switch auto-centering. Turning it off pauses motor output only; the
    /// tracker keeps its lock.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            info!(
                "Auto-centering {}",
                if enabled { "enabled" } else { "disabled" }
            );
        }
        self.enabled = enabled;
    }

    pub fn toggle(&mut self) -> bool {
        self.set_enabled(!self.enabled);
        self.enabled
    }

    pub fn commands_emitted(&self) -> u64 {
        self.commands_emitted
    }

    /// Forget the last command time, so the next movement is not delayed.
    pub fn reset_rate_limit(&mut self) {
        self.last_command_at = None;
    }

    /// Contract entry point: the command to send for this update, if any.
    pub fn on_tracking_update(
        &mut self,
        update: &TrackingUpdate,
        frame_center: Point2<f64>,
        now: Instant,
    ) -> Option<ServoCommand> {
        self.evaluate(update, frame_center, now).command()
    }

    /// Same as [`on_tracking_update`](Self::on_tracking_update) but also
    /// reports why nothing was emitted.
    pub fn evaluate(
        &mut self,
        update: &TrackingUpdate,
        frame_center: Point2<f64>,
        now: Instant,
    ) -> ServoDecision {
        let decision = self.decide(update, frame_center, now);
        self.last_decision = Some(decision);
        decision
    }

    fn decide(
        &mut self,
        update: &TrackingUpdate,
        frame_center: Point2<f64>,
        now: Instant,
    ) -> ServoDecision {
        if !self.enabled {
            return ServoDecision::Suppressed(Suppression::Disabled);
        }

        // Safety path: never rate limited.
        if update.requires_stop() {
            info!("Stop issued after {:?}", update);
            self.reset_rate_limit();
            return ServoDecision::Command(ServoCommand::stop());
        }

        if matches!(update, TrackingUpdate::Locked { .. }) {
            self.reset_rate_limit();
        }

        let Some(position) = update.position() else {
            return ServoDecision::Suppressed(Suppression::NoTarget);
        };

        let error = position - frame_center;
        let Some(command) = self.command_for_error(error) else {
            let reason = if error.x.abs() < self.config.deadzone_px
                && error.y.abs() < self.config.deadzone_px
            {
                Suppression::Deadzone
            } else {
                Suppression::AxisThreshold
            };
            return ServoDecision::Suppressed(reason);
        };

        if let Some(last) = self.last_command_at {
            let elapsed = now.saturating_duration_since(last);
            let interval = self.config.min_command_interval();
            if elapsed < interval {
                let remaining = interval - elapsed;
                debug!("Servo rate limited, {:.1}s remaining", remaining.as_secs_f64());
                return ServoDecision::Suppressed(Suppression::RateLimited { remaining });
            }
        }

        self.last_command_at = Some(now);
        self.commands_emitted += 1;
        info!(
            "Servo command x={:?} y={:?} steps={} error=({:+.0}, {:+.0})",
            command.axis_x, command.axis_y, command.step_count, error.x, error.y
        );
        ServoDecision::Command(command)
    }

    /// Map a pixel error to a movement directive, or `None` when the error is
    /// inside the deadzone / axis thresholds.
    pub fn command_for_error(&self, error: Vector2<f64>) -> Option<ServoCommand> {
        let cfg = &self.config;
        if error.x.abs() < cfg.deadzone_px && error.y.abs() < cfg.deadzone_px {
            return None;
        }

        let steps_x = axis_steps(error.x, cfg.axis_threshold_px, cfg.pixels_per_step_x, cfg.max_steps_per_command);
        let steps_y = axis_steps(error.y, cfg.axis_threshold_px, cfg.pixels_per_step_y, cfg.max_steps_per_command);
        if steps_x == 0 && steps_y == 0 {
            return None;
        }

        // Image y grows downwards; a target below center needs the stage to
        // move down.
        Some(ServoCommand {
            axis_x: AxisDir::from_sign(steps_x as f64),
            axis_y: AxisDir::from_sign(-(steps_y as f64)),
            step_count: steps_x.unsigned_abs().max(steps_y.unsigned_abs()),
            error_px: error,
        })
    }

    /// Human-readable summary of the latest decision.
    pub fn status_line(&self) -> String {
        let mode = if self.enabled { "AUTO-CENTERING: ON" } else { "AUTO-CENTERING: OFF" };
        let detail = match self.last_decision {
            None => "idle".to_string(),
            Some(ServoDecision::Command(cmd)) if cmd.is_stop() => "stop sent".to_string(),
            Some(ServoDecision::Command(cmd)) => format!(
                "moving x={} y={} ({} steps)",
                cmd.axis_x.value(),
                cmd.axis_y.value(),
                cmd.step_count
            ),
            Some(ServoDecision::Suppressed(Suppression::RateLimited { remaining })) => {
                format!("motor ready in {:.0}s", remaining.as_secs_f64().ceil())
            }
            Some(ServoDecision::Suppressed(reason)) => format!("holding ({:?})", reason),
        };
        format!("{} | {} | commands sent: {}", mode, detail, self.commands_emitted)
    }
}

impl Default for ServoController {
    fn default() -> Self {
        Self::new(ServoConfig::default())
    }
}

/// Signed, clamped step count for one axis; zero below the axis threshold.
fn axis_steps(error_px: f64, threshold_px: f64, pixels_per_step: f64, max_steps: u32) -> i32 {
    if error_px.abs() <= threshold_px || pixels_per_step <= 0.0 {
        return 0;
    }
    let max = max_steps.max(1) as i32;
    let magnitude = ((error_px.abs() / pixels_per_step) as i32).clamp(1, max);
    if error_px > 0.0 {
        magnitude
    } else {
        -magnitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::{LockId, ReleaseReason};

    fn center() -> Point2<f64> {
        Point2::new(320.0, 240.0)
    }

    fn tracking_at(x: f64, y: f64) -> TrackingUpdate {
        TrackingUpdate::Tracking {
            lock_id: LockId::new(1),
            position: Point2::new(x, y),
            frame_seq: 1,
        }
    }

    fn enabled(config: ServoConfig) -> ServoController {
        let mut servo = ServoController::new(config);
        servo.set_enabled(true);
        servo
    }

    #[test]
    fn test_small_error_emits_nothing() {
        let mut servo = enabled(ServoConfig::default());
        let decision = servo.evaluate(&tracking_at(340.0, 245.0), center(), Instant::now());
        assert_eq!(decision, ServoDecision::Suppressed(Suppression::Deadzone));
    }

    #[test]
    fn test_default_deadzone_covers_forty_pixels() {
        // error (40, 5): inside the 50px global deadzone.
        let mut servo = enabled(ServoConfig::default());
        assert!(servo
            .on_tracking_update(&tracking_at(360.0, 245.0), center(), Instant::now())
            .is_none());
    }

    #[test]
    fn test_only_axis_past_threshold_moves() {
        let config = ServoConfig {
            deadzone_px: 30.0,
            ..ServoConfig::default()
        };
        let mut servo = enabled(config);
        let cmd = servo
            .on_tracking_update(&tracking_at(360.0, 245.0), center(), Instant::now())
            .unwrap();
        assert_eq!(cmd.axis_x, AxisDir::Positive);
        assert_eq!(cmd.axis_y, AxisDir::Stay);
        assert_eq!(cmd.error_px, Vector2::new(40.0, 5.0));
    }

    #[test]
    fn test_directions_and_clamp() {
        let servo = enabled(ServoConfig::default());
        // Target up-left of center, far away.
        let cmd = servo.command_for_error(Vector2::new(-200.0, -120.0)).unwrap();
        assert_eq!(cmd.axis_x, AxisDir::Negative);
        assert_eq!(cmd.axis_y, AxisDir::Positive);
        assert_eq!(cmd.step_count, 5);

        // Target below center only.
        let cmd = servo.command_for_error(Vector2::new(0.0, 60.0)).unwrap();
        assert_eq!(cmd.axis_x, AxisDir::Stay);
        assert_eq!(cmd.axis_y, AxisDir::Negative);
        assert_eq!(cmd.step_count, 5);
    }

    #[test]
    fn test_outside_deadzone_but_under_axis_threshold() {
        let config = ServoConfig {
            deadzone_px: 10.0,
            axis_threshold_px: 30.0,
            ..ServoConfig::default()
        };
        let mut servo = enabled(config);
        let decision = servo.evaluate(&tracking_at(345.0, 260.0), center(), Instant::now());
        assert_eq!(decision, ServoDecision::Suppressed(Suppression::AxisThreshold));
    }

    #[test]
    fn test_rate_limit() {
        let t0 = Instant::now();
        let far = tracking_at(500.0, 240.0);

        let mut servo = enabled(ServoConfig::default());
        assert!(servo.on_tracking_update(&far, center(), t0).is_some());
        let second = servo.evaluate(&far, center(), t0 + Duration::from_secs_f64(1.0));
        assert!(matches!(
            second,
            ServoDecision::Suppressed(Suppression::RateLimited { .. })
        ));

        let mut servo = enabled(ServoConfig::default());
        assert!(servo.on_tracking_update(&far, center(), t0).is_some());
        assert!(servo
            .on_tracking_update(&far, center(), t0 + Duration::from_secs_f64(3.1))
            .is_some());
        assert_eq!(servo.commands_emitted(), 2);
    }

    #[test]
    fn test_lost_always_stops() {
        let t0 = Instant::now();
        let mut servo = enabled(ServoConfig::default());
        assert!(servo
            .on_tracking_update(&tracking_at(500.0, 240.0), center(), t0)
            .is_some());

        let lost = TrackingUpdate::Lost {
            lock_id: LockId::new(1),
            last_position: Point2::new(500.0, 240.0),
        };
        let cmd = servo
            .on_tracking_update(&lost, center(), t0 + Duration::from_millis(10))
            .unwrap();
        assert!(cmd.is_stop());

        let reset = TrackingUpdate::Released {
            lock_id: LockId::new(1),
            reason: ReleaseReason::Reset,
        };
        assert!(servo
            .on_tracking_update(&reset, center(), t0 + Duration::from_millis(20))
            .unwrap()
            .is_stop());
    }

    #[test]
    fn test_disabled_suppresses_everything() {
        let mut servo = ServoController::default();
        let lost = TrackingUpdate::Lost {
            lock_id: LockId::new(1),
            last_position: Point2::new(0.0, 0.0),
        };
        assert_eq!(
            servo.evaluate(&lost, center(), Instant::now()),
            ServoDecision::Suppressed(Suppression::Disabled)
        );
        assert!(servo
            .on_tracking_update(&tracking_at(600.0, 400.0), center(), Instant::now())
            .is_none());
        assert!(servo.status_line().contains("OFF"));
    }

    #[test]
    fn test_new_lock_clears_rate_limit() {
        let t0 = Instant::now();
        let mut servo = enabled(ServoConfig::default());
        assert!(servo
            .on_tracking_update(&tracking_at(500.0, 240.0), center(), t0)
            .is_some());

        let locked = TrackingUpdate::Locked {
            lock_id: LockId::new(2),
            position: Point2::new(100.0, 240.0),
        };
        let cmd = servo
            .on_tracking_update(&locked, center(), t0 + Duration::from_millis(500))
            .unwrap();
        assert_eq!(cmd.axis_x, AxisDir::Negative);
    }
}
