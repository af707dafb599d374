//! Worker threads: tracking + servo, stitching, and motor output.
//!
//! Each worker polls its queue with a timeout so it notices shutdown and
//! mode flags between frames.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use nalgebra::Point2;
use tracing::{debug, error, info, warn};

use crate::detection::{DetectorConfig, OrganismDetector};
use crate::io::Frame;
use crate::servo::{ServoCommand, ServoController, ServoDecision, Suppression};
use crate::stage::{MotorLink, MoveToken, StageError};
use crate::stitching::{StitchAccumulator, StitchConfig, StitchOutcome};
use crate::tracking::{Tracker, TrackingUpdate};

use super::messages::{ControlMsg, StatusEvent};
use super::shared_state::SharedState;

/// Poll interval for shutdown checks.
pub(crate) const RECV_TIMEOUT: Duration = Duration::from_millis(50);

/// Lossy status output: a full channel drops the event.
#[derive(Clone)]
pub(crate) struct StatusSink(pub Sender<StatusEvent>);

impl StatusSink {
    pub fn emit(&self, event: StatusEvent) {
        if let Err(TrySendError::Full(event)) = self.0.try_send(event) {
            debug!("Status channel full, dropped: {}", event);
        }
    }
}

/// A servo directive with the stop generation it was decided under.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueuedCommand {
    pub cmd: ServoCommand,
    pub stop_generation: u64,
}

pub(crate) struct TrackingWorker {
    pub detector_config: DetectorConfig,
    pub tracker: Tracker,
    pub servo: ServoController,
    pub motor: Option<Arc<MotorLink>>,
    pub motor_tx: Sender<QueuedCommand>,
    pub status: StatusSink,
    /// Servo set-point: center of the last processed frame.
    pub last_center: Option<Point2<f64>>,
    /// Stop generation seen before the latest tracking-enabled check.
    pub stop_generation: u64,
}

impl TrackingWorker {
    pub fn run(mut self, frames: Receiver<Frame>, control: Receiver<ControlMsg>, shared: Arc<SharedState>) {
        let mut detector = match OrganismDetector::new(self.detector_config.clone()) {
            Ok(d) => d,
            Err(e) => {
                error!("Tracking worker could not start detector: {:#}", e);
                return;
            }
        };
        info!("Tracking worker started");
        let mut processed = 0u64;

        loop {
            if shared.is_shutdown_requested() {
                break;
            }
            for msg in control.try_iter() {
                self.handle_control(msg, &mut detector, &shared);
            }

            let frame = match frames.recv_timeout(RECV_TIMEOUT) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if !shared.is_tracking_enabled() {
                continue;
            }

            let candidates = match detector.detect(&frame) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Detection failed on frame {}: {:#}", frame.seq, e);
                    continue;
                }
            };
            // Tracking may have been stopped while detection ran. A stop
            // that lands after this check has a newer generation.
            self.observe_stop_generation();
            if !shared.is_tracking_enabled() {
                continue;
            }
            let update = self.tracker.update(&candidates, frame.seq);
            processed += 1;
            self.last_center = Some(frame.center());
            self.publish(&update, frame.seq, &shared);
            self.drive(&update, &shared);
        }

        info!("Tracking worker exiting after {} frames", processed);
    }

    fn handle_control(
        &mut self,
        msg: ControlMsg,
        detector: &mut OrganismDetector,
        shared: &SharedState,
    ) {
        debug!("Control: {:?}", msg);
        self.observe_stop_generation();
        match msg {
            ControlMsg::LockOn(point) => match self.tracker.lock_on(point) {
                Ok(update) => {
                    if let TrackingUpdate::Locked { lock_id, position } = &update {
                        self.status.emit(StatusEvent::LockAcquired {
                            lock_id: *lock_id,
                            position: *position,
                        });
                    }
                    *shared.last_update.lock() = Some(update.clone());
                    if shared.is_tracking_enabled() {
                        self.drive(&update, shared);
                    }
                }
                Err(e) => {
                    info!("{}", e);
                    self.status.emit(StatusEvent::LockFailed {
                        reason: e.to_string(),
                    });
                }
            },
            ControlMsg::ResetTracking => {
                if let Some(update) = self.tracker.reset() {
                    self.publish(&update, 0, shared);
                    self.drive(&update, shared);
                }
            }
            ControlMsg::ResetBackground => {
                if let Err(e) = detector.reset_background() {
                    warn!("Background reset failed: {:#}", e);
                }
            }
            ControlMsg::StopTracking => {
                if let Some(update) = self.tracker.stop() {
                    self.publish(&update, 0, shared);
                }
            }
            ControlMsg::SetAutoCentering(enabled) => self.set_auto_centering(enabled, shared),
            ControlMsg::ToggleAutoCentering => {
                let enabled = !self.servo.is_enabled();
                self.set_auto_centering(enabled, shared);
            }
        }
    }

    fn set_auto_centering(&mut self, enabled: bool, shared: &SharedState) {
        let was_enabled = self.servo.is_enabled();
        self.servo.set_enabled(enabled);
        shared.auto_centering.store(enabled, Ordering::SeqCst);
        self.status.emit(StatusEvent::AutoCentering { enabled });
        if was_enabled && !enabled {
            self.send_stop();
        }
    }

    fn publish(&self, update: &TrackingUpdate, seq: u64, shared: &SharedState) {
        if let TrackingUpdate::Lost { lock_id, last_position } = update {
            self.status.emit(StatusEvent::TargetLost {
                lock_id: *lock_id,
                last_position: *last_position,
            });
        }
        *shared.last_update.lock() = Some(update.clone());
        self.status.emit(StatusEvent::Tracking {
            seq,
            update: update.clone(),
        });
    }

    fn observe_stop_generation(&mut self) {
        if let Some(link) = &self.motor {
            self.stop_generation = link.stop_generation();
        }
    }

    /// Feed a tracking update to the servo controller and route its output.
    fn drive(&mut self, update: &TrackingUpdate, shared: &SharedState) {
        let Some(center) = self.last_center else {
            return;
        };
        let decision = self.servo.evaluate(update, center, Instant::now());
        *shared.servo_status.lock() = self.servo.status_line();
        match decision {
            ServoDecision::Command(cmd) if cmd.is_stop() => self.send_stop(),
            ServoDecision::Command(cmd) => {
                let queued = QueuedCommand {
                    cmd,
                    stop_generation: self.stop_generation,
                };
                if let Err(TrySendError::Full(queued)) = self.motor_tx.try_send(queued) {
                    let token = MoveToken::from_command(&queued.cmd).to_string();
                    debug!("Motor busy, dropping {}", token);
                    self.status.emit(StatusEvent::ServoCommandDropped { token });
                }
            }
            ServoDecision::Suppressed(reason @ Suppression::RateLimited { .. }) => {
                self.status.emit(StatusEvent::ServoSuppressed { reason })
            }
            ServoDecision::Suppressed(_) => {}
        }
    }

    /// Stops bypass the motor queue.
    fn send_stop(&self) {
        let Some(link) = &self.motor else {
            return;
        };
        match link.emergency_stop() {
            Ok(()) => self.status.emit(StatusEvent::StopSent),
            Err(e) => {
                warn!("Stop failed: {}", e);
                self.status.emit(StatusEvent::StageFailure {
                    message: e.to_string(),
                    fatal: e.is_fatal(),
                });
            }
        }
    }
}

/// Sends servo directives one at a time. The queue holds one command, so a
/// new directive never waits behind a stale one.
pub(crate) struct MotorWorker {
    pub link: Arc<MotorLink>,
    pub control_tx: Sender<ControlMsg>,
    pub status: StatusSink,
}

impl MotorWorker {
    pub fn run(self, commands: Receiver<QueuedCommand>, shared: Arc<SharedState>) {
        info!("Motor worker started");
        let mut sent = 0u64;
        loop {
            if shared.is_shutdown_requested() {
                break;
            }
            let queued = match commands.recv_timeout(RECV_TIMEOUT) {
                Ok(queued) => queued,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let token = MoveToken::from_command(&queued.cmd).to_string();
            if !shared.is_tracking_enabled() || !shared.is_auto_centering() {
                debug!("Auto-centering off, dropping {}", token);
                self.status.emit(StatusEvent::ServoCommandDropped { token });
                continue;
            }
            match self.link.send_command(&queued.cmd, queued.stop_generation) {
                Ok(position) => {
                    sent += 1;
                    self.status.emit(StatusEvent::ServoCommandSent { token, position });
                }
                Err(StageError::Superseded { .. }) => {
                    debug!("Stop issued after {} was decided; dropped", token);
                    self.status.emit(StatusEvent::ServoCommandDropped { token });
                }
                Err(e) => {
                    let fatal = e.is_fatal();
                    self.status.emit(StatusEvent::StageFailure {
                        message: e.to_string(),
                        fatal,
                    });
                    if fatal {
                        error!("Motor link lost; auto-centering disabled until reconnect");
                        let _ = self.control_tx.send(ControlMsg::SetAutoCentering(false));
                    }
                }
            }
        }
        info!("Motor worker exiting after {} commands", sent);
    }
}

pub(crate) struct StitchWorker {
    pub config: StitchConfig,
    pub status: StatusSink,
}

impl StitchWorker {
    pub fn run(self, frames: Receiver<Frame>, shared: Arc<SharedState>) {
        let mut accumulator = match StitchAccumulator::new(self.config.clone()) {
            Ok(a) => a,
            Err(e) => {
                error!("Stitch worker could not start: {}", e);
                return;
            }
        };
        info!("Stitch worker started");

        loop {
            if shared.is_shutdown_requested() {
                break;
            }
            let frame = match frames.recv_timeout(RECV_TIMEOUT) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if shared.take_stitch_reset() {
                accumulator.reset();
            }
            if !shared.is_stitching_enabled() {
                continue;
            }

            match accumulator.ingest(&frame) {
                Ok(StitchOutcome::Seeded) | Ok(StitchOutcome::Blended { .. }) => {
                    self.refresh_preview(&accumulator, &shared)
                }
                Err(e) if e.is_registration_failure() => {
                    self.status.emit(StatusEvent::FrameSkipped {
                        seq: frame.seq,
                        reason: e.to_string(),
                    });
                }
                Err(e) => warn!("Stitching frame {} failed: {}", frame.seq, e),
            }
        }

        let frames = accumulator.canvas().map_or(0, |c| c.frame_count());
        info!(
            "Stitch worker exiting: {} frames stitched, {} skipped",
            frames,
            accumulator.skipped_frames()
        );
    }

    fn refresh_preview(&self, accumulator: &StitchAccumulator, shared: &SharedState) {
        let Some(canvas) = accumulator.canvas() else {
            return;
        };
        match canvas.cropped() {
            Ok(image) => {
                *shared.preview.lock() = Some(image);
                self.status.emit(StatusEvent::CanvasUpdated {
                    frames: canvas.frame_count(),
                    width: canvas.width(),
                    height: canvas.height(),
                });
            }
            Err(e) => warn!("Preview update failed: {}", e),
        }
    }
}
