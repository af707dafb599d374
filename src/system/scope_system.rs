//! Top-level orchestration.
//!
//! `ScopeSystem` owns the shared state and spawns three workers:
//! - tracking: detection, tracking and servo evaluation per frame
//! - motor: sends servo directives through the motor link
//! - stitch: feeds the stitch accumulator
//!
//! Frames fan out through bounded queues that drop the oldest frame when
//! full, so a slow stitcher never delays servo control.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use opencv::core::Mat;
use opencv::prelude::*;
use tracing::{info, warn};

use crate::config::ScopeConfig;
use crate::io::{Frame, FrameSource};
use crate::servo::ServoController;
use crate::stage::MotorLink;
use crate::tracking::{Tracker, TrackingUpdate};

use super::messages::{ControlMsg, StatusEvent};
use super::shared_state::SharedState;
use super::workers::{MotorWorker, QueuedCommand, StatusSink, StitchWorker, TrackingWorker};

/// Status events buffered for a slow reader before new ones are dropped.
const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Sending and draining ends of one drop-oldest frame queue.
struct FrameQueue {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
}

impl FrameQueue {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Enqueue, evicting the oldest frame if full. Returns true if a frame
    /// was dropped.
    fn push_latest(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => false,
            Err(TrySendError::Full(frame)) => {
                let _ = self.rx.try_recv();
                let _ = self.tx.try_send(frame);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

pub struct ScopeSystem {
    shared: Arc<SharedState>,
    config: ScopeConfig,
    motor: Option<Arc<MotorLink>>,

    tracking_frames: FrameQueue,
    stitch_frames: FrameQueue,
    control_tx: Sender<ControlMsg>,
    status_rx: Receiver<StatusEvent>,

    handles: Vec<JoinHandle<()>>,
}

impl ScopeSystem {
    /// Spawn the workers. Without a motor link the servo output is
    /// evaluated but goes nowhere.
    pub fn new(config: ScopeConfig, motor: Option<Arc<MotorLink>>) -> Result<Self> {
        let shared = SharedState::new();
        let tracking_frames = FrameQueue::new(config.pipeline.tracking_queue);
        let stitch_frames = FrameQueue::new(config.pipeline.stitch_queue);
        let (control_tx, control_rx) = crossbeam_channel::unbounded::<ControlMsg>();
        let (status_tx, status_rx) = bounded::<StatusEvent>(STATUS_CHANNEL_CAPACITY);
        let (motor_tx, motor_rx) = bounded::<QueuedCommand>(1);
        let status = StatusSink(status_tx);

        let mut handles = Vec::new();

        let tracking = TrackingWorker {
            detector_config: config.detector.clone(),
            tracker: Tracker::new(config.tracker.clone()),
            servo: ServoController::new(config.servo.clone()),
            motor: motor.clone(),
            motor_tx,
            status: status.clone(),
            last_center: None,
            stop_generation: 0,
        };
        {
            let frames = tracking_frames.rx.clone();
            let shared = Arc::clone(&shared);
            handles.push(
                thread::Builder::new()
                    .name("tracking".into())
                    .spawn(move || tracking.run(frames, control_rx, shared))
                    .context("Failed to spawn tracking worker")?,
            );
        }

        if let Some(link) = &motor {
            let worker = MotorWorker {
                link: Arc::clone(link),
                control_tx: control_tx.clone(),
                status: status.clone(),
            };
            let shared = Arc::clone(&shared);
            handles.push(
                thread::Builder::new()
                    .name("motor".into())
                    .spawn(move || worker.run(motor_rx, shared))
                    .context("Failed to spawn motor worker")?,
            );
        }

        {
            let worker = StitchWorker {
                config: config.stitch.clone(),
                status,
            };
            let frames = stitch_frames.rx.clone();
            let shared = Arc::clone(&shared);
            handles.push(
                thread::Builder::new()
                    .name("stitch".into())
                    .spawn(move || worker.run(frames, shared))
                    .context("Failed to spawn stitch worker")?,
            );
        }

        info!(
            "Scope system started ({})",
            if motor.is_some() { "motor attached" } else { "no motor" }
        );
        Ok(Self {
            shared,
            config,
            motor,
            tracking_frames,
            stitch_frames,
            control_tx,
            status_rx,
            handles,
        })
    }

    pub fn config(&self) -> &ScopeConfig {
        &self.config
    }

    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Motor link for manual moves and configuration from the UI.
    pub fn motor(&self) -> Option<&Arc<MotorLink>> {
        self.motor.as_ref()
    }

    /// Hand one frame to every active consumer.
    pub fn push_frame(&self, frame: Frame) -> Result<()> {
        self.shared.frames_received.fetch_add(1, Ordering::Relaxed);
        let to_tracking = self.shared.is_tracking_enabled();
        let to_stitch = self.shared.is_stitching_enabled();

        let mut dropped = false;
        match (to_tracking, to_stitch) {
            (true, true) => {
                dropped |= self.stitch_frames.push_latest(frame.try_clone()?);
                dropped |= self.tracking_frames.push_latest(frame);
            }
            (true, false) => dropped |= self.tracking_frames.push_latest(frame),
            (false, true) => dropped |= self.stitch_frames.push_latest(frame),
            (false, false) => {}
        }
        if dropped {
            self.shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Pump `source` until it ends or shutdown is requested, sleeping `pace`
    /// between frames. Returns the number of frames pushed.
    pub fn run_source(&self, source: &mut dyn FrameSource, pace: Option<Duration>) -> Result<u64> {
        let mut pushed = 0;
        while !self.shared.is_shutdown_requested() {
            let Some(frame) = source.next_frame()? else {
                break;
            };
            self.push_frame(frame)?;
            pushed += 1;
            if let Some(pace) = pace {
                thread::sleep(pace);
            }
        }
        Ok(pushed)
    }

    pub fn send_control(&self, msg: ControlMsg) {
        if self.control_tx.send(msg).is_err() {
            warn!("Tracking worker is gone; control message dropped");
        }
    }

    pub fn status_receiver(&self) -> Receiver<StatusEvent> {
        self.status_rx.clone()
    }

    pub fn last_update(&self) -> Option<TrackingUpdate> {
        self.shared.last_update.lock().clone()
    }

    /// Servo controller summary for display, empty before its first decision.
    pub fn servo_status(&self) -> String {
        self.shared.servo_status.lock().clone()
    }

    pub fn start_tracking(&self) {
        self.shared.tracking_enabled.store(true, Ordering::SeqCst);
        info!("Tracking mode on");
    }

    /// Leave tracking mode immediately: the flag is seen at the worker's
    /// next checkpoint, and the stage gets an unconditional stop now. Any
    /// directive decided before the stop is discarded unsent.
    pub fn stop_tracking(&self) {
        self.shared.tracking_enabled.store(false, Ordering::SeqCst);
        if let Some(link) = &self.motor {
            if let Err(e) = link.emergency_stop() {
                warn!("Stop on tracking exit failed: {}", e);
            }
        }
        self.send_control(ControlMsg::StopTracking);
        info!("Tracking mode off");
    }

    /// Start a fresh panorama.
    pub fn start_stitching(&self) {
        self.shared.stitch_reset_requested.store(true, Ordering::SeqCst);
        *self.shared.preview.lock() = None;
        self.shared.stitching_enabled.store(true, Ordering::SeqCst);
        info!("Stitching started");
    }

    /// Stop feeding the stitcher and return the latest canvas, cropped to
    /// content. Does not wait for a blend in progress.
    pub fn stop_stitching(&self) -> Result<Option<Mat>> {
        self.shared.stitching_enabled.store(false, Ordering::SeqCst);
        info!("Stitching stopped");
        self.preview()
    }

    /// Copy of the live canvas for display.
    pub fn preview(&self) -> Result<Option<Mat>> {
        match self.shared.preview.lock().as_ref() {
            Some(image) => Ok(Some(image.try_clone()?)),
            None => Ok(None),
        }
    }

    /// Signal every worker and wait for them.
    pub fn shutdown(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.shared.request_shutdown();
        if let Some(link) = &self.motor {
            let _ = link.emergency_stop();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        info!(
            "Scope system stopped: {} frames received, {} dropped",
            self.shared.frames_received.load(Ordering::Relaxed),
            self.shared.frames_dropped.load(Ordering::Relaxed)
        );
    }
}

impl Drop for ScopeSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
