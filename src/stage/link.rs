//! Exclusive, acknowledged command channel to the stage firmware.
//!
//! Every request goes through one send / await-acknowledgement cycle guarded
//! by `request_lock`, so at most one command is in flight. The writer has its
//! own lock that is never held while waiting, which lets
//! [`MotorLink::emergency_stop`] put `SS` on the wire immediately and
//! preempt whatever wait is in progress.
//!
//! Every stop bumps a generation counter under the writer lock. A servo
//! directive carries the generation it was decided under and is discarded
//! at the wire if a stop went out since, so no move follows a stop.
//!
//! The firmware answers every move (including `SS`) with `MOVE_OK`, in
//! order, without naming the command. Moves whose reply was not consumed
//! (stops, preempted and timed-out moves) are counted as owed, and that
//! many `MOVE_OK` lines are settled before a new move takes one as its
//! own acknowledgement.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::servo::ServoCommand;

use super::error::StageError;
use super::protocol::{ConfigField, MoveToken, Reply, Request};
use super::state::{Direction, MotorPreset, MotorSettings, SoftLimits, StagePosition, StageState};
use super::transport::{open_serial, LineReader, LineWriter};

/// Motor link configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Serial device, e.g. `/dev/ttyACM0`.
    pub port: String,
    pub baud_rate: u32,
    /// Bound on every acknowledgement wait, in seconds.
    pub ack_timeout_s: f64,
    /// Granularity of the reply poll (and of preemption), in seconds.
    pub poll_interval_s: f64,
    /// The board resets when the port opens; wait this long before talking.
    pub boot_delay_s: f64,
    pub limits: SoftLimits,
}

impl StageConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ack_timeout_s.max(0.0))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_s.max(0.001))
    }

    pub fn boot_delay(&self) -> Duration {
        Duration::from_secs_f64(self.boot_delay_s.max(0.0))
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 115_200,
            ack_timeout_s: 2.0,
            poll_interval_s: 0.02,
            boot_delay_s: 2.0,
            limits: SoftLimits::default(),
        }
    }
}

pub struct MotorLink {
    config: StageConfig,
    /// Serializes whole request/acknowledgement cycles.
    request_lock: Mutex<()>,
    writer: Mutex<Option<Box<dyn LineWriter>>>,
    reader: Mutex<Option<Box<dyn LineReader>>>,
    state: RwLock<StageState>,
    estop_requested: AtomicBool,
    stop_generation: AtomicU64,
    /// `MOVE_OK` replies still due for moves that no longer wait for them.
    owed_move_acks: AtomicU32,
}

impl MotorLink {
    pub fn new(writer: Box<dyn LineWriter>, reader: Box<dyn LineReader>, config: StageConfig) -> Self {
        let state = StageState {
            limits: config.limits,
            ..StageState::default()
        };
        Self {
            config,
            request_lock: Mutex::new(()),
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
            state: RwLock::new(state),
            estop_requested: AtomicBool::new(false),
            stop_generation: AtomicU64::new(0),
            owed_move_acks: AtomicU32::new(0),
        }
    }

    /// Open the configured serial port, wait for the board to boot and read
    /// its settings.
    pub fn open(config: StageConfig) -> Result<Self, StageError> {
        let (writer, reader) =
            open_serial(&config.port, config.baud_rate).map_err(StageError::Disconnected)?;
        thread::sleep(config.boot_delay());
        let link = Self::new(Box::new(writer), Box::new(reader), config);
        link.sync_settings();
        Ok(link)
    }

    /// Query `STATUS` once; failures only leave the defaults in place.
    pub fn sync_settings(&self) {
        match self.query_status() {
            Ok(s) => info!(
                "Stage settings: delay={}us steps={} pulse={}us ({:?})",
                s.step_delay_us,
                s.steps_per_command,
                s.pulse_width_us,
                MotorPreset::classify(s.step_delay_us)
            ),
            Err(e) => warn!("Could not read stage settings: {}", e),
        }
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn state(&self) -> StageState {
        self.state.read().clone()
    }

    pub fn position(&self) -> StagePosition {
        self.state.read().position()
    }

    pub fn settings(&self) -> MotorSettings {
        self.state.read().settings
    }

    pub fn is_connected(&self) -> bool {
        self.writer.lock().is_some()
    }

    /// Number of emergency stops issued so far.
    pub fn stop_generation(&self) -> u64 {
        self.stop_generation.load(Ordering::SeqCst)
    }

    /// Send the move token for a servo directive decided under
    /// `stop_generation` and wait for `MOVE_OK`. Fails with `Superseded`,
    /// without writing, if a stop was issued since.
    pub fn send_command(
        &self,
        cmd: &ServoCommand,
        stop_generation: u64,
    ) -> Result<StagePosition, StageError> {
        let token = MoveToken::from_command(cmd);
        self.transact(&Request::Move(token), Some(stop_generation), |link| {
            link.check_bounds(token)
        })?;
        Ok(self.position())
    }

    pub fn manual_move(&self, direction: Direction) -> Result<StagePosition, StageError> {
        self.send_move(MoveToken::from_direction(direction))
    }

    /// Send one move token. Returns the acknowledged position.
    pub fn send_move(&self, token: MoveToken) -> Result<StagePosition, StageError> {
        let request = Request::Move(token);
        self.transact(&request, None, |link| link.check_bounds(token))?;
        Ok(self.position())
    }

    /// Write `SS` now, skipping the request queue, and abort any pending
    /// acknowledgement wait.
    pub fn emergency_stop(&self) -> Result<(), StageError> {
        self.estop_requested.store(true, Ordering::SeqCst);
        let result = {
            let mut writer = self.writer.lock();
            self.stop_generation.fetch_add(1, Ordering::SeqCst);
            let w = writer.as_mut().ok_or(StageError::NotConnected)?;
            let written = w.write_line(&MoveToken::STOP.to_string());
            if written.is_ok() {
                self.owed_move_acks.fetch_add(1, Ordering::SeqCst);
            }
            written
        };
        match result {
            Ok(()) => {
                info!("Emergency stop sent");
                Ok(())
            }
            Err(e) => Err(self.disconnect(e)),
        }
    }

    pub fn set_speed(&self, step_delay_us: u32) -> Result<u32, StageError> {
        self.set_field(ConfigField::Speed, step_delay_us)
    }

    pub fn set_steps(&self, steps_per_command: u32) -> Result<u32, StageError> {
        self.set_field(ConfigField::Steps, steps_per_command)
    }

    pub fn set_pulse(&self, pulse_width_us: u32) -> Result<u32, StageError> {
        self.set_field(ConfigField::Pulse, pulse_width_us)
    }

    pub fn apply_preset(&self, preset: MotorPreset) -> Result<MotorSettings, StageError> {
        self.set_speed(preset.step_delay_us())?;
        self.set_steps(preset.steps_per_command())?;
        info!("Applied {:?} motor preset", preset);
        Ok(self.settings())
    }

    pub fn query_status(&self) -> Result<MotorSettings, StageError> {
        match self.transact(&Request::Status, None, |_| Ok(()))? {
            Reply::Status(settings) => Ok(settings),
            other => Err(StageError::UnexpectedReply {
                command: Request::Status.line(),
                reply: format!("{:?}", other),
            }),
        }
    }

    /// Declare the current acknowledged position home. Soft limits apply
    /// from now on.
    pub fn set_origin(&self) {
        let mut state = self.state.write();
        state.origin = Some(state.firmware_position);
        info!("Home set at firmware position {}", state.firmware_position);
    }

    pub fn set_limits(&self, limits: SoftLimits) {
        self.state.write().limits = limits;
    }

    /// Replace a lost channel.
    pub fn reconnect(&self, writer: Box<dyn LineWriter>, reader: Box<dyn LineReader>) {
        let _guard = self.request_lock.lock();
        *self.writer.lock() = Some(writer);
        *self.reader.lock() = Some(reader);
        self.owed_move_acks.store(0, Ordering::SeqCst);
        info!("Motor link reconnected");
    }

    /// Short human-readable summary for status displays.
    pub fn status_line(&self) -> String {
        if !self.is_connected() {
            return "Stage: disconnected".to_string();
        }
        let state = self.state.read();
        let home = if state.origin_set() { "home set" } else { "no home" };
        format!(
            "Stage: {} | {} | {:?} ({} steps/cmd)",
            state.position(),
            home,
            MotorPreset::classify(state.settings.step_delay_us),
            state.settings.steps_per_command
        )
    }

    fn set_field(&self, field: ConfigField, value: u32) -> Result<u32, StageError> {
        match self.transact(&Request::Config(field, value), None, |_| Ok(()))? {
            Reply::ConfigSet { value, .. } => Ok(value),
            other => Err(StageError::UnexpectedReply {
                command: Request::Config(field, value).line(),
                reply: format!("{:?}", other),
            }),
        }
    }

    fn check_bounds(&self, token: MoveToken) -> Result<(), StageError> {
        if token.is_stop() {
            return Ok(());
        }
        let state = self.state.read();
        if !state.origin_set() {
            return Ok(());
        }
        let target = token.apply(state.position(), state.settings.steps_per_command);
        if state.limits.contains(target) {
            Ok(())
        } else {
            Err(StageError::BoundaryViolation {
                command: token.to_string(),
                target,
                limits: state.limits,
            })
        }
    }

    /// One full request cycle: drain stale input, run `precheck`, send,
    /// wait for the matching acknowledgement and apply it. With
    /// `stop_generation`, the request is dropped at the writer if a stop
    /// was issued after that generation.
    fn transact<F>(
        &self,
        request: &Request,
        stop_generation: Option<u64>,
        precheck: F,
    ) -> Result<Reply, StageError>
    where
        F: FnOnce(&Self) -> Result<(), StageError>,
    {
        let _guard = self.request_lock.lock();
        let command = request.line();

        let mut reader_slot = self.reader.lock();
        let reader = reader_slot.as_mut().ok_or(StageError::NotConnected)?;
        if let Err(e) = self.drain_stale(reader.as_mut()) {
            *reader_slot = None;
            return Err(self.disconnect(e));
        }

        if let Err(e) = precheck(self) {
            warn!("{}", e);
            return Err(e);
        }

        self.estop_requested.store(false, Ordering::SeqCst);
        let sent = {
            let mut writer = self.writer.lock();
            let w = writer.as_mut().ok_or(StageError::NotConnected)?;
            if let Some(generation) = stop_generation {
                if generation != self.stop_generation.load(Ordering::SeqCst) {
                    debug!("Dropping {}: a stop was issued after it", command);
                    return Err(StageError::Superseded { command });
                }
            }
            w.write_line(&command)
        };
        if let Err(e) = sent {
            *reader_slot = None;
            return Err(self.disconnect(e));
        }
        debug!("Sent {}", command);

        let timeout = self.config.ack_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            if self.estop_requested.load(Ordering::SeqCst) {
                warn!("Wait for {} preempted by emergency stop", command);
                self.owe_ack_for(request);
                return Err(StageError::Preempted { command });
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("No acknowledgement for {} within {:?}", command, timeout);
                self.owe_ack_for(request);
                return Err(StageError::Timeout {
                    command,
                    waited: timeout,
                });
            }
            let slice = (deadline - now).min(self.config.poll_interval());

            let line = match reader.read_line(slice) {
                Ok(Some(line)) => line,
                Ok(None) => continue,
                Err(e) => {
                    *reader_slot = None;
                    return Err(self.disconnect(e));
                }
            };

            let reply = Reply::parse(&line);
            if matches!(reply, Reply::MoveOk(_)) && self.settle_owed_ack() {
                debug!("Acknowledgement of an earlier move: {:?}", reply);
                self.apply_reply(&reply);
                continue;
            }
            match &reply {
                r if request.is_acked_by(r) => {
                    self.apply_reply(r);
                    return Ok(reply.clone());
                }
                Reply::Error(reason) => {
                    warn!("Firmware rejected {}: {}", command, reason);
                    return Err(StageError::Firmware {
                        command,
                        reason: reason.clone(),
                    });
                }
                Reply::Malformed(text) if request.owns_malformed(text) => {
                    return Err(StageError::UnexpectedReply {
                        command,
                        reply: text.clone(),
                    });
                }
                other => self.absorb_unsolicited(other),
            }
        }
    }

    fn drain_stale(&self, reader: &mut dyn LineReader) -> io::Result<()> {
        while let Some(line) = reader.read_line(Duration::ZERO)? {
            self.absorb_unsolicited(&Reply::parse(&line));
        }
        Ok(())
    }

    /// Lines that arrive outside their request cycle. A late `MOVE_OK` is
    /// still an acknowledgement of a move that happened.
    fn absorb_unsolicited(&self, reply: &Reply) {
        match reply {
            Reply::MoveOk(_) => {
                self.settle_owed_ack();
                debug!("Late acknowledgement {:?}", reply);
                self.apply_reply(reply);
            }
            Reply::ConfigSet { .. } | Reply::Status(_) => {
                debug!("Late acknowledgement {:?}", reply);
                self.apply_reply(reply);
            }
            Reply::Error(reason) => debug!("Stale firmware error: {}", reason),
            Reply::Malformed(line) | Reply::Other(line) => debug!("Ignoring firmware line {:?}", line),
        }
    }

    fn owe_ack_for(&self, request: &Request) {
        if matches!(request, Request::Move(_)) {
            self.owed_move_acks.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Count one owed `MOVE_OK` as received. False if none was owed.
    fn settle_owed_ack(&self) -> bool {
        self.owed_move_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn apply_reply(&self, reply: &Reply) {
        let mut state = self.state.write();
        match reply {
            Reply::MoveOk(abs) => state.firmware_position = *abs,
            Reply::ConfigSet { field, value } => match field {
                ConfigField::Speed => state.settings.step_delay_us = *value,
                ConfigField::Steps => state.settings.steps_per_command = *value,
                ConfigField::Pulse => state.settings.pulse_width_us = *value,
            },
            Reply::Status(settings) => state.settings = *settings,
            Reply::Error(_) | Reply::Malformed(_) | Reply::Other(_) => {}
        }
    }

    fn disconnect(&self, e: io::Error) -> StageError {
        warn!("Serial channel lost: {}", e);
        *self.writer.lock() = None;
        StageError::Disconnected(e)
    }
}
