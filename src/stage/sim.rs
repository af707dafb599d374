//! In-process firmware emulator speaking the same line protocol.
//!
//! Used by `--simulate` and by the link tests. Replies can be held back to
//! provoke timeouts, and every received line is logged.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::protocol::{ConfigField, MoveToken};
use super::state::{MotorSettings, StagePosition};
use super::transport::{LineReader, LineWriter};

/// Accepted value ranges, inclusive.
#[derive(Debug, Clone, Copy)]
pub struct FirmwareRanges {
    pub speed: (u32, u32),
    pub steps: (u32, u32),
    pub pulse: (u32, u32),
}

impl Default for FirmwareRanges {
    fn default() -> Self {
        Self {
            speed: (500, 50_000),
            steps: (1, 1000),
            pulse: (500, 5000),
        }
    }
}

struct FirmwareState {
    position: StagePosition,
    settings: MotorSettings,
    ranges: FirmwareRanges,
    received: Vec<String>,
    hold_replies: bool,
    held: Vec<String>,
    unplugged: bool,
}

/// Handle to the emulated firmware. Cloning shares the same device.
#[derive(Clone)]
pub struct SimulatedFirmware {
    state: Arc<Mutex<FirmwareState>>,
    reply_tx: Sender<String>,
    reply_rx: Receiver<String>,
}

impl SimulatedFirmware {
    pub fn new() -> Self {
        Self::with_ranges(FirmwareRanges::default())
    }

    pub fn with_ranges(ranges: FirmwareRanges) -> Self {
        let (reply_tx, reply_rx) = unbounded();
        Self {
            state: Arc::new(Mutex::new(FirmwareState {
                position: StagePosition::default(),
                settings: MotorSettings::default(),
                ranges,
                received: Vec::new(),
                hold_replies: false,
                held: Vec::new(),
                unplugged: false,
            })),
            reply_tx,
            reply_rx,
        }
    }

    /// Writer and reader halves connected to this device.
    pub fn channel(&self) -> (Box<dyn LineWriter>, Box<dyn LineReader>) {
        (
            Box::new(SimWriter { fw: self.clone() }),
            Box::new(SimReader {
                fw: self.clone(),
                rx: self.reply_rx.clone(),
            }),
        )
    }

    /// Every line received so far, in order.
    pub fn received(&self) -> Vec<String> {
        self.state.lock().received.clone()
    }

    pub fn position(&self) -> StagePosition {
        self.state.lock().position
    }

    pub fn settings(&self) -> MotorSettings {
        self.state.lock().settings
    }

    /// While held, replies are queued instead of sent.
    pub fn hold_replies(&self, hold: bool) {
        self.state.lock().hold_replies = hold;
    }

    /// Send every held reply now.
    pub fn release_held(&self) {
        let held = std::mem::take(&mut self.state.lock().held);
        for line in held {
            let _ = self.reply_tx.send(line);
        }
    }

    /// Emit an unsolicited line, e.g. a boot banner.
    pub fn emit(&self, line: &str) {
        let _ = self.reply_tx.send(line.to_string());
    }

    /// Make every further read and write fail as if the cable was pulled.
    pub fn unplug(&self) {
        self.state.lock().unplugged = true;
    }

    pub fn replug(&self) {
        self.state.lock().unplugged = false;
    }

    fn receive(&self, line: &str) -> io::Result<()> {
        let mut st = self.state.lock();
        if st.unplugged {
            return Err(unplugged());
        }
        st.received.push(line.to_string());
        let reply = st.execute(line.trim());
        if st.hold_replies {
            st.held.push(reply);
        } else {
            let _ = self.reply_tx.send(reply);
        }
        Ok(())
    }
}

impl Default for SimulatedFirmware {
    fn default() -> Self {
        Self::new()
    }
}

impl FirmwareState {
    fn execute(&mut self, line: &str) -> String {
        if let Some(token) = MoveToken::parse(line) {
            self.position = token.apply(self.position, self.settings.steps_per_command);
            return format!("MOVE_OK:{},{}", self.position.x, self.position.y);
        }
        if line == "STATUS" {
            let s = self.settings;
            return format!(
                "STATUS:{},{},{}",
                s.step_delay_us, s.steps_per_command, s.pulse_width_us
            );
        }
        let Some((name, value)) = line.split_once(':') else {
            return "ERROR:UNKNOWN_COMMAND".to_string();
        };
        let (field, range) = match name {
            "SPEED" => (ConfigField::Speed, self.ranges.speed),
            "STEPS" => (ConfigField::Steps, self.ranges.steps),
            "PULSE" => (ConfigField::Pulse, self.ranges.pulse),
            _ => return "ERROR:UNKNOWN_COMMAND".to_string(),
        };
        match value.trim().parse::<u32>() {
            Ok(v) if (range.0..=range.1).contains(&v) => {
                match field {
                    ConfigField::Speed => self.settings.step_delay_us = v,
                    ConfigField::Steps => self.settings.steps_per_command = v,
                    ConfigField::Pulse => self.settings.pulse_width_us = v,
                }
                format!("{}_SET:{}", field.name(), v)
            }
            _ => format!("ERROR:{}_OUT_OF_RANGE", field.name()),
        }
    }
}

fn unplugged() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "simulated device unplugged")
}

struct SimWriter {
    fw: SimulatedFirmware,
}

impl LineWriter for SimWriter {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.fw.receive(line)
    }
}

struct SimReader {
    fw: SimulatedFirmware,
    rx: Receiver<String>,
}

impl LineReader for SimReader {
    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        if self.fw.state.lock().unplugged {
            return Err(unplugged());
        }
        match self.rx.recv_timeout(timeout) {
            Ok(line) => Ok(Some(line)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(unplugged()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(fw: &SimulatedFirmware, line: &str) -> String {
        let (mut w, mut r) = fw.channel();
        w.write_line(line).unwrap();
        r.read_line(Duration::from_millis(100)).unwrap().unwrap()
    }

    #[test]
    fn test_firmware_replies() {
        let fw = SimulatedFirmware::new();
        assert_eq!(roundtrip(&fw, "UR"), "MOVE_OK:100,100");
        assert_eq!(roundtrip(&fw, "DS"), "MOVE_OK:100,0");
        assert_eq!(roundtrip(&fw, "SPEED:8000"), "SPEED_SET:8000");
        assert_eq!(roundtrip(&fw, "SPEED:100"), "ERROR:SPEED_OUT_OF_RANGE");
        assert_eq!(roundtrip(&fw, "STEPS:1001"), "ERROR:STEPS_OUT_OF_RANGE");
        assert_eq!(roundtrip(&fw, "STATUS"), "STATUS:8000,100,1500");
        assert_eq!(roundtrip(&fw, "JUMP"), "ERROR:UNKNOWN_COMMAND");
        assert_eq!(fw.received().len(), 7);
    }

    #[test]
    fn test_held_replies() {
        let fw = SimulatedFirmware::new();
        let (mut w, mut r) = fw.channel();
        fw.hold_replies(true);
        w.write_line("SR").unwrap();
        assert!(r.read_line(Duration::from_millis(10)).unwrap().is_none());
        fw.release_held();
        assert_eq!(
            r.read_line(Duration::from_millis(10)).unwrap().as_deref(),
            Some("MOVE_OK:100,0")
        );
    }
}
