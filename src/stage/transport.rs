//! Line-oriented byte channel to the firmware.
//!
//! The channel is split into a writer and a reader so that an emergency stop
//! can be written while another request is waiting for its reply.

use std::io::{self, BufRead, BufReader, Write};
use std::time::Duration;

use serialport::SerialPort;
use tracing::info;

pub trait LineWriter: Send {
    /// Write one request line; the terminator is appended here.
    fn write_line(&mut self, line: &str) -> io::Result<()>;
}

pub trait LineReader: Send {
    /// Read one reply line without its terminator. `Ok(None)` when nothing
    /// complete arrived within `timeout`.
    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>>;
}

pub struct SerialLineWriter {
    port: Box<dyn SerialPort>,
}

impl LineWriter for SerialLineWriter {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\n")?;
        self.port.flush()
    }
}

pub struct SerialLineReader {
    reader: BufReader<Box<dyn SerialPort>>,
    /// Partial line carried over from a read that timed out.
    pending: String,
}

impl LineReader for SerialLineReader {
    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        self.reader.get_mut().set_timeout(timeout)?;
        match self.reader.read_line(&mut self.pending) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "serial port closed",
            )),
            Ok(_) if self.pending.ends_with('\n') => {
                let line = self.pending.trim().to_string();
                self.pending.clear();
                Ok(Some(line))
            }
            Ok(_) => Ok(None),
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Open a serial device and split it into writer and reader halves.
pub fn open_serial(path: &str, baud_rate: u32) -> io::Result<(SerialLineWriter, SerialLineReader)> {
    let port = serialport::new(path, baud_rate)
        .timeout(Duration::from_millis(50))
        .open()?;
    let read_half = port.try_clone()?;
    info!("Opened serial port {} at {} baud", path, baud_rate);
    Ok((
        SerialLineWriter { port },
        SerialLineReader {
            reader: BufReader::new(read_half),
            pending: String::new(),
        },
    ))
}
