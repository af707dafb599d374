//! Motorized stage: wire protocol, the exclusive motor link, and scanning.

pub mod error;
pub mod link;
pub mod protocol;
pub mod scan;
pub mod sim;
pub mod state;
pub mod transport;

pub use error::StageError;
pub use link::{MotorLink, StageConfig};
pub use protocol::{ConfigField, MoveToken, Reply, Request};
pub use scan::{lawnmower_pattern, AutoScan, ScanProgress, ScanReport};
pub use sim::SimulatedFirmware;
pub use state::{Direction, MotorPreset, MotorSettings, SoftLimits, StagePosition, StageState};
pub use transport::{open_serial, LineReader, LineWriter};
