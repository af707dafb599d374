//! Visual servoing: tracking error in, rate-limited stage directives out.

pub mod command;
pub mod controller;

pub use command::{AxisDir, ServoCommand};
pub use controller::{ServoConfig, ServoController, ServoDecision, Suppression};
