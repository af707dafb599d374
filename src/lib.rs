pub mod config;
pub mod detection;
pub mod io;
pub mod servo;
pub mod stage;
pub mod stitching;
pub mod system;
pub mod tracking;
