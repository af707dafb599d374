//! Runtime orchestration: worker threads, shared state and messaging.

pub mod messages;
pub mod shared_state;
mod scope_system;
mod workers;

pub use messages::{ControlMsg, StatusEvent};
pub use scope_system::ScopeSystem;
pub use shared_state::SharedState;
