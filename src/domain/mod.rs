//! Domain layer - call-control rules that do not depend on the wire
//!
//! This layer contains:
//! - Dialog identity and the dialog state machine
//! - Value objects shared by the SIP and application layers

pub mod dialog;
pub mod shared;

// Re-export commonly used types
pub use dialog::{DialogEvent, DialogId, DialogState, DialogStateMachine};
pub use shared::{DomainError, Result};
