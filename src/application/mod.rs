//! Application layer - the phone and its call workflows
//!
//! This layer contains:
//! - The `Phone` facade and its builder
//! - Register, Dial, Answer and REFER transfer workflows
//! - Call session handles returned to the caller
//! - Event sinks and the public error type

pub mod answer;
pub mod dial;
pub mod error;
pub mod events;
pub mod phone;
mod refer;
pub mod register;
pub mod session;

pub use answer::AnswerOptions;
pub use dial::DialOptions;
pub use error::{PhoneError, ResponseError, Result};
pub use events::{AnswerEvents, CallDecision, DialEvents, ReferState};
pub use phone::{Phone, PhoneBuilder, DEFAULT_USER_AGENT};
pub use register::{RegisterOptions, RegisterTransaction};
pub use session::{DialogClientSession, DialogServerSession};
