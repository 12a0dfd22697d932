//! YakPhone - a SIP user agent built with Rust
//!
//! Registers with a registrar behind NAT, places and answers calls and
//! follows REFER transfers. The layering follows Domain-Driven Design:
//! dialog rules in `domain`, SIP and media plumbing in `infrastructure`,
//! and the phone workflows in `application`.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{
    AnswerEvents, AnswerOptions, CallDecision, DialEvents, DialOptions, DialogClientSession,
    DialogServerSession, Phone, PhoneError, ReferState, RegisterOptions,
};
pub use config::PhoneConfig;
pub use domain::dialog::{DialogId, DialogState};
pub use domain::shared::{DomainError, SipUri};
