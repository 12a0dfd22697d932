//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Protocol implementations (SIP message, auth, transaction, transport)
//! - Media session handling

pub mod media;
pub mod protocols;
