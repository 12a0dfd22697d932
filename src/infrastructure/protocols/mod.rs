//! Network protocol implementations

pub mod sip;
