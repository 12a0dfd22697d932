//! Media processing implementations

pub mod codec;
pub mod session;

pub use codec::{CodecInfo, CodecNegotiator};
pub use session::{MediaError, MediaSession};
