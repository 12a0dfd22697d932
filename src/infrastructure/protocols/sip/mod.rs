//! SIP protocol implementation
//!
//! The user-agent side of a SIP stack based on RFC 3261.
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │   Application Layer     │
//! │ (Register, Dial, Answer)│
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transaction Layer     │
//! │  (Client/Server TXN)    │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Layer       │
//! │         (UDP)           │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod message;
pub mod rport;
pub mod sdp;
pub mod transaction;
pub mod transport;

pub use auth::{AuthDecision, DigestChallenge, DigestCredentials, InviteAuthenticator};
pub use builder::{RequestBuilder, ResponseBuilder};
pub use message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use rport::NatAddress;
pub use sdp::SdpSession;
pub use transaction::{
    ClientTransaction, Endpoint, EndpointFactory, ServerTransaction, SipTimers, TransactionId,
};
pub use transport::{ListenAddr, TransportProtocol, UdpEndpoint, UdpEndpointFactory};
