//! Errors surfaced by the phone API

use crate::domain::shared::DomainError;
use crate::infrastructure::media::MediaError;
use crate::infrastructure::protocols::sip::{SipError, SipRequest, SipResponse};
use std::fmt;
use thiserror::Error;

/// A request that drew a final non-2xx response
#[derive(Debug, Clone)]
pub struct ResponseError {
    pub request: SipRequest,
    pub response: SipResponse,
    pub message: String,
}

impl ResponseError {
    pub fn new(request: SipRequest, response: SipResponse, message: impl Into<String>) -> Self {
        Self {
            request,
            response,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.response.status_code()
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Error, Debug)]
pub enum PhoneError {
    #[error("{0}")]
    RegisterResponse(Box<ResponseError>),

    #[error("register unauthorized")]
    RegisterUnauthorized,

    #[error("register failed")]
    RegisterFailed,

    #[error("{0}")]
    DialResponse(Box<ResponseError>),

    #[error("Call rejected with {code} {reason}")]
    CallRejected { code: u16, reason: String },

    #[error("transaction died: {0}")]
    TransactionTerminated(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Sip(SipError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl PhoneError {
    /// Status code of the response that ended the operation, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            PhoneError::RegisterResponse(e) | PhoneError::DialResponse(e) => Some(e.status_code()),
            PhoneError::CallRejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<SipError> for PhoneError {
    fn from(err: SipError) -> Self {
        match err {
            SipError::Cancelled => PhoneError::Cancelled,
            SipError::TransactionError(msg) => PhoneError::TransactionTerminated(msg),
            other => PhoneError::Sip(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, PhoneError>;
