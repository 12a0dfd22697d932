//! Event sinks through which the workflows report to the application

use super::session::DialogClientSession;
use crate::infrastructure::media::MediaSession;
use crate::infrastructure::protocols::sip::{SipRequest, SipResponse};

/// Progress of a transfer requested by the peer with REFER
#[derive(Debug, Clone)]
pub enum ReferState {
    /// REFER accepted; the new call has not been placed yet
    Initiated,
    /// The refer target answered
    Confirmed(DialogClientSession),
    /// The transfer failed
    Ended,
}

/// Callbacks of an outbound call.
///
/// REFER and mid-call INVITE are refused with 405 unless the sink opts in.
pub trait DialEvents: Send + Sync {
    /// Provisional responses to the INVITE
    fn on_response(&self, _response: &SipResponse) {}

    fn handles_refer(&self) -> bool {
        false
    }

    /// Called with `Initiated` once the REFER is accepted, then `Confirmed`
    /// or `Ended`. A malformed in-dialog REFER only reports `Ended`.
    fn on_refer(&self, _state: ReferState) {}

    fn handles_media_update(&self) -> bool {
        false
    }

    /// A re-INVITE changed the media; the session is a fork of the current one
    fn on_media_update(&self, _session: MediaSession) {}
}

/// What to do with an incoming call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDecision {
    Continue,
    Busy,
    Respond(u16),
}

impl From<i32> for CallDecision {
    fn from(value: i32) -> Self {
        match value {
            v if v < 0 => CallDecision::Busy,
            0 => CallDecision::Continue,
            v => CallDecision::Respond(u16::try_from(v).unwrap_or(500)),
        }
    }
}

pub trait AnswerEvents: Send + Sync {
    fn on_call(&self, invite: &SipRequest) -> CallDecision;
}

impl<F> AnswerEvents for F
where
    F: Fn(&SipRequest) -> CallDecision + Send + Sync,
{
    fn on_call(&self, invite: &SipRequest) -> CallDecision {
        self(invite)
    }
}
