//! Dialog State Machine
//!
//! A dialog only moves forward: `Trying -> Early -> Confirmed -> Terminated`.
//! Rejection short-cuts from `Trying` or `Early` straight to `Terminated`.

use super::shared::error::{DomainError, Result};
use std::fmt;
use std::time::Instant;

/// Dialog State
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialogState {
    /// INVITE sent/received, no provisional answer with a tag yet
    Trying,
    /// 18x sent/received
    Early,
    /// 2xx answered and acknowledged
    Confirmed,
    /// BYE, rejection or teardown
    Terminated,
}

impl DialogState {
    /// Check if the dialog can still carry requests
    pub fn is_active(&self) -> bool {
        !matches!(self, DialogState::Terminated)
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, DialogState::Confirmed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DialogState::Trying => "Trying",
            DialogState::Early => "Early",
            DialogState::Confirmed => "Confirmed",
            DialogState::Terminated => "Terminated",
        }
    }
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Dialog State Machine Event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogEvent {
    /// 18x sent/received
    Ringing,
    /// 2xx acknowledged
    Confirm,
    /// Final non-2xx response or cancellation before answer
    Reject,
    /// BYE sent/received, or local close
    Bye,
}

/// Dialog identity: Call-ID plus the tag pair seen from our side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<String>,
        local_tag: impl Into<String>,
        remote_tag: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}__{}__{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// Dialog timing statistics
#[derive(Debug, Clone)]
pub struct DialogStats {
    pub created_at: Instant,
    pub confirmed_at: Option<Instant>,
    pub ended_at: Option<Instant>,
    pub provisional_count: u32,
}

impl DialogStats {
    pub fn new() -> Self {
        Self {
            created_at: Instant::now(),
            confirmed_at: None,
            ended_at: None,
            provisional_count: 0,
        }
    }

    /// Time from creation to confirmation
    pub fn setup_duration(&self) -> Option<std::time::Duration> {
        self.confirmed_at.map(|t| t.duration_since(self.created_at))
    }

    /// Time from confirmation to termination
    pub fn call_duration(&self) -> Option<std::time::Duration> {
        match (self.confirmed_at, self.ended_at) {
            (Some(confirmed), Some(ended)) => Some(ended.duration_since(confirmed)),
            _ => None,
        }
    }
}

impl Default for DialogStats {
    fn default() -> Self {
        Self::new()
    }
}

/// State Machine
#[derive(Debug, Clone)]
pub struct DialogStateMachine {
    state: DialogState,
    stats: DialogStats,
}

impl DialogStateMachine {
    pub fn new() -> Self {
        Self {
            state: DialogState::Trying,
            stats: DialogStats::new(),
        }
    }

    pub fn state(&self) -> DialogState {
        self.state
    }

    pub fn stats(&self) -> &DialogStats {
        &self.stats
    }

    /// Process an event and transition state
    pub fn process_event(&mut self, event: DialogEvent) -> Result<DialogState> {
        let new_state = match (self.state, event) {
            (DialogState::Trying, DialogEvent::Ringing) => DialogState::Early,
            (DialogState::Early, DialogEvent::Ringing) => DialogState::Early,

            (DialogState::Trying | DialogState::Early, DialogEvent::Confirm) => DialogState::Confirmed,
            (DialogState::Trying | DialogState::Early, DialogEvent::Reject) => DialogState::Terminated,
            (DialogState::Trying | DialogState::Early, DialogEvent::Bye) => DialogState::Terminated,

            (DialogState::Confirmed, DialogEvent::Bye) => DialogState::Terminated,

            _ => {
                return Err(DomainError::InvalidStateTransition(format!(
                    "{} + {:?}",
                    self.state, event
                )))
            }
        };

        match event {
            DialogEvent::Ringing => self.stats.provisional_count += 1,
            DialogEvent::Confirm => self.stats.confirmed_at = Some(Instant::now()),
            DialogEvent::Reject | DialogEvent::Bye => self.stats.ended_at = Some(Instant::now()),
        }

        self.state = new_state;
        Ok(new_state)
    }

    pub fn can_terminate(&self) -> bool {
        self.state.is_active()
    }
}

impl Default for DialogStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialog_state_transitions() {
        let mut sm = DialogStateMachine::new();
        assert_eq!(sm.state(), DialogState::Trying);

        sm.process_event(DialogEvent::Ringing).unwrap();
        assert_eq!(sm.state(), DialogState::Early);

        // 180 followed by 183
        sm.process_event(DialogEvent::Ringing).unwrap();
        assert_eq!(sm.stats().provisional_count, 2);

        sm.process_event(DialogEvent::Confirm).unwrap();
        assert_eq!(sm.state(), DialogState::Confirmed);
        assert!(sm.stats().setup_duration().is_some());

        sm.process_event(DialogEvent::Bye).unwrap();
        assert_eq!(sm.state(), DialogState::Terminated);
        assert!(sm.stats().call_duration().is_some());
    }

    #[test]
    fn test_immediate_rejection() {
        let mut sm = DialogStateMachine::new();
        assert_eq!(sm.process_event(DialogEvent::Reject).unwrap(), DialogState::Terminated);
        assert!(sm.stats().ended_at.is_some());
    }

    #[test]
    fn test_states_never_go_backwards() {
        let mut sm = DialogStateMachine::new();
        sm.process_event(DialogEvent::Confirm).unwrap();

        assert!(sm.process_event(DialogEvent::Ringing).is_err());
        assert!(sm.process_event(DialogEvent::Confirm).is_err());
        assert!(sm.process_event(DialogEvent::Reject).is_err());

        sm.process_event(DialogEvent::Bye).unwrap();
        assert!(matches!(
            sm.process_event(DialogEvent::Bye),
            Err(DomainError::InvalidStateTransition(_))
        ));
        assert!(!sm.can_terminate());
    }

    #[test]
    fn test_dialog_id_display() {
        let id = DialogId::new("abc@host", "l1", "r1");
        assert_eq!(id.to_string(), "abc@host__l1__r1");
    }
}
