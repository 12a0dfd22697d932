//! Call sessions
//!
//! A session pairs a dialog with its media. Sessions are cheap to clone;
//! all clones share the dialog state and close it together.

use super::error::{PhoneError, Result};
use crate::domain::dialog::{DialogEvent, DialogId, DialogState, DialogStateMachine};
use crate::domain::shared::SipUri;
use crate::infrastructure::media::MediaSession;
use crate::infrastructure::protocols::sip::{
    ClientTransaction, Endpoint, RequestBuilder, ResponseBuilder, ServerTransaction, SipMethod,
    SipRequest, SipResponse,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ACTIVE: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Execute-once guard for teardown paths that can race (BYE, close, cancel).
#[derive(Debug, Default)]
pub(crate) struct Teardown(AtomicU8);

impl Teardown {
    /// True for the single caller that gets to run the teardown
    pub(crate) fn begin(&self) -> bool {
        self.0
            .compare_exchange(ACTIVE, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn finish(&self) {
        self.0.store(CLOSED, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.0.load(Ordering::Acquire) == CLOSED
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Dialog id of an incoming in-dialog request, seen from our side
pub(crate) fn incoming_dialog_id(request: &SipRequest) -> Option<DialogId> {
    Some(DialogId::new(
        request.call_id()?,
        request.to_tag()?,
        request.from_tag()?,
    ))
}

/// Signaling state shared by the session handles of one dialog
pub(crate) struct Dialog {
    id: DialogId,
    local_party: String,
    remote_party: String,
    remote_target: SipUri,
    local_seq: AtomicU32,
    remote_seq: AtomicU32,
    machine: Mutex<DialogStateMachine>,
    state: watch::Sender<DialogState>,
    lifetime: CancellationToken,
    teardown: Teardown,
    endpoint: Arc<dyn Endpoint>,
}

impl Dialog {
    /// UAC side, from the INVITE we sent and the 2xx that answered it
    pub(crate) fn client(
        invite: &SipRequest,
        response: &SipResponse,
        machine: DialogStateMachine,
        endpoint: Arc<dyn Endpoint>,
    ) -> Result<Self> {
        let missing = |what: &str| PhoneError::InvalidRequest(format!("INVITE without {}", what));

        let call_id = invite.call_id().ok_or_else(|| missing("Call-ID"))?;
        let local_tag = invite.from_tag().ok_or_else(|| missing("From tag"))?;
        let remote_target = match response.contact_uri() {
            Some(uri) => uri,
            None => invite.request_uri()?,
        };

        Ok(Self::new(
            DialogId::new(call_id, local_tag, response.to_tag().unwrap_or_default()),
            invite.header("from").ok_or_else(|| missing("From"))?,
            response
                .header("to")
                .ok_or_else(|| PhoneError::InvalidRequest("2xx without To".to_string()))?,
            remote_target,
            invite.cseq().unwrap_or(1),
            0,
            machine,
            endpoint,
        ))
    }

    /// UAS side, from the INVITE we received and the tag we answer with
    pub(crate) fn server(
        invite: &SipRequest,
        local_tag: &str,
        machine: DialogStateMachine,
        endpoint: Arc<dyn Endpoint>,
    ) -> Result<Self> {
        let missing = |what: &str| PhoneError::InvalidRequest(format!("INVITE without {}", what));

        let call_id = invite.call_id().ok_or_else(|| missing("Call-ID"))?;
        let remote_tag = invite.from_tag().ok_or_else(|| missing("From tag"))?;
        let from = invite.header("from").ok_or_else(|| missing("From"))?;
        let to = invite.header("to").ok_or_else(|| missing("To"))?;
        let local_party = match invite.to_tag() {
            Some(_) => to,
            None => format!("{};tag={}", to, local_tag),
        };
        let remote_target = match invite.contact_uri() {
            Some(uri) => uri,
            None => SipUri::from_name_addr(&from)?,
        };

        Ok(Self::new(
            DialogId::new(call_id, local_tag, remote_tag),
            local_party,
            from,
            remote_target,
            0,
            invite.cseq().unwrap_or(0),
            machine,
            endpoint,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        id: DialogId,
        local_party: String,
        remote_party: String,
        remote_target: SipUri,
        local_seq: u32,
        remote_seq: u32,
        machine: DialogStateMachine,
        endpoint: Arc<dyn Endpoint>,
    ) -> Self {
        let (state, _) = watch::channel(machine.state());
        Self {
            id,
            local_party,
            remote_party,
            remote_target,
            local_seq: AtomicU32::new(local_seq),
            remote_seq: AtomicU32::new(remote_seq),
            machine: Mutex::new(machine),
            state,
            lifetime: CancellationToken::new(),
            teardown: Teardown::default(),
            endpoint,
        }
    }

    pub(crate) fn id(&self) -> &DialogId {
        &self.id
    }

    pub(crate) fn state(&self) -> DialogState {
        *self.state.borrow()
    }

    pub(crate) fn remote_target(&self) -> &SipUri {
        &self.remote_target
    }

    pub(crate) fn matches(&self, request: &SipRequest) -> bool {
        incoming_dialog_id(request).as_ref() == Some(&self.id)
    }

    /// Feed an event to the state machine; invalid transitions are ignored
    pub(crate) fn apply(&self, event: DialogEvent) -> DialogState {
        let state = {
            let mut machine = lock(&self.machine);
            match machine.process_event(event) {
                Ok(state) => state,
                Err(e) => {
                    debug!(dialog = %self.id, error = %e, "Ignoring dialog event");
                    return machine.state();
                }
            }
        };

        debug!(dialog = %self.id, state = %state, "Dialog state changed");
        self.state.send_replace(state);
        if state == DialogState::Terminated {
            self.lifetime.cancel();
        }
        state
    }

    /// Record the CSeq of an in-dialog request; false when it is not newer
    pub(crate) fn accept_remote_seq(&self, cseq: u32) -> bool {
        self.remote_seq
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (cseq > current).then_some(cseq)
            })
            .is_ok()
    }

    /// New in-dialog request with the next local CSeq
    pub(crate) fn request(&self, method: SipMethod) -> Result<SipRequest> {
        let seq = self.local_seq.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(RequestBuilder::new(method, self.remote_target.clone())
            .from_value(self.local_party.clone())
            .to_value(self.remote_party.clone())
            .call_id(self.id.call_id.clone())
            .cseq(seq)
            .build()?)
    }

    /// ACK for the 2xx to the INVITE sent with `cseq`
    pub(crate) fn ack(&self, cseq: u32) -> Result<SipRequest> {
        Ok(RequestBuilder::new(SipMethod::Ack, self.remote_target.clone())
            .from_value(self.local_party.clone())
            .to_value(self.remote_party.clone())
            .call_id(self.id.call_id.clone())
            .cseq(cseq)
            .build()?)
    }

    pub(crate) async fn send(&self, request: SipRequest) -> Result<ClientTransaction> {
        Ok(self.endpoint.request(request).await?)
    }

    /// Send BYE on a confirmed dialog and wait for its final response
    pub(crate) async fn bye(&self) -> Result<()> {
        if !self.state().is_confirmed() {
            return Ok(());
        }

        let bye = self.request(SipMethod::Bye)?;
        info!(call_id = %self.id.call_id, "Sending BYE");
        let mut tx = self.endpoint.request(bye).await?;
        let result = tx.final_response(&CancellationToken::new(), |_| {}).await;
        self.apply(DialogEvent::Bye);

        let response = result?;
        if !response.is_success() {
            warn!(status = response.status_code(), "BYE was not accepted");
        }
        Ok(())
    }

    /// Peer hung up
    pub(crate) fn read_bye(&self, tx: &ServerTransaction) -> Result<()> {
        tx.respond(ResponseBuilder::ok().build_for_request(tx.request()))?;
        self.apply(DialogEvent::Bye);
        Ok(())
    }
}

/// Outbound dialogs of one dial endpoint. Removing the last one shuts the
/// endpoint down.
pub(crate) struct DialogClientCache {
    endpoint: Arc<dyn Endpoint>,
    contact: SipUri,
    dialogs: Mutex<HashMap<DialogId, Arc<Dialog>>>,
    /// Abandoned INVITEs still waiting for their final response
    pending: AtomicUsize,
    shutdown: CancellationToken,
}

impl DialogClientCache {
    pub(crate) fn new(endpoint: Arc<dyn Endpoint>, contact: SipUri) -> Self {
        Self {
            endpoint,
            contact,
            dialogs: Mutex::new(HashMap::new()),
            pending: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    pub(crate) fn contact(&self) -> &SipUri {
        &self.contact
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn insert(&self, dialog: Arc<Dialog>) {
        lock(&self.dialogs).insert(dialog.id().clone(), dialog);
    }

    pub(crate) fn match_request(&self, request: &SipRequest) -> Option<Arc<Dialog>> {
        let id = incoming_dialog_id(request)?;
        lock(&self.dialogs).get(&id).cloned()
    }

    pub(crate) fn remove(&self, id: &DialogId) {
        let empty = {
            let mut dialogs = lock(&self.dialogs);
            dialogs.remove(id);
            dialogs.is_empty()
        };
        if empty {
            self.shutdown();
        }
    }

    /// Shut down unless a dialog or an abandoned INVITE is still alive
    pub(crate) fn release_if_idle(&self) {
        if lock(&self.dialogs).is_empty() && self.pending.load(Ordering::Acquire) == 0 {
            self.shutdown();
        }
    }

    /// Keep the endpoint open while an abandoned INVITE finishes
    pub(crate) fn hold(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unhold(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        self.release_if_idle();
    }

    fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("Closing dial endpoint {}", self.endpoint.local_addr());
            self.shutdown.cancel();
            self.endpoint.close();
        }
    }
}

struct ClientInner {
    dialog: Arc<Dialog>,
    media: Mutex<Option<MediaSession>>,
    invite_response: SipResponse,
    cache: Arc<DialogClientCache>,
}

/// Outbound call returned by `Phone::dial`
#[derive(Clone)]
pub struct DialogClientSession {
    inner: Arc<ClientInner>,
}

impl DialogClientSession {
    pub(crate) fn new(
        dialog: Arc<Dialog>,
        media: MediaSession,
        invite_response: SipResponse,
        cache: Arc<DialogClientCache>,
    ) -> Self {
        cache.insert(dialog.clone());
        Self {
            inner: Arc::new(ClientInner {
                dialog,
                media: Mutex::new(Some(media)),
                invite_response,
                cache,
            }),
        }
    }

    pub fn id(&self) -> &DialogId {
        self.inner.dialog.id()
    }

    pub fn state(&self) -> DialogState {
        self.inner.dialog.state()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<DialogState> {
        self.inner.dialog.state.subscribe()
    }

    /// Cancelled once the dialog terminates
    pub fn lifetime(&self) -> CancellationToken {
        self.inner.dialog.lifetime.clone()
    }

    /// Media session; `None` after close
    pub fn media(&self) -> Option<MediaSession> {
        lock(&self.inner.media).clone()
    }

    pub fn invite_response(&self) -> &SipResponse {
        &self.inner.invite_response
    }

    pub(crate) fn dialog(&self) -> &Arc<Dialog> {
        &self.inner.dialog
    }

    pub(crate) fn set_media(&self, media: MediaSession) {
        *lock(&self.inner.media) = Some(media);
    }

    /// Hang up without releasing the endpoint
    pub async fn bye(&self) -> Result<()> {
        self.inner.dialog.bye().await
    }

    /// Hang up if still connected and release signaling and media.
    /// Only the first call does anything.
    pub async fn close(&self) -> Result<()> {
        let dialog = &self.inner.dialog;
        if !dialog.teardown.begin() {
            debug!(dialog = %dialog.id(), "Dialog already closed");
            return Ok(());
        }

        let result = dialog.bye().await;
        dialog.apply(DialogEvent::Bye);
        if let Some(media) = lock(&self.inner.media).take() {
            media.close();
        }
        self.inner.cache.remove(dialog.id());
        dialog.teardown.finish();
        result
    }

    pub fn is_closed(&self) -> bool {
        self.inner.dialog.teardown.is_closed()
    }
}

impl fmt::Debug for DialogClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialogClientSession")
            .field("id", self.id())
            .field("state", &self.state())
            .finish()
    }
}

struct ServerInner {
    dialog: Arc<Dialog>,
    media: Mutex<Option<MediaSession>>,
    release: CancellationToken,
}

/// Inbound call returned by `Phone::answer`
#[derive(Clone)]
pub struct DialogServerSession {
    inner: Arc<ServerInner>,
}

impl DialogServerSession {
    /// `release` is cancelled when the session closes
    pub(crate) fn new(dialog: Arc<Dialog>, media: MediaSession, release: CancellationToken) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                dialog,
                media: Mutex::new(Some(media)),
                release,
            }),
        }
    }

    pub fn id(&self) -> &DialogId {
        self.inner.dialog.id()
    }

    pub fn state(&self) -> DialogState {
        self.inner.dialog.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<DialogState> {
        self.inner.dialog.state.subscribe()
    }

    pub fn lifetime(&self) -> CancellationToken {
        self.inner.dialog.lifetime.clone()
    }

    pub fn media(&self) -> Option<MediaSession> {
        lock(&self.inner.media).clone()
    }

    pub(crate) fn dialog(&self) -> &Arc<Dialog> {
        &self.inner.dialog
    }

    /// Cancelled when the session closes
    pub(crate) fn release_token(&self) -> CancellationToken {
        self.inner.release.clone()
    }

    /// Apply a re-INVITE offer to the current media
    pub(crate) fn update_media(&self, sdp: &[u8]) -> Result<()> {
        let mut media = lock(&self.inner.media);
        let media = media
            .as_mut()
            .ok_or_else(|| PhoneError::InvalidRequest("session closed".to_string()))?;
        media.apply_remote_sdp(sdp)?;
        Ok(())
    }

    pub async fn bye(&self) -> Result<()> {
        self.inner.dialog.bye().await
    }

    /// Hang up if still connected, release media and stop the listeners.
    /// Only the first call does anything.
    pub async fn close(&self) -> Result<()> {
        let dialog = &self.inner.dialog;
        if !dialog.teardown.begin() {
            debug!(dialog = %dialog.id(), "Dialog already closed");
            return Ok(());
        }

        let result = dialog.bye().await;
        dialog.apply(DialogEvent::Bye);
        if let Some(media) = lock(&self.inner.media).take() {
            media.close();
        }
        self.inner.release.cancel();
        dialog.teardown.finish();
        result
    }

    pub fn is_closed(&self) -> bool {
        self.inner.dialog.teardown.is_closed()
    }
}

impl fmt::Debug for DialogServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialogServerSession")
            .field("id", self.id())
            .field("state", &self.state())
            .finish()
    }
}
