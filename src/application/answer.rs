//! Inbound calls

use super::error::{PhoneError, Result};
use super::events::{AnswerEvents, CallDecision};
use super::phone::{contact_host, respond, respond_out_of_dialog, Phone};
use super::register::{RegisterOptions, RegisterTransaction};
use super::session::{lock, Dialog, DialogServerSession, Teardown};
use crate::domain::dialog::{DialogEvent, DialogState, DialogStateMachine};
use crate::domain::shared::SipUri;
use crate::infrastructure::protocols::sip::builder::{contact_value, make_tag};
use crate::infrastructure::protocols::sip::{
    AuthDecision, Endpoint, InviteAuthenticator, ListenAddr, ResponseBuilder, ServerTransaction,
    SipMethod,
};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Registration expiry when answering behind a registrar
const DEFAULT_ANSWER_EXPIRY: u32 = 1800;

/// Bound on the unregister sent while tearing down
const UNREGISTER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Default)]
pub struct AnswerOptions {
    /// Registration expiry in seconds when `register_addr` is set
    pub expiry: u32,
    /// How long to ring before answering; zero answers at once
    pub ringtime: Duration,
    /// Extra headers on the 200 OK
    pub headers: Vec<(String, String)>,
    pub username: String,
    pub password: String,
    pub realm: Option<String>,
    /// Register here before listening; disables INVITE challenges
    pub register_addr: Option<String>,
    pub formats: Vec<String>,
    pub events: Option<Arc<dyn AnswerEvents>>,
    /// Answer every call with this code instead of 200
    pub answer_code: Option<u16>,
    pub answer_reason: Option<String>,
    /// Notified once the listeners are up
    pub ready: Option<Arc<Notify>>,
}

impl fmt::Debug for AnswerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnswerOptions")
            .field("expiry", &self.expiry)
            .field("ringtime", &self.ringtime)
            .field("username", &self.username)
            .field("realm", &self.realm)
            .field("register_addr", &self.register_addr)
            .field("formats", &self.formats)
            .field("answer_code", &self.answer_code)
            .finish()
    }
}

/// Reason for a configured rejection code
fn default_answer_reason(code: u16) -> Option<&'static str> {
    match code {
        486 => Some("Busy"),
        403 => Some("Forbidden"),
        401 => Some("Unauthorized"),
        _ => None,
    }
}

fn is_rejection(code: u16) -> bool {
    (300..=699).contains(&code)
}

/// Final code and reason to refuse a call with, if it is refused. A decided
/// code outside 300-699 cannot end the INVITE, so the configured answer
/// applies instead.
fn rejection_for(decision: CallDecision, options: &AnswerOptions) -> Option<(u16, Option<String>)> {
    let configured = || match options.answer_code {
        Some(code) if is_rejection(code) => {
            let reason = options
                .answer_reason
                .clone()
                .or_else(|| default_answer_reason(code).map(str::to_string));
            Some((code, reason))
        }
        Some(code) if code != 200 => {
            warn!(code, "Configured answer code is not a final rejection, answering");
            None
        }
        _ => None,
    };

    match decision {
        CallDecision::Busy => Some((486, None)),
        CallDecision::Respond(code) if is_rejection(code) => Some((code, None)),
        CallDecision::Respond(code) => {
            warn!(code, "Call decision is not a final rejection code");
            configured()
        }
        CallDecision::Continue => configured(),
    }
}

/// What the INVITE task hands to the blocked caller
enum Handoff {
    Established(DialogServerSession),
    Rejected { code: u16, reason: String },
    Failed(PhoneError),
}

/// Listeners, registration and the stop signal of one `Phone::answer`
struct AnswerState {
    stop: CancellationToken,
    teardown: Teardown,
    endpoints: Vec<Arc<dyn Endpoint>>,
    registration: Mutex<Option<Arc<RegisterTransaction>>>,
    exit_error: Mutex<Option<PhoneError>>,
}

impl AnswerState {
    /// Unregister, stop the tasks and close the listeners. Runs once.
    async fn stop_answer(&self) {
        if !self.teardown.begin() {
            return;
        }

        let registration = lock(&self.registration).take();
        if let Some(registration) = registration {
            let cancel = CancellationToken::new();
            match tokio::time::timeout(UNREGISTER_TIMEOUT, registration.unregister(&cancel)).await {
                Ok(Ok(())) => info!("Unregistered"),
                Ok(Err(e)) => warn!(error = %e, "Unregister failed"),
                Err(_) => warn!("Unregister timed out"),
            }
        }

        self.stop.cancel();
        for endpoint in &self.endpoints {
            endpoint.close();
        }
        self.teardown.finish();
        debug!("Answer stopped");
    }

    fn fail(&self, e: PhoneError) {
        let mut exit = lock(&self.exit_error);
        if exit.is_none() {
            *exit = Some(e);
        }
    }
}

impl Phone {
    /// Wait for one incoming call and answer it.
    ///
    /// Returns the established session, `CallRejected` when the call was
    /// turned down by the options or the callback, or `Cancelled`.
    pub async fn answer(
        &self,
        cancel: &CancellationToken,
        options: AnswerOptions,
    ) -> Result<DialogServerSession> {
        let listeners = self.bind_listeners().await?;
        let addrs: Vec<String> = listeners
            .iter()
            .map(|(_, endpoint)| endpoint.local_addr().to_string())
            .collect();

        let span = info_span!("answer", listen = ?addrs);
        self.answer_inner(cancel, listeners, options).instrument(span).await
    }

    async fn answer_inner(
        &self,
        cancel: &CancellationToken,
        listeners: Vec<(ListenAddr, Arc<dyn Endpoint>)>,
        options: AnswerOptions,
    ) -> Result<DialogServerSession> {
        let state = Arc::new(AnswerState {
            stop: cancel.child_token(),
            teardown: Teardown::default(),
            endpoints: listeners.iter().map(|(_, e)| e.clone()).collect(),
            registration: Mutex::new(None),
            exit_error: Mutex::new(None),
        });

        let mut contacts = Vec::with_capacity(listeners.len());
        for (addr, endpoint) in &listeners {
            let local = endpoint.local_addr();
            match contact_host(local) {
                Ok(host) => contacts.push(self.contact_uri(&host, local.port(), &addr.network)),
                Err(e) => {
                    state.stop_answer().await;
                    return Err(e);
                }
            }
        }

        if let Some(register_addr) = &options.register_addr {
            match self.register_for_answer(&state, register_addr, &contacts[0], &options).await {
                Ok(contact) => contacts[0] = contact,
                Err(e) => {
                    state.stop_answer().await;
                    return Err(e);
                }
            }
        }

        let authenticator = match (&options.register_addr, options.password.is_empty()) {
            (None, false) => Some(InviteAuthenticator::new(
                &options.username,
                &options.password,
                options.realm.as_deref(),
            )),
            _ => None,
        };

        let (incoming_tx, incoming_rx) = mpsc::channel(32);
        for (index, endpoint) in state.endpoints.iter().enumerate() {
            tokio::spawn(forward(index, endpoint.clone(), state.stop.clone(), incoming_tx.clone()));
        }
        drop(incoming_tx);

        let (handoff_tx, mut handoff_rx) = mpsc::channel(1);
        let router = Router {
            phone: self.clone(),
            state: state.clone(),
            options: options.clone(),
            contacts,
            authenticator,
            call: Arc::new(Mutex::new(None)),
            handoff: handoff_tx,
        };
        tokio::spawn(router.run(incoming_rx));

        info!("Waiting for incoming call");
        if let Some(ready) = &options.ready {
            ready.notify_one();
        }

        let handoff = tokio::select! {
            biased;
            handoff = handoff_rx.recv() => handoff,
            _ = state.stop.cancelled() => None,
        };

        match handoff {
            Some(Handoff::Established(session)) => {
                let release = session.release_token();
                let state = state.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = release.cancelled() => {}
                        _ = state.stop.cancelled() => {}
                    }
                    state.stop_answer().await;
                });
                Ok(session)
            }
            Some(Handoff::Rejected { code, reason }) => {
                state.stop_answer().await;
                Err(PhoneError::CallRejected { code, reason })
            }
            Some(Handoff::Failed(e)) => {
                state.stop_answer().await;
                Err(e)
            }
            None => {
                state.stop_answer().await;
                if cancel.is_cancelled() {
                    return Err(PhoneError::Cancelled);
                }
                let exit = lock(&state.exit_error).take();
                Err(exit.unwrap_or_else(|| {
                    PhoneError::TransactionTerminated("call ended before it was established".to_string())
                }))
            }
        }
    }

    /// Register the first listener and keep it registered in the background.
    /// Returns the contact as the registrar sees it.
    async fn register_for_answer(
        &self,
        state: &Arc<AnswerState>,
        register_addr: &str,
        contact: &SipUri,
        options: &AnswerOptions,
    ) -> Result<SipUri> {
        let recipient = if register_addr.starts_with("sip:") || register_addr.starts_with("sips:") {
            SipUri::parse(register_addr)?
        } else {
            SipUri::parse(&format!("sip:{}", register_addr))?
        };
        let user = if options.username.is_empty() {
            self.user_agent().to_string()
        } else {
            options.username.clone()
        };
        let aor = SipUri::new(Some(user), recipient.host(), None);

        let registration = Arc::new(RegisterTransaction::new(
            state.endpoints[0].clone(),
            &recipient,
            &aor,
            contact,
            self.user_agent(),
            RegisterOptions {
                username: options.username.clone(),
                password: options.password.clone(),
                expiry: match options.expiry {
                    0 => DEFAULT_ANSWER_EXPIRY,
                    e => e,
                },
                ..Default::default()
            },
        )?);

        registration.register(&state.stop).await?;
        let contact = registration.contact().await.unwrap_or_else(|| contact.clone());
        info!(contact = %contact, "Registered for incoming calls");
        *lock(&state.registration) = Some(registration.clone());

        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = registration.qualify_loop(&state.stop).await {
                error!(error = %e, "Registration lost, stopping answer");
                state.fail(e);
                state.stop_answer().await;
            }
        });
        Ok(contact)
    }
}

/// Move accepted transactions of one listener onto the shared queue
async fn forward(
    index: usize,
    endpoint: Arc<dyn Endpoint>,
    stop: CancellationToken,
    queue: mpsc::Sender<(usize, ServerTransaction)>,
) {
    loop {
        let tx = tokio::select! {
            tx = endpoint.accept() => tx,
            _ = stop.cancelled() => None,
        };
        let Some(tx) = tx else { break };
        if queue.send((index, tx)).await.is_err() {
            break;
        }
    }
}

/// The call being set up or in progress; `session` is filled once answered
struct CallSlot {
    session: Option<DialogServerSession>,
}

/// Routes requests from all listeners. Owns the challenge state.
struct Router {
    phone: Phone,
    state: Arc<AnswerState>,
    options: AnswerOptions,
    contacts: Vec<SipUri>,
    authenticator: Option<InviteAuthenticator>,
    call: Arc<Mutex<Option<CallSlot>>>,
    handoff: mpsc::Sender<Handoff>,
}

impl Router {
    async fn run(mut self, mut incoming: mpsc::Receiver<(usize, ServerTransaction)>) {
        loop {
            let next = tokio::select! {
                next = incoming.recv() => next,
                _ = self.state.stop.cancelled() => None,
            };
            let Some((index, tx)) = next else { break };
            debug!(request = %tx.request().start_line(), "Received request");

            match tx.method() {
                Some(SipMethod::Invite) => self.on_invite(index, tx),
                Some(SipMethod::Bye) => self.on_bye(&tx),
                Some(SipMethod::Ack) => debug!(call_id = ?tx.request().call_id(), "ACK received"),
                _ => respond_out_of_dialog(&tx),
            }
        }
        debug!("Answer router stopped");
    }

    fn on_invite(&mut self, index: usize, tx: ServerTransaction) {
        {
            let call = lock(&self.call);
            if let Some(call) = call.as_ref() {
                match call.session.as_ref() {
                    Some(session) if session.dialog().matches(tx.request()) => {
                        update_media(&tx, session, &self.contacts[index]);
                    }
                    _ => {
                        info!(call_id = ?tx.request().call_id(), "Already in a call, rejecting");
                        respond(&tx, ResponseBuilder::new(486));
                    }
                }
                return;
            }
        }

        if let Some(authenticator) = self.authenticator.as_mut() {
            if let AuthDecision::Respond(response) = authenticator.check(tx.request()) {
                info!(status = response.status_code(), "INVITE not authorized");
                if let Err(e) = tx.respond(response) {
                    warn!(error = %e, "Failed to respond");
                }
                return;
            }
        }

        *lock(&self.call) = Some(CallSlot { session: None });
        let call = IncomingCall {
            phone: self.phone.clone(),
            state: self.state.clone(),
            options: self.options.clone(),
            contact: self.contacts[index].clone(),
            endpoint: self.state.endpoints[index].clone(),
            call: self.call.clone(),
        };
        let handoff = self.handoff.clone();
        tokio::spawn(async move {
            let outcome = match call.handle(tx).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "Incoming call failed");
                    Handoff::Failed(e)
                }
            };
            let _ = handoff.send(outcome).await;
        });
    }

    fn on_bye(&self, tx: &ServerTransaction) {
        let session = lock(&self.call)
            .as_ref()
            .and_then(|call| call.session.clone())
            .filter(|session| session.dialog().matches(tx.request()));

        match session {
            Some(session) if session.state() != DialogState::Terminated => {
                info!(call_id = %session.id().call_id, "Received BYE");
                if let Err(e) = session.dialog().read_bye(tx) {
                    warn!(error = %e, "Failed to answer BYE");
                }
                let state = self.state.clone();
                tokio::spawn(async move { state.stop_answer().await });
            }
            _ => {
                info!(call_id = ?tx.request().call_id(), "BYE for a closed or unknown dialog");
                respond(tx, ResponseBuilder::new(481));
            }
        }
    }
}

/// Re-INVITE on the answered call
fn update_media(tx: &ServerTransaction, session: &DialogServerSession, contact: &SipUri) {
    if let Some(cseq) = tx.request().cseq() {
        session.dialog().accept_remote_seq(cseq);
    }
    match session.update_media(tx.request().body()) {
        Ok(()) => {
            let sdp = session.media().map(|m| m.local_sdp()).unwrap_or_default();
            info!("Media updated");
            respond(
                tx,
                ResponseBuilder::ok()
                    .header("Contact", contact_value(contact))
                    .body("application/sdp", sdp),
            );
        }
        Err(e) => {
            warn!(error = %e, "Re-INVITE offer rejected");
            respond(tx, ResponseBuilder::new(400).reason("SDP applying failed"));
        }
    }
}

/// One INVITE taken from ringing to ACK
struct IncomingCall {
    phone: Phone,
    state: Arc<AnswerState>,
    options: AnswerOptions,
    contact: SipUri,
    endpoint: Arc<dyn Endpoint>,
    call: Arc<Mutex<Option<CallSlot>>>,
}

impl IncomingCall {
    async fn handle(&self, mut tx: ServerTransaction) -> Result<Handoff> {
        let request = tx.request().clone();
        info!(call_id = ?request.call_id(), from = ?request.header("from"), "Incoming call");
        let local_tag = make_tag();

        let decision = self
            .options
            .events
            .as_ref()
            .map(|events| events.on_call(&request))
            .unwrap_or(CallDecision::Continue);

        if let Some((code, reason)) = rejection_for(decision, &self.options) {
            return self.reject(&mut tx, &local_tag, code, reason).await;
        }

        let mut machine = DialogStateMachine::new();
        if self.options.ringtime.is_zero() {
            respond(&tx, ResponseBuilder::new(100));
        } else {
            respond(&tx, ResponseBuilder::new(180).to_tag(&local_tag));
            machine.process_event(DialogEvent::Ringing)?;
            debug!(ringtime = ?self.options.ringtime, "Ringing");
            tokio::select! {
                _ = tokio::time::sleep(self.options.ringtime) => {}
                _ = tx.terminated() => {
                    let reason = tx.error().unwrap_or_else(|| "caller gave up".to_string());
                    return Err(PhoneError::TransactionTerminated(reason));
                }
                _ = self.state.stop.cancelled() => return Err(PhoneError::Cancelled),
            }
        }

        let has_sdp = request
            .content_type()
            .map(|ct| ct.to_ascii_lowercase().starts_with("application/sdp"))
            .unwrap_or(false);
        if !has_sdp || request.body().is_empty() {
            respond(&tx, ResponseBuilder::new(400).to_tag(&local_tag).reason("Missing SDP"));
            return Err(PhoneError::InvalidRequest("INVITE without SDP offer".to_string()));
        }

        let mut media = self
            .phone
            .media_session(self.contact.host(), &self.options.formats)
            .await?;
        if let Err(e) = media.apply_remote_sdp(request.body()) {
            respond(&tx, ResponseBuilder::new(488).to_tag(&local_tag));
            media.close();
            return Err(e.into());
        }

        let mut ok = ResponseBuilder::ok()
            .to_tag(&local_tag)
            .header("Contact", contact_value(&self.contact));
        for (name, value) in &self.options.headers {
            ok = ok.header(name, value.clone());
        }
        let sdp = media.local_sdp();
        let dialog = Arc::new(Dialog::server(&request, &local_tag, machine, self.endpoint.clone())?);
        tx.respond(ok.body("application/sdp", sdp).build_for_request(&request))?;
        info!(formats = %media.log_formats(), "Answered call");

        let session = DialogServerSession::new(dialog.clone(), media, CancellationToken::new());
        if let Some(call) = lock(&self.call).as_mut() {
            call.session = Some(session.clone());
        }

        tokio::select! {
            ack = tx.wait_ack() => match ack {
                Some(_) => {
                    dialog.apply(DialogEvent::Confirm);
                    info!(call_id = %dialog.id().call_id, "Call established");
                    Ok(Handoff::Established(session))
                }
                None => {
                    let reason = tx.error().unwrap_or_else(|| "call ended before ACK".to_string());
                    let _ = session.close().await;
                    Err(PhoneError::TransactionTerminated(reason))
                }
            },
            _ = self.state.stop.cancelled() => {
                let _ = session.close().await;
                Err(PhoneError::Cancelled)
            }
        }
    }

    /// Refuse the call and wait for the peer to ACK it
    async fn reject(
        &self,
        tx: &mut ServerTransaction,
        local_tag: &str,
        code: u16,
        reason: Option<String>,
    ) -> Result<Handoff> {
        let mut builder = ResponseBuilder::new(code).to_tag(local_tag);
        if let Some(reason) = reason {
            builder = builder.reason(reason);
        }
        let response = builder.build_for_request(tx.request());
        let reason = response.reason();
        info!(code, reason = %reason, "Rejecting call");
        tx.respond(response)?;

        tokio::select! {
            ack = tx.wait_ack() => {
                if ack.is_none() {
                    debug!(error = ?tx.error(), "Rejection ended without ACK");
                }
            }
            _ = self.state.stop.cancelled() => return Err(PhoneError::Cancelled),
        }
        Ok(Handoff::Rejected { code, reason })
    }
}
