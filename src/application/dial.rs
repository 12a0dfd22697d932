//! Outbound calls

use super::error::{PhoneError, ResponseError, Result};
use super::events::DialEvents;
use super::phone::{contact_host, respond, respond_out_of_dialog, Phone};
use super::session::{Dialog, DialogClientCache, DialogClientSession};
use crate::domain::dialog::{DialogEvent, DialogState, DialogStateMachine};
use crate::domain::shared::SipUri;
use crate::infrastructure::media::MediaSession;
use crate::infrastructure::protocols::sip::auth::authorize_request;
use crate::infrastructure::protocols::sip::builder::{contact_value, make_tag};
use crate::infrastructure::protocols::sip::{
    ClientTransaction, RequestBuilder, ResponseBuilder, ServerTransaction, SipMethod, SipRequest,
    SipResponse,
};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// How long an abandoned INVITE may take to reach its final response (64*T1)
const ABANDON_WAIT: Duration = Duration::from_secs(32);

pub(crate) type DialFuture<'a> = Pin<Box<dyn Future<Output = Result<DialogClientSession>> + Send + 'a>>;

#[derive(Clone, Default)]
pub struct DialOptions {
    /// Digest credentials used when the INVITE is challenged
    pub username: String,
    pub password: String,
    /// Extra INVITE headers
    pub headers: Vec<(String, String)>,
    /// Payload types to offer; empty offers the defaults
    pub formats: Vec<String>,
    pub events: Option<Arc<dyn DialEvents>>,
}

impl fmt::Debug for DialOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialOptions")
            .field("username", &self.username)
            .field("headers", &self.headers)
            .field("formats", &self.formats)
            .field("events", &self.events.is_some())
            .finish()
    }
}

impl Phone {
    /// Place a call to `recipient` and wait until it is answered.
    ///
    /// The returned session owns the dial endpoint; close it to hang up and
    /// release the endpoint and media.
    pub async fn dial(
        &self,
        cancel: &CancellationToken,
        recipient: SipUri,
        options: DialOptions,
    ) -> Result<DialogClientSession> {
        self.dial_boxed(cancel, recipient, options).await
    }

    /// Boxed so a transfer can dial again from inside the dispatcher task
    pub(crate) fn dial_boxed<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        recipient: SipUri,
        options: DialOptions,
    ) -> DialFuture<'a> {
        let span = info_span!("dial", recipient = %recipient);
        Box::pin(self.dial_inner(cancel, recipient, options).instrument(span))
    }

    async fn dial_inner(
        &self,
        cancel: &CancellationToken,
        recipient: SipUri,
        options: DialOptions,
    ) -> Result<DialogClientSession> {
        let recipient = recipient.without_password();
        let network = recipient.transport();
        let (host, port) = self.interface_host_port(&network)?;
        let endpoint = self.bind(&network, &host, port).await?;

        let host = match contact_host(endpoint.local_addr()) {
            Ok(host) => host,
            Err(e) => {
                endpoint.close();
                return Err(e);
            }
        };
        let contact = self.contact_uri(&host, endpoint.local_addr().port(), &network);

        let cache = Arc::new(DialogClientCache::new(endpoint, contact));
        let dialer = Arc::new(Dialer {
            phone: self.clone(),
            cache: cache.clone(),
            options,
            host,
            current: OnceLock::new(),
        });
        tokio::spawn(dialer.clone().serve());

        match dialer.start(cancel, recipient).await {
            Ok(session) => {
                let _ = dialer.current.set(session.clone());
                Ok(session)
            }
            Err(e) => {
                cache.release_if_idle();
                Err(e)
            }
        }
    }
}

/// State of one `Phone::dial`: the endpoint cache plus the call it tracks
/// for mid-call requests.
pub(crate) struct Dialer {
    pub(super) phone: Phone,
    pub(super) cache: Arc<DialogClientCache>,
    pub(super) options: DialOptions,
    host: String,
    /// Only one outbound call per dial is tracked for re-INVITE
    current: OnceLock<DialogClientSession>,
}

impl Dialer {
    async fn start(&self, cancel: &CancellationToken, recipient: SipUri) -> Result<DialogClientSession> {
        let media = self.phone.media_session(&self.host, &self.options.formats).await?;
        info!(formats = %media.log_formats(), "Offering formats");

        let from = self.phone.from_uri(&self.host);
        let invite = RequestBuilder::new(SipMethod::Invite, recipient.clone())
            .from(&from, &make_tag())
            .to(&recipient.clone().without_params(), None)
            .contact(self.cache.contact())
            .header("User-Agent", self.phone.user_agent())
            .headers(self.options.headers.iter().cloned())
            .body("application/sdp", media.local_sdp())
            .build()?;

        self.invite(cancel, invite, media).await
    }

    /// Send the INVITE, answer one digest challenge, then ACK the 2xx
    async fn invite(
        &self,
        cancel: &CancellationToken,
        invite: SipRequest,
        mut media: MediaSession,
    ) -> Result<DialogClientSession> {
        let endpoint = self.cache.endpoint().clone();
        let mut machine = DialogStateMachine::new();
        let mut provisional = false;

        info!(call_id = ?invite.call_id(), "Sending INVITE");
        let mut tx = endpoint.request(invite).await?;
        let mut response = match self.wait_answer(cancel, &mut tx, &mut machine, &mut provisional).await {
            Err(PhoneError::Cancelled) => return Err(self.abandon(tx, machine, provisional)),
            result => result?,
        };

        if matches!(response.status_code(), 401 | 407) && !self.options.password.is_empty() {
            info!(status = response.status_code(), "Unauthorized. Doing digest auth");
            let request = authorize_request(tx.request(), &response, &self.options.username, &self.options.password)?;
            tx = endpoint.request(request).await?;
            provisional = false;
            response = match self.wait_answer(cancel, &mut tx, &mut machine, &mut provisional).await {
                Err(PhoneError::Cancelled) => return Err(self.abandon(tx, machine, provisional)),
                result => result?,
            };
        }

        let invite = tx.request().clone();
        if !response.is_success() {
            let message = format!("Call not answered: {}", response.start_line());
            return Err(PhoneError::DialResponse(Box::new(ResponseError::new(
                invite, response, message,
            ))));
        }
        info!(status = response.status_code(), "Call answered");

        let dialog = Arc::new(Dialog::client(&invite, &response, machine, endpoint.clone())?);
        let cseq = invite.cseq().unwrap_or(1);
        let sdp_result = media.apply_remote_sdp(response.body());

        endpoint.write(dialog.ack(cseq)?).await?;
        dialog.apply(DialogEvent::Confirm);

        if let Err(e) = sdp_result {
            warn!(error = %e, "Answer SDP rejected, hanging up");
            if let Err(e) = dialog.bye().await {
                debug!(error = %e, "BYE after bad answer failed");
            }
            media.close();
            return Err(e.into());
        }

        Ok(DialogClientSession::new(dialog, media, response, self.cache.clone()))
    }

    async fn wait_answer(
        &self,
        cancel: &CancellationToken,
        tx: &mut ClientTransaction,
        machine: &mut DialogStateMachine,
        provisional: &mut bool,
    ) -> Result<SipResponse> {
        let events = self.options.events.clone();
        let response = tx
            .final_response(cancel, |r| {
                debug!(status = r.status_code(), reason = %r.reason(), "Provisional response");
                *provisional = true;
                if matches!(r.status_code(), 180 | 183) {
                    let _ = machine.process_event(DialogEvent::Ringing);
                }
                if let Some(events) = &events {
                    events.on_response(r);
                }
            })
            .await?;
        Ok(response)
    }

    /// The caller gave up on a pending INVITE. The rest runs in the
    /// background with the endpoint held open: CANCEL once the peer has
    /// answered provisionally, and hang up a 2xx that still gets through.
    fn abandon(&self, tx: ClientTransaction, machine: DialogStateMachine, provisional: bool) -> PhoneError {
        self.cache.hold();
        let cache = self.cache.clone();
        tokio::spawn(
            async move {
                let finish = cancel_invite(&cache, tx, machine, provisional);
                if tokio::time::timeout(ABANDON_WAIT, finish).await.is_err() {
                    warn!("No final response to the cancelled INVITE");
                }
                cache.unhold();
            }
            .in_current_span(),
        );
        PhoneError::Cancelled
    }

    /// Serve requests arriving on the dial endpoint until it shuts down
    async fn serve(self: Arc<Self>) {
        let endpoint = self.cache.endpoint().clone();
        let shutdown = self.cache.shutdown_token().clone();

        loop {
            let tx = tokio::select! {
                tx = endpoint.accept() => tx,
                _ = shutdown.cancelled() => None,
            };
            let Some(tx) = tx else { break };
            debug!(request = %tx.request().start_line(), "Received request");

            match tx.method() {
                Some(SipMethod::Bye) => self.on_bye(&tx),
                Some(SipMethod::Ack) => debug!(call_id = ?tx.request().call_id(), "ACK received"),
                Some(SipMethod::Invite) => self.on_reinvite(&tx),
                Some(SipMethod::Refer) => {
                    tokio::spawn(self.clone().on_refer(tx));
                }
                _ => respond_out_of_dialog(&tx),
            }
        }
        debug!("Dial dispatcher stopped");
    }

    fn on_bye(&self, tx: &ServerTransaction) {
        match self.cache.match_request(tx.request()) {
            Some(dialog) if dialog.state() != DialogState::Terminated => {
                info!(call_id = %dialog.id().call_id, "Received BYE");
                if let Err(e) = dialog.read_bye(tx) {
                    warn!(error = %e, "Failed to answer BYE");
                }
            }
            _ => {
                info!(call_id = ?tx.request().call_id(), "BYE for a closed or unknown dialog");
                respond(tx, ResponseBuilder::new(481));
            }
        }
    }

    /// Mid-call INVITE: renegotiate media on a fork of the current session
    fn on_reinvite(&self, tx: &ServerTransaction) {
        let Some(session) = self.current.get() else {
            respond(tx, ResponseBuilder::new(481));
            return;
        };
        if !session.dialog().matches(tx.request()) {
            respond(tx, ResponseBuilder::new(404));
            return;
        }
        if let Some(cseq) = tx.request().cseq() {
            session.dialog().accept_remote_seq(cseq);
        }
        let Some(mut media) = session.media().map(|m| m.fork()) else {
            respond(tx, ResponseBuilder::new(481));
            return;
        };

        if let Err(e) = media.apply_remote_sdp(tx.request().body()) {
            warn!(error = %e, "Re-INVITE offer rejected");
            respond(tx, ResponseBuilder::new(400).reason("SDP applying failed"));
            return;
        }

        let events = match &self.options.events {
            Some(events) if events.handles_media_update() => events,
            _ => {
                respond(tx, ResponseBuilder::new(405));
                return;
            }
        };

        info!(formats = %media.log_formats(), "Media updated");
        events.on_media_update(media.clone());
        let sdp = media.local_sdp();
        session.set_media(media);
        respond(
            tx,
            ResponseBuilder::ok()
                .header("Contact", contact_value(self.cache.contact()))
                .body("application/sdp", sdp),
        );
    }
}

async fn cancel_invite(
    cache: &DialogClientCache,
    mut tx: ClientTransaction,
    machine: DialogStateMachine,
    mut provisional: bool,
) {
    let endpoint = cache.endpoint().clone();
    let never = CancellationToken::new();
    let mut cancel_sent = false;

    let response = loop {
        // No CANCEL before a provisional response (RFC 3261 9.1)
        if provisional && !cancel_sent {
            cancel_sent = true;
            info!(call_id = ?tx.request().call_id(), "Sending CANCEL");
            if let Err(e) = endpoint.cancel(tx.request()).await {
                warn!(error = %e, "Failed to send CANCEL");
            }
        }
        match tx.recv(&never).await {
            Ok(response) if response.is_provisional() => provisional = true,
            Ok(response) => break response,
            Err(e) => {
                debug!(error = %e, "Cancelled INVITE ended");
                return;
            }
        }
    };

    if !response.is_success() {
        debug!(status = response.status_code(), "Cancelled INVITE ended");
        return;
    }

    info!("Call answered after CANCEL, hanging up");
    let invite = tx.request();
    let dialog = match Dialog::client(invite, &response, machine, endpoint.clone()) {
        Ok(dialog) => dialog,
        Err(e) => {
            warn!(error = %e, "Cannot build dialog for late answer");
            return;
        }
    };
    match dialog.ack(invite.cseq().unwrap_or(1)) {
        Ok(ack) => {
            if let Err(e) = endpoint.write(ack).await {
                warn!(error = %e, "Failed to ACK late answer");
            }
        }
        Err(e) => warn!(error = %e, "Failed to build ACK"),
    }
    dialog.apply(DialogEvent::Confirm);
    if let Err(e) = dialog.bye().await {
        warn!(error = %e, "BYE after late answer failed");
    }
}
