//! Registration keep-alive

use super::dial::DialOptions;
use super::error::{PhoneError, ResponseError, Result};
use super::phone::{contact_host, spawn_options_responder, Phone};
use super::session::DialogClientSession;
use crate::domain::shared::SipUri;
use crate::infrastructure::protocols::sip::auth::authorize_request;
use crate::infrastructure::protocols::sip::builder::{contact_value, make_tag};
use crate::infrastructure::protocols::sip::{
    Endpoint, NatAddress, RequestBuilder, SipMethod, SipRequest, SipResponse,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Bound on the initial REGISTER exchange
const REGISTER_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on the unregister sent when registration ends
const UNREGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `register_and_dial` waits for the first registration
const REGISTER_WAIT: Duration = Duration::from_secs(5);

/// Expiry used for the refresh interval when none was requested
const DEFAULT_QUALIFY_EXPIRY: u32 = 30;

#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    pub username: String,
    pub password: String,
    /// Seconds; 0 leaves Expires out
    pub expiry: u32,
    pub allow_headers: Vec<String>,
    /// Clear all bindings with `Contact: *` before registering
    pub unregister_all: bool,
}

/// One registration binding and its refresh state
pub struct RegisterTransaction {
    endpoint: Arc<dyn Endpoint>,
    options: RegisterOptions,
    /// REGISTER template; its Contact follows NAT correction
    origin: Mutex<SipRequest>,
}

impl RegisterTransaction {
    pub fn new(
        endpoint: Arc<dyn Endpoint>,
        recipient: &SipUri,
        aor: &SipUri,
        contact: &SipUri,
        user_agent: &str,
        options: RegisterOptions,
    ) -> Result<Self> {
        let mut builder = RequestBuilder::new(SipMethod::Register, recipient.clone())
            .from(aor, &make_tag())
            .to(aor, None)
            .contact(contact)
            .header("User-Agent", user_agent);
        if options.expiry > 0 {
            builder = builder.header("Expires", options.expiry.to_string());
        }
        if !options.allow_headers.is_empty() {
            builder = builder.header("Allow", options.allow_headers.join(", "));
        }

        Ok(Self {
            endpoint,
            options,
            origin: Mutex::new(builder.build()?),
        })
    }

    /// Current REGISTER template
    pub async fn origin(&self) -> SipRequest {
        self.origin.lock().await.clone()
    }

    /// Contact as registered, after any NAT correction
    pub async fn contact(&self) -> Option<SipUri> {
        self.origin.lock().await.contact_uri()
    }

    /// Initial registration. Applies NAT correction from the first response.
    pub async fn register(&self, cancel: &CancellationToken) -> Result<()> {
        let exchange = async {
            let mut origin = self.origin.lock().await;
            info!(uri = %origin.uri(), expiry = self.options.expiry, "Sending REGISTER");

            let mut tx = self.endpoint.request(origin.clone()).await?;
            let response = tx.final_response(cancel, |r| debug!(status = r.status_code(), "Provisional response")).await?;

            if let Some(nat) = response.via().and_then(|via| NatAddress::from_via(&via)) {
                if let Some(contact) = origin.contact_uri() {
                    let corrected = nat.apply(contact);
                    info!(contact = %corrected, "Contact corrected from Via rport/received");
                    origin.set_header("Contact", contact_value(&corrected));
                }
            }

            self.finish(&mut origin, response, cancel).await
        };

        match tokio::time::timeout(REGISTER_TIMEOUT, exchange).await {
            Ok(result) => result,
            Err(_) => Err(PhoneError::TransactionTerminated(
                "no response to REGISTER, check that the registrar is reachable".to_string(),
            )),
        }
    }

    /// Refresh every `expiry/2` until cancelled. A failed refresh ends the loop.
    pub async fn qualify_loop(&self, cancel: &CancellationToken) -> Result<()> {
        let expiry = match self.options.expiry {
            0 => DEFAULT_QUALIFY_EXPIRY,
            e => e,
        };
        let refresh = Duration::from_secs(u64::from(expiry / 2)).max(Duration::from_secs(1));

        let mut ticker = interval_at(Instant::now() + refresh, refresh);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            info!(expiry, refresh = ?refresh, "Refreshing registration");
            if let Err(e) = self.qualify(cancel).await {
                if matches!(e, PhoneError::Cancelled) {
                    return Ok(());
                }
                error!(error = %e, "Registration refresh failed");
                return Err(e);
            }
        }
    }

    async fn qualify(&self, cancel: &CancellationToken) -> Result<()> {
        let mut origin = self.origin.lock().await;
        bump_cseq(&mut origin);
        let request = origin.clone();
        self.reregister(&mut origin, request, cancel).await
    }

    /// Retire our own binding (`Expires: 0`)
    pub async fn unregister(&self, cancel: &CancellationToken) -> Result<()> {
        let mut origin = self.origin.lock().await;
        bump_cseq(&mut origin);
        let mut request = origin.clone();
        request.set_header("Expires", "0");

        info!(uri = %request.uri(), "Unregistering");
        self.reregister(&mut origin, request, cancel).await
    }

    /// Retire every binding of the AOR (`Contact: *`)
    pub async fn unregister_all(&self, cancel: &CancellationToken) -> Result<()> {
        let mut origin = self.origin.lock().await;
        bump_cseq(&mut origin);
        let mut request = origin.clone();
        request.set_header("Contact", "*");
        request.set_header("Expires", "0");

        info!(uri = %request.uri(), "Unregistering all bindings");
        self.reregister(&mut origin, request, cancel).await
    }

    async fn reregister(
        &self,
        origin: &mut SipRequest,
        mut request: SipRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        request.remove_header("Via");
        let mut tx = self.endpoint.request(request).await?;
        let response = tx.final_response(cancel, |_| {}).await?;

        // Challenges are answered for the request that drew them
        let sent = tx.request().clone();
        self.finish_with(origin, sent, response, cancel).await
    }

    async fn finish(
        &self,
        origin: &mut SipRequest,
        response: SipResponse,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let sent = origin.clone();
        self.finish_with(origin, sent, response, cancel).await
    }

    /// Answer one digest challenge, then require 2xx
    async fn finish_with(
        &self,
        origin: &mut SipRequest,
        sent: SipRequest,
        mut response: SipResponse,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(status = response.status_code(), "Received REGISTER response");
        let mut request = sent;

        if is_challenge(&response) {
            info!("Unauthorized. Doing digest auth");
            request = authorize_request(&request, &response, &self.options.username, &self.options.password)?;
            if let Some(seq) = request.cseq() {
                origin.set_header("CSeq", format!("{} {}", seq, SipMethod::Register));
            }

            let mut tx = self.endpoint.request(request.clone()).await?;
            response = tx.final_response(cancel, |_| {}).await?;
            info!(status = response.status_code(), "Received REGISTER response");

            if is_challenge(&response) {
                return Err(PhoneError::RegisterUnauthorized);
            }
        }

        if !response.is_success() {
            let message = response.start_line();
            return Err(PhoneError::RegisterResponse(Box::new(ResponseError::new(
                request, response, message,
            ))));
        }
        Ok(())
    }
}

impl Phone {
    /// Register with `recipient` and keep the binding fresh until `cancel`.
    ///
    /// Returns `Ok` once cancelled and unregistered, or the first error. A
    /// failed refresh is not retried.
    pub async fn register(
        &self,
        cancel: &CancellationToken,
        recipient: SipUri,
        options: RegisterOptions,
    ) -> Result<()> {
        let span = info_span!("register", recipient = %recipient);
        self.register_inner(cancel, recipient, options, None).instrument(span).await
    }

    /// Register in the background, then dial once the first registration
    /// succeeded. The registration ends with the call.
    pub async fn register_and_dial(
        &self,
        cancel: &CancellationToken,
        registrar: SipUri,
        recipient: SipUri,
        register: RegisterOptions,
        dial: DialOptions,
    ) -> Result<DialogClientSession> {
        let registration_cancel = cancel.child_token();
        let (registered_tx, registered_rx) = oneshot::channel();

        let phone = self.clone();
        let token = registration_cancel.clone();
        let span = info_span!("register", recipient = %registrar);
        let registration = tokio::spawn(
            async move {
                phone
                    .register_inner(&token, registrar, register, Some(registered_tx))
                    .await
            }
            .instrument(span),
        );

        match tokio::time::timeout(REGISTER_WAIT, registered_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                registration_cancel.cancel();
                return Err(match registration.await {
                    Ok(Err(e)) => e,
                    _ => PhoneError::RegisterFailed,
                });
            }
            Err(_) => {
                registration_cancel.cancel();
                return Err(PhoneError::TransactionTerminated(
                    "registration did not complete in time".to_string(),
                ));
            }
        }

        let session = match self.dial(cancel, recipient, dial).await {
            Ok(session) => session,
            Err(e) => {
                registration_cancel.cancel();
                return Err(e);
            }
        };

        let lifetime = session.lifetime();
        tokio::spawn(async move {
            tokio::select! {
                _ = lifetime.cancelled() => {}
                _ = registration_cancel.cancelled() => {}
            }
            registration_cancel.cancel();
        });
        Ok(session)
    }

    async fn register_inner(
        &self,
        cancel: &CancellationToken,
        recipient: SipUri,
        options: RegisterOptions,
        registered: Option<oneshot::Sender<()>>,
    ) -> Result<()> {
        let recipient = recipient.without_password();
        let network = recipient.transport();
        let (host, port) = self.interface_host_port(&network)?;
        let endpoint = self.bind(&network, &host, port).await?;

        let stop = cancel.child_token();
        spawn_options_responder(endpoint.clone(), stop.clone());

        let result = self
            .keep_registered(&stop, &endpoint, &recipient, &network, options, registered)
            .await;

        stop.cancel();
        endpoint.close();
        result
    }

    async fn keep_registered(
        &self,
        cancel: &CancellationToken,
        endpoint: &Arc<dyn Endpoint>,
        recipient: &SipUri,
        network: &str,
        options: RegisterOptions,
        registered: Option<oneshot::Sender<()>>,
    ) -> Result<()> {
        let local = endpoint.local_addr();
        let contact = self.contact_uri(&contact_host(local)?, local.port(), network);
        let user = if options.username.is_empty() {
            self.user_agent().to_string()
        } else {
            options.username.clone()
        };
        let aor = SipUri::new(Some(user), recipient.host(), None);
        let unregister_all = options.unregister_all;

        let transaction = RegisterTransaction::new(
            endpoint.clone(),
            recipient,
            &aor,
            &contact,
            self.user_agent(),
            options,
        )?;

        if unregister_all {
            if let Err(e) = transaction.unregister_all(cancel).await {
                error!(error = %e, "Failed to unregister all bindings");
                return Err(PhoneError::RegisterFailed);
            }
        }

        transaction.register(cancel).await?;
        if let Some(contact) = transaction.contact().await {
            info!(contact = %contact, "Registered");
        }
        if let Some(registered) = registered {
            let _ = registered.send(());
        }

        let result = transaction.qualify_loop(cancel).await;

        let unregister = CancellationToken::new();
        match tokio::time::timeout(UNREGISTER_TIMEOUT, transaction.unregister(&unregister)).await {
            Ok(Ok(())) => info!("Unregistered"),
            Ok(Err(e)) => warn!(error = %e, "Unregister failed"),
            Err(_) => warn!("Unregister timed out"),
        }
        result
    }
}

fn is_challenge(response: &SipResponse) -> bool {
    matches!(response.status_code(), 401 | 407)
}

fn bump_cseq(request: &mut SipRequest) {
    let seq = request.cseq().unwrap_or(0) + 1;
    request.set_header("CSeq", format!("{} {}", seq, SipMethod::Register));
}
