//! SIP Transaction Layer
//!
//! The call-control workflows reach the network only through [`Endpoint`]:
//! a request goes out as a [`ClientTransaction`] that yields responses in
//! arrival order, and incoming requests arrive as [`ServerTransaction`]s
//! carrying a responder, an ACK stream and a terminal signal.
//!
//! Endpoint implementations drive the other half of each transaction
//! through the matching handle types.

use super::builder::make_branch;
use super::message::{find_headers, SipError, SipMethod, SipRequest, SipResponse};
use super::rport::add_rport_to_via_string;
use super::transport::{ListenAddr, TransportProtocol};
use async_trait::async_trait;
use rsip::{Header, Headers};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Transaction ID - uniquely identifies a transaction
/// Based on branch parameter in Via header
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TransactionId(pub String);

impl TransactionId {
    pub fn from_branch(branch: &str) -> Self {
        Self(branch.to_string())
    }

    pub fn generate() -> Self {
        Self(make_branch())
    }

    pub fn from_request(request: &SipRequest) -> Option<Self> {
        request.via_branch().map(|b| Self::from_branch(&b))
    }
}

/// SIP Timers (RFC 3261 Section 17.1.1.1)
#[derive(Debug, Clone, Copy)]
pub struct SipTimers {
    /// T1: RTT Estimate (default 500ms)
    pub t1: Duration,
    /// T4: Maximum duration a message remains in network (default 5s)
    pub t4: Duration,
}

impl SipTimers {
    pub fn with_t1(t1: Duration) -> Self {
        Self { t1, ..Self::default() }
    }

    /// Timer B / F: client transaction timeout
    pub fn timer_b(&self) -> Duration {
        self.t1 * 64
    }

    /// Timer H: wait for ACK after a non-2xx final response
    pub fn timer_h(&self) -> Duration {
        self.t1 * 64
    }

    /// Timer L: accepted INVITE server transaction lifetime (RFC 6026)
    pub fn timer_l(&self) -> Duration {
        self.t1 * 64
    }
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t4: Duration::from_secs(5),
        }
    }
}

/// Put a top Via with a fresh branch on a request that has none, and
/// return the transaction id.
pub fn prepare_request(
    request: &mut SipRequest,
    protocol: TransportProtocol,
    local_addr: SocketAddr,
) -> TransactionId {
    if let Some(id) = TransactionId::from_request(request) {
        return id;
    }

    let id = TransactionId::generate();
    let via = add_rport_to_via_string(&format!(
        "SIP/2.0/{} {};branch={}",
        protocol.as_str(),
        local_addr,
        id.0
    ));

    let mut headers: Vec<Header> = vec![Header::Via(via.into())];
    headers.extend(request.headers().iter().cloned());
    request.inner.headers = Headers::from(headers);
    id
}

/// CANCEL for a pending INVITE (RFC 3261 9.1). It shares the INVITE's top
/// Via, so the branch and thus the server transaction match.
pub fn cancel_request(invite: &SipRequest) -> Result<SipRequest, SipError> {
    let missing = |name: &str| SipError::InvalidMessage(format!("INVITE without {}", name));

    let mut cancel = SipRequest::with_method(SipMethod::Cancel, &invite.request_uri()?)?;
    cancel.push_header("Via", invite.header("via").ok_or_else(|| missing("Via"))?);
    for route in find_headers(invite.headers(), "route") {
        cancel.push_header("Route", route);
    }
    cancel.push_header("From", invite.header("from").ok_or_else(|| missing("From"))?);
    cancel.push_header("To", invite.header("to").ok_or_else(|| missing("To"))?);
    cancel.push_header("Call-ID", invite.call_id().ok_or_else(|| missing("Call-ID"))?);
    let seq = invite.cseq().ok_or_else(|| missing("CSeq"))?;
    cancel.push_header("CSeq", format!("{} {}", seq, SipMethod::Cancel));
    cancel.push_header("Max-Forwards", "70");
    cancel.push_header("Content-Length", "0");
    Ok(cancel)
}

/// Client side of a transaction, held by the requester
#[derive(Debug)]
pub struct ClientTransaction {
    id: TransactionId,
    request: SipRequest,
    responses: mpsc::Receiver<SipResponse>,
}

/// Endpoint side of a client transaction
#[derive(Debug, Clone)]
pub struct ClientTransactionHandle {
    pub id: TransactionId,
    responses: mpsc::Sender<SipResponse>,
}

impl ClientTransaction {
    pub fn new(id: TransactionId, request: SipRequest) -> (Self, ClientTransactionHandle) {
        let (tx, rx) = mpsc::channel(32);
        (
            Self {
                id: id.clone(),
                request,
                responses: rx,
            },
            ClientTransactionHandle { id, responses: tx },
        )
    }

    /// A transaction that already saw all of its responses
    pub fn completed(request: SipRequest, responses: Vec<SipResponse>) -> Self {
        let id = TransactionId::from_request(&request).unwrap_or_else(TransactionId::generate);
        let (tx, rx) = mpsc::channel(responses.len().max(1));
        for response in responses {
            let _ = tx.try_send(response);
        }
        Self {
            id,
            request,
            responses: rx,
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn request(&self) -> &SipRequest {
        &self.request
    }

    /// Next response; `None` once the transaction has ended.
    pub async fn next_response(&mut self) -> Option<SipResponse> {
        self.responses.recv().await
    }

    /// Wait for the next response, the transaction dying, or cancellation.
    pub async fn recv(&mut self, cancel: &CancellationToken) -> Result<SipResponse, SipError> {
        tokio::select! {
            response = self.responses.recv() => response.ok_or_else(|| {
                SipError::TransactionError(format!(
                    "transaction died waiting for response to {}",
                    self.request.start_line()
                ))
            }),
            _ = cancel.cancelled() => Err(SipError::Cancelled),
        }
    }

    /// Wait for the final response, passing provisional ones to `on_provisional`.
    pub async fn final_response<F>(
        &mut self,
        cancel: &CancellationToken,
        mut on_provisional: F,
    ) -> Result<SipResponse, SipError>
    where
        F: FnMut(&SipResponse),
    {
        loop {
            let response = self.recv(cancel).await?;
            if !response.is_provisional() {
                return Ok(response);
            }
            on_provisional(&response);
        }
    }
}

impl ClientTransactionHandle {
    /// Hand a response to the requester. Returns false once it stopped listening.
    pub async fn deliver(&self, response: SipResponse) -> bool {
        self.responses.send(response).await.is_ok()
    }

    /// Resolves once the requester dropped its [`ClientTransaction`]
    pub async fn closed(&self) {
        self.responses.closed().await
    }
}

/// Server side of a transaction, handed to the request handler
#[derive(Debug)]
pub struct ServerTransaction {
    id: TransactionId,
    request: SipRequest,
    responses: mpsc::UnboundedSender<SipResponse>,
    acks: mpsc::Receiver<SipRequest>,
    done: CancellationToken,
    error: Arc<OnceLock<String>>,
}

/// Endpoint side of a server transaction
#[derive(Debug)]
pub struct ServerTransactionHandle {
    pub id: TransactionId,
    responses: mpsc::UnboundedReceiver<SipResponse>,
    acks: mpsc::Sender<SipRequest>,
    done: CancellationToken,
    error: Arc<OnceLock<String>>,
}

impl ServerTransaction {
    pub fn new(request: SipRequest) -> (Self, ServerTransactionHandle) {
        let id = TransactionId::from_request(&request).unwrap_or_else(TransactionId::generate);
        let (res_tx, res_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::channel(8);
        let done = CancellationToken::new();
        let error = Arc::new(OnceLock::new());
        (
            Self {
                id: id.clone(),
                request,
                responses: res_tx,
                acks: ack_rx,
                done: done.clone(),
                error: error.clone(),
            },
            ServerTransactionHandle {
                id,
                responses: res_rx,
                acks: ack_tx,
                done,
                error,
            },
        )
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn request(&self) -> &SipRequest {
        &self.request
    }

    pub fn method(&self) -> Option<SipMethod> {
        self.request.method()
    }

    pub fn respond(&self, response: SipResponse) -> Result<(), SipError> {
        self.responses
            .send(response)
            .map_err(|_| SipError::TransactionError("transaction terminated".to_string()))
    }

    /// Wait for the ACK; `None` when the transaction ended without one
    pub async fn wait_ack(&mut self) -> Option<SipRequest> {
        tokio::select! {
            biased;
            ack = self.acks.recv() => ack,
            _ = self.done.cancelled() => None,
        }
    }

    /// Resolves when the transaction reaches its terminal state
    pub async fn terminated(&self) {
        self.done.cancelled().await
    }

    pub fn is_terminated(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Reason the transaction failed, if it did
    pub fn error(&self) -> Option<String> {
        self.error.get().cloned()
    }
}

impl ServerTransactionHandle {
    /// Next response written by the handler; `None` when it dropped the transaction.
    pub async fn next_response(&mut self) -> Option<SipResponse> {
        self.responses.recv().await
    }

    pub async fn deliver_ack(&self, ack: SipRequest) {
        let _ = self.acks.send(ack).await;
    }

    pub fn terminate(&self) {
        self.done.cancel();
    }

    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.error.set(reason.into());
        self.done.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.done.is_cancelled()
    }
}

/// Black-box transaction client/server bound to one local address
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn local_addr(&self) -> SocketAddr;

    fn protocol(&self) -> TransportProtocol;

    /// Start a client transaction. A top Via is added when missing.
    async fn request(&self, request: SipRequest) -> Result<ClientTransaction, SipError>;

    /// Abandon a pending INVITE by sending CANCEL for it. The INVITE
    /// transaction keeps running and still yields its final response.
    async fn cancel(&self, invite: &SipRequest) -> Result<ClientTransaction, SipError> {
        self.request(cancel_request(invite)?).await
    }

    /// Send a request outside any transaction (ACK for 2xx)
    async fn write(&self, request: SipRequest) -> Result<(), SipError>;

    /// Next incoming request; `None` once the endpoint is closed.
    async fn accept(&self) -> Option<ServerTransaction>;

    /// Stop receiving and release the socket. Idempotent.
    fn close(&self);
}

/// Creates endpoints for listen addresses
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EndpointFactory: Send + Sync {
    async fn bind(&self, addr: &ListenAddr) -> Result<Arc<dyn Endpoint>, SipError>;
}
