//! In-memory SIP peer shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use yakphone::infrastructure::protocols::sip::transaction::{
    cancel_request, prepare_request, ClientTransactionHandle, ServerTransactionHandle,
};
use yakphone::infrastructure::protocols::sip::{
    ClientTransaction, Endpoint, EndpointFactory, ListenAddr, RequestBuilder, ResponseBuilder,
    SdpSession, ServerTransaction, SipError, SipMethod, SipRequest, SipResponse,
    TransportProtocol,
};
use yakphone::{Phone, SipUri};

/// Answers every request sent through a scripted endpoint. When the last
/// response is provisional the transaction stays open until cancelled.
pub type Responder = Arc<dyn Fn(&SipRequest) -> Vec<SipResponse> + Send + Sync>;

/// Final response to a pending INVITE once it is cancelled
pub type CancelOutcome = Arc<dyn Fn(&SipRequest) -> SipResponse + Send + Sync>;

pub struct ScriptedEndpoint {
    addr: SocketAddr,
    responder: Responder,
    sent: Mutex<Vec<SipRequest>>,
    written: Mutex<Vec<SipRequest>>,
    pending: Mutex<Vec<(SipRequest, ClientTransactionHandle)>>,
    cancel_outcome: Mutex<Option<CancelOutcome>>,
    incoming: mpsc::UnboundedSender<ServerTransaction>,
    accepted: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerTransaction>>,
    closed: CancellationToken,
    close_count: AtomicUsize,
}

impl ScriptedEndpoint {
    pub fn new(addr: SocketAddr, responder: Responder) -> Self {
        let (incoming, accepted) = mpsc::unbounded_channel();
        Self {
            addr,
            responder,
            sent: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            cancel_outcome: Mutex::new(None),
            incoming,
            accepted: tokio::sync::Mutex::new(accepted),
            closed: CancellationToken::new(),
            close_count: AtomicUsize::new(0),
        }
    }

    /// Requests sent as transactions, in order
    pub fn sent(&self) -> Vec<SipRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_with(&self, method: SipMethod) -> Vec<SipRequest> {
        self.sent().into_iter().filter(|r| r.is_method(method)).collect()
    }

    /// Requests written outside a transaction (ACK for 2xx)
    pub fn written(&self) -> Vec<SipRequest> {
        self.written.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Deliver a request from the peer. After close the request is dropped
    /// unanswered, as a closed socket would.
    pub fn inject(&self, request: SipRequest) -> ServerTransactionHandle {
        let (tx, handle) = ServerTransaction::new(request);
        if !self.closed.is_cancelled() {
            self.incoming
                .send(tx)
                .expect("Endpoint receiver dropped");
        }
        handle
    }
}

#[async_trait]
impl Endpoint for ScriptedEndpoint {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }

    async fn request(&self, mut request: SipRequest) -> Result<ClientTransaction, SipError> {
        if self.closed.is_cancelled() {
            return Err(SipError::TransportError("endpoint closed".to_string()));
        }
        let id = prepare_request(&mut request, TransportProtocol::Udp, self.addr);
        self.sent.lock().unwrap().push(request.clone());
        let responses = (self.responder)(&request);
        if !responses.last().map(|r| r.is_provisional()).unwrap_or(false) {
            return Ok(ClientTransaction::completed(request, responses));
        }

        let (tx, handle) = ClientTransaction::new(id, request.clone());
        for response in responses {
            handle.deliver(response).await;
        }
        self.pending.lock().unwrap().push((request, handle));
        Ok(tx)
    }

    async fn cancel(&self, invite: &SipRequest) -> Result<ClientTransaction, SipError> {
        let mut cancel = cancel_request(invite)?;
        prepare_request(&mut cancel, TransportProtocol::Udp, self.addr);
        self.sent.lock().unwrap().push(cancel.clone());

        let pending = {
            let mut pending = self.pending.lock().unwrap();
            let position = pending
                .iter()
                .position(|(request, _)| request.via_branch() == invite.via_branch());
            position.map(|i| pending.remove(i))
        };
        if let Some((request, handle)) = pending {
            let outcome = self.cancel_outcome.lock().unwrap().clone();
            let response = match outcome {
                Some(outcome) => outcome(&request),
                None => ResponseBuilder::new(487).build_for_request(&request),
            };
            handle.deliver(response).await;
        }

        let ok = ResponseBuilder::ok().build_for_request(&cancel);
        Ok(ClientTransaction::completed(cancel, vec![ok]))
    }

    async fn write(&self, request: SipRequest) -> Result<(), SipError> {
        self.written.lock().unwrap().push(request);
        Ok(())
    }

    async fn accept(&self) -> Option<ServerTransaction> {
        let mut accepted = self.accepted.lock().await;
        tokio::select! {
            tx = accepted.recv() => tx,
            _ = self.closed.cancelled() => None,
        }
    }

    fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        self.pending.lock().unwrap().clear();
    }
}

/// Hands out scripted endpoints on consecutive ports
pub struct ScriptedFactory {
    responder: Responder,
    next_port: AtomicU16,
    endpoints: Mutex<Vec<Arc<ScriptedEndpoint>>>,
    cancel_outcome: Mutex<Option<CancelOutcome>>,
}

impl ScriptedFactory {
    pub fn new(responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            responder,
            next_port: AtomicU16::new(15060),
            endpoints: Mutex::new(Vec::new()),
            cancel_outcome: Mutex::new(None),
        })
    }

    /// Endpoints bound from now on answer a cancelled INVITE with this instead of 487
    pub fn on_cancel(&self, outcome: CancelOutcome) {
        *self.cancel_outcome.lock().unwrap() = Some(outcome);
    }

    pub fn endpoints(&self) -> Vec<Arc<ScriptedEndpoint>> {
        self.endpoints.lock().unwrap().clone()
    }

    /// Wait for endpoint `index` to be bound
    pub async fn endpoint(&self, index: usize) -> Arc<ScriptedEndpoint> {
        for _ in 0..200 {
            if let Some(endpoint) = self.endpoints().get(index) {
                return endpoint.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("endpoint {} was never bound", index);
    }
}

#[async_trait]
impl EndpointFactory for ScriptedFactory {
    async fn bind(&self, addr: &ListenAddr) -> Result<Arc<dyn Endpoint>, SipError> {
        let mut socket: SocketAddr = addr
            .addr
            .parse()
            .map_err(|_| SipError::TransportError(format!("bad address {}", addr.addr)))?;
        if socket.port() == 0 {
            socket.set_port(self.next_port.fetch_add(1, Ordering::SeqCst));
        }
        let endpoint = ScriptedEndpoint::new(socket, self.responder.clone());
        *endpoint.cancel_outcome.lock().unwrap() = self.cancel_outcome.lock().unwrap().clone();
        let endpoint = Arc::new(endpoint);
        self.endpoints.lock().unwrap().push(endpoint.clone());
        Ok(endpoint)
    }
}

pub fn phone(factory: Arc<ScriptedFactory>) -> Phone {
    Phone::builder()
        .listen_addr(ListenAddr::new("udp", "127.0.0.1:0"))
        .user_agent("alice")
        .endpoint_factory(factory)
        .build()
}

/// Audio description of the peer on 127.0.0.1
pub fn peer_sdp(port: u16) -> Vec<u8> {
    SdpSession::create_audio_session(IpAddr::V4(Ipv4Addr::LOCALHOST), port, &["0".to_string()])
        .to_string()
        .into_bytes()
}

/// In-dialog request from the peer; tags are given from the peer's side
pub fn peer_request(
    method: SipMethod,
    call_id: &str,
    peer_tag: &str,
    our_tag: &str,
    cseq: u32,
) -> SipRequest {
    RequestBuilder::new(method, SipUri::parse("sip:alice@127.0.0.1").unwrap())
        .from_value(format!("<sip:bob@127.0.0.1:5099>;tag={}", peer_tag))
        .to_value(format!("<sip:alice@127.0.0.1>;tag={}", our_tag))
        .call_id(call_id)
        .cseq(cseq)
        .build()
        .expect("Failed to build peer request")
}

/// Poll `check` until it holds or a second passes
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
