//! SIP transport layer - UDP endpoint
//!
//! Runs the endpoint half of client and server transactions over a single
//! UDP socket. Retransmission is not done here; timers only bound how long
//! a transaction waits.

use super::builder::ResponseBuilder;
use super::message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
use super::rport::add_rport_and_received;
use super::transaction::{
    prepare_request, ClientTransaction, ClientTransactionHandle, Endpoint, EndpointFactory,
    ServerTransaction, ServerTransactionHandle, SipTimers, TransactionId,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Tls => "TLS",
            TransportProtocol::Ws => "WS",
            TransportProtocol::Wss => "WSS",
        }
    }

    pub fn parse(network: &str) -> Option<Self> {
        match network.to_ascii_lowercase().as_str() {
            "udp" => Some(TransportProtocol::Udp),
            "tcp" => Some(TransportProtocol::Tcp),
            "tls" => Some(TransportProtocol::Tls),
            "ws" => Some(TransportProtocol::Ws),
            "wss" => Some(TransportProtocol::Wss),
            _ => None,
        }
    }
}

/// Listener address: a network name and a `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenAddr {
    pub network: String,
    pub addr: String,
}

impl ListenAddr {
    pub fn new(network: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            addr: addr.into(),
        }
    }

    pub fn protocol(&self) -> Result<TransportProtocol, SipError> {
        TransportProtocol::parse(&self.network)
            .ok_or_else(|| SipError::TransportError(format!("Unknown network {}", self.network)))
    }
}

/// Client transactions match on the Via branch and the CSeq method, so a
/// CANCEL and the INVITE it cancels stay apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    branch: TransactionId,
    method: SipMethod,
}

impl ClientKey {
    fn for_request(branch: &TransactionId, request: &SipRequest) -> Option<Self> {
        Some(Self {
            branch: branch.clone(),
            method: request.method()?,
        })
    }

    fn for_response(response: &SipResponse) -> Option<Self> {
        Some(Self {
            branch: TransactionId::from_branch(&response.via_branch()?),
            method: response.cseq_method()?,
        })
    }
}

struct ClientEntry {
    handle: ClientTransactionHandle,
    request: SipRequest,
    answered: bool,
    done: CancellationToken,
}

impl ClientEntry {
    fn is_invite(&self) -> bool {
        self.request.is_method(SipMethod::Invite)
    }
}

struct ServerEntry {
    call_id: Option<String>,
    cseq: Option<u32>,
    is_invite: bool,
    acks: mpsc::Sender<SipRequest>,
    cancel: CancellationToken,
    last_response: Arc<Mutex<Option<Bytes>>>,
}

struct Shared {
    socket: UdpSocket,
    local_addr: SocketAddr,
    timers: SipTimers,
    clients: Mutex<HashMap<ClientKey, ClientEntry>>,
    servers: Mutex<HashMap<TransactionId, ServerEntry>>,
    shutdown: CancellationToken,
}

/// UDP transaction endpoint
pub struct UdpEndpoint {
    shared: Arc<Shared>,
    incoming: Mutex<mpsc::Receiver<ServerTransaction>>,
}

impl UdpEndpoint {
    pub async fn bind(addr: SocketAddr, timers: SipTimers) -> Result<Self, SipError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket {}: {}", addr, e)))?;
        let local_addr = socket.local_addr()?;
        info!("UDP endpoint listening on {}", local_addr);

        let (tx, rx) = mpsc::channel(1000);
        let shared = Arc::new(Shared {
            socket,
            local_addr,
            timers,
            clients: Mutex::new(HashMap::new()),
            servers: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Self::receive_loop(shared.clone(), tx));

        Ok(Self {
            shared,
            incoming: Mutex::new(rx),
        })
    }

    async fn receive_loop(shared: Arc<Shared>, incoming: mpsc::Sender<ServerTransaction>) {
        let mut buf = vec![0u8; 65535];

        loop {
            let received = tokio::select! {
                r = shared.socket.recv_from(&mut buf) => r,
                _ = shared.shutdown.cancelled() => break,
            };

            let (size, source) = match received {
                Ok(r) => r,
                Err(e) => {
                    // ICMP port unreachable surfaces here on some platforms
                    warn!("Failed to receive UDP packet: {}", e);
                    continue;
                }
            };

            trace!("Received {} bytes from {} via UDP", size, source);
            let message = match SipMessage::parse(&buf[..size]) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Failed to parse SIP message from {}: {}", source, e);
                    continue;
                }
            };

            match message {
                SipMessage::Response(response) => Self::on_response(&shared, response).await,
                SipMessage::Request(request) => {
                    if !Self::on_request(&shared, request, source, &incoming).await {
                        break;
                    }
                }
            }
        }
        debug!("UDP receive loop on {} stopped", shared.local_addr);
    }

    async fn on_response(shared: &Arc<Shared>, response: SipResponse) {
        let Some(key) = ClientKey::for_response(&response) else {
            warn!("Dropping response without Via branch or CSeq");
            return;
        };

        debug!(status = response.status_code(), branch = %key.branch.0, method = %key.method, "<- response");
        let is_final = !response.is_provisional();
        let (handle, ack) = {
            let mut clients = shared.clients.lock().await;
            let Some(entry) = clients.get_mut(&key) else {
                debug!(branch = %key.branch.0, "No client transaction for response");
                return;
            };
            entry.answered = true;

            // Non-2xx finals to INVITE are acknowledged here, 2xx by the dialog
            let ack = if entry.is_invite() && response.status_code() >= 300 {
                non_2xx_ack(&entry.request, &response)
            } else {
                None
            };

            let handle = entry.handle.clone();
            if is_final {
                entry.done.cancel();
                clients.remove(&key);
            }
            (handle, ack)
        };

        if !handle.deliver(response).await && !is_final {
            shared.clients.lock().await.remove(&key);
        }

        if let Some(ack) = ack {
            match Self::destination(&ack).await {
                Ok(destination) => {
                    if let Err(e) = shared.socket.send_to(&ack.to_bytes(), destination).await {
                        warn!("Failed to send ACK: {}", e);
                    }
                }
                Err(e) => warn!("Cannot route ACK: {}", e),
            }
        }
    }

    /// Returns false once the incoming queue is gone.
    async fn on_request(
        shared: &Arc<Shared>,
        mut request: SipRequest,
        source: SocketAddr,
        incoming: &mpsc::Sender<ServerTransaction>,
    ) -> bool {
        if let Some(via) = request.header("via") {
            let stamped = add_rport_and_received(&via, source);
            replace_top_via(&mut request, &stamped);
        }
        debug!(method = ?request.method(), source = %source, "<- request");
        trace!("{}", request);

        let id = TransactionId::from_request(&request).unwrap_or_else(TransactionId::generate);

        match request.method() {
            Some(SipMethod::Ack) => {
                Self::on_ack(shared, &id, &request).await;
                // 2xx ACKs are end-to-end and also reach the dialog layer
                let (tx, handle) = ServerTransaction::new(request);
                handle.terminate();
                return incoming.send(tx).await.is_ok();
            }
            Some(SipMethod::Cancel) => {
                Self::on_cancel(shared, &id, &request, source).await;
                return true;
            }
            _ => {}
        }

        // Retransmission of a request we already have a transaction for
        {
            let servers = shared.servers.lock().await;
            if let Some(entry) = servers.get(&id) {
                let last = entry.last_response.lock().await.clone();
                if let Some(bytes) = last {
                    let _ = shared.socket.send_to(&bytes, source).await;
                }
                return true;
            }
        }

        let is_invite = request.is_method(SipMethod::Invite);
        let (ack_tx, ack_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let last_response = Arc::new(Mutex::new(None));
        shared.servers.lock().await.insert(
            id.clone(),
            ServerEntry {
                call_id: request.call_id(),
                cseq: request.cseq(),
                is_invite,
                acks: ack_tx,
                cancel: cancel.clone(),
                last_response: last_response.clone(),
            },
        );

        let (tx, handle) = ServerTransaction::new(request.clone());
        tokio::spawn(Self::serve_transaction(
            shared.clone(),
            handle,
            request,
            source,
            ack_rx,
            cancel,
            last_response,
        ));
        incoming.send(tx).await.is_ok()
    }

    async fn on_ack(shared: &Arc<Shared>, id: &TransactionId, ack: &SipRequest) {
        let servers = shared.servers.lock().await;
        // Non-2xx ACK reuses the INVITE branch; 2xx ACK matches on Call-ID and CSeq
        let entry = servers.get(id).or_else(|| {
            servers.values().find(|e| {
                e.is_invite && e.call_id == ack.call_id() && e.cseq.is_some() && e.cseq == ack.cseq()
            })
        });
        if let Some(entry) = entry {
            let _ = entry.acks.try_send(ack.clone());
        }
    }

    async fn on_cancel(shared: &Arc<Shared>, id: &TransactionId, cancel: &SipRequest, source: SocketAddr) {
        let found = {
            let servers = shared.servers.lock().await;
            match servers.get(id) {
                Some(entry) if entry.is_invite => {
                    entry.cancel.cancel();
                    true
                }
                _ => false,
            }
        };

        let code = if found { 200 } else { 481 };
        let response = ResponseBuilder::new(code).build_for_request(cancel);
        if let Err(e) = shared.socket.send_to(&response.to_bytes(), source).await {
            warn!("Failed to answer CANCEL: {}", e);
        }
    }

    async fn serve_transaction(
        shared: Arc<Shared>,
        mut handle: ServerTransactionHandle,
        request: SipRequest,
        destination: SocketAddr,
        mut acks: mpsc::Receiver<SipRequest>,
        cancelled: CancellationToken,
        last_response: Arc<Mutex<Option<Bytes>>>,
    ) {
        let timers = shared.timers;
        let send = |response: SipResponse| {
            let shared = shared.clone();
            let last_response = last_response.clone();
            async move {
                debug!(status = response.status_code(), destination = %destination, "-> response");
                let bytes = response.to_bytes();
                *last_response.lock().await = Some(bytes.clone());
                if let Err(e) = shared.socket.send_to(&bytes, destination).await {
                    error!("Failed to send response to {}: {}", destination, e);
                }
            }
        };

        let final_status = loop {
            tokio::select! {
                response = handle.next_response() => match response {
                    Some(response) => {
                        let code = response.status_code();
                        send(response).await;
                        if code >= 200 {
                            break Some(code);
                        }
                    }
                    None => break None,
                },
                _ = cancelled.cancelled() => {
                    send(ResponseBuilder::new(487).build_for_request(&request)).await;
                    handle.fail("request terminated by CANCEL");
                    break Some(487);
                }
                _ = shared.shutdown.cancelled() => {
                    handle.fail("endpoint closed");
                    break None;
                }
            }
        };

        if request.is_method(SipMethod::Invite) {
            match final_status {
                Some(code) if (200..300).contains(&code) => {
                    let deadline = tokio::time::sleep(timers.timer_l());
                    tokio::pin!(deadline);
                    let mut acked = false;
                    loop {
                        tokio::select! {
                            ack = acks.recv() => match ack {
                                Some(ack) => {
                                    acked = true;
                                    handle.deliver_ack(ack).await;
                                }
                                None => break,
                            },
                            _ = &mut deadline => break,
                            _ = shared.shutdown.cancelled() => break,
                        }
                    }
                    if acked {
                        handle.terminate();
                    } else {
                        handle.fail("no ACK received for 2xx");
                    }
                }
                Some(_) => {
                    tokio::select! {
                        ack = acks.recv() => {
                            if let Some(ack) = ack {
                                handle.deliver_ack(ack).await;
                            }
                            handle.terminate();
                        }
                        _ = tokio::time::sleep(timers.timer_h()) => handle.fail("ACK timeout"),
                        _ = shared.shutdown.cancelled() => handle.fail("endpoint closed"),
                    }
                }
                None => handle.terminate(),
            }
        } else {
            handle.terminate();
        }

        // Keep the entry around briefly to absorb retransmissions
        tokio::time::sleep(timers.t4).await;
        shared.servers.lock().await.remove(&handle.id);
    }

    /// Timer B/F, and cleanup once the requester walks away. An INVITE that
    /// got a provisional answer outlives Timer B and waits for its final
    /// response or for the caller to drop it.
    async fn watch_client(
        shared: Arc<Shared>,
        key: ClientKey,
        watch: ClientTransactionHandle,
        done: CancellationToken,
    ) {
        let timer_b = tokio::time::sleep(shared.timers.timer_b());
        tokio::pin!(timer_b);
        let mut expired = false;
        loop {
            tokio::select! {
                _ = &mut timer_b, if !expired => {
                    expired = true;
                    let clients = shared.clients.lock().await;
                    let waiting = clients
                        .get(&key)
                        .map(|e| e.is_invite() && e.answered)
                        .unwrap_or(false);
                    if !waiting {
                        if clients.contains_key(&key) {
                            debug!(branch = %key.branch.0, "Client transaction timed out");
                        }
                        break;
                    }
                }
                _ = watch.closed() => {
                    trace!(branch = %key.branch.0, "Client transaction dropped by requester");
                    break;
                }
                _ = done.cancelled() => return,
                _ = shared.shutdown.cancelled() => break,
            }
        }
        shared.clients.lock().await.remove(&key);
    }

    async fn destination(request: &SipRequest) -> Result<SocketAddr, SipError> {
        let uri = request.request_uri()?;
        let target = format!("{}:{}", bracket(uri.host()), uri.port_or_default());
        tokio::net::lookup_host(&target)
            .await?
            .next()
            .ok_or_else(|| SipError::TransportError(format!("Cannot resolve {}", target)))
    }

    async fn send_request(&self, request: &SipRequest) -> Result<(), SipError> {
        let destination = Self::destination(request).await?;
        debug!(method = ?request.method(), destination = %destination, "-> request");
        trace!("{}", request);
        self.shared
            .socket
            .send_to(&request.to_bytes(), destination)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;
        Ok(())
    }
}

fn bracket(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

/// ACK for a non-2xx final response (RFC 3261 17.1.1.3)
fn non_2xx_ack(request: &SipRequest, response: &SipResponse) -> Option<SipRequest> {
    let mut ack = SipRequest::with_method(SipMethod::Ack, &request.request_uri().ok()?).ok()?;
    ack.push_header("Via", request.header("via")?);
    ack.push_header("From", request.header("from")?);
    ack.push_header("To", response.header("to")?);
    ack.push_header("Call-ID", request.call_id()?);
    ack.push_header("CSeq", format!("{} {}", request.cseq()?, SipMethod::Ack));
    ack.push_header("Max-Forwards", "70");
    ack.push_header("Content-Length", "0");
    Some(ack)
}

fn replace_top_via(request: &mut SipRequest, value: &str) {
    let mut replaced = false;
    let headers: Vec<rsip::Header> = request
        .headers()
        .iter()
        .map(|h| match h {
            rsip::Header::Via(_) if !replaced => {
                replaced = true;
                rsip::Header::Via(value.to_string().into())
            }
            other => other.clone(),
        })
        .collect();
    request.inner.headers = rsip::Headers::from(headers);
}

#[async_trait]
impl Endpoint for UdpEndpoint {
    fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }

    async fn request(&self, mut request: SipRequest) -> Result<ClientTransaction, SipError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(SipError::TransportError("endpoint closed".to_string()));
        }

        let id = prepare_request(&mut request, TransportProtocol::Udp, self.shared.local_addr);
        let key = ClientKey::for_request(&id, &request)
            .ok_or_else(|| SipError::InvalidMessage("request without a known method".to_string()))?;
        let (tx, handle) = ClientTransaction::new(id.clone(), request.clone());
        let watch = handle.clone();
        let done = CancellationToken::new();
        self.shared.clients.lock().await.insert(
            key.clone(),
            ClientEntry {
                handle,
                request: request.clone(),
                answered: false,
                done: done.clone(),
            },
        );

        if let Err(e) = self.send_request(&request).await {
            self.shared.clients.lock().await.remove(&key);
            return Err(e);
        }

        tokio::spawn(Self::watch_client(self.shared.clone(), key, watch, done));
        Ok(tx)
    }

    async fn write(&self, mut request: SipRequest) -> Result<(), SipError> {
        prepare_request(&mut request, TransportProtocol::Udp, self.shared.local_addr);
        self.send_request(&request).await
    }

    async fn accept(&self) -> Option<ServerTransaction> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            tx = incoming.recv() => tx,
            _ = self.shared.shutdown.cancelled() => None,
        }
    }

    fn close(&self) {
        if !self.shared.shutdown.is_cancelled() {
            info!("Closing UDP endpoint {}", self.shared.local_addr);
            self.shared.shutdown.cancel();
        }
    }
}

impl Drop for UdpEndpoint {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

/// Binds [`UdpEndpoint`]s; stream transports are rejected
#[derive(Debug, Clone, Default)]
pub struct UdpEndpointFactory {
    timers: SipTimers,
}

impl UdpEndpointFactory {
    pub fn new(timers: SipTimers) -> Self {
        Self { timers }
    }
}

#[async_trait]
impl EndpointFactory for UdpEndpointFactory {
    async fn bind(&self, addr: &ListenAddr) -> Result<Arc<dyn Endpoint>, SipError> {
        let protocol = addr.protocol()?;
        if protocol != TransportProtocol::Udp {
            return Err(SipError::TransportError(format!(
                "Transport {} is not supported",
                protocol.as_str()
            )));
        }

        let socket_addr = tokio::net::lookup_host(&addr.addr)
            .await?
            .next()
            .ok_or_else(|| SipError::TransportError(format!("Cannot resolve {}", addr.addr)))?;
        let endpoint = UdpEndpoint::bind(socket_addr, self.timers).await?;
        Ok(Arc::new(endpoint))
    }
}
