//! Phone facade
//!
//! A `Phone` only holds configuration. Every workflow binds its own
//! endpoint and releases it when done, so one phone can register, dial and
//! answer at the same time.

use super::error::{PhoneError, Result};
use crate::config::PhoneConfig;
use crate::domain::shared::SipUri;
use crate::infrastructure::media::MediaSession;
use crate::infrastructure::protocols::sip::{
    Endpoint, EndpointFactory, ListenAddr, ResponseBuilder, ServerTransaction, SipMethod, SipTimers,
    UdpEndpointFactory,
};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_USER_AGENT: &str = "yakphone";

#[derive(Clone)]
pub struct Phone {
    factory: Arc<dyn EndpointFactory>,
    listen_addrs: Vec<ListenAddr>,
    user_agent: String,
    hostname: Option<String>,
}

pub struct PhoneBuilder {
    listen_addrs: Vec<ListenAddr>,
    user_agent: String,
    hostname: Option<String>,
    timers: SipTimers,
    factory: Option<Arc<dyn EndpointFactory>>,
}

impl PhoneBuilder {
    /// Add a listen address. Only `udp` is served by the bundled transport.
    pub fn listen_addr(mut self, addr: ListenAddr) -> Self {
        self.listen_addrs.push(addr);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Host used in From headers instead of the local address
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn sip_timers(mut self, timers: SipTimers) -> Self {
        self.timers = timers;
        self
    }

    /// Replace the UDP transport
    pub fn endpoint_factory(mut self, factory: Arc<dyn EndpointFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn build(self) -> Phone {
        let timers = self.timers;
        Phone {
            factory: self
                .factory
                .unwrap_or_else(|| Arc::new(UdpEndpointFactory::new(timers))),
            listen_addrs: self.listen_addrs,
            user_agent: self.user_agent,
            hostname: self.hostname,
        }
    }
}

impl Phone {
    pub fn builder() -> PhoneBuilder {
        PhoneBuilder {
            listen_addrs: Vec::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            hostname: None,
            timers: SipTimers::default(),
            factory: None,
        }
    }

    pub fn from_config(config: &PhoneConfig) -> Self {
        let mut builder = Self::builder()
            .user_agent(config.user_agent.clone())
            .sip_timers(SipTimers::with_t1(Duration::from_millis(config.sip_timers.t1_ms)));
        for addr in &config.listen {
            builder = builder.listen_addr(addr.clone());
        }
        if let Some(hostname) = &config.hostname {
            builder = builder.hostname(hostname.clone());
        }
        builder.build()
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn listen_addrs(&self) -> &[ListenAddr] {
        &self.listen_addrs
    }

    /// Local host and port for `network`.
    ///
    /// A configured address wins. Port 0 is kept so the bind picks a free
    /// port. Without configuration the first non-loopback IPv4 interface is
    /// used.
    pub(crate) fn interface_host_port(&self, network: &str) -> Result<(String, u16)> {
        if let Some(addr) = self
            .listen_addrs
            .iter()
            .find(|a| a.network.eq_ignore_ascii_case(network))
        {
            return split_host_port(&addr.addr);
        }

        let ip = resolve_interface_ip()?;
        Ok((ip.to_string(), 0))
    }

    pub(crate) async fn bind(&self, network: &str, host: &str, port: u16) -> Result<Arc<dyn Endpoint>> {
        let addr = ListenAddr::new(network, join_host_port(host, port));
        let endpoint = self.factory.bind(&addr).await?;
        info!(network = %network, addr = %endpoint.local_addr(), "Listening on");
        Ok(endpoint)
    }

    /// Listeners for Answer: configured addresses, or one UDP interface address
    pub(crate) async fn bind_listeners(&self) -> Result<Vec<(ListenAddr, Arc<dyn Endpoint>)>> {
        let addrs = if self.listen_addrs.is_empty() {
            let (host, port) = self.interface_host_port("udp")?;
            vec![ListenAddr::new("udp", join_host_port(&host, port))]
        } else {
            self.listen_addrs.clone()
        };

        let mut listeners = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let endpoint = match self.factory.bind(&addr).await {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    for (_, endpoint) in &listeners {
                        endpoint.close();
                    }
                    return Err(e.into());
                }
            };
            info!(network = %addr.network, addr = %endpoint.local_addr(), "Listening on");
            listeners.push((addr, endpoint));
        }
        Ok(listeners)
    }

    /// Contact for a local transport address
    pub(crate) fn contact_uri(&self, host: &str, port: u16, network: &str) -> SipUri {
        SipUri::new(Some(self.user_agent.clone()), host, Some(port))
            .with_param("transport", Some(&network.to_ascii_lowercase()))
    }

    /// Our identity in From headers
    pub(crate) fn from_uri(&self, host: &str) -> SipUri {
        let host = self.hostname.as_deref().unwrap_or(host);
        SipUri::new(Some(self.user_agent.clone()), host, None)
    }

    /// Media session on `host`, or on an interface address if `host` is not a usable IP
    pub(crate) async fn media_session(&self, host: &str, formats: &[String]) -> Result<MediaSession> {
        let ip = match host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
            Ok(ip) if !ip.is_unspecified() => ip,
            _ => resolve_interface_ip()?,
        };

        let mut media = MediaSession::new(ip).await?;
        media.set_formats(formats.to_vec());
        Ok(media)
    }
}

impl fmt::Debug for Phone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Phone")
            .field("listen_addrs", &self.listen_addrs)
            .field("user_agent", &self.user_agent)
            .field("hostname", &self.hostname)
            .finish()
    }
}

/// First non-loopback IPv4 address
pub(crate) fn resolve_interface_ip() -> Result<IpAddr> {
    let interfaces = get_if_addrs::get_if_addrs()
        .map_err(|e| PhoneError::Config(format!("Cannot list interfaces: {}", e)))?;
    for iface in interfaces {
        if !iface.is_loopback() {
            if let get_if_addrs::IfAddr::V4(ref addr) = iface.addr {
                return Ok(IpAddr::V4(addr.ip));
            }
        }
    }
    Err(PhoneError::Config("No IPv4 interface found".to_string()))
}

/// Host for Contact: the bound IP, or an interface address when bound to any
pub(crate) fn contact_host(local: SocketAddr) -> Result<String> {
    let ip = match local.ip() {
        ip if ip.is_unspecified() => resolve_interface_ip()?,
        ip => ip,
    };
    Ok(ip.to_string())
}

pub(crate) fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let invalid = || PhoneError::Config(format!("Invalid address {}", addr));

    if let Some(rest) = addr.strip_prefix('[') {
        let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
        return Ok((host.to_string(), port.parse().map_err(|_| invalid())?));
    }
    match addr.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), port.parse().map_err(|_| invalid())?)),
        None => Ok((addr.to_string(), 0)),
    }
}

pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Send a response, logging instead of failing when the transaction is gone
pub(crate) fn respond(tx: &ServerTransaction, response: ResponseBuilder) {
    let response = response.build_for_request(tx.request());
    debug!(status = response.status_code(), method = ?tx.method(), "Sending response");
    if let Err(e) = tx.respond(response) {
        warn!(error = %e, "Failed to respond");
    }
}

/// Reply to requests outside any dialog: OPTIONS gets 200, the rest 405
pub(crate) fn respond_out_of_dialog(tx: &ServerTransaction) {
    let code = match tx.method() {
        Some(SipMethod::Ack) => return,
        Some(SipMethod::Options) => 200,
        _ => 405,
    };
    respond(tx, ResponseBuilder::new(code));
}

/// Serve OPTIONS keep-alives on an endpoint until `cancel`
pub(crate) fn spawn_options_responder(endpoint: Arc<dyn Endpoint>, cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            let tx = tokio::select! {
                tx = endpoint.accept() => tx,
                _ = cancel.cancelled() => None,
            };
            match tx {
                Some(tx) => respond_out_of_dialog(&tx),
                None => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("127.0.0.1:5060").unwrap(), ("127.0.0.1".to_string(), 5060));
        assert_eq!(split_host_port("[::1]:0").unwrap(), ("::1".to_string(), 0));
        assert_eq!(split_host_port("pbx.local").unwrap(), ("pbx.local".to_string(), 0));
        assert!(split_host_port("host:port").is_err());
        assert_eq!(join_host_port("::1", 5060), "[::1]:5060");
    }

    #[test]
    fn test_contact_host_keeps_bound_ip() {
        let addr: SocketAddr = "10.2.3.4:5070".parse().unwrap();
        assert_eq!(contact_host(addr).unwrap(), "10.2.3.4");
    }

    #[test]
    fn test_configured_listen_addr_wins() {
        let phone = Phone::builder()
            .listen_addr(ListenAddr::new("udp", "10.1.1.1:0"))
            .build();
        assert_eq!(
            phone.interface_host_port("UDP").unwrap(),
            ("10.1.1.1".to_string(), 0)
        );
    }

    #[test]
    fn test_contact_and_from() {
        let phone = Phone::builder().user_agent("alice").hostname("example.org").build();
        let contact = phone.contact_uri("10.0.0.5", 5070, "UDP");
        assert_eq!(contact.to_string(), "sip:alice@10.0.0.5:5070;transport=udp");
        assert_eq!(phone.from_uri("10.0.0.5").to_string(), "sip:alice@example.org");
    }

    #[tokio::test]
    async fn test_media_session_on_loopback() {
        let phone = Phone::builder().build();
        let media = phone
            .media_session("127.0.0.1", &["8".to_string()])
            .await
            .unwrap();
        assert_eq!(media.formats(), &["8".to_string()]);
    }
}
