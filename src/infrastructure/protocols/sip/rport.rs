//! RPORT support for NAT traversal (RFC 3581)
//!
//! The server stamps `received`/`rport` on the top Via of requests it gets;
//! the client reads them back from the response to learn its public address.

use crate::domain::shared::SipUri;
use rsip::Param;
use std::net::SocketAddr;
use tracing::{debug, info};

fn via_params(via_header: &str) -> Vec<Param> {
    rsip::headers::Via::from(via_header.to_string())
        .params()
        .unwrap_or_default()
}

/// `None` when absent, `Some(None)` for a bare `rport`
fn rport_param(params: &[Param]) -> Option<Option<String>> {
    params.iter().find_map(|param| match param {
        Param::Other(key, value) if key.value().eq_ignore_ascii_case("rport") => {
            Some(value.as_ref().map(|v| v.value().to_string()))
        }
        _ => None,
    })
}

/// Add an empty rport parameter to a Via value
pub fn add_rport_to_via_string(via_header: &str) -> String {
    if has_rport_parameter(via_header) {
        via_header.to_string()
    } else {
        format!("{};rport", via_header)
    }
}

/// Extract rport value from Via header
///
/// Returns the port number if rport parameter is present with a value
pub fn extract_rport_from_via(via_header: &str) -> Option<u16> {
    rport_param(&via_params(via_header))?.and_then(|port| port.parse().ok())
}

/// Extract received parameter from Via header
pub fn extract_received_from_via(via_header: &str) -> Option<String> {
    via_params(via_header).iter().find_map(|param| match param {
        Param::Received(received) if !received.value().is_empty() => {
            Some(received.value().to_string())
        }
        _ => None,
    })
}

pub fn has_rport_parameter(via_header: &str) -> bool {
    rport_param(&via_params(via_header)).is_some()
}

/// Fill `received` and `rport` from the packet source, as a server does for
/// incoming requests. Only an rport the client asked for gets a value.
pub fn add_rport_and_received(via_header: &str, source_addr: SocketAddr) -> String {
    let mut parts: Vec<String> = via_header
        .split(';')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.to_ascii_lowercase().starts_with("received="))
        .collect();

    for part in parts.iter_mut().skip(1) {
        if part.eq_ignore_ascii_case("rport") {
            *part = format!("rport={}", source_addr.port());
        }
    }
    parts.push(format!("received={}", source_addr.ip()));

    debug!(source = %source_addr, "Stamped received/rport on Via");
    parts.join(";")
}

/// Public address reported by the server in a response Via.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatAddress {
    pub host: Option<String>,
    pub port: u16,
}

impl NatAddress {
    /// Read the observed address from a response Via. Nothing is learned
    /// unless the server filled in `rport`; `received` only counts alongside it.
    pub fn from_via(via_header: &str) -> Option<Self> {
        let port = extract_rport_from_via(via_header)?;
        Some(Self {
            host: extract_received_from_via(via_header),
            port,
        })
    }

    /// Rewrite a contact URI to the observed address
    pub fn apply(&self, contact: SipUri) -> SipUri {
        let contact = contact.with_port(Some(self.port));
        let contact = match &self.host {
            Some(host) => contact.with_host(host.clone()),
            None => contact,
        };
        info!(contact = %contact, "Contact corrected from rport/received");
        contact
    }
}
