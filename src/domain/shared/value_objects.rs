//! Value Objects - Immutable objects defined by their attributes

use super::error::{DomainError, Result};
use std::fmt;

/// SIP URI value object
///
/// Covers the parts of RFC 3261 URIs a user agent needs: scheme, user info,
/// host, port and parameters. URI headers (`?...`) are dropped on parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    scheme: String,
    user: Option<String>,
    password: Option<String>,
    host: String,
    port: Option<u16>,
    params: Vec<(String, Option<String>)>,
}

impl SipUri {
    pub fn new(user: Option<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            scheme: "sip".to_string(),
            user,
            password: None,
            host: host.into(),
            port,
            params: Vec::new(),
        }
    }

    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        let (scheme, rest) = uri
            .split_once(':')
            .ok_or_else(|| DomainError::ValidationError(format!("missing scheme in {}", uri)))?;
        let scheme = scheme.to_ascii_lowercase();
        if scheme != "sip" && scheme != "sips" {
            return Err(DomainError::ValidationError(format!(
                "URI must start with 'sip:' or 'sips:', got {}",
                uri
            )));
        }

        let rest = rest.split('?').next().unwrap_or_default();
        let (userinfo, hostpart) = match rest.rsplit_once('@') {
            Some((userinfo, hostpart)) => (Some(userinfo), hostpart),
            None => (None, rest),
        };

        let (user, password) = match userinfo {
            Some(info) => match info.split_once(':') {
                Some((user, password)) => (Some(user.to_string()), Some(password.to_string())),
                None => (Some(info.to_string()), None),
            },
            None => (None, None),
        };

        let mut parts = hostpart.split(';');
        let hostport = parts.next().unwrap_or_default();
        let params = parts
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((name, value)) => (name.to_string(), Some(value.to_string())),
                None => (p.to_string(), None),
            })
            .collect();

        let (host, port) = split_host_port(hostport)?;
        if host.is_empty() {
            return Err(DomainError::ValidationError(format!("missing host in {}", uri)));
        }

        Ok(Self {
            scheme,
            user: user.filter(|u| !u.is_empty()),
            password,
            host,
            port,
            params,
        })
    }

    /// Parse the URI out of a name-addr header value such as
    /// `"Bob" <sip:bob@example.com>;tag=1234`.
    pub fn from_name_addr(value: &str) -> Result<Self> {
        let value = value.trim();
        if let Some(start) = value.find('<') {
            let end = value[start..]
                .find('>')
                .ok_or_else(|| DomainError::ValidationError(format!("unterminated <> in {}", value)))?;
            return Self::parse(&value[start + 1..start + end]);
        }
        // addr-spec form: header parameters follow the first ';'
        Self::parse(value.split(';').next().unwrap_or_default())
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn port_or_default(&self) -> u16 {
        self.port
            .unwrap_or(if self.scheme == "sips" { 5061 } else { 5060 })
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    /// Transport named by the `transport` parameter, `udp` when absent.
    pub fn transport(&self) -> String {
        self.param("transport")
            .filter(|t| !t.is_empty())
            .map(|t| t.to_ascii_lowercase())
            .unwrap_or_else(|| "udp".to_string())
    }

    /// `host` or `host:port`, with brackets around IPv6 hosts.
    pub fn host_port(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.port {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn with_param(mut self, name: &str, value: Option<&str>) -> Self {
        self.params.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.params
            .push((name.to_string(), value.map(|v| v.to_string())));
        self
    }

    pub fn without_password(mut self) -> Self {
        self.password = None;
        self
    }

    pub fn without_params(mut self) -> Self {
        self.params.clear();
        self
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}", user)?;
            if let Some(password) = &self.password {
                write!(f, ":{}", password)?;
            }
            write!(f, "@")?;
        }
        write!(f, "{}", self.host_port())?;
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for SipUri {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn split_host_port(hostport: &str) -> Result<(String, Option<u16>)> {
    let invalid_port =
        |p: &str| DomainError::ValidationError(format!("invalid port {} in {}", p, hostport));

    if let Some(stripped) = hostport.strip_prefix('[') {
        let (host, tail) = stripped
            .split_once(']')
            .ok_or_else(|| DomainError::ValidationError(format!("unterminated IPv6 host {}", hostport)))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p.parse().map_err(|_| invalid_port(p))?),
            None => None,
        };
        return Ok((host.to_string(), port));
    }

    match hostport.rsplit_once(':') {
        Some((host, p)) => Ok((host.to_string(), Some(p.parse().map_err(|_| invalid_port(p))?))),
        None => Ok((hostport.to_string(), None)),
    }
}
