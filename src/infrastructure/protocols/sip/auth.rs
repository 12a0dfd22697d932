//! SIP Digest Authentication (RFC 2617, RFC 3261)
//!
//! Both directions live here: answering a 401/407 challenge on outgoing
//! requests, and challenging incoming INVITEs when the phone answers with a
//! password configured.

use super::builder::ResponseBuilder;
use super::message::{SipError, SipRequest, SipResponse};
use rand::Rng;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Realm used when answering with a password but no realm configured
pub const DEFAULT_REALM: &str = "sipgo";

/// Authentication challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: String,
    pub opaque: Option<String>,
    pub qop: Option<String>,
}

impl DigestChallenge {
    /// Create a new authentication challenge
    pub fn new(realm: &str) -> Self {
        Self {
            realm: realm.to_string(),
            nonce: generate_nonce(),
            algorithm: "MD5".to_string(),
            opaque: None,
            qop: None,
        }
    }

    /// Parse a WWW-Authenticate / Proxy-Authenticate value
    pub fn parse(value: &str) -> Result<Self, SipError> {
        let params = parse_digest_params(value)?;
        let realm = params
            .get("realm")
            .ok_or_else(|| SipError::Authentication("Missing realm in challenge".to_string()))?;
        let nonce = params
            .get("nonce")
            .ok_or_else(|| SipError::Authentication("Missing nonce in challenge".to_string()))?;

        let algorithm = params
            .get("algorithm")
            .cloned()
            .unwrap_or_else(|| "MD5".to_string());
        if !algorithm.eq_ignore_ascii_case("MD5") {
            return Err(SipError::Authentication(format!(
                "Unsupported digest algorithm {}",
                algorithm
            )));
        }

        Ok(Self {
            realm: realm.clone(),
            nonce: nonce.clone(),
            algorithm,
            opaque: params.get("opaque").cloned(),
            qop: params.get("qop").cloned(),
        })
    }

    /// Format as WWW-Authenticate header value
    pub fn to_header_value(&self) -> String {
        let mut value = format!(
            r#"Digest realm="{}", nonce="{}", algorithm={}"#,
            self.realm, self.nonce, self.algorithm
        );
        if let Some(opaque) = &self.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        if let Some(qop) = &self.qop {
            value.push_str(&format!(r#", qop="{}""#, qop));
        }
        value
    }

    /// Whether the challenge offers `qop=auth`
    fn offers_qop_auth(&self) -> bool {
        self.qop
            .as_deref()
            .map(|q| q.split(',').any(|v| v.trim().eq_ignore_ascii_case("auth")))
            .unwrap_or(false)
    }
}

fn generate_nonce() -> String {
    let random_bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(random_bytes)
}

/// Parsed Authorization header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: Option<String>,
    pub opaque: Option<String>,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
}

impl DigestCredentials {
    /// Parse Authorization header from request
    pub fn from_request(request: &SipRequest) -> Result<Self, SipError> {
        let value = request
            .header("authorization")
            .or_else(|| request.header("proxy-authorization"))
            .ok_or_else(|| SipError::Authentication("No Authorization header found".to_string()))?;

        debug!("Parsing Authorization header: {}", value);
        Self::parse(&value)
    }

    pub fn parse(value: &str) -> Result<Self, SipError> {
        let params = parse_digest_params(value)?;
        let required = |name: &str| {
            params.get(name).cloned().ok_or_else(|| {
                SipError::Authentication(format!("Missing {} in Authorization", name))
            })
        };

        Ok(Self {
            username: required("username")?,
            realm: required("realm")?,
            nonce: required("nonce")?,
            uri: required("uri")?,
            response: required("response")?,
            algorithm: params.get("algorithm").cloned(),
            opaque: params.get("opaque").cloned(),
            qop: params.get("qop").cloned(),
            nc: params.get("nc").cloned(),
            cnonce: params.get("cnonce").cloned(),
        })
    }

    pub fn to_header_value(&self) -> String {
        let mut value = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm={}"#,
            self.username,
            self.realm,
            self.nonce,
            self.uri,
            self.response,
            self.algorithm.as_deref().unwrap_or("MD5"),
        );
        if let Some(opaque) = &self.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        if let (Some(qop), Some(nc), Some(cnonce)) = (&self.qop, &self.nc, &self.cnonce) {
            value.push_str(&format!(r#", qop={}, nc={}, cnonce="{}""#, qop, nc, cnonce));
        }
        value
    }
}

/// Parse `key=value` pairs of a Digest header, honouring quoted commas.
fn parse_digest_params(value: &str) -> Result<HashMap<String, String>, SipError> {
    let value = value.trim();
    let digest_str = match value.split_once(char::is_whitespace) {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("digest") => rest.trim(),
        _ => {
            return Err(SipError::Authentication(format!(
                "Not a Digest header: {}",
                value
            )))
        }
    };

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in digest_str.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    let params = parts
        .iter()
        .filter_map(|part| part.trim().split_once('='))
        .map(|(key, value)| {
            (
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            )
        })
        .collect();
    Ok(params)
}

/// Calculate digest response
#[allow(clippy::too_many_arguments)]
pub fn calculate_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<&str>,
    nc: Option<&str>,
    cnonce: Option<&str>,
) -> String {
    // HA1 = MD5(username:realm:password)
    let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));

    // HA2 = MD5(method:uri)
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));

    match (qop, nc, cnonce) {
        (Some(qop), Some(nc), Some(cnonce)) => format!(
            "{:x}",
            md5::compute(format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2))
        ),
        _ => format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, ha2))),
    }
}

/// Answer a 401/407 challenge: returns a copy of `request` carrying
/// credentials, with a bumped CSeq and no Via so a new branch is generated.
pub fn authorize_request(
    request: &SipRequest,
    response: &SipResponse,
    username: &str,
    password: &str,
) -> Result<SipRequest, SipError> {
    let (challenge_header, auth_header) = match response.status_code() {
        401 => ("WWW-Authenticate", "Authorization"),
        407 => ("Proxy-Authenticate", "Proxy-Authorization"),
        code => {
            return Err(SipError::Authentication(format!(
                "Response {} is not an authentication challenge",
                code
            )))
        }
    };

    let challenge = response
        .header(challenge_header)
        .ok_or_else(|| SipError::Authentication(format!("{} header missing", challenge_header)))
        .and_then(|value| DigestChallenge::parse(&value))?;

    let method = request
        .method()
        .ok_or_else(|| SipError::InvalidMessage("Unknown request method".to_string()))?;
    let uri = request.uri().to_string();

    let (qop, nc, cnonce) = if challenge.offers_qop_auth() {
        let cnonce: [u8; 8] = rand::thread_rng().gen();
        (
            Some("auth".to_string()),
            Some("00000001".to_string()),
            Some(hex::encode(cnonce)),
        )
    } else {
        (None, None, None)
    };

    let credentials = DigestCredentials {
        username: username.to_string(),
        realm: challenge.realm.clone(),
        nonce: challenge.nonce.clone(),
        response: calculate_response(
            username,
            password,
            &challenge.realm,
            &challenge.nonce,
            method.as_str(),
            &uri,
            qop.as_deref(),
            nc.as_deref(),
            cnonce.as_deref(),
        ),
        uri,
        algorithm: Some(challenge.algorithm.clone()),
        opaque: challenge.opaque.clone(),
        qop,
        nc,
        cnonce,
    };

    let mut authorized = request.clone();
    authorized.remove_header("Via");
    authorized.set_header(auth_header, credentials.to_header_value());
    let seq = request.cseq().unwrap_or(0) + 1;
    authorized.set_header("CSeq", format!("{} {}", seq, method));
    Ok(authorized)
}

/// Outcome of checking an incoming INVITE
#[derive(Debug)]
pub enum AuthDecision {
    /// Credentials matched the outstanding challenge
    Authorized,
    /// Send this response and stop processing the request
    Respond(SipResponse),
}

/// Challenges incoming INVITEs against a single configured account.
///
/// Only one challenge is ever issued; a second attempt without credentials
/// gets 403 instead of another 401.
#[derive(Debug)]
pub struct InviteAuthenticator {
    username: String,
    password: String,
    realm: String,
    challenge: Option<DigestChallenge>,
}

impl InviteAuthenticator {
    pub fn new(username: &str, password: &str, realm: Option<&str>) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            realm: realm
                .filter(|r| !r.is_empty())
                .unwrap_or(DEFAULT_REALM)
                .to_string(),
            challenge: None,
        }
    }

    /// Whether a challenge has been sent
    pub fn challenged(&self) -> bool {
        self.challenge.is_some()
    }

    pub fn check(&mut self, request: &SipRequest) -> AuthDecision {
        let has_credentials = request.header("authorization").is_some();

        let challenge = match (self.challenge.clone(), has_credentials) {
            (Some(_), false) => {
                warn!("Second INVITE without credentials, rejecting");
                return AuthDecision::Respond(ResponseBuilder::new(403).build_for_request(request));
            }
            (Some(challenge), true) => challenge,
            (None, _) => {
                let challenge = DigestChallenge::new(&self.realm);
                let response = ResponseBuilder::new(401)
                    .header("WWW-Authenticate", challenge.to_header_value())
                    .build_for_request(request);
                self.challenge = Some(challenge);
                return AuthDecision::Respond(response);
            }
        };

        let credentials = match DigestCredentials::from_request(request) {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(error = %e, "Unparsable credentials");
                return AuthDecision::Respond(
                    ResponseBuilder::new(401)
                        .reason("Bad credentials")
                        .build_for_request(request),
                );
            }
        };

        let expected = calculate_response(
            &self.username,
            &self.password,
            &challenge.realm,
            &challenge.nonce,
            "INVITE",
            &credentials.uri,
            credentials.qop.as_deref(),
            credentials.nc.as_deref(),
            credentials.cnonce.as_deref(),
        );

        if credentials.response != expected {
            warn!(username = %credentials.username, "Digest response mismatch");
            return AuthDecision::Respond(ResponseBuilder::new(401).build_for_request(request));
        }

        debug!(username = %credentials.username, "INVITE authorized");
        AuthDecision::Authorized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::shared::SipUri;
    use crate::infrastructure::protocols::sip::builder::RequestBuilder;
    use crate::infrastructure::protocols::sip::message::SipMethod;

    fn invite() -> SipRequest {
        let bob = SipUri::parse("sip:bob@10.0.0.2:5060").unwrap();
        let alice = SipUri::parse("sip:alice@10.0.0.1:5060").unwrap();
        RequestBuilder::new(SipMethod::Invite, bob)
            .from(&alice, "t1")
            .call_id("auth-call")
            .cseq(1)
            .build()
            .unwrap()
    }

    #[test]
    fn test_calculate_response_rfc2617() {
        // RFC 2617 section 3.5 example
        let response = calculate_response(
            "Mufasa",
            "Circle Of Life",
            "testrealm@host.com",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "GET",
            "/dir/index.html",
            Some("auth"),
            Some("00000001"),
            Some("0a4f113b"),
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_challenge_round_trip() {
        let challenge = DigestChallenge::new("example.com");
        let parsed = DigestChallenge::parse(&challenge.to_header_value()).unwrap();
        assert_eq!(parsed, challenge);
    }

    #[test]
    fn test_parse_params_with_quoted_comma() {
        let challenge =
            DigestChallenge::parse(r#"Digest realm="a,b", nonce="n1", qop="auth,auth-int""#).unwrap();
        assert_eq!(challenge.realm, "a,b");
        assert!(challenge.offers_qop_auth());
        assert!(DigestChallenge::parse(r#"Basic realm="x""#).is_err());
    }

    #[test]
    fn test_authorize_request_from_401() {
        let req = invite();
        let challenge = DigestChallenge::new("asterisk");
        let res = ResponseBuilder::new(401)
            .header("WWW-Authenticate", challenge.to_header_value())
            .build_for_request(&req);

        let authorized = authorize_request(&req, &res, "alice", "secret").unwrap();
        assert_eq!(authorized.cseq(), Some(2));
        assert!(authorized.header("via").is_none());

        let creds = DigestCredentials::from_request(&authorized).unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.nonce, challenge.nonce);
        let expected = calculate_response(
            "alice", "secret", "asterisk", &challenge.nonce, "INVITE", &creds.uri, None, None, None,
        );
        assert_eq!(creds.response, expected);
    }

    #[test]
    fn test_authorize_request_from_407_uses_proxy_headers() {
        let req = invite();
        let res = ResponseBuilder::new(407)
            .header("Proxy-Authenticate", DigestChallenge::new("proxy").to_header_value())
            .build_for_request(&req);

        let authorized = authorize_request(&req, &res, "alice", "secret").unwrap();
        assert!(authorized.header("proxy-authorization").is_some());
        assert!(authorized.header("authorization").is_none());

        let not_challenge = ResponseBuilder::new(404).build_for_request(&req);
        assert!(authorize_request(&req, &not_challenge, "a", "b").is_err());
    }

    #[test]
    fn test_invite_authenticator_flow() {
        let mut auth = InviteAuthenticator::new("bob", "pw", None);
        let req = invite();

        // First attempt: challenge
        let challenge_res = match auth.check(&req) {
            AuthDecision::Respond(res) => res,
            AuthDecision::Authorized => panic!("expected challenge"),
        };
        assert_eq!(challenge_res.status_code(), 401);
        assert!(auth.challenged());
        let www = challenge_res.header("www-authenticate").unwrap();
        assert!(www.contains(r#"realm="sipgo""#));

        // Second attempt without credentials: forbidden
        match auth.check(&req) {
            AuthDecision::Respond(res) => assert_eq!(res.status_code(), 403),
            AuthDecision::Authorized => panic!("expected 403"),
        }

        // Wrong password: 401
        let wrong = authorize_request(&req, &challenge_res, "bob", "nope").unwrap();
        match auth.check(&wrong) {
            AuthDecision::Respond(res) => assert_eq!(res.status_code(), 401),
            AuthDecision::Authorized => panic!("expected 401"),
        }

        // Right password
        let right = authorize_request(&req, &challenge_res, "bob", "pw").unwrap();
        assert!(matches!(auth.check(&right), AuthDecision::Authorized));
    }
}
