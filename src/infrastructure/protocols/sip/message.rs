//! SIP message types and parsing

use crate::domain::shared::{DomainError, SipUri};
use bytes::Bytes;
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Header, Headers, Method, Request, Response, StatusCode, Uri, Version};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

impl From<std::io::Error> for SipError {
    fn from(err: std::io::Error) -> Self {
        SipError::TransportError(err.to_string())
    }
}

impl From<DomainError> for SipError {
    fn from(err: DomainError) -> Self {
        SipError::InvalidMessage(err.to_string())
    }
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Update,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Publish => "PUBLISH",
        }
    }

    pub fn from_rsip(method: &Method) -> Option<Self> {
        match method {
            Method::Register => Some(SipMethod::Register),
            Method::Invite => Some(SipMethod::Invite),
            Method::Ack => Some(SipMethod::Ack),
            Method::Cancel => Some(SipMethod::Cancel),
            Method::Bye => Some(SipMethod::Bye),
            Method::Options => Some(SipMethod::Options),
            Method::Info => Some(SipMethod::Info),
            Method::Update => Some(SipMethod::Update),
            Method::Subscribe => Some(SipMethod::Subscribe),
            Method::Notify => Some(SipMethod::Notify),
            Method::Refer => Some(SipMethod::Refer),
            Method::Message => Some(SipMethod::Message),
            Method::Publish => Some(SipMethod::Publish),
            _ => None,
        }
    }

    pub fn to_rsip(&self) -> Method {
        match self {
            SipMethod::Register => Method::Register,
            SipMethod::Invite => Method::Invite,
            SipMethod::Ack => Method::Ack,
            SipMethod::Cancel => Method::Cancel,
            SipMethod::Bye => Method::Bye,
            SipMethod::Options => Method::Options,
            SipMethod::Info => Method::Info,
            SipMethod::Update => Method::Update,
            SipMethod::Subscribe => Method::Subscribe,
            SipMethod::Notify => Method::Notify,
            SipMethod::Refer => Method::Refer,
            SipMethod::Message => Method::Message,
            SipMethod::Publish => Method::Publish,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let method = match name.trim().to_ascii_uppercase().as_str() {
            "REGISTER" => SipMethod::Register,
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "CANCEL" => SipMethod::Cancel,
            "BYE" => SipMethod::Bye,
            "OPTIONS" => SipMethod::Options,
            "INFO" => SipMethod::Info,
            "UPDATE" => SipMethod::Update,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "REFER" => SipMethod::Refer,
            "MESSAGE" => SipMethod::Message,
            "PUBLISH" => SipMethod::Publish,
            _ => return None,
        };
        Some(method)
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Expand compact header forms (RFC 3261 7.3.3) and lowercase.
fn canonical_name(name: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    let long = match name.as_str() {
        "v" => "via",
        "f" => "from",
        "t" => "to",
        "i" => "call-id",
        "m" => "contact",
        "l" => "content-length",
        "c" => "content-type",
        "r" => "refer-to",
        "o" => "event",
        _ => return name,
    };
    long.to_string()
}

/// Split a header into its wire name and value.
pub fn header_name_value(header: &Header) -> (String, String) {
    if let Header::Other(name, value) = header {
        return (name.clone(), value.clone());
    }
    let line = header.to_string();
    match line.split_once(':') {
        Some((name, value)) => (name.trim().to_string(), value.trim().to_string()),
        None => (line.trim().to_string(), String::new()),
    }
}

fn header_is(header: &Header, name: &str) -> bool {
    canonical_name(&header_name_value(header).0) == canonical_name(name)
}

/// First value of the named header, case-insensitive.
pub fn find_header(headers: &Headers, name: &str) -> Option<String> {
    headers
        .iter()
        .find(|h| header_is(h, name))
        .map(|h| header_name_value(h).1)
}

/// All values of the named header, in message order.
pub fn find_headers(headers: &Headers, name: &str) -> Vec<String> {
    headers
        .iter()
        .filter(|h| header_is(h, name))
        .map(|h| header_name_value(h).1)
        .collect()
}

/// Build a header, using the typed rsip variant when one exists.
pub fn make_header(name: &str, value: impl Into<String>) -> Header {
    let value: String = value.into();
    match canonical_name(name).as_str() {
        "via" => Header::Via(value.into()),
        "from" => Header::From(value.into()),
        "to" => Header::To(value.into()),
        "call-id" => Header::CallId(value.into()),
        "cseq" => Header::CSeq(value.into()),
        "contact" => Header::Contact(value.into()),
        "expires" => Header::Expires(value.into()),
        "max-forwards" => Header::MaxForwards(value.into()),
        "content-type" => Header::ContentType(value.into()),
        "content-length" => Header::ContentLength(value.into()),
        "user-agent" => Header::UserAgent(value.into()),
        "allow" => Header::Allow(value.into()),
        "authorization" => Header::Authorization(value.into()),
        "proxy-authorization" => Header::ProxyAuthorization(value.into()),
        "www-authenticate" => Header::WwwAuthenticate(value.into()),
        "proxy-authenticate" => Header::ProxyAuthenticate(value.into()),
        "event" => Header::Event(value.into()),
        _ => Header::Other(name.to_string(), value),
    }
}

fn set_header(headers: &mut Headers, name: &str, value: impl Into<String>) {
    headers.retain(|h| !header_is(h, name));
    headers.push(make_header(name, value));
}

fn remove_header(headers: &mut Headers, name: &str) {
    headers.retain(|h| !header_is(h, name));
}

fn tag_value(tag: Result<Option<rsip::param::Tag>, rsip::Error>) -> Option<String> {
    tag.ok().flatten().map(|tag| tag.value().to_string())
}

fn cseq_number(cseq: Result<&rsip::headers::CSeq, rsip::Error>) -> Option<u32> {
    cseq.ok()?.seq().ok()
}

fn cseq_method(cseq: Result<&rsip::headers::CSeq, rsip::Error>) -> Option<SipMethod> {
    let method = cseq.ok()?.method().ok()?;
    SipMethod::from_rsip(&method)
}

/// Branch of a Via header
pub fn via_branch(via: &rsip::headers::Via) -> Option<String> {
    via.typed().ok()?.branch().map(|branch| branch.to_string())
}

/// Default reason phrase for a status code.
pub fn default_reason(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call Is Being Forwarded",
        182 => "Queued",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        415 => "Unsupported Media Type",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        603 => "Decline",
        _ => "",
    }
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    /// Empty request with only the request line set.
    pub fn with_method(method: SipMethod, uri: &SipUri) -> Result<Self, SipError> {
        let uri = Uri::try_from(uri.to_string().as_str())?;
        Ok(Self::new(Request {
            method: method.to_rsip(),
            uri,
            version: Version::V2,
            headers: Headers::from(Vec::<Header>::new()),
            body: Vec::new(),
        }))
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn is_method(&self, method: SipMethod) -> bool {
        self.method() == Some(method)
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn request_uri(&self) -> Result<SipUri, SipError> {
        Ok(SipUri::parse(&self.inner.uri.to_string())?)
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn header(&self, name: &str) -> Option<String> {
        find_header(&self.inner.headers, name)
    }

    /// Replace every header of this name with a single new value.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        set_header(&mut self.inner.headers, name, value);
    }

    pub fn push_header(&mut self, name: &str, value: impl Into<String>) {
        self.inner.headers.push(make_header(name, value));
    }

    pub fn remove_header(&mut self, name: &str) {
        remove_header(&mut self.inner.headers, name);
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    /// Set the body along with Content-Type and Content-Length.
    pub fn set_body(&mut self, content_type: &str, body: Vec<u8>) {
        self.set_header("Content-Type", content_type);
        self.set_header("Content-Length", body.len().to_string());
        self.inner.body = body;
    }

    pub fn content_type(&self) -> Option<String> {
        self.header("content-type")
    }

    pub fn call_id(&self) -> Option<String> {
        self.header("call-id")
    }

    pub fn from_tag(&self) -> Option<String> {
        tag_value(self.inner.from_header().ok()?.tag())
    }

    pub fn to_tag(&self) -> Option<String> {
        tag_value(self.inner.to_header().ok()?.tag())
    }

    pub fn cseq(&self) -> Option<u32> {
        cseq_number(self.inner.cseq_header())
    }

    pub fn cseq_method(&self) -> Option<SipMethod> {
        cseq_method(self.inner.cseq_header())
    }

    /// Branch of the topmost Via.
    pub fn via_branch(&self) -> Option<String> {
        via_branch(self.inner.via_header().ok()?)
    }

    pub fn contact_uri(&self) -> Option<SipUri> {
        self.header("contact")
            .and_then(|v| SipUri::from_name_addr(&v).ok())
    }

    pub fn start_line(&self) -> String {
        format!("{} {} SIP/2.0", self.inner.method, self.inner.uri)
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// SIP Response wrapper
///
/// rsip keeps only the status code, so a non-default reason phrase is carried
/// alongside and written back on the start line.
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
    reason: Option<String>,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner, reason: None }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        let reason = String::from_utf8_lossy(data)
            .lines()
            .next()
            .and_then(|line| line.splitn(3, ' ').nth(2).map(|r| r.trim().to_string()))
            .filter(|r| !r.is_empty());
        Ok(Self { inner: response, reason })
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn reason(&self) -> String {
        match &self.reason {
            Some(reason) => reason.clone(),
            None => default_reason(self.status_code()).to_string(),
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.status_code() < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code())
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn header(&self, name: &str) -> Option<String> {
        find_header(&self.inner.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        set_header(&mut self.inner.headers, name, value);
    }

    pub fn push_header(&mut self, name: &str, value: impl Into<String>) {
        self.inner.headers.push(make_header(name, value));
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn content_type(&self) -> Option<String> {
        self.header("content-type")
    }

    pub fn call_id(&self) -> Option<String> {
        self.header("call-id")
    }

    pub fn from_tag(&self) -> Option<String> {
        tag_value(self.inner.from_header().ok()?.tag())
    }

    pub fn to_tag(&self) -> Option<String> {
        tag_value(self.inner.to_header().ok()?.tag())
    }

    pub fn cseq(&self) -> Option<u32> {
        cseq_number(self.inner.cseq_header())
    }

    pub fn cseq_method(&self) -> Option<SipMethod> {
        cseq_method(self.inner.cseq_header())
    }

    pub fn via(&self) -> Option<String> {
        self.header("via")
    }

    pub fn via_branch(&self) -> Option<String> {
        via_branch(self.inner.via_header().ok()?)
    }

    pub fn contact_uri(&self) -> Option<SipUri> {
        self.header("contact")
            .and_then(|v| SipUri::from_name_addr(&v).ok())
    }

    pub fn start_line(&self) -> String {
        format!("SIP/2.0 {} {}", self.status_code(), self.reason())
    }

    pub fn to_bytes(&self) -> Bytes {
        let text = self.inner.to_string();
        match text.split_once("\r\n") {
            Some((_, rest)) => Bytes::from(format!("{}\r\n{}", self.start_line(), rest)),
            None => Bytes::from(text),
        }
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.to_bytes()))
    }
}

/// Status code from a plain number, for building responses.
pub fn status_code(code: u16) -> StatusCode {
    StatusCode::from(code)
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        if data.starts_with(b"SIP/") {
            return SipResponse::parse(data).map(SipMessage::Response);
        }
        SipRequest::parse(data).map(SipMessage::Request)
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register_request() {
        let data = b"REGISTER sip:registrar.example.com SIP/2.0\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds;rport\r\n\
                     From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
                     To: Alice <sip:alice@example.com>\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 314159 REGISTER\r\n\
                     Contact: <sip:alice@192.168.1.100:5060;transport=udp>\r\n\
                     Expires: 3600\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        assert!(msg.is_request());

        let req = msg.as_request().unwrap();
        assert_eq!(req.method(), Some(SipMethod::Register));
        assert_eq!(req.call_id(), Some("a84b4c76e66710@pc33.example.com".to_string()));
        assert_eq!(req.cseq(), Some(314159));
        assert_eq!(req.cseq_method(), Some(SipMethod::Register));
        assert_eq!(req.from_tag(), Some("1928301774".to_string()));
        assert_eq!(req.to_tag(), None);
        assert_eq!(req.via_branch(), Some("z9hG4bK776asdhds".to_string()));
        assert_eq!(req.header("expires"), Some("3600".to_string()));

        let contact = req.contact_uri().unwrap();
        assert_eq!(contact.port(), Some(5060));
        assert_eq!(contact.transport(), "udp");
    }

    #[test]
    fn test_parse_response_keeps_reason() {
        let data = b"SIP/2.0 486 Busy\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
                     To: Bob <sip:bob@example.com>;tag=a6c85cf\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 1 INVITE\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        assert!(msg.is_response());

        let resp = msg.as_response().unwrap();
        assert_eq!(resp.status_code(), 486);
        assert_eq!(resp.reason(), "Busy");
        assert_eq!(resp.start_line(), "SIP/2.0 486 Busy");
        assert_eq!(resp.to_tag(), Some("a6c85cf".to_string()));
        assert!(!resp.is_success());
        assert!(!resp.is_provisional());
    }

    #[test]
    fn test_unknown_header_round_trips_by_name() {
        let data = b"REFER sip:alice@10.0.0.1 SIP/2.0\r\n\
                     Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKref\r\n\
                     From: <sip:bob@10.0.0.2>;tag=b\r\n\
                     To: <sip:alice@10.0.0.1>;tag=a\r\n\
                     Call-ID: refer-1\r\n\
                     CSeq: 2 REFER\r\n\
                     Refer-To: <sip:carol@10.0.0.3>\r\n\
                     Content-Length: 0\r\n\r\n";

        let mut req = SipRequest::parse(data).unwrap();
        assert_eq!(req.method(), Some(SipMethod::Refer));
        assert_eq!(req.header("refer-to"), Some("<sip:carol@10.0.0.3>".to_string()));

        req.set_header("X-Custom", "one");
        req.set_header("x-custom", "two");
        assert_eq!(find_headers(req.headers(), "X-Custom"), vec!["two".to_string()]);

        req.remove_header("Refer-To");
        assert!(req.header("refer-to").is_none());
    }

    #[test]
    fn test_typed_accessors_skip_uri_params() {
        let data = b"BYE sip:alice@10.0.0.1 SIP/2.0\r\n\
                     Via: SIP/2.0/UDP 10.0.0.2:5060;rport=40000;branch=z9hG4bKbye;received=203.0.113.9\r\n\
                     From: <sip:bob@10.0.0.2;transport=udp>;tag=b0b\r\n\
                     To: <sip:alice@10.0.0.1>\r\n\
                     Call-ID: bye-1\r\n\
                     CSeq: 4 BYE\r\n\
                     Content-Length: 0\r\n\r\n";

        let req = SipRequest::parse(data).unwrap();
        assert_eq!(req.from_tag(), Some("b0b".to_string()));
        assert_eq!(req.to_tag(), None);
        assert_eq!(req.via_branch(), Some("z9hG4bKbye".to_string()));
        assert_eq!(req.cseq(), Some(4));
        assert_eq!(req.cseq_method(), Some(SipMethod::Bye));
    }
}
