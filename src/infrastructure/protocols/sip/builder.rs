//! SIP message builders

use super::message::{status_code, SipError, SipMethod, SipRequest, SipResponse};
use crate::domain::shared::SipUri;
use rsip::{Header, Headers, Response, Version};

/// RFC 3261 magic cookie for branch parameters
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

pub fn make_tag() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
}

pub fn make_branch() -> String {
    format!("{}{}", BRANCH_MAGIC_COOKIE, uuid::Uuid::new_v4().simple())
}

pub fn make_call_id(host: &str) -> String {
    format!("{}@{}", uuid::Uuid::new_v4().simple(), host)
}

/// Contact header value for a local transport address.
pub fn contact_value(uri: &SipUri) -> String {
    format!("<{}>", uri)
}

/// Build a SIP request with the dialog-forming headers filled in.
///
/// Via is left to the transaction layer, which knows the local address.
pub struct RequestBuilder {
    method: SipMethod,
    uri: SipUri,
    from: Option<String>,
    to: Option<String>,
    call_id: Option<String>,
    cseq: u32,
    headers: Vec<(String, String)>,
    body: Option<(String, Vec<u8>)>,
}

impl RequestBuilder {
    pub fn new(method: SipMethod, uri: SipUri) -> Self {
        Self {
            method,
            uri,
            from: None,
            to: None,
            call_id: None,
            cseq: 1,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn from(mut self, uri: &SipUri, tag: &str) -> Self {
        self.from = Some(format!("<{}>;tag={}", uri, tag));
        self
    }

    pub fn to(mut self, uri: &SipUri, tag: Option<&str>) -> Self {
        self.to = Some(match tag {
            Some(tag) => format!("<{}>;tag={}", uri, tag),
            None => format!("<{}>", uri),
        });
        self
    }

    /// Raw From/To values, used for in-dialog requests.
    pub fn from_value(mut self, value: impl Into<String>) -> Self {
        self.from = Some(value.into());
        self
    }

    pub fn to_value(mut self, value: impl Into<String>) -> Self {
        self.to = Some(value.into());
        self
    }

    pub fn call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    pub fn cseq(mut self, seq: u32) -> Self {
        self.cseq = seq;
        self
    }

    pub fn contact(self, uri: &SipUri) -> Self {
        self.header("Contact", contact_value(uri))
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.body = Some((content_type.to_string(), body));
        self
    }

    pub fn build(self) -> Result<SipRequest, SipError> {
        let mut request = SipRequest::with_method(self.method, &self.uri)?;

        let from = self
            .from
            .ok_or_else(|| SipError::InvalidMessage("From is required".to_string()))?;
        let to = self.to.unwrap_or_else(|| format!("<{}>", self.uri.clone().without_params()));
        let call_id = self
            .call_id
            .unwrap_or_else(|| make_call_id(self.uri.host()));

        request.push_header("From", from);
        request.push_header("To", to);
        request.push_header("Call-ID", call_id);
        request.push_header("CSeq", format!("{} {}", self.cseq, self.method));
        request.push_header("Max-Forwards", "70");
        for (name, value) in self.headers {
            request.push_header(&name, value);
        }

        match self.body {
            Some((content_type, body)) => request.set_body(&content_type, body),
            None => request.push_header("Content-Length", "0"),
        }
        Ok(request)
    }
}

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    reason: Option<String>,
    to_tag: Option<String>,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            reason: None,
            to_tag: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Tag added to To when the request has none.
    pub fn to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    pub fn body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.headers
            .push(super::message::make_header("Content-Type", content_type));
        self.body = body;
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push(super::message::make_header(name, value));
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> SipResponse {
        let mut headers = Vec::new();

        // Copy essential headers from request
        for header in request.headers().iter() {
            match header {
                Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_) => {
                    headers.push(header.clone());
                }
                Header::To(to) => match (&self.to_tag, request.to_tag()) {
                    (Some(tag), None) => {
                        let value = super::message::header_name_value(header).1;
                        headers.push(Header::To(format!("{};tag={}", value, tag).into()));
                    }
                    _ => headers.push(Header::To(to.clone())),
                },
                _ => {}
            }
        }

        headers.extend(self.headers);
        headers.push(Header::ContentLength(self.body.len().to_string().into()));

        let response = SipResponse::new(Response {
            status_code: status_code(self.status_code),
            headers: Headers::from(headers),
            body: self.body,
            version: Version::V2,
        });
        match self.reason {
            Some(reason) => response.with_reason(reason),
            None => response,
        }
    }
}
