//! Requests, responses and the message union.
//!
//! These are immutable value types: the stack clones-and-edits rather than
//! mutating shared messages. Interpreted headers (From, To, Via, routes,
//! contacts, Supported/Require, Expires) are structured fields; everything
//! else rides in the opaque [`HeaderMap`].

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::address::NameAddr;
use crate::types::headers::HeaderMap;
use crate::types::method::Method;
use crate::types::status::StatusCode;
use crate::types::transport::TransportBinding;
use crate::types::uri::Uri;
use crate::types::via::Via;

/// Stable identifier assigned when a message enters the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        MessageId(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        MessageId::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// CSeq header value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(seq: u32, method: Method) -> Self {
        CSeq { seq, method }
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// A SIP request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub from: NameAddr,
    pub to: NameAddr,
    pub call_id: String,
    pub cseq: CSeq,
    /// Via entries, topmost (most recent hop) first.
    pub vias: Vec<Via>,
    /// Route set for the request, topmost first.
    pub routes: Vec<NameAddr>,
    /// Record-Route entries accumulated by proxies, topmost first.
    pub record_routes: Vec<NameAddr>,
    /// Path entries (RFC 3327), topmost first. REGISTER only.
    pub paths: Vec<NameAddr>,
    pub contacts: Vec<NameAddr>,
    pub supported: Vec<String>,
    pub require: Vec<String>,
    pub expires: Option<u32>,
    pub max_forwards: u32,
    pub headers: HeaderMap,
    #[serde(skip)]
    pub body: Bytes,
    /// Connection the request arrived on, or must be sent on.
    pub binding: Option<TransportBinding>,
    pub id: MessageId,
}

impl Request {
    pub fn new(method: Method, uri: Uri, from: NameAddr, to: NameAddr, call_id: impl Into<String>, cseq: u32) -> Self {
        Request {
            cseq: CSeq::new(cseq, method.clone()),
            method,
            uri,
            from,
            to,
            call_id: call_id.into(),
            vias: Vec::new(),
            routes: Vec::new(),
            record_routes: Vec::new(),
            paths: Vec::new(),
            contacts: Vec::new(),
            supported: Vec::new(),
            require: Vec::new(),
            expires: None,
            max_forwards: 70,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            binding: None,
            id: MessageId::new(),
        }
    }

    pub fn top_via(&self) -> Option<&Via> {
        self.vias.first()
    }

    /// Branch of the topmost Via.
    pub fn branch(&self) -> Option<&str> {
        self.top_via().and_then(Via::branch)
    }

    pub fn top_route(&self) -> Option<&NameAddr> {
        self.routes.first()
    }

    pub fn contact(&self) -> Option<&NameAddr> {
        self.contacts.first()
    }

    /// Whether `token` appears in the Supported list.
    pub fn supports(&self, token: &str) -> bool {
        self.supported.iter().any(|t| t.eq_ignore_ascii_case(token))
    }

    /// Whether `token` appears in the Require list.
    pub fn requires(&self, token: &str) -> bool {
        self.require.iter().any(|t| t.eq_ignore_ascii_case(token))
    }

    /// Whether a 1xx-with-tag or 2xx to this request creates a dialog.
    pub fn is_dialog_forming(&self) -> bool {
        self.method.is_dialog_forming() && self.to.tag().is_none()
    }

    /// From tag, required on every request the stack originates.
    pub fn from_tag(&self) -> Option<&str> {
        self.from.tag()
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.to.tag()
    }

    pub fn with_body(mut self, content_type: &str, body: Bytes) -> Self {
        self.headers.set("content-type", content_type);
        self.body = body;
        self
    }
}

/// A SIP response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: StatusCode,
    /// Reason phrase when it differs from the code's default. Synthetic
    /// responses use this to name the timer that fired.
    pub reason: Option<String>,
    pub from: NameAddr,
    pub to: NameAddr,
    pub call_id: String,
    pub cseq: CSeq,
    pub vias: Vec<Via>,
    pub record_routes: Vec<NameAddr>,
    pub paths: Vec<NameAddr>,
    pub contacts: Vec<NameAddr>,
    pub supported: Vec<String>,
    pub require: Vec<String>,
    pub expires: Option<u32>,
    pub headers: HeaderMap,
    #[serde(skip)]
    pub body: Bytes,
    pub binding: Option<TransportBinding>,
    pub id: MessageId,
}

impl Response {
    /// Build a response for `request`, copying the headers RFC 3261 §8.2.6
    /// requires: Via list, From, To, Call-ID and CSeq. The reply is bound to
    /// the connection the request arrived on.
    pub fn to_request(request: &Request, status: StatusCode) -> Self {
        Response {
            status,
            reason: None,
            from: request.from.clone(),
            to: request.to.clone(),
            call_id: request.call_id.clone(),
            cseq: request.cseq.clone(),
            vias: request.vias.clone(),
            record_routes: Vec::new(),
            paths: Vec::new(),
            contacts: Vec::new(),
            supported: Vec::new(),
            require: Vec::new(),
            expires: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            binding: request.binding,
            id: MessageId::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// The effective reason phrase.
    pub fn reason_phrase(&self) -> &str {
        self.reason
            .as_deref()
            .unwrap_or_else(|| self.status.default_reason())
    }

    pub fn top_via(&self) -> Option<&Via> {
        self.vias.first()
    }

    pub fn branch(&self) -> Option<&str> {
        self.top_via().and_then(Via::branch)
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.to.tag()
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.from.tag()
    }

    pub fn contact(&self) -> Option<&NameAddr> {
        self.contacts.first()
    }

    pub fn supports(&self, token: &str) -> bool {
        self.supported.iter().any(|t| t.eq_ignore_ascii_case(token))
    }

    pub fn requires(&self, token: &str) -> bool {
        self.require.iter().any(|t| t.eq_ignore_ascii_case(token))
    }
}

/// Either a request or a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn call_id(&self) -> &str {
        match self {
            SipMessage::Request(r) => &r.call_id,
            SipMessage::Response(r) => &r.call_id,
        }
    }

    pub fn cseq(&self) -> &CSeq {
        match self {
            SipMessage::Request(r) => &r.cseq,
            SipMessage::Response(r) => &r.cseq,
        }
    }

    pub fn top_via(&self) -> Option<&Via> {
        match self {
            SipMessage::Request(r) => r.top_via(),
            SipMessage::Response(r) => r.top_via(),
        }
    }

    pub fn binding(&self) -> Option<&TransportBinding> {
        match self {
            SipMessage::Request(r) => r.binding.as_ref(),
            SipMessage::Response(r) => r.binding.as_ref(),
        }
    }

    pub fn id(&self) -> MessageId {
        match self {
            SipMessage::Request(r) => r.id,
            SipMessage::Response(r) => r.id,
        }
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            SipMessage::Request(r) => Some(r),
            SipMessage::Response(_) => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            SipMessage::Request(_) => None,
            SipMessage::Response(r) => Some(r),
        }
    }

    /// The top-Via branch, or an error for keyless messages.
    pub fn branch(&self) -> Result<&str> {
        self.top_via()
            .and_then(Via::branch)
            .ok_or(Error::MissingHeader("Via"))
    }
}

impl From<Request> for SipMessage {
    fn from(r: Request) -> Self {
        SipMessage::Request(r)
    }
}

impl From<Response> for SipMessage {
    fn from(r: Response) -> Self {
        SipMessage::Response(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::uri::Uri;

    fn request() -> Request {
        Request::new(
            Method::Invite,
            Uri::new("biloxi.com").with_user("bob"),
            NameAddr::new(Uri::new("atlanta.com").with_user("alice")).with_tag("1928301774"),
            NameAddr::new(Uri::new("biloxi.com").with_user("bob")),
            "a84b4c76e66710",
            314159,
        )
    }

    #[test]
    fn response_copies_transaction_headers() {
        let mut req = request();
        req.vias
            .push("SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bKnashds8".parse().unwrap());
        let rsp = Response::to_request(&req, StatusCode::RINGING);
        assert_eq!(rsp.call_id, req.call_id);
        assert_eq!(rsp.cseq, req.cseq);
        assert_eq!(rsp.vias, req.vias);
        assert_eq!(rsp.from.tag(), Some("1928301774"));
        assert_eq!(rsp.reason_phrase(), "Ringing");
    }

    #[test]
    fn custom_reason_overrides_default() {
        let rsp = Response::to_request(&request(), StatusCode::REQUEST_TIMEOUT)
            .with_reason("Timer B Timeout");
        assert_eq!(rsp.reason_phrase(), "Timer B Timeout");
    }

    #[test]
    fn dialog_forming_requires_tagless_to() {
        let mut req = request();
        assert!(req.is_dialog_forming());
        req.to = req.to.clone().with_tag("x");
        assert!(!req.is_dialog_forming());
    }
}
