//! The host application surface.
//!
//! All callbacks are synchronous pure functions so the core can be unit
//! tested without a host application. The stack calls them from inside a
//! call actor; they must not block.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use sipflow_auth_core::DigestOutcome;
use sipflow_registrar_core::Registrar;
use sipflow_sip_core::{
    NameAddr, Request, Response, Scheme, SipMessage, StatusCode, TransportBinding, Uri,
};

use crate::config::ServiceConfig;

/// Pre-parsed digest state handed to [`ServiceHandler::authorize`].
#[derive(Debug, Clone)]
pub struct DigestAuth {
    pub user: String,
    pub realm: String,
    pub outcome: DigestOutcome,
}

/// What the authorize callback sees.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Where the request came from.
    pub source: Option<TransportBinding>,
    /// Digest verification results for each credential on the request.
    pub digest: Vec<DigestAuth>,
    /// Whether the source is already in the dialog's authorized-origin set.
    pub dialog_authorized: bool,
}

impl AuthContext {
    /// Whether any credential verified successfully.
    pub fn digest_ok(&self) -> bool {
        self.digest.iter().any(|d| d.outcome == DigestOutcome::Valid)
    }
}

/// Authorize callback results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorize {
    Ok,
    Forbidden,
    /// Challenge with 401; `realm` defaults to the request host.
    Authenticate { realm: Option<String> },
    /// Challenge with 407.
    ProxyAuthenticate { realm: Option<String> },
}

/// A group-of-groups target set for forking: outer groups are tried in
/// series, the URIs inside one group in parallel.
pub type UriSet = Vec<Vec<Uri>>;

/// Options steering proxy forwarding.
#[derive(Debug, Clone, Default)]
pub struct ProxyOpts {
    /// Insert a Record-Route on dialog-forming requests.
    pub record_route: bool,
    /// Insert a Path on REGISTER.
    pub path: bool,
    /// Chase 3xx responses instead of reporting them.
    pub follow_redirects: bool,
    /// Override the per-branch Timer C.
    pub timer_c: Option<Duration>,
    /// Next-hop routes prepended to every branch (chained proxies).
    pub route: Vec<NameAddr>,
}

impl ProxyOpts {
    pub fn with_route(mut self, route: NameAddr) -> Self {
        self.route.push(route);
        self
    }
}

/// What the callbacks can see of the call's surroundings.
pub struct CallCtx<'a> {
    /// The owning service's configuration snapshot.
    pub service: &'a ServiceConfig,
    /// The registrar, when the plugin is enabled.
    pub registrar: Option<&'a Arc<Registrar>>,
}

/// Route callback results.
#[derive(Debug, Clone)]
pub enum RouteAction {
    /// Answer from the route callback, statefully.
    Reply(SipReply),
    /// Answer without creating a server transaction.
    ReplyStateless(SipReply),
    /// Handle locally: registrar, dialog, or the UA surface.
    Process,
    /// Handle locally without transaction state. Invalid for INVITE.
    ProcessStateless,
    /// Fork to the given targets; empty target set means "the request URI".
    Proxy { targets: UriSet, opts: ProxyOpts },
    /// Forward without fork state, preserving Via and branch.
    ProxyStateless { opts: ProxyOpts },
    /// Pop the top Route and forward to it, statelessly.
    StrictProxy { opts: ProxyOpts },
}

/// Password callback results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Accept without checking a digest.
    Grant,
    /// Unknown user.
    Deny,
    /// Plain password for (user, realm).
    Password(String),
    /// Pre-computed HA1 for (user, realm).
    Ha1(String),
}

/// What [`ServiceHandler::on_request`] returns.
#[derive(Debug, Clone)]
pub enum RequestReply {
    /// Answer now.
    Reply(SipReply),
    /// Leave the transaction pending; the application answers later through
    /// the reply work item.
    Defer,
}

/// A reply the application wants sent.
#[derive(Debug, Clone)]
pub struct SipReply {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub contacts: Vec<NameAddr>,
    pub expires: Option<u32>,
    pub body: Option<(String, Bytes)>,
    /// Extra opaque headers, appended as given.
    pub headers: Vec<(String, String)>,
}

impl SipReply {
    pub fn new(status: StatusCode) -> Self {
        SipReply {
            status,
            reason: None,
            contacts: Vec::new(),
            expires: None,
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_contact(mut self, contact: NameAddr) -> Self {
        self.contacts.push(contact);
        self
    }
}

impl From<StatusCode> for SipReply {
    fn from(status: StatusCode) -> Self {
        SipReply::new(status)
    }
}

/// Build a reply that mirrors a downstream response (used when a proxy
/// forwards a final response upstream).
impl From<&Response> for SipReply {
    fn from(rsp: &Response) -> Self {
        SipReply {
            status: rsp.status,
            reason: rsp.reason.clone(),
            contacts: rsp.contacts.clone(),
            expires: rsp.expires,
            body: None,
            headers: Vec::new(),
        }
    }
}

/// Callbacks the host application implements.
///
/// Every method has a sensible default so a service only overrides what it
/// cares about: the default service authorizes everything, processes
/// everything locally, answers OPTIONS with 200 and everything else with
/// 501.
pub trait ServiceHandler: Send + Sync + 'static {
    /// Decide whether a request may proceed.
    fn authorize(&self, _auth: &AuthContext, _request: &Request, _call: &CallCtx<'_>) -> Authorize {
        Authorize::Ok
    }

    /// Decide what to do with a request that is not in-dialog.
    fn route(
        &self,
        _scheme: Scheme,
        _user: &str,
        _host: &str,
        _request: &Request,
        _call: &CallCtx<'_>,
    ) -> RouteAction {
        RouteAction::Process
    }

    /// Answer a Process-routed request.
    fn on_request(&self, request: &Request) -> RequestReply {
        match request.method {
            sipflow_sip_core::Method::Options => RequestReply::Reply(StatusCode::OK.into()),
            _ => RequestReply::Reply(SipReply::new(StatusCode(501))),
        }
    }

    /// Notification that an INVITE this service owns was cancelled.
    fn on_cancel(&self, _invite: &Request, _cancel: &Request) {}

    /// Credentials for digest verification.
    fn get_user_pass(&self, _user: &str, _realm: &str, _request: &Request) -> PassOutcome {
        PassOutcome::Deny
    }

    /// Observational hook: every message the stack receives.
    fn on_receive(&self, _message: &SipMessage) {}
}

/// The do-nothing service: defaults only.
#[derive(Debug, Default)]
pub struct DefaultHandler;

impl ServiceHandler for DefaultHandler {}
