//! Dialog records (RFC 3261 §12) and the INVITE sub-state machine.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Instant;

use tracing::debug;

use sipflow_sip_core::{
    CSeq, DialogId, Method, NameAddr, Request, Response, TransportBinding, TransportKind, Uri,
};

use crate::timer::TimerSlot;

/// Sub-state of the dialog's INVITE usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteState {
    Init,
    Proceeding,
    Accepted,
    Confirmed,
    Terminated,
}

/// Subscription sub-state (RFC 6665).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    Pending,
    Active,
    Terminated,
}

/// One subscription usage inside a dialog.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub event: String,
    pub state: SubState,
    pub expires_at: Instant,
}

/// A dialog, owned by its call actor.
#[derive(Debug)]
pub struct Dialog {
    pub id: DialogId,
    pub local_uri: Uri,
    pub remote_uri: Uri,
    /// Route set in traversal order for outgoing in-dialog requests.
    pub route_set: Vec<NameAddr>,
    pub remote_target: Uri,
    pub local_cseq: u32,
    pub remote_cseq: u32,
    pub invite_state: InviteState,
    pub refresh_timer: Option<TimerSlot>,
    pub subscriptions: Vec<Subscription>,
    /// Origins allowed to send into this dialog without re-authorizing.
    pub authorized_origins: HashSet<(TransportKind, IpAddr, u16)>,
    /// Whether we created the dialog (sent the dialog-forming request).
    pub caller: bool,
    /// Option tags the peer advertised; steers refresh method selection.
    pub remote_supported: Vec<String>,
    /// Connection the peer was last seen on.
    pub dest: Option<TransportBinding>,
    /// CSeq of the INVITE, for building the matching ACK.
    pub invite_cseq: u32,
    pub touched: Instant,
}

impl Dialog {
    /// Create a dialog on the UAC side from a dialog-forming request and the
    /// first 1xx-with-tag or 2xx response.
    ///
    /// The route set is the response's Record-Route list in natural order
    /// (RFC 3261 §12.1.2).
    pub fn from_uac(request: &Request, response: &Response) -> Option<Dialog> {
        let id = DialogId::from_uac_response(request, response)?;
        let remote_target = response
            .contact()
            .map(|c| c.uri.clone())
            .unwrap_or_else(|| request.uri.clone());
        Some(Dialog {
            id,
            local_uri: request.from.uri.clone(),
            remote_uri: request.to.uri.clone(),
            route_set: response.record_routes.clone(),
            remote_target,
            local_cseq: request.cseq.seq,
            remote_cseq: 0,
            invite_state: if response.status.is_success() {
                InviteState::Accepted
            } else {
                InviteState::Proceeding
            },
            refresh_timer: None,
            subscriptions: Vec::new(),
            authorized_origins: HashSet::new(),
            caller: true,
            remote_supported: response.supported.clone(),
            dest: response.binding,
            invite_cseq: request.cseq.seq,
            touched: Instant::now(),
        })
    }

    /// Create a dialog on the UAS side when sending a 1xx-with-tag or 2xx to
    /// a dialog-forming request.
    ///
    /// The route set is the request's Record-Route list reversed
    /// (RFC 3261 §12.1.1).
    pub fn from_uas(request: &Request, response: &Response) -> Option<Dialog> {
        let id = DialogId::from_uas_request_response(request, response)?;
        let mut route_set = request.record_routes.clone();
        route_set.reverse();
        let remote_target = request
            .contact()
            .map(|c| c.uri.clone())
            .unwrap_or_else(|| request.from.uri.clone());
        Some(Dialog {
            id,
            local_uri: request.to.uri.clone(),
            remote_uri: request.from.uri.clone(),
            route_set,
            remote_target,
            local_cseq: 0,
            remote_cseq: request.cseq.seq,
            invite_state: if response.status.is_success() {
                InviteState::Accepted
            } else {
                InviteState::Proceeding
            },
            refresh_timer: None,
            subscriptions: Vec::new(),
            authorized_origins: HashSet::new(),
            caller: false,
            remote_supported: request.supported.clone(),
            dest: request.binding,
            invite_cseq: request.cseq.seq,
            touched: Instant::now(),
        })
    }

    /// Refresh remote state from a later response in this dialog (target
    /// refresh, 2xx confirmation).
    pub fn update_from_response(&mut self, response: &Response) {
        if let Some(contact) = response.contact() {
            self.remote_target = contact.uri.clone();
        }
        if response.status.is_success() && self.invite_state == InviteState::Proceeding {
            self.invite_state = InviteState::Accepted;
        }
        if response.binding.is_some() {
            self.dest = response.binding;
        }
        self.touched = Instant::now();
    }

    /// Enforce the remote CSeq order for an incoming in-dialog request.
    ///
    /// Non-ACK requests with a CSeq at or below the last seen are stale and
    /// must be rejected with 500. ACK reuses the INVITE's CSeq by design.
    pub fn accept_remote_cseq(&mut self, cseq: &CSeq) -> bool {
        if cseq.method == Method::Ack {
            return true;
        }
        if self.remote_cseq != 0 && cseq.seq <= self.remote_cseq {
            debug!(id = %self.id, got = cseq.seq, last = self.remote_cseq, "stale in-dialog CSeq");
            return false;
        }
        self.remote_cseq = cseq.seq;
        self.touched = Instant::now();
        true
    }

    /// Build an in-dialog request: RURI from the remote target, Route from
    /// the stored route set, CSeq strictly increasing (except ACK).
    pub fn make_request(&mut self, method: Method) -> Request {
        let cseq = if method == Method::Ack {
            self.invite_cseq
        } else {
            self.local_cseq += 1;
            self.local_cseq
        };
        let mut request = Request::new(
            method,
            self.remote_target.clone(),
            NameAddr::new(self.local_uri.clone()).with_tag(self.id.local_tag.clone()),
            NameAddr::new(self.remote_uri.clone()).with_tag(self.id.remote_tag.clone()),
            self.id.call_id.clone(),
            cseq,
        );
        request.routes = self.route_set.clone();
        self.touched = Instant::now();
        request
    }

    pub fn remote_supports(&self, token: &str) -> bool {
        self.remote_supported
            .iter()
            .any(|t| t.eq_ignore_ascii_case(token))
    }

    /// The refresh method for a confirmed INVITE usage: UPDATE when the peer
    /// supports it (RFC 3311), a re-INVITE otherwise.
    pub fn refresh_method(&self) -> Method {
        if self.remote_supports("update") {
            Method::Update
        } else {
            Method::Invite
        }
    }

    /// Record or refresh a subscription usage.
    pub fn upsert_subscription(&mut self, event: &str, state: SubState, expires_at: Instant) {
        match self
            .subscriptions
            .iter_mut()
            .find(|s| s.event.eq_ignore_ascii_case(event))
        {
            Some(sub) => {
                sub.state = state;
                sub.expires_at = expires_at;
            }
            None => self.subscriptions.push(Subscription {
                event: event.to_string(),
                state,
                expires_at,
            }),
        }
        self.touched = Instant::now();
    }

    pub fn authorize_origin(&mut self, binding: &TransportBinding) {
        self.authorized_origins.insert(binding.origin());
    }

    pub fn origin_authorized(&self, binding: &TransportBinding) -> bool {
        self.authorized_origins.contains(&binding.origin())
    }

    pub fn terminated(&self) -> bool {
        self.invite_state == InviteState::Terminated
    }
}

/// `DialogId` helper: UAS ids take the local tag from the response we are
/// about to send, since the request's To had none.
trait UasDialogId {
    fn from_uas_request_response(request: &Request, response: &Response) -> Option<DialogId>;
}

impl UasDialogId for DialogId {
    fn from_uas_request_response(request: &Request, response: &Response) -> Option<DialogId> {
        Some(DialogId::new(
            request.call_id.clone(),
            response.to.tag()?,
            request.from.tag()?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipflow_sip_core::StatusCode;

    fn invite() -> Request {
        let mut req = Request::new(
            Method::Invite,
            Uri::new("ua2.example").with_user("bob"),
            NameAddr::new(Uri::new("ua1.example").with_user("alice")).with_tag("ltag"),
            NameAddr::new(Uri::new("ua2.example").with_user("bob")),
            "dlg-call",
            10,
        );
        req.record_routes = vec![
            NameAddr::new("sip:p1.example;lr".parse().unwrap()),
            NameAddr::new("sip:p2.example;lr".parse().unwrap()),
        ];
        req.contacts
            .push(NameAddr::new(Uri::new("10.0.0.1").with_user("alice").with_port(5062)));
        req
    }

    fn ok_response(req: &Request) -> Response {
        let mut rsp = Response::to_request(req, StatusCode::OK);
        rsp.to = rsp.to.clone().with_tag("rtag");
        rsp.record_routes = req.record_routes.clone();
        rsp.contacts
            .push(NameAddr::new(Uri::new("10.0.0.2").with_user("bob").with_port(5064)));
        rsp
    }

    #[test]
    fn uas_route_set_is_reversed_uac_is_not() {
        let req = invite();
        let rsp = ok_response(&req);

        let uac = Dialog::from_uac(&req, &rsp).unwrap();
        assert_eq!(uac.route_set[0].uri.host, "p1.example");
        assert!(uac.caller);

        let uas = Dialog::from_uas(&req, &rsp).unwrap();
        assert_eq!(uas.route_set[0].uri.host, "p2.example");
        assert!(!uas.caller);
        assert_eq!(uas.id, uac.id.reversed());
    }

    #[test]
    fn remote_cseq_is_strictly_increasing_except_ack() {
        let req = invite();
        let rsp = ok_response(&req);
        let mut dialog = Dialog::from_uas(&req, &rsp).unwrap();

        assert!(!dialog.accept_remote_cseq(&CSeq::new(10, Method::Bye)));
        assert!(dialog.accept_remote_cseq(&CSeq::new(10, Method::Ack)));
        assert!(dialog.accept_remote_cseq(&CSeq::new(11, Method::Bye)));
        assert!(!dialog.accept_remote_cseq(&CSeq::new(11, Method::Info)));
    }

    #[test]
    fn in_dialog_requests_use_target_and_route_set() {
        let req = invite();
        let rsp = ok_response(&req);
        let mut dialog = Dialog::from_uac(&req, &rsp).unwrap();

        let bye = dialog.make_request(Method::Bye);
        assert_eq!(bye.uri.host, "10.0.0.2");
        assert_eq!(bye.routes.len(), 2);
        assert_eq!(bye.cseq.seq, 11);
        assert_eq!(bye.from.tag(), Some("ltag"));
        assert_eq!(bye.to.tag(), Some("rtag"));

        let ack = dialog.make_request(Method::Ack);
        assert_eq!(ack.cseq.seq, 10);

        let info = dialog.make_request(Method::Info);
        assert_eq!(info.cseq.seq, 12);
    }

    #[test]
    fn refresh_prefers_update_when_supported() {
        let req = invite();
        let mut rsp = ok_response(&req);
        rsp.supported = vec!["update".into()];
        let dialog = Dialog::from_uac(&req, &rsp).unwrap();
        assert_eq!(dialog.refresh_method(), Method::Update);

        let rsp2 = ok_response(&req);
        let dialog2 = Dialog::from_uac(&req, &rsp2).unwrap();
        assert_eq!(dialog2.refresh_method(), Method::Invite);
    }
}
