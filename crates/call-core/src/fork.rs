//! Fork records and best-response selection (RFC 3261 §16).
//!
//! A fork tries its target groups serially, the URIs inside one group in
//! parallel. The launch/response plumbing lives with the call actor; this
//! module holds the record itself and the pure response-selection rules so
//! they can be tested without a network.

use std::collections::VecDeque;
use std::time::Instant;

use sipflow_sip_core::{FlowId, Request, Response, StatusCode, Uri};

use crate::handler::ProxyOpts;
use crate::trans::{ForkId, TransId};

/// Reason text carried by CANCELs sent when a 2xx wins the fork.
pub const COMPLETED_ELSEWHERE: &str = "Call completed elsewhere";

/// Terminal disposition of a fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkFinal {
    None,
    TwoXx,
    SixXx,
}

/// A parallel/serial fork rooted at a UAS transaction.
#[derive(Debug)]
pub struct Fork {
    /// Fork id = the originating UAS transaction id.
    pub id: ForkId,
    pub request: Request,
    /// Target groups not yet launched.
    pub uriset: VecDeque<Vec<Uri>>,
    /// Every UAC branch ever launched.
    pub launched: Vec<TransId>,
    /// Branches still waiting for a final response.
    pub pending: Vec<TransId>,
    /// Collected non-2xx finals, for best-response selection.
    pub responses: Vec<Response>,
    pub final_status: ForkFinal,
    pub opts: ProxyOpts,
    /// Flow recorded for Record-Route/Path synthesis on this fork's
    /// branches, with its `ob` annotation.
    pub record_flow: Option<(FlowId, bool)>,
    /// Connection the route pipeline pinned the onward request to.
    pub forced_dest: Option<sipflow_sip_core::TransportBinding>,
    pub started: Instant,
}

impl Fork {
    pub fn new(id: ForkId, request: Request, uriset: Vec<Vec<Uri>>, opts: ProxyOpts) -> Self {
        Fork {
            id,
            request,
            uriset: uriset.into(),
            launched: Vec::new(),
            pending: Vec::new(),
            responses: Vec::new(),
            final_status: ForkFinal::None,
            opts,
            record_flow: None,
            forced_dest: None,
            started: Instant::now(),
        }
    }

    /// The next group to launch, if the fork is still looking for a winner.
    pub fn next_group(&mut self) -> Option<Vec<Uri>> {
        if self.final_status != ForkFinal::None {
            return None;
        }
        self.uriset.pop_front()
    }

    pub fn branch_done(&mut self, trans: TransId) {
        self.pending.retain(|id| *id != trans);
    }

    /// No pending branches and nothing left to launch.
    pub fn drained(&self) -> bool {
        self.pending.is_empty() && self.uriset.is_empty()
    }

    /// Replace the remaining work with redirect contacts, dropping `sips`
    /// incompatible targets when the original RURI was sips.
    pub fn follow_redirect(&mut self, contacts: &[Uri]) {
        let sips = self.request.uri.scheme == sipflow_sip_core::Scheme::Sips;
        let group: Vec<Uri> = contacts
            .iter()
            .filter(|u| !sips || u.scheme == sipflow_sip_core::Scheme::Sips)
            .cloned()
            .collect();
        if !group.is_empty() {
            self.uriset.push_back(group);
        }
    }
}

/// Selection rank: lower is better. Within a rank, the lower code wins.
fn class_rank(status: StatusCode) -> u8 {
    match status.0 {
        401 | 407 => 0,
        415 | 420 | 484 => 1,
        503 => 2,
        600..=699 => 3,
        _ => 4,
    }
}

/// Pick the response to forward upstream from the collected finals.
///
/// 401/407 win and carry the merged challenges of every such response; then
/// 415/420/484; a chosen 503 goes upstream as 500; then 6xx by code; then
/// everything else by code. An empty set synthesises 480.
pub fn best_response(request: &Request, responses: &[Response]) -> Response {
    let Some(best) = responses
        .iter()
        .min_by_key(|r| (class_rank(r.status), r.status.0))
    else {
        return Response::to_request(request, StatusCode::TEMPORARILY_UNAVAILABLE);
    };

    let mut chosen = best.clone();

    if matches!(chosen.status.0, 401 | 407) {
        // Merge challenges from every authenticating response so the caller
        // can answer any of the forked endpoints.
        chosen.headers.remove("www-authenticate");
        chosen.headers.remove("proxy-authenticate");
        for rsp in responses.iter().filter(|r| matches!(r.status.0, 401 | 407)) {
            for value in rsp.headers.get_all("www-authenticate") {
                chosen.headers.append("www-authenticate", value);
            }
            for value in rsp.headers.get_all("proxy-authenticate") {
                chosen.headers.append("proxy-authenticate", value);
            }
        }
    }

    if chosen.status == StatusCode::SERVICE_UNAVAILABLE {
        chosen.status = StatusCode::INTERNAL_ERROR;
        chosen.reason = None;
    }

    chosen
}

/// Reason header value for CANCELs caused by a winning final response.
pub fn cancel_reason(winner: StatusCode) -> String {
    if winner.is_success() {
        format!("SIP;cause=200;text=\"{}\"", COMPLETED_ELSEWHERE)
    } else {
        format!("SIP;cause={}", winner.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipflow_sip_core::{Method, NameAddr};

    fn request() -> Request {
        Request::new(
            Method::Invite,
            Uri::new("h").with_user("callee"),
            NameAddr::new(Uri::new("a").with_user("caller")).with_tag("f"),
            NameAddr::new(Uri::new("h").with_user("callee")),
            "fork-call",
            1,
        )
    }

    fn response(code: u16) -> Response {
        Response::to_request(&request(), StatusCode(code))
    }

    #[test]
    fn empty_set_synthesises_480() {
        let best = best_response(&request(), &[]);
        assert_eq!(best.status, StatusCode::TEMPORARILY_UNAVAILABLE);
    }

    #[test]
    fn auth_beats_everything_and_merges_challenges() {
        let mut a = response(401);
        a.headers.append("www-authenticate", "Digest realm=\"r1\", nonce=\"n1\"");
        let mut b = response(407);
        b.headers
            .append("proxy-authenticate", "Digest realm=\"r2\", nonce=\"n2\"");
        let c = response(404);

        let best = best_response(&request(), &[c, b, a.clone()]);
        assert_eq!(best.status.0, 401);
        assert_eq!(best.headers.get_all("www-authenticate").count(), 1);
        assert_eq!(best.headers.get_all("proxy-authenticate").count(), 1);
    }

    #[test]
    fn five_oh_three_is_rewritten_to_500() {
        let best = best_response(&request(), &[response(503), response(600)]);
        // 503 outranks 6xx in the selection order but goes upstream as 500.
        assert_eq!(best.status, StatusCode::INTERNAL_ERROR);
    }

    #[test]
    fn six_hundreds_beat_ordinary_failures() {
        let best = best_response(&request(), &[response(404), response(603), response(486)]);
        assert_eq!(best.status.0, 603);
    }

    #[test]
    fn otherwise_lowest_code_wins() {
        let best = best_response(&request(), &[response(486), response(404), response(480)]);
        assert_eq!(best.status.0, 404);
    }

    #[test]
    fn cancel_reasons() {
        assert_eq!(
            cancel_reason(StatusCode::OK),
            "SIP;cause=200;text=\"Call completed elsewhere\""
        );
        assert_eq!(cancel_reason(StatusCode(603)), "SIP;cause=603");
    }

    #[test]
    fn redirect_drops_sip_targets_for_sips_request() {
        let mut req = request();
        req.uri = req.uri.with_scheme(sipflow_sip_core::Scheme::Sips);
        let mut fork = Fork::new(1, req, vec![], ProxyOpts::default());
        fork.follow_redirect(&[
            "sip:a@1.2.3.4".parse().unwrap(),
            "sips:b@1.2.3.5".parse().unwrap(),
        ]);
        let group = fork.next_group().unwrap();
        assert_eq!(group.len(), 1);
        assert_eq!(group[0].user.as_deref(), Some("b"));
    }
}
