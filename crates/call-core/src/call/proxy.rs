//! The UAS route pipeline and the proxy/fork engine.
//!
//! Every new server transaction runs authorize → route → dispatch. The fork
//! engine launches target groups serially (URIs within a group in parallel),
//! classifies responses, and forwards the best one upstream. Stateless
//! forwarding preserves the incoming Via branch so retransmissions collapse
//! onto the same downstream transaction.

use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use sipflow_auth_core::{
    make_nonce, verify_credentials, DigestChallenge, DigestCredentials, DigestOutcome, Secret,
};
use sipflow_registrar_core::routes_from_contact;
use sipflow_sip_core::{
    DialogId, Method, NameAddr, Request, Response, StatusCode, TransportBinding, Uri,
};
use sipflow_sip_transport::{resolve_uri, Error as TransportError};

use crate::call::uas::branch_key;
use crate::call::Call;
use crate::dialog::SubState;
use crate::fork::{best_response, cancel_reason, Fork, ForkFinal};
use crate::handler::{
    AuthContext, Authorize, CallCtx, DigestAuth, PassOutcome, ProxyOpts, RequestReply,
    RouteAction, SipReply, UriSet,
};
use crate::outbound::{self, RouteDisposition};
use crate::trans::{ForkId, ReplySink, RequestOpts, TransId};

/// Reason phrase for route callbacks that return something unusable.
const INVALID_SERVICE_RESPONSE: &str = "Invalid Service Response";

impl Call {
    /// Authorize, route and dispatch a new server transaction.
    pub(crate) async fn route_pipeline(&mut self, id: TransId) {
        let Some(mut request) = self
            .transactions
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.request.clone())
        else {
            return;
        };

        // Routes addressed to us come off first; they may pin the onward
        // connection or record a flow for header synthesis.
        let local = self.deps.transport.local_addr();
        let registry = self.deps.transport.registry().clone();
        let disposition =
            match outbound::strip_own_routes(&self.deps.config, &registry, local, &mut request) {
                Ok(d) => d,
                Err(TransportError::FlowFailed) => {
                    let _ = self.do_reply(id, SipReply::new(StatusCode::FLOW_FAILED)).await;
                    return;
                }
                Err(TransportError::InvalidFlowToken) => {
                    let _ = self.do_reply(id, SipReply::new(StatusCode::FORBIDDEN)).await;
                    return;
                }
                Err(_) => {
                    let _ = self
                        .do_reply(id, SipReply::new(StatusCode::INTERNAL_ERROR))
                        .await;
                    return;
                }
            };
        if let Some(trans) = self.transactions.iter_mut().find(|t| t.id == id) {
            trans.request.routes = request.routes.clone();
        }

        // Authorize.
        let auth = self.collect_auth(&request);
        let verdict = {
            let call_ctx = CallCtx {
                service: &*self.deps.config,
                registrar: self.deps.registrar.as_ref(),
            };
            self.deps.handler.authorize(&auth, &request, &call_ctx)
        };
        match verdict {
            Authorize::Ok => {
                if let Some(dialog_id) = DialogId::from_uas_request(&request) {
                    if let (Some(binding), Some(dialog)) =
                        (request.binding, self.find_dialog_mut(&dialog_id))
                    {
                        dialog.authorize_origin(&binding);
                    }
                }
            }
            Authorize::Forbidden => {
                let _ = self.do_reply(id, SipReply::new(StatusCode::FORBIDDEN)).await;
                return;
            }
            Authorize::Authenticate { realm } => {
                self.challenge(id, &request, realm, false).await;
                return;
            }
            Authorize::ProxyAuthenticate { realm } => {
                self.challenge(id, &request, realm, true).await;
                return;
            }
        }

        // In-dialog requests go to the dialog manager, not the route
        // callback.
        if request.to.tag().is_some() {
            self.uas_in_dialog(id, request, disposition).await;
            return;
        }

        // Route.
        let action = {
            let call_ctx = CallCtx {
                service: &*self.deps.config,
                registrar: self.deps.registrar.as_ref(),
            };
            self.deps.handler.route(
                request.uri.scheme,
                request.uri.user.as_deref().unwrap_or(""),
                &request.uri.host,
                &request,
                &call_ctx,
            )
        };
        self.dispatch(id, request, action, disposition).await;
    }

    async fn dispatch(
        &mut self,
        id: TransId,
        request: Request,
        action: RouteAction,
        disposition: RouteDisposition,
    ) {
        match action {
            RouteAction::Reply(reply) => {
                let _ = self.do_reply(id, reply).await;
            }
            RouteAction::ReplyStateless(reply) => {
                self.reply_stateless(&request, reply.status, reply.reason.as_deref())
                    .await;
                if let Some(trans) = self.take_trans(id) {
                    drop(trans);
                }
            }
            RouteAction::Process => {
                self.dispatch_process(id, request).await;
            }
            RouteAction::ProcessStateless => {
                if request.method == Method::Invite {
                    // An INVITE cannot be handled without transaction state.
                    let reply = SipReply::new(StatusCode::INTERNAL_ERROR)
                        .with_reason(INVALID_SERVICE_RESPONSE);
                    let _ = self.do_reply(id, reply).await;
                    return;
                }
                self.dispatch_process(id, request).await;
                if let Some(trans) = self.take_trans(id) {
                    drop(trans);
                }
            }
            RouteAction::Proxy { targets, opts } => {
                self.fork_start(id, request, targets, opts, disposition).await;
            }
            RouteAction::ProxyStateless { opts } => {
                self.forward_stateless(request, opts, disposition).await;
                if let Some(trans) = self.take_trans(id) {
                    drop(trans);
                }
            }
            RouteAction::StrictProxy { opts } => {
                // Strict routing: the next hop is the top Route, and the
                // request travels to exactly that URI.
                let mut request = request;
                if request.routes.is_empty() {
                    let reply = SipReply::new(StatusCode::INTERNAL_ERROR)
                        .with_reason(INVALID_SERVICE_RESPONSE);
                    let _ = self.do_reply(id, reply).await;
                    return;
                }
                let next = request.routes.remove(0);
                request.uri = next.uri;
                self.forward_stateless(request, opts, disposition).await;
                if let Some(trans) = self.take_trans(id) {
                    drop(trans);
                }
            }
        }
    }

    /// Process locally: registrar for REGISTER, the UA surface otherwise.
    async fn dispatch_process(&mut self, id: TransId, request: Request) {
        if request.method == Method::Register {
            if let Some(registrar) = self.deps.registrar.clone() {
                let response = registrar.process(&request);
                let _ = self.do_reply_response(id, response).await;
                return;
            }
        }
        match self.deps.handler.on_request(&request) {
            RequestReply::Reply(reply) => {
                let _ = self.do_reply(id, reply).await;
            }
            RequestReply::Defer => {
                trace!(call = %self.call_id, trans = id, "reply deferred to application");
            }
        }
    }

    /// In-dialog dispatch: CSeq enforcement, BYE teardown, subscription
    /// state, the UA surface for the rest.
    async fn uas_in_dialog(
        &mut self,
        id: TransId,
        request: Request,
        disposition: RouteDisposition,
    ) {
        let Some(dialog_id) = DialogId::from_uas_request(&request) else {
            let _ = self.do_reply(id, SipReply::new(StatusCode::NO_TRANSACTION)).await;
            return;
        };

        if self.find_dialog_mut(&dialog_id).is_none() {
            // Not our dialog: forward if we are a hop in it, 481 otherwise.
            if disposition.forced_dest.is_some() || !request.routes.is_empty() {
                self.forward_stateless(request, ProxyOpts::default(), disposition)
                    .await;
                if let Some(trans) = self.take_trans(id) {
                    drop(trans);
                }
            } else {
                let _ = self.do_reply(id, SipReply::new(StatusCode::NO_TRANSACTION)).await;
            }
            return;
        }

        // CSeq must move strictly forward for everything but ACK.
        let cseq_ok = self
            .find_dialog_mut(&dialog_id)
            .map(|d| d.accept_remote_cseq(&request.cseq))
            .unwrap_or(false);
        if !cseq_ok {
            let _ = self.do_reply(id, SipReply::new(StatusCode::INTERNAL_ERROR)).await;
            return;
        }

        match request.method {
            Method::Bye => {
                let _ = self.do_reply(id, SipReply::new(StatusCode::OK)).await;
                if self.remove_dialog(&dialog_id) {
                    debug!(call = %self.call_id, dialog = %dialog_id, "dialog ended by BYE");
                }
            }
            Method::Notify | Method::Subscribe => {
                let (state, expires) = parse_subscription_state(
                    request.headers.get("subscription-state"),
                    request.expires,
                );
                let event = request.headers.get("event").unwrap_or("presence").to_string();
                if let Some(dialog) = self.find_dialog_mut(&dialog_id) {
                    dialog.upsert_subscription(
                        &event,
                        state,
                        Instant::now() + Duration::from_secs(u64::from(expires)),
                    );
                    if state == SubState::Terminated {
                        dialog
                            .subscriptions
                            .retain(|s| s.state != SubState::Terminated);
                    }
                }
                let _ = self.do_reply(id, SipReply::new(StatusCode::OK)).await;
            }
            Method::Invite | Method::Update => {
                // Target refresh.
                if let Some(contact) = request.contact().cloned() {
                    if let Some(dialog) = self.find_dialog_mut(&dialog_id) {
                        dialog.remote_target = contact.uri;
                    }
                }
                match self.deps.handler.on_request(&request) {
                    RequestReply::Reply(reply) => {
                        let _ = self.do_reply(id, reply).await;
                    }
                    RequestReply::Defer => {}
                }
            }
            _ => match self.deps.handler.on_request(&request) {
                RequestReply::Reply(reply) => {
                    let _ = self.do_reply(id, reply).await;
                }
                RequestReply::Defer => {}
            },
        }
    }

    /// Collect and verify digest credentials for the authorize callback.
    fn collect_auth(&mut self, request: &Request) -> AuthContext {
        let mut digest = Vec::new();
        let source_ip = request.binding.map(|b| b.remote.ip());

        let headers: Vec<String> = request
            .headers
            .get_all("authorization")
            .chain(request.headers.get_all("proxy-authorization"))
            .map(str::to_string)
            .collect();

        for header in headers {
            let Ok(creds) = DigestCredentials::parse(&header) else {
                continue;
            };
            let outcome = match self
                .deps
                .handler
                .get_user_pass(&creds.username, &creds.realm, request)
            {
                PassOutcome::Grant => DigestOutcome::Valid,
                PassOutcome::Deny => DigestOutcome::Failed,
                PassOutcome::Password(pass) => {
                    self.verify_digest(request, &creds, &Secret::Password(pass), source_ip)
                }
                PassOutcome::Ha1(ha1) => {
                    self.verify_digest(request, &creds, &Secret::Ha1(ha1), source_ip)
                }
            };
            digest.push(DigestAuth {
                user: creds.username,
                realm: creds.realm,
                outcome,
            });
        }

        let dialog_authorized = request
            .binding
            .and_then(|binding| {
                DialogId::from_uas_request(request).map(|id| (binding, id))
            })
            .and_then(|(binding, id)| {
                self.find_dialog_mut(&id)
                    .map(|d| d.origin_authorized(&binding))
            })
            .unwrap_or(false);

        AuthContext {
            source: request.binding,
            digest,
            dialog_authorized,
        }
    }

    fn verify_digest(
        &self,
        request: &Request,
        creds: &DigestCredentials,
        secret: &Secret,
        source_ip: Option<std::net::IpAddr>,
    ) -> DigestOutcome {
        let Some(ip) = source_ip else {
            return DigestOutcome::Failed;
        };
        verify_credentials(
            &self.deps.config.name,
            &self.call_id,
            &request.method,
            ip,
            creds,
            secret,
            &self.deps.nonces,
        )
        .unwrap_or(DigestOutcome::Failed)
    }

    /// Emit a 401/407 with a fresh challenge.
    async fn challenge(&mut self, id: TransId, request: &Request, realm: Option<String>, proxy: bool) {
        let realm = realm.unwrap_or_else(|| request.to.uri.host.clone());
        let nonce = make_nonce();
        if let Some(binding) = request.binding {
            self.deps.nonces.insert(
                &self.deps.config.name,
                &self.call_id,
                &nonce,
                binding.remote.ip(),
                self.deps.config.nonce_timeout,
            );
        }
        let challenge = DigestChallenge::new(realm, nonce, &self.deps.config.name);
        let (status, header) = if proxy {
            (StatusCode::PROXY_AUTHENTICATION_REQUIRED, "Proxy-Authenticate")
        } else {
            (StatusCode::UNAUTHORIZED, "WWW-Authenticate")
        };
        let mut reply = SipReply::new(status);
        reply.headers.push((header.to_string(), challenge.to_string()));
        let _ = self.do_reply(id, reply).await;
    }

    // --- fork engine ---------------------------------------------------------

    /// Enter the fork engine for a Proxy route decision.
    pub(crate) async fn fork_start(
        &mut self,
        id: TransId,
        request: Request,
        targets: UriSet,
        opts: ProxyOpts,
        disposition: RouteDisposition,
    ) {
        let targets = if targets.is_empty() {
            vec![vec![request.uri.clone()]]
        } else {
            targets
        };

        let mut fork = Fork::new(id, request, targets, opts);
        // Path recording happens where the REGISTER passes through, before
        // the fork launches any branch.
        if fork.opts.path {
            let registry = self.deps.transport.registry();
            if let Some((flow, ob)) = outbound::register_path_flow(registry, &fork.request) {
                fork.record_flow = Some((flow, ob));
            }
        }
        if fork.record_flow.is_none() {
            fork.record_flow = disposition.record_flow;
        }
        fork.forced_dest = disposition.forced_dest;
        debug!(call = %self.call_id, fork = id, groups = fork.uriset.len(), "fork started");
        self.forks.push(fork);
        self.fork_launch(id).await;
    }

    /// Launch groups until one has a pending branch (or the fork drains).
    async fn fork_launch(&mut self, fork_id: ForkId) {
        let Some(index) = self.forks.iter().position(|f| f.id == fork_id) else {
            return;
        };
        let mut fork = self.forks.remove(index);

        while fork.pending.is_empty() {
            let Some(group) = fork.next_group() else {
                break;
            };
            for target in group {
                match self.launch_branch(&mut fork, target).await {
                    Ok(branch) => {
                        fork.launched.push(branch);
                        fork.pending.push(branch);
                    }
                    Err(response) => fork.responses.push(response),
                }
            }
        }

        if fork.final_status == ForkFinal::None && fork.drained() {
            let best = best_response(&fork.request, &fork.responses);
            debug!(call = %self.call_id, fork = fork.id, status = %best.status, "fork best response");
            let _ = self.forward_response(fork.id, best).await;
            return;
        }
        if fork.final_status != ForkFinal::None && fork.pending.is_empty() {
            debug!(call = %self.call_id, fork = fork.id, "fork complete");
            return;
        }
        self.forks.push(fork);
    }

    /// Prepare and send one branch. Errors come back as the stored response
    /// for best-response selection.
    async fn launch_branch(
        &mut self,
        fork: &mut Fork,
        target: Uri,
    ) -> std::result::Result<TransId, Response> {
        let mut request = fork.request.clone();

        // A registrar contact carries its path as a `route` parameter.
        let stored_routes = routes_from_contact(&NameAddr::new(target.clone()));
        let mut uri = target;
        uri.remove_param("route");
        request.uri = uri;
        // Route order: configured next hops, then the contact's stored path,
        // then whatever the request already carried.
        let mut routes = fork.opts.route.clone();
        routes.extend(stored_routes);
        routes.extend(request.routes.clone());
        request.routes = routes;

        if request.max_forwards == 0 {
            return Err(self.synthetic(&fork.request, StatusCode(483), "Too Many Hops"));
        }
        request.max_forwards -= 1;

        let local = self.deps.transport.local_addr();
        let kind = self.deps.transport.kind();
        let incoming_branch = branch_key(&fork.request);

        if fork.opts.record_route && request.method.allows_record_route() {
            let rr = outbound::proxy_route_uri(
                &self.deps.config,
                local,
                kind,
                fork.record_flow,
                &incoming_branch,
            );
            request.record_routes.insert(0, rr);
        }
        if fork.opts.path && request.method == Method::Register {
            let path = outbound::proxy_route_uri(
                &self.deps.config,
                local,
                kind,
                fork.record_flow,
                &incoming_branch,
            );
            request.paths.insert(0, path);
        }

        // The stored routes may start with our own flow token (a path we
        // minted earlier); consume it and pin the connection.
        let registry = self.deps.transport.registry().clone();
        let disposition =
            match outbound::strip_own_routes(&self.deps.config, &registry, local, &mut request) {
                Ok(d) => d,
                Err(TransportError::FlowFailed) => {
                    warn!(call = %self.call_id, fork = fork.id, "branch flow is dead");
                    return Err(self.synthetic(&fork.request, StatusCode::FLOW_FAILED, "Flow Failed"));
                }
                Err(TransportError::InvalidFlowToken) => {
                    return Err(self.synthetic(&fork.request, StatusCode::FORBIDDEN, "Forbidden"));
                }
                Err(_) => {
                    return Err(self.synthetic(
                        &fork.request,
                        StatusCode::SERVICE_UNAVAILABLE,
                        "Service Unavailable",
                    ));
                }
            };

        let opts = RequestOpts {
            proxy: true,
            timer_c: fork.opts.timer_c,
            ..RequestOpts::default()
        };
        let forced = disposition.forced_dest.or(fork.forced_dest);
        self.uac_send(request, opts, ReplySink::Fork(fork.id), forced)
            .await
            .map_err(|err| {
                warn!(call = %self.call_id, fork = fork.id, %err, "branch launch failed");
                let (status, reason) = match err {
                    crate::error::Error::Transport(TransportError::FlowFailed) => {
                        (StatusCode::FLOW_FAILED, "Flow Failed")
                    }
                    _ => (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable"),
                };
                self.synthetic(&fork.request, status, reason)
            })
    }

    /// A branch response reached the fork.
    pub(crate) async fn fork_response(
        &mut self,
        fork_id: ForkId,
        branch: TransId,
        response: Response,
    ) {
        let Some(index) = self.forks.iter().position(|f| f.id == fork_id) else {
            trace!(call = %self.call_id, fork = fork_id, "response for dead fork");
            return;
        };
        let mut fork = self.forks.remove(index);
        let status = response.status;

        if status.is_provisional() {
            // 100s are hop-by-hop and never forwarded.
            if fork.final_status == ForkFinal::None && status.0 > 100 {
                let _ = self.forward_response(fork.id, response).await;
            }
            self.forks.push(fork);
            return;
        }

        fork.branch_done(branch);

        if status.is_success() {
            let reason = cancel_reason(status);
            for pending in fork.pending.clone() {
                self.cancel_branch(pending, reason.clone()).await;
            }
            fork.uriset.clear();
            fork.final_status = ForkFinal::TwoXx;
            let _ = self.forward_response(fork.id, response).await;
        } else if status.is_redirect()
            && fork.opts.follow_redirects
            && fork.final_status == ForkFinal::None
            && !response.contacts.is_empty()
        {
            let contacts: Vec<Uri> = response.contacts.iter().map(|c| c.uri.clone()).collect();
            debug!(call = %self.call_id, fork = fork.id, n = contacts.len(), "following redirect");
            fork.follow_redirect(&contacts);
        } else if status.is_global_failure() {
            let reason = cancel_reason(status);
            for pending in fork.pending.clone() {
                self.cancel_branch(pending, reason.clone()).await;
            }
            fork.uriset.clear();
            fork.final_status = ForkFinal::SixXx;
            let _ = self.forward_response(fork.id, response).await;
        } else {
            fork.responses.push(response);
        }

        if fork.final_status == ForkFinal::None {
            if fork.pending.is_empty() && !fork.uriset.is_empty() {
                self.forks.push(fork);
                self.fork_launch(fork_id).await;
                return;
            }
            if fork.drained() {
                let best = best_response(&fork.request, &fork.responses);
                debug!(call = %self.call_id, fork = fork.id, status = %best.status, "fork best response");
                let _ = self.forward_response(fork.id, best).await;
                return;
            }
        } else if fork.pending.is_empty() {
            debug!(call = %self.call_id, fork = fork.id, "fork complete");
            return;
        }
        self.forks.push(fork);
    }

    /// Upstream CANCEL propagated into the fork: cancel every pending
    /// branch; their 487s become the upstream answer.
    pub(crate) async fn fork_cancel(&mut self, fork_id: ForkId, reason: String) {
        let pending = match self.forks.iter().find(|f| f.id == fork_id) {
            Some(fork) => fork.pending.clone(),
            None => return,
        };
        debug!(call = %self.call_id, fork = fork_id, branches = pending.len(), "cancelling fork");
        for branch in pending {
            self.cancel_branch(branch, reason.clone()).await;
        }
    }

    // --- stateless forwarding ------------------------------------------------

    /// Forward a request with no fork state, deriving the outgoing branch
    /// from the incoming one so retransmissions stay on one transaction.
    pub(crate) async fn forward_stateless(
        &mut self,
        mut request: Request,
        _opts: ProxyOpts,
        disposition: RouteDisposition,
    ) {
        if request.max_forwards == 0 {
            self.reply_stateless(&request, StatusCode(483), None).await;
            return;
        }
        request.max_forwards -= 1;

        let local = self.deps.transport.local_addr();
        let kind = self.deps.transport.kind();
        let incoming_branch = branch_key(&request);
        request.vias.insert(
            0,
            sipflow_sip_core::Via::new(kind, local.ip().to_string(), local.port())
                .with_branch(incoming_branch),
        );

        let dest = match disposition.forced_dest {
            Some(dest) => Some(dest),
            None => {
                let target = request
                    .top_route()
                    .filter(|r| r.uri.is_lr())
                    .map(|r| r.uri.clone())
                    .unwrap_or_else(|| request.uri.clone());
                resolve_uri(&target)
                    .ok()
                    .map(|(_, addr)| TransportBinding::new(kind, local, addr))
            }
        };
        let Some(dest) = dest else {
            self.reply_stateless(&request, StatusCode::SERVICE_UNAVAILABLE, None)
                .await;
            return;
        };
        if let Err(err) = self.deps.transport.send(request.clone().into(), dest).await {
            warn!(call = %self.call_id, %err, "stateless forward failed");
            let status = match err {
                TransportError::FlowFailed => StatusCode::FLOW_FAILED,
                TransportError::InvalidFlowToken => StatusCode::FORBIDDEN,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            };
            self.reply_stateless(&request, status, None).await;
        }
    }

    /// In-dialog traffic for a dialog we merely route (ACKs to 2xx, BYEs
    /// through a record-routing hop).
    pub(crate) async fn forward_in_dialog(&mut self, mut request: Request) {
        let local = self.deps.transport.local_addr();
        let registry = self.deps.transport.registry().clone();
        let disposition =
            match outbound::strip_own_routes(&self.deps.config, &registry, local, &mut request) {
                Ok(d) => d,
                Err(_) => {
                    trace!(call = %self.call_id, "dropping unroutable in-dialog request");
                    return;
                }
            };
        if disposition.forced_dest.is_none() && request.routes.is_empty() {
            // No route left: fall back to where the proxied 2xx of this
            // dialog came from.
            let cached = DialogId::from_uas_request(&request)
                .and_then(|id| self.dests.get(&id).copied());
            let Some(dest) = cached else {
                return;
            };
            self.forward_stateless(
                request,
                ProxyOpts::default(),
                RouteDisposition {
                    forced_dest: Some(dest),
                    record_flow: None,
                },
            )
            .await;
            return;
        }
        self.forward_stateless(request, ProxyOpts::default(), disposition)
            .await;
    }

    /// Pop our Via off a response nobody here was waiting for and relay it
    /// to the next hop. This is how stateless proxying handles responses.
    pub(crate) async fn relay_response(&mut self, mut response: Response) {
        let local = self.deps.transport.local_addr();
        let is_ours = response
            .top_via()
            .map(|via| {
                via.port.unwrap_or(5060) == local.port()
                    && via
                        .host
                        .parse::<std::net::IpAddr>()
                        .map(|ip| ip == local.ip())
                        .unwrap_or(false)
            })
            .unwrap_or(false);
        if !is_ours || response.vias.len() < 2 {
            trace!(call = %self.call_id, "dropping unmatched response");
            return;
        }
        response.vias.remove(0);
        let next = &response.vias[0];
        let Ok(ip) = next.host.parse::<std::net::IpAddr>() else {
            return;
        };
        let addr = std::net::SocketAddr::new(ip, next.port.unwrap_or(5060));
        let kind = self.deps.transport.kind();
        let dest = TransportBinding::new(kind, local, addr);
        let _ = self.deps.transport.send(response.into(), dest).await;
    }
}

/// Parse a Subscription-State header value into (state, expires).
fn parse_subscription_state(value: Option<&str>, default_expires: Option<u32>) -> (SubState, u32) {
    let mut state = SubState::Active;
    let mut expires = default_expires.unwrap_or(3600);
    if let Some(value) = value {
        let mut parts = value.split(';').map(str::trim);
        match parts.next().map(str::to_ascii_lowercase).as_deref() {
            Some("pending") => state = SubState::Pending,
            Some("terminated") => state = SubState::Terminated,
            _ => {}
        }
        for part in parts {
            if let Some(v) = part.strip_prefix("expires=") {
                if let Ok(v) = v.parse() {
                    expires = v;
                }
            }
        }
    }
    (state, expires)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_state_parsing() {
        assert_eq!(
            parse_subscription_state(Some("active;expires=60"), None),
            (SubState::Active, 60)
        );
        assert_eq!(
            parse_subscription_state(Some("terminated;reason=timeout"), Some(90)),
            (SubState::Terminated, 90)
        );
        assert_eq!(parse_subscription_state(None, None), (SubState::Active, 3600));
    }
}
