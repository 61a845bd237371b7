//! Server transactions (RFC 3261 §17.2) and reply dispatch.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Instant;

use tracing::{debug, trace, warn};

use sipflow_sip_core::{
    new_tag, DialogId, Method, NameAddr, Param, Request, Response, StatusCode, Uri,
};

use crate::call::Call;
use crate::dialog::{Dialog, InviteState};
use crate::error::{Error, Result};
use crate::handler::SipReply;
use crate::timer::TimerTag;
use crate::trans::{
    CancelState, ReplySink, RequestOpts, TransClass, TransId, TransStatus, Transaction,
};

impl Call {
    /// Entry point for every inbound request.
    pub(crate) async fn uas_incoming(&mut self, request: Request) {
        let branch = branch_key(&request);
        match request.method {
            Method::Ack => self.uas_ack(request, branch).await,
            Method::Cancel => self.uas_cancel(request, branch).await,
            _ => {
                if let Some(id) = self.find_trans(TransClass::Uas, &request.method, &branch) {
                    self.uas_retransmission(id).await;
                    return;
                }
                self.uas_new(request, branch).await;
            }
        }
    }

    /// ACK matching: same branch hits the INVITE transaction in Completed;
    /// a 2xx ACK arrives on its own branch and belongs to the dialog (or, at
    /// a proxy, gets forwarded along its route).
    async fn uas_ack(&mut self, request: Request, branch: String) {
        if let Some(id) = self.find_trans(TransClass::Uas, &Method::Invite, &branch) {
            let Some(mut trans) = self.take_trans(id) else {
                return;
            };
            if trans.status == TransStatus::InviteCompleted {
                trans.set_status(TransStatus::InviteConfirmed);
                trans.retrans_timer = None;
                if self.deps.transport.is_reliable() {
                    trans.set_status(TransStatus::Finished);
                } else {
                    trans.timeout_timer = Some(self.schedule_trans(
                        TimerTag::I,
                        trans.id,
                        self.deps.config.timer_t4,
                    ));
                }
            }
            self.put_trans(trans);
            return;
        }

        if let Some(id) = DialogId::from_uas_request(&request) {
            if let Some(dialog) = self.find_dialog_mut(&id) {
                dialog.accept_remote_cseq(&request.cseq);
                if dialog.invite_state == InviteState::Accepted {
                    dialog.invite_state = InviteState::Confirmed;
                    debug!(call = %self.call_id, dialog = %id, "dialog confirmed");
                }
                return;
            }
        }
        // Not ours: a proxy in the path of someone else's dialog.
        self.forward_in_dialog(request).await;
    }

    /// CANCEL matching: branch **and** source address must match the INVITE
    /// (RFC 3261 §9.2 hardened against cross-source cancels).
    async fn uas_cancel(&mut self, cancel: Request, branch: String) {
        let Some(id) = self.find_trans(TransClass::Uas, &Method::Invite, &branch) else {
            debug!(call = %self.call_id, "CANCEL matches no transaction");
            self.reply_stateless(&cancel, StatusCode::NO_TRANSACTION, None).await;
            return;
        };
        let Some(mut trans) = self.take_trans(id) else {
            return;
        };

        let source_matches = match (trans.request.binding, cancel.binding) {
            (Some(a), Some(b)) => {
                (a.remote.ip(), a.remote.port()) == (b.remote.ip(), b.remote.port())
            }
            _ => false,
        };
        if !source_matches {
            warn!(call = %self.call_id, trans = trans.id, "CANCEL source mismatch");
            self.put_trans(trans);
            self.reply_stateless(&cancel, StatusCode::NO_TRANSACTION, None).await;
            return;
        }

        self.reply_stateless(&cancel, StatusCode::OK, None).await;

        if trans.status == TransStatus::InviteProceeding {
            trans.cancel = CancelState::Cancelled;
            self.deps.handler.on_cancel(&trans.request, &cancel);
            let owned_by_fork = self.forks.iter().any(|f| f.id == trans.id);
            let trans_id = trans.id;
            self.put_trans(trans);
            if owned_by_fork {
                // The fork cancels its branches; their 487s select the
                // upstream answer.
                self.fork_cancel(trans_id, "SIP;cause=487".to_string()).await;
            } else {
                let _ = self
                    .do_reply(trans_id, SipReply::new(StatusCode::REQUEST_TERMINATED))
                    .await;
            }
        } else {
            self.put_trans(trans);
        }
    }

    /// Retransmitted request: replay the last response, if any.
    async fn uas_retransmission(&mut self, id: TransId) {
        let Some(trans) = self.transactions.iter().find(|t| t.id == id) else {
            return;
        };
        let replay = match trans.status {
            TransStatus::InviteProceeding | TransStatus::Proceeding | TransStatus::Trying => {
                trans.response.clone()
            }
            TransStatus::InviteCompleted
            | TransStatus::InviteAccepted
            | TransStatus::Completed => trans.response.clone(),
            _ => None,
        };
        if let (Some(response), Some(dest)) =
            (replay, self.transactions.iter().find(|t| t.id == id).and_then(|t| t.dest))
        {
            trace!(call = %self.call_id, trans = id, "replaying response for retransmission");
            let _ = self.deps.transport.send(response.into(), dest).await;
        }
    }

    /// A brand new server transaction.
    async fn uas_new(&mut self, request: Request, branch: String) {
        let is_invite = request.method == Method::Invite;
        let id = self.new_trans_id();
        let mut trans = Transaction {
            id,
            class: TransClass::Uas,
            method: request.method.clone(),
            status: if is_invite {
                TransStatus::InviteProceeding
            } else {
                TransStatus::Trying
            },
            dest: request.binding,
            request,
            response: None,
            opts: RequestOpts::default(),
            from: ReplySink::None,
            branch,
            timeout_timer: None,
            retrans_timer: None,
            expire_timer: None,
            retrans_count: 0,
            next_retrans: self.deps.config.timer_t1,
            stateless: false,
            cancel: CancelState::None,
            created: Instant::now(),
            touched: Instant::now(),
        };

        // Automatic 100 Trying keeps upstream retransmissions quiet while
        // the pipeline runs.
        if is_invite && !self.deps.config.no_100 && trans.request.to.tag().is_none() {
            let hundred = self.build_uas_response(&mut trans, &SipReply::new(StatusCode::TRYING));
            if let Some(dest) = trans.dest {
                let _ = self.deps.transport.send(hundred.clone().into(), dest).await;
            }
            trans.response = Some(hundred);
        }

        self.put_trans(trans);
        self.route_pipeline(id).await;
    }

    /// The single point where a server transaction emits a response and
    /// advances its state.
    pub(crate) async fn do_reply(&mut self, id: TransId, reply: SipReply) -> Result<Response> {
        let Some(mut trans) = self.take_trans(id) else {
            return Err(Error::NoTransaction);
        };
        if trans.class != TransClass::Uas {
            self.put_trans(trans);
            return Err(Error::Invalid("transaction class"));
        }
        let response = self.build_uas_response(&mut trans, &reply);
        let result = self.emit_response(&mut trans, response).await;
        self.put_trans(trans);
        result
    }

    /// Like [`Call::do_reply`] but with an externally built response (the
    /// registrar constructs its own).
    pub(crate) async fn do_reply_response(
        &mut self,
        id: TransId,
        mut response: Response,
    ) -> Result<Response> {
        let Some(mut trans) = self.take_trans(id) else {
            return Err(Error::NoTransaction);
        };
        self.fix_to_tag(&mut trans, &mut response);
        let result = self.emit_response(&mut trans, response).await;
        self.put_trans(trans);
        result
    }

    /// Forward a downstream final or provisional upstream (proxy path): the
    /// downstream response with our Via stack put back on.
    pub(crate) async fn forward_response(
        &mut self,
        id: TransId,
        downstream: Response,
    ) -> Result<()> {
        let Some(mut trans) = self.take_trans(id) else {
            return Err(Error::NoTransaction);
        };
        let downstream_source = downstream.binding;
        let mut upstream = downstream;
        upstream.vias = trans.request.vias.clone();
        upstream.binding = trans.request.binding;

        // Remember where a proxied 2xx came from so the caller's ACK can be
        // routed back down the same leg.
        if upstream.status.is_success() && trans.is_invite() {
            if let (Some(local), Some(remote), Some(source)) =
                (upstream.to.tag(), upstream.from.tag(), downstream_source)
            {
                let dialog_id = DialogId::new(upstream.call_id.clone(), local, remote);
                self.dests.insert(dialog_id, source);
            }
        }

        let result = self.emit_response(&mut trans, upstream).await.map(|_| ());
        self.put_trans(trans);
        result
    }

    /// Serialise a response through the transport and advance the FSM.
    async fn emit_response(
        &mut self,
        trans: &mut Transaction,
        response: Response,
    ) -> Result<Response> {
        let status = response.status;
        let sendable = match (trans.is_invite(), trans.status) {
            (true, TransStatus::InviteProceeding) => true,
            // A proxy forwards every winning 2xx, not just the first.
            (true, TransStatus::InviteAccepted) => status.is_success(),
            (false, TransStatus::Trying | TransStatus::Proceeding) => true,
            _ => false,
        };
        if !sendable {
            return Err(Error::Invalid("transaction status"));
        }

        if let Some(dest) = trans.dest {
            self.deps
                .transport
                .send(response.clone().into(), dest)
                .await?;
        }

        if trans.is_invite() {
            if status.is_provisional() {
                // stays in Proceeding
            } else if status.is_success() {
                self.dialog_on_uas_response(trans, &response);
                trans.set_status(TransStatus::InviteAccepted);
                trans.timeout_timer = Some(self.schedule_trans(
                    TimerTag::L,
                    trans.id,
                    self.deps.config.timeout_64t1(),
                ));
            } else {
                trans.set_status(TransStatus::InviteCompleted);
                trans.timeout_timer = Some(self.schedule_trans(
                    TimerTag::H,
                    trans.id,
                    self.deps.config.timeout_64t1(),
                ));
                if !self.deps.transport.is_reliable() {
                    let t1 = self.deps.config.timer_t1;
                    trans.next_retrans = t1;
                    trans.retrans_timer = Some(self.schedule_trans(TimerTag::G, trans.id, t1));
                }
            }
        } else if status.is_provisional() {
            trans.set_status(TransStatus::Proceeding);
        } else {
            trans.set_status(TransStatus::Completed);
            if self.deps.transport.is_reliable() {
                trans.set_status(TransStatus::Finished);
            } else {
                trans.timeout_timer = Some(self.schedule_trans(
                    TimerTag::J,
                    trans.id,
                    self.deps.config.timeout_64t1(),
                ));
            }
        }

        if status.is_final() || status.0 > 100 {
            trans.response = Some(response.clone());
        }
        Ok(response)
    }

    /// Server-side timer dispatch.
    pub(crate) async fn uas_timer(&mut self, trans: &mut Transaction, tag: TimerTag) {
        match tag {
            TimerTag::G => {
                if trans.status == TransStatus::InviteCompleted {
                    if let (Some(response), Some(dest)) = (trans.response.clone(), trans.dest) {
                        let _ = self.deps.transport.send(response.into(), dest).await;
                    }
                    trans.next_retrans = (trans.next_retrans * 2).min(self.deps.config.timer_t2);
                    let delay = trans.next_retrans;
                    trans.retrans_timer = Some(self.schedule_trans(TimerTag::G, trans.id, delay));
                }
            }
            TimerTag::H => {
                // No ACK ever came; give up on the transaction.
                debug!(call = %self.call_id, trans = trans.id, "Timer H fired without ACK");
                trans.set_status(TransStatus::Finished);
            }
            TimerTag::I | TimerTag::J | TimerTag::L => {
                trans.set_status(TransStatus::Finished);
            }
            _ => {}
        }
    }

    /// Build a response for a server transaction from a [`SipReply`].
    fn build_uas_response(&mut self, trans: &mut Transaction, reply: &SipReply) -> Response {
        let mut response = Response::to_request(&trans.request, reply.status);
        if let Some(reason) = &reply.reason {
            response.reason = Some(reason.clone());
        }
        self.fix_to_tag(trans, &mut response);

        response.contacts = reply.contacts.clone();
        if response.contacts.is_empty()
            && trans.request.is_dialog_forming()
            && reply.status.0 > 100
            && reply.status.0 < 300
        {
            let local = self.deps.transport.local_addr();
            let kind = self.deps.transport.kind();
            let mut uri = Uri::new(local.ip().to_string()).with_port(local.port());
            if let Some(user) = trans.request.to.uri.user.clone() {
                uri = uri.with_user(user);
            }
            if kind != sipflow_sip_core::TransportKind::Udp {
                uri.set_param(Param::new("transport", kind.as_str().to_ascii_lowercase()));
            }
            response.contacts.push(NameAddr::new(uri));
        }

        // Dialog-forming answers echo the Record-Route set (RFC 3261 §12.1.1).
        if trans.request.is_dialog_forming() && reply.status.0 > 100 && reply.status.0 < 300 {
            response.record_routes = trans.request.record_routes.clone();
        }

        response.supported = self.deps.config.supported.clone();
        response.expires = reply.expires;
        for (name, value) in &reply.headers {
            response.headers.append(name, value.clone());
        }
        if let Some((content_type, body)) = &reply.body {
            response.headers.set("content-type", content_type.clone());
            response.body = body.clone();
        }
        response
    }

    /// Responses above 100 need a stable local tag; it is minted once per
    /// transaction and reused for every subsequent response.
    fn fix_to_tag(&mut self, trans: &mut Transaction, response: &mut Response) {
        if response.status == StatusCode::TRYING || response.to.tag().is_some() {
            return;
        }
        if trans.request.to.tag().is_none() {
            trans
                .request
                .to
                .set_param(Param::new("tag", new_tag()));
        }
        // The request's To now carries the transaction-local tag.
        response.to = trans.request.to.clone();
    }

    /// A response with no transaction behind it.
    pub(crate) async fn reply_stateless(
        &mut self,
        request: &Request,
        status: StatusCode,
        reason: Option<&str>,
    ) {
        let mut response = Response::to_request(request, status);
        if let Some(reason) = reason {
            response.reason = Some(reason.to_string());
        }
        if let Some(dest) = request.binding {
            let _ = self.deps.transport.send(response.into(), dest).await;
        }
    }

    /// Dialog bookkeeping when a UAS answers a dialog-forming request.
    fn dialog_on_uas_response(&mut self, trans: &Transaction, response: &Response) {
        if !trans.request.is_dialog_forming() || response.to.tag().is_none() {
            return;
        }
        let Some(id) = response.to.tag().and_then(|local| {
            trans
                .request
                .from
                .tag()
                .map(|remote| DialogId::new(trans.request.call_id.clone(), local, remote))
        }) else {
            return;
        };
        if let Some(dialog) = self.find_dialog_mut(&id) {
            if response.status.is_success() {
                dialog.invite_state = InviteState::Accepted;
            }
            return;
        }
        if let Some(dialog) = Dialog::from_uas(&trans.request, response) {
            let id = dialog.id.clone();
            debug!(call = %self.call_id, dialog = %id, "dialog created (uas)");
            self.store_dialog(dialog);
            self.arm_refresh(&id, &trans.request);
        }
    }
}

/// The key a request's transaction is matched on: the RFC 3261 branch when
/// present, a hash over the legacy Via identity otherwise.
pub(crate) fn branch_key(request: &Request) -> String {
    match request.top_via() {
        Some(via) if via.has_rfc_branch() => {
            let branch = via.branch().unwrap_or_default();
            // CANCEL and ACK share the INVITE's branch by construction.
            branch.to_string()
        }
        Some(via) => {
            let mut hasher = DefaultHasher::new();
            via.host.hash(&mut hasher);
            via.port.hash(&mut hasher);
            via.branch().unwrap_or_default().hash(&mut hasher);
            request.call_id.hash(&mut hasher);
            request.cseq.seq.hash(&mut hasher);
            format!("legacy.{:016x}", hasher.finish())
        }
        None => String::new(),
    }
}
