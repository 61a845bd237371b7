//! Client transactions (RFC 3261 §17.1).

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use sipflow_sip_core::{
    new_branch, DialogId, Method, Request, Response, StatusCode, TransportBinding, Via,
};
use sipflow_sip_transport::resolve_uri;

use crate::call::Call;
use crate::dialog::{Dialog, InviteState, SubState};
use crate::error::{Error, Result};
use crate::outbound;
use crate::timer::TimerTag;
use crate::trans::{
    CancelState, ReplySink, RequestOpts, TransClass, TransId, TransStatus, Transaction,
};

/// Timer D: wait for 3xx-6xx retransmissions over unreliable transports.
const TIMER_D: Duration = Duration::from_secs(32);

impl Call {
    /// Launch a client transaction: finalise the request, send it, arm the
    /// RFC 3261 timers and insert the record.
    ///
    /// Transport failures surface to the caller and create no transaction.
    /// ACK and stateless sends are fire-and-forget: nothing is inserted and
    /// any response is matched by Via branch only (so it matches nothing
    /// here and is dropped).
    pub(crate) async fn uac_send(
        &mut self,
        mut request: Request,
        opts: RequestOpts,
        from: ReplySink,
        forced_dest: Option<TransportBinding>,
    ) -> Result<TransId> {
        request.from.ensure_tag();
        if request.call_id.is_empty() {
            request.call_id = self.call_id.clone();
        } else if request.call_id != self.call_id {
            return Err(Error::Invalid("Call-ID"));
        }
        if request.cseq.seq == 0 {
            request.cseq.seq = self.deps.cseq.fetch_add(1, Ordering::Relaxed);
        }
        request.cseq.method = request.method.clone();
        if request.supported.is_empty() {
            request.supported = self.deps.config.supported.clone();
        }

        let kind = self.deps.transport.kind();
        let local = self.deps.transport.local_addr();

        let branch = new_branch();
        request.vias.insert(
            0,
            Via::new(kind, local.ip().to_string(), local.port()).with_branch(branch.clone()),
        );

        let wants_contact = opts.contact
            || request.is_dialog_forming()
            || (request.method == Method::Register
                && opts.reg_id.or(self.deps.config.reg_id).is_some());
        if request.contacts.is_empty() && wants_contact {
            request.contacts.push(outbound::local_contact(
                &self.deps.config,
                &request,
                local,
                kind,
                opts.reg_id,
            ));
        }

        let dest = match forced_dest {
            Some(dest) => dest,
            None => {
                let target = request
                    .top_route()
                    .filter(|r| r.uri.is_lr())
                    .map(|r| r.uri.clone())
                    .unwrap_or_else(|| request.uri.clone());
                let (_, addr) = resolve_uri(&target)?;
                TransportBinding::new(kind, local, addr)
            }
        };

        self.deps
            .transport
            .send(request.clone().into(), dest)
            .await?;

        let id = self.new_trans_id();
        if opts.stateless || request.method == Method::Ack {
            trace!(call = %self.call_id, %branch, "stateless send, no transaction");
            return Ok(id);
        }

        let is_invite = request.method == Method::Invite;
        let t1 = self.deps.config.timer_t1;
        let mut trans = Transaction {
            id,
            class: TransClass::Uac,
            method: request.method.clone(),
            status: if is_invite {
                TransStatus::InviteCalling
            } else {
                TransStatus::Trying
            },
            request,
            response: None,
            opts: opts.clone(),
            from,
            branch,
            dest: Some(dest),
            timeout_timer: None,
            retrans_timer: None,
            expire_timer: None,
            retrans_count: 0,
            next_retrans: t1,
            stateless: false,
            cancel: CancelState::None,
            created: Instant::now(),
            touched: Instant::now(),
        };

        let unreliable = !kind.is_reliable();
        let b = self.deps.config.timeout_64t1();
        if is_invite {
            if unreliable {
                trans.retrans_timer = Some(self.schedule_trans(TimerTag::A, id, t1));
            }
            if opts.proxy {
                // Proxy branches time out on Timer C. Arming only C keeps
                // the Timer-C-vs-B race deterministic: B is effectively
                // pushed past C, which is what proxy contexts want.
                let c = opts.timer_c.unwrap_or(self.deps.config.timer_c);
                trans.timeout_timer = Some(self.schedule_trans(TimerTag::C, id, c));
            } else {
                trans.timeout_timer = Some(self.schedule_trans(TimerTag::B, id, b));
            }
            if let Some(expires) = trans.request.expires.filter(|e| *e > 0) {
                trans.expire_timer = Some(self.schedule_trans(
                    TimerTag::Expire,
                    id,
                    Duration::from_secs(u64::from(expires)),
                ));
            }
        } else {
            if unreliable {
                trans.retrans_timer = Some(self.schedule_trans(TimerTag::E, id, t1));
            }
            trans.timeout_timer = Some(self.schedule_trans(TimerTag::F, id, b));
        }

        self.put_trans(trans);
        Ok(id)
    }

    /// Route an incoming response into its client transaction.
    pub(crate) async fn uac_response(&mut self, response: Response) {
        let Some(branch) = response.branch().map(str::to_string) else {
            warn!(call = %self.call_id, "response without Via branch");
            return;
        };
        let method = response.cseq.method.clone();
        let Some(id) = self.find_trans(TransClass::Uac, &method, &branch) else {
            trace!(call = %self.call_id, %branch, %method, "response matches no transaction");
            // Possibly a stateless-proxied response: pop our Via and relay.
            self.relay_response(response).await;
            return;
        };
        let Some(mut trans) = self.take_trans(id) else {
            return;
        };

        let status = response.status;
        match (trans.is_invite(), trans.status) {
            (true, TransStatus::InviteCalling | TransStatus::InviteProceeding) => {
                if status.is_provisional() {
                    trans.set_status(TransStatus::InviteProceeding);
                    trans.retrans_timer = None;
                    if trans.timeout_timer.is_some_and(|s| s.tag == TimerTag::B)
                        && !trans.opts.proxy
                    {
                        trans.timeout_timer = None;
                    }
                    if trans.cancel == CancelState::Pending {
                        let reason = trans.request.headers.get("reason").map(str::to_string);
                        self.emit_cancel(&mut trans, reason).await;
                    }
                    if status.0 > 100 {
                        if let Some(rseq) = response
                            .headers
                            .get("rseq")
                            .and_then(|v| v.trim().parse().ok())
                        {
                            self.provisionals.push((trans.id, rseq));
                        }
                        self.dialog_on_uac_response(&trans, &response);
                        let sink = trans.from.clone();
                        self.deliver(sink, trans.id, response).await;
                    }
                } else if status.is_success() {
                    trans.set_status(TransStatus::InviteAccepted);
                    trans.retrans_timer = None;
                    trans.response = Some(response.clone());
                    trans.timeout_timer = Some(self.schedule_trans(
                        TimerTag::M,
                        trans.id,
                        self.deps.config.timeout_64t1(),
                    ));
                    if matches!(trans.from, ReplySink::Caller(_)) {
                        self.dialog_on_uac_response(&trans, &response);
                        self.ack_2xx(&trans, &response).await;
                    }
                    let sink = trans.from.clone();
                    self.deliver(sink, trans.id, response).await;
                } else {
                    trans.set_status(TransStatus::InviteCompleted);
                    trans.response = Some(response.clone());
                    trans.retrans_timer = None;
                    self.ack_non_2xx(&trans, &response).await;
                    if self.deps.transport.is_reliable() {
                        trans.set_status(TransStatus::Finished);
                    } else {
                        trans.timeout_timer =
                            Some(self.schedule_trans(TimerTag::D, trans.id, TIMER_D));
                    }
                    self.dialog_on_failure(&trans, &response);
                    let sink = trans.from.clone();
                    self.deliver(sink, trans.id, response).await;
                }
            }
            (true, TransStatus::InviteAccepted) => {
                // 2xx retransmission: the ACK got lost, resend it.
                if status.is_success() {
                    self.ack_2xx(&trans, &response).await;
                }
            }
            (true, TransStatus::InviteCompleted) => {
                // Duplicate final: re-ACK, never re-deliver upstream.
                if status.is_final() {
                    self.ack_non_2xx(&trans, &response).await;
                }
            }
            (false, TransStatus::Trying | TransStatus::Proceeding) => {
                if status.is_provisional() {
                    trans.set_status(TransStatus::Proceeding);
                    if status.0 > 100 {
                        let sink = trans.from.clone();
                        self.deliver(sink, trans.id, response).await;
                    }
                } else {
                    trans.set_status(TransStatus::Completed);
                    trans.retrans_timer = None;
                    trans.response = Some(response.clone());
                    if self.deps.transport.is_reliable() {
                        trans.set_status(TransStatus::Finished);
                    } else {
                        trans.timeout_timer = Some(self.schedule_trans(
                            TimerTag::K,
                            trans.id,
                            self.deps.config.timer_t4,
                        ));
                    }
                    self.in_dialog_final(&trans, &response);
                    let sink = trans.from.clone();
                    self.deliver(sink, trans.id, response).await;
                }
            }
            (false, TransStatus::Completed) => {
                trace!(call = %self.call_id, trans = trans.id, "absorbing retransmitted final");
            }
            _ => {}
        }
        self.put_trans(trans);
    }

    /// Timer dispatch for client transactions.
    pub(crate) async fn uac_timer(&mut self, trans: &mut Transaction, tag: TimerTag) {
        match tag {
            TimerTag::A => {
                if trans.status == TransStatus::InviteCalling {
                    self.retransmit(trans).await;
                    trans.next_retrans *= 2;
                    let delay = trans.next_retrans;
                    trans.retrans_timer = Some(self.schedule_trans(TimerTag::A, trans.id, delay));
                }
            }
            TimerTag::E => {
                if matches!(trans.status, TransStatus::Trying | TransStatus::Proceeding) {
                    self.retransmit(trans).await;
                    trans.next_retrans = (trans.next_retrans * 2).min(self.deps.config.timer_t2);
                    let delay = trans.next_retrans;
                    trans.retrans_timer = Some(self.schedule_trans(TimerTag::E, trans.id, delay));
                }
            }
            TimerTag::B => {
                self.timeout(trans, "Timer B Timeout").await;
            }
            TimerTag::F => {
                self.timeout(trans, "Timer F Timeout").await;
            }
            TimerTag::C => {
                // The branch hung without a final response: cancel it and
                // report upstream.
                self.emit_cancel(trans, Some("SIP;cause=408".to_string())).await;
                self.timeout(trans, "Timer C Timeout").await;
            }
            TimerTag::D | TimerTag::K | TimerTag::M => {
                trans.set_status(TransStatus::Finished);
            }
            TimerTag::Expire => {
                if trans.is_invite() && !trans.opts.no_auto_expire {
                    match trans.status {
                        TransStatus::InviteProceeding => {
                            self.emit_cancel(trans, Some("SIP;cause=487".to_string())).await
                        }
                        TransStatus::InviteCalling => trans.cancel = CancelState::Pending,
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    async fn timeout(&mut self, trans: &mut Transaction, reason: &str) {
        if trans.status.rank() >= TransStatus::InviteCompleted.rank() {
            return;
        }
        debug!(call = %self.call_id, trans = trans.id, reason, "transaction timeout");
        let synthetic = self.synthetic(&trans.request, StatusCode::REQUEST_TIMEOUT, reason);
        trans.set_status(TransStatus::Finished);
        let sink = trans.from.clone();
        self.deliver(sink, trans.id, synthetic).await;
    }

    async fn retransmit(&mut self, trans: &mut Transaction) {
        trans.retrans_count += 1;
        trace!(call = %self.call_id, trans = trans.id, n = trans.retrans_count, "retransmit");
        if let Some(dest) = trans.dest {
            let _ = self
                .deps
                .transport
                .send(trans.request.clone().into(), dest)
                .await;
        }
    }

    /// External cancel: immediate in Proceeding, deferred to the first 1xx
    /// otherwise.
    pub(crate) async fn send_cancel(&mut self, id: TransId) -> Result<()> {
        let Some(mut trans) = self.take_trans(id) else {
            return Err(Error::NoTransaction);
        };
        let result = if !trans.is_invite() {
            Err(Error::Invalid("method"))
        } else {
            match trans.status {
                TransStatus::InviteProceeding => {
                    self.emit_cancel(&mut trans, None).await;
                    Ok(())
                }
                TransStatus::InviteCalling => {
                    trans.cancel = CancelState::Pending;
                    Ok(())
                }
                _ => Ok(()),
            }
        };
        self.put_trans(trans);
        result
    }

    /// Send a CANCEL on the transaction's branch. Idempotent; fire-and-forget
    /// (the 200 to the CANCEL matches no transaction here and is dropped).
    pub(crate) async fn emit_cancel(&mut self, trans: &mut Transaction, reason: Option<String>) {
        if trans.cancel == CancelState::Cancelled {
            return;
        }
        trans.cancel = CancelState::Cancelled;
        let mut cancel = Request::new(
            Method::Cancel,
            trans.request.uri.clone(),
            trans.request.from.clone(),
            trans.request.to.clone(),
            trans.request.call_id.clone(),
            trans.request.cseq.seq,
        );
        cancel.vias = trans.request.vias.first().cloned().into_iter().collect();
        cancel.routes = trans.request.routes.clone();
        if let Some(reason) = reason {
            cancel.headers.set("reason", reason);
        }
        debug!(call = %self.call_id, trans = trans.id, "sending CANCEL");
        if let Some(dest) = trans.dest {
            let _ = self.deps.transport.send(cancel.into(), dest).await;
        }
    }

    /// ACK for a non-2xx final: same branch, same transaction (§17.1.1.3).
    async fn ack_non_2xx(&mut self, trans: &Transaction, response: &Response) {
        let mut ack = Request::new(
            Method::Ack,
            trans.request.uri.clone(),
            trans.request.from.clone(),
            response.to.clone(),
            trans.request.call_id.clone(),
            trans.request.cseq.seq,
        );
        ack.vias = trans.request.vias.first().cloned().into_iter().collect();
        ack.routes = trans.request.routes.clone();
        if let Some(dest) = trans.dest {
            let _ = self.deps.transport.send(ack.into(), dest).await;
        }
    }

    /// ACK for a 2xx: a new in-dialog request on its own branch (§13.2.2.4).
    async fn ack_2xx(&mut self, trans: &Transaction, response: &Response) {
        let Some(id) = DialogId::from_uac_response(&trans.request, response) else {
            return;
        };
        let (ack, dest) = match self.find_dialog_mut(&id) {
            Some(dialog) => {
                let ack = dialog.make_request(Method::Ack);
                dialog.invite_state = InviteState::Confirmed;
                // Only a pinned flow overrides normal route/target
                // resolution; plain connections are not sticky.
                (ack, dialog.dest.filter(|b| b.flow.is_some()))
            }
            None => return,
        };
        let _ = self
            .uac_send(ack, RequestOpts::default(), ReplySink::None, dest)
            .await;
    }

    /// Dialog bookkeeping for a dialog-forming response on the UAC side.
    fn dialog_on_uac_response(&mut self, trans: &Transaction, response: &Response) {
        if !trans.request.is_dialog_forming() || response.to.tag().is_none() {
            return;
        }
        let Some(id) = DialogId::from_uac_response(&trans.request, response) else {
            return;
        };
        if let Some(dialog) = self.find_dialog_mut(&id) {
            dialog.update_from_response(response);
            return;
        }
        if let Some(mut dialog) = Dialog::from_uac(&trans.request, response) {
            if trans.method == Method::Subscribe {
                let event = trans
                    .request
                    .headers
                    .get("event")
                    .unwrap_or("presence")
                    .to_string();
                let expires = response.expires.or(trans.request.expires).unwrap_or(3600);
                dialog.upsert_subscription(
                    &event,
                    SubState::Pending,
                    Instant::now() + Duration::from_secs(u64::from(expires)),
                );
            }
            let id = dialog.id.clone();
            debug!(call = %self.call_id, dialog = %id, "dialog created (uac)");
            self.store_dialog(dialog);
            self.arm_refresh(&id, &trans.request);
        }
    }

    /// A final non-2xx to a dialog-forming request kills the early dialog; a
    /// 481 to any in-dialog request kills the dialog outright.
    fn dialog_on_failure(&mut self, trans: &Transaction, response: &Response) {
        let Some(id) = DialogId::from_uac_response(&trans.request, response) else {
            return;
        };
        let early = self
            .find_dialog_mut(&id)
            .map(|d| d.invite_state == InviteState::Proceeding)
            .unwrap_or(false);
        if early || response.status == StatusCode::NO_TRANSACTION {
            if self.remove_dialog(&id) {
                debug!(call = %self.call_id, dialog = %id, "early dialog terminated");
            }
        }
    }

    /// In-dialog final-response bookkeeping: BYE 2xx and 481 both end the
    /// dialog.
    fn in_dialog_final(&mut self, trans: &Transaction, response: &Response) {
        let Some(to_tag) = trans.request.to.tag() else {
            return;
        };
        let Some(from_tag) = trans.request.from.tag() else {
            return;
        };
        let id = DialogId::new(trans.request.call_id.clone(), from_tag, to_tag);
        let bye_done = trans.method == Method::Bye && response.status.is_success();
        let gone = response.status == StatusCode::NO_TRANSACTION;
        if bye_done || gone {
            if let Some(dialog) = self.find_dialog_mut(&id) {
                dialog.invite_state = InviteState::Terminated;
            }
            if self.remove_dialog(&id) {
                debug!(call = %self.call_id, dialog = %id, bye = bye_done, "dialog terminated");
            }
        }
    }

    /// Build and send an in-dialog request.
    pub(crate) async fn send_in_dialog(
        &mut self,
        id: DialogId,
        method: Method,
        body: Option<(String, bytes::Bytes)>,
        sink: tokio::sync::mpsc::UnboundedSender<Response>,
    ) -> Result<TransId> {
        let (request, dest) = {
            let dialog = self.find_dialog_mut(&id).ok_or(Error::NoDialog)?;
            let mut request = dialog.make_request(method.clone());
            if let Some((content_type, body)) = body {
                request = request.with_body(&content_type, body);
            }
            (request, dialog.dest.filter(|b| b.flow.is_some()))
        };
        let sink = if method == Method::Ack {
            ReplySink::None
        } else {
            ReplySink::Caller(sink)
        };
        self.uac_send(request, RequestOpts::default(), sink, dest).await
    }

    /// Add a Reason parameter to CANCELs launched by the fork engine.
    pub(crate) async fn cancel_branch(&mut self, id: TransId, reason: String) {
        let Some(mut trans) = self.take_trans(id) else {
            return;
        };
        if trans.cancellable() {
            match trans.status {
                TransStatus::InviteProceeding => {
                    self.emit_cancel(&mut trans, Some(reason)).await;
                }
                _ => {
                    // No provisional yet: remember the reason, cancel at 1xx.
                    trans.cancel = CancelState::Pending;
                    trans.request.headers.set("reason", reason);
                }
            }
        }
        self.put_trans(trans);
    }
}
