//! The per-Call-ID actor.
//!
//! One task owns everything keyed by a Call-ID: transactions, dialogs, forks
//! and their timers. All mutation happens inside the actor, one work item or
//! timer event at a time; the outside world talks to it through the mailbox
//! and reads state through apply/inspect items. There is intentionally no
//! lock anywhere in this module.

mod proxy;
mod uac;
mod uas;

use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use sipflow_auth_core::NonceStore;
use sipflow_registrar_core::Registrar;
use sipflow_sip_core::{
    DialogId, Method, Request, Response, SipMessage, StatusCode, TransportBinding,
};
use sipflow_sip_transport::Transport;

use crate::config::ServiceConfig;
use crate::dialog::{Dialog, InviteState};
use crate::error::{Error, Result};
use crate::fork::Fork;
use crate::handler::{ServiceHandler, SipReply};
use crate::timer::{self, TimerEvent, TimerSlot, TimerSubject, TimerTag};
use crate::trans::{ReplySink, RequestOpts, Transaction, TransClass, TransId, TransStatus};

/// Everything a call actor needs from the stack, snapshotted at spawn.
#[derive(Clone)]
pub(crate) struct CallDeps {
    pub config: Arc<ServiceConfig>,
    pub handler: Arc<dyn ServiceHandler>,
    pub transport: Arc<dyn Transport>,
    pub registrar: Option<Arc<Registrar>>,
    pub nonces: Arc<NonceStore>,
    pub cseq: Arc<AtomicU32>,
}

/// Work submitted to a call actor.
pub enum WorkItem {
    SendRequest {
        request: Request,
        opts: RequestOpts,
        sink: mpsc::UnboundedSender<Response>,
        done: oneshot::Sender<Result<TransId>>,
    },
    SendInDialog {
        dialog: DialogId,
        method: Method,
        body: Option<(String, bytes::Bytes)>,
        sink: mpsc::UnboundedSender<Response>,
        done: oneshot::Sender<Result<TransId>>,
    },
    SendCancel {
        trans: TransId,
        done: oneshot::Sender<Result<()>>,
    },
    SendReply {
        trans: TransId,
        reply: SipReply,
        done: oneshot::Sender<Result<()>>,
    },
    Incoming(SipMessage),
    InspectCall {
        reply: oneshot::Sender<CallInfo>,
    },
    InspectDialog {
        id: DialogId,
        reply: oneshot::Sender<Option<DialogInfo>>,
    },
    InspectTrans {
        id: TransId,
        reply: oneshot::Sender<Option<TransInfo>>,
    },
    StopDialog {
        id: DialogId,
        done: oneshot::Sender<Result<()>>,
    },
    /// Test only: kill the actor from inside.
    Crash,
}

/// Mailbox message: external work or an expired timer.
pub enum CallMsg {
    Work(WorkItem),
    Timer(TimerEvent),
}

/// Read-only snapshot of a transaction.
#[derive(Debug, Clone)]
pub struct TransInfo {
    pub id: TransId,
    pub class: TransClass,
    pub method: Method,
    pub status: TransStatus,
    pub branch: String,
}

/// Read-only snapshot of a dialog.
#[derive(Debug, Clone)]
pub struct DialogInfo {
    pub id: DialogId,
    pub invite_state: InviteState,
    pub local_cseq: u32,
    pub remote_cseq: u32,
    pub remote_target: String,
}

/// Read-only snapshot of a call.
#[derive(Debug, Clone)]
pub struct CallInfo {
    pub call_id: String,
    pub transactions: Vec<TransInfo>,
    pub dialogs: Vec<DialogInfo>,
    pub forks: usize,
    pub hibernating: bool,
}

pub(crate) struct Call {
    pub(crate) call_id: String,
    pub(crate) deps: CallDeps,
    /// Handle to our own mailbox; timers post through it.
    pub(crate) mailbox: mpsc::Sender<CallMsg>,
    /// Most recently touched first.
    pub(crate) transactions: Vec<Transaction>,
    pub(crate) dialogs: Vec<Dialog>,
    pub(crate) forks: Vec<Fork>,
    /// Reliable provisionals seen per transaction (RSeq bookkeeping).
    pub(crate) provisionals: Vec<(TransId, u32)>,
    /// Learned destinations for routing requests of reversed dialogs.
    pub(crate) dests: HashMap<DialogId, TransportBinding>,
    next_trans: TransId,
    next_gen: u64,
    check_slot: Option<TimerSlot>,
    pub(crate) hibernate: bool,
    crashed: bool,
}

impl Call {
    pub(crate) fn new(call_id: String, deps: CallDeps, mailbox: mpsc::Sender<CallMsg>) -> Self {
        Call {
            call_id,
            deps,
            mailbox,
            transactions: Vec::new(),
            dialogs: Vec::new(),
            forks: Vec::new(),
            provisionals: Vec::new(),
            dests: HashMap::new(),
            next_trans: 1,
            next_gen: 1,
            check_slot: None,
            hibernate: false,
            crashed: false,
        }
    }

    /// Run the actor until the call is idle or crashed.
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<CallMsg>) {
        self.schedule_check();
        debug!(call = %self.call_id, "call actor started");

        while let Some(msg) = rx.recv().await {
            match msg {
                CallMsg::Work(item) => self.handle_work(item).await,
                CallMsg::Timer(event) => self.handle_timer(event).await,
            }
            if self.crashed {
                warn!(call = %self.call_id, "call actor crashed");
                break;
            }
            if self.idle() {
                break;
            }
        }
        debug!(call = %self.call_id, "call actor finished");
    }

    fn idle(&self) -> bool {
        self.transactions.is_empty() && self.dialogs.is_empty() && self.forks.is_empty()
    }

    async fn handle_work(&mut self, item: WorkItem) {
        match item {
            WorkItem::SendRequest {
                request,
                opts,
                sink,
                done,
            } => {
                let result = self
                    .uac_send(request, opts, ReplySink::Caller(sink), None)
                    .await;
                let _ = done.send(result);
            }
            WorkItem::SendInDialog {
                dialog,
                method,
                body,
                sink,
                done,
            } => {
                let result = self.send_in_dialog(dialog, method, body, sink).await;
                let _ = done.send(result);
            }
            WorkItem::SendCancel { trans, done } => {
                let _ = done.send(self.send_cancel(trans).await);
            }
            WorkItem::SendReply { trans, reply, done } => {
                let _ = done.send(self.do_reply(trans, reply).await.map(|_| ()));
            }
            WorkItem::Incoming(msg) => {
                self.deps.handler.on_receive(&msg);
                match msg {
                    SipMessage::Request(req) => self.uas_incoming(req).await,
                    SipMessage::Response(rsp) => self.uac_response(rsp).await,
                }
            }
            WorkItem::InspectCall { reply } => {
                let _ = reply.send(self.info());
            }
            WorkItem::InspectDialog { id, reply } => {
                let info = self.dialogs.iter().find(|d| d.id == id).map(|d| DialogInfo {
                    id: d.id.clone(),
                    invite_state: d.invite_state,
                    local_cseq: d.local_cseq,
                    remote_cseq: d.remote_cseq,
                    remote_target: d.remote_target.to_string(),
                });
                let _ = reply.send(info);
            }
            WorkItem::InspectTrans { id, reply } => {
                let info = self.transactions.iter().find(|t| t.id == id).map(trans_info);
                let _ = reply.send(info);
            }
            WorkItem::StopDialog { id, done } => {
                let found = self.remove_dialog(&id);
                let _ = done.send(if found { Ok(()) } else { Err(Error::NoDialog) });
            }
            WorkItem::Crash => {
                self.crashed = true;
            }
        }
    }

    async fn handle_timer(&mut self, event: TimerEvent) {
        match event.subject.clone() {
            TimerSubject::Trans(id) => self.trans_timer(id, event).await,
            TimerSubject::Dialog(id) => self.dialog_timer(id, event).await,
            TimerSubject::Call => {
                if self.check_slot.is_some_and(|s| s.matches(&event)) {
                    self.check_call();
                    self.schedule_check();
                }
            }
        }
    }

    async fn trans_timer(&mut self, id: TransId, event: TimerEvent) {
        let Some(index) = self.transactions.iter().position(|t| t.id == id) else {
            return;
        };
        let trans = &self.transactions[index];
        // A stale generation means the timer was re-armed or cancelled
        // between scheduling and firing.
        let current = trans.timeout_timer.is_some_and(|s| s.matches(&event))
            || trans.retrans_timer.is_some_and(|s| s.matches(&event))
            || trans.expire_timer.is_some_and(|s| s.matches(&event));
        if !current {
            return;
        }

        let mut trans = self.transactions.remove(index);
        match trans.class {
            TransClass::Uac => self.uac_timer(&mut trans, event.tag).await,
            TransClass::Uas => self.uas_timer(&mut trans, event.tag).await,
        }
        self.put_trans(trans);
    }

    async fn dialog_timer(&mut self, id: DialogId, event: TimerEvent) {
        let Some(dialog) = self.dialogs.iter_mut().find(|d| d.id == id) else {
            return;
        };
        if !(event.tag == TimerTag::Refresh
            && dialog.refresh_timer.is_some_and(|s| s.matches(&event)))
        {
            return;
        }
        dialog.refresh_timer = None;
        if dialog.invite_state != InviteState::Confirmed {
            return;
        }
        // Session refresh: re-INVITE, or UPDATE when the peer supports it.
        let method = dialog.refresh_method();
        debug!(dialog = %id, %method, "dialog refresh");
        let (sink, _rx) = mpsc::unbounded_channel();
        let _ = self.send_in_dialog(id, method, None, sink).await;
    }

    /// Periodic sweep: drop transactions and forks older than 2·Ttrans and
    /// dialogs untouched for 2·Tdialog.
    fn check_call(&mut self) {
        let now = Instant::now();
        let trans_horizon = self.deps.config.trans_timeout * 2;
        let dialog_horizon = self.deps.config.dialog_timeout * 2;

        self.transactions.retain(|t| {
            let keep = now.duration_since(t.created) < trans_horizon;
            if !keep {
                warn!(call = %self.call_id, trans = t.id, "sweeping stuck transaction");
            }
            keep
        });
        self.forks.retain(|f| {
            let keep = now.duration_since(f.started) < trans_horizon;
            if !keep {
                warn!(call = %self.call_id, fork = f.id, "sweeping stuck fork");
            }
            keep
        });
        self.dialogs.retain(|d| {
            let keep = now.duration_since(d.touched) < dialog_horizon;
            if !keep {
                warn!(call = %self.call_id, dialog = %d.id, "sweeping idle dialog");
            }
            keep
        });

        let live: Vec<TransId> = self.transactions.iter().map(|t| t.id).collect();
        self.provisionals.retain(|(id, _)| live.contains(id));

        // Only long-lived dialog state left: the actor is a hibernation
        // candidate.
        self.hibernate = self.transactions.is_empty() && self.forks.is_empty();
    }

    fn schedule_check(&mut self) {
        let gen = self.gen();
        let period = self.deps.config.trans_timeout / 2;
        self.check_slot = Some(timer::schedule(
            &self.mailbox,
            TimerTag::CheckCall,
            TimerSubject::Call,
            gen,
            period,
        ));
    }

    // --- bookkeeping helpers -------------------------------------------------

    pub(crate) fn gen(&mut self) -> u64 {
        let g = self.next_gen;
        self.next_gen += 1;
        g
    }

    pub(crate) fn new_trans_id(&mut self) -> TransId {
        let id = self.next_trans;
        self.next_trans += 1;
        id
    }

    /// Detach a transaction for processing; [`Call::put_trans`] returns it.
    pub(crate) fn take_trans(&mut self, id: TransId) -> Option<Transaction> {
        let index = self.transactions.iter().position(|t| t.id == id)?;
        Some(self.transactions.remove(index))
    }

    /// Reinsert at the front (most recently touched first). Finished
    /// transactions are dropped instead, which is what removes them from the
    /// call.
    pub(crate) fn put_trans(&mut self, trans: Transaction) {
        if trans.is_finished() {
            debug!(call = %self.call_id, trans = trans.id, "transaction finished");
            return;
        }
        self.transactions.insert(0, trans);
    }

    pub(crate) fn find_trans(
        &self,
        class: TransClass,
        method: &Method,
        branch: &str,
    ) -> Option<TransId> {
        self.transactions
            .iter()
            .find(|t| t.class == class && t.method == *method && t.branch == branch)
            .map(|t| t.id)
    }

    pub(crate) fn schedule_trans(
        &mut self,
        tag: TimerTag,
        trans: TransId,
        delay: Duration,
    ) -> TimerSlot {
        let gen = self.gen();
        timer::schedule(
            &self.mailbox,
            tag,
            TimerSubject::Trans(trans),
            gen,
            delay,
        )
    }

    pub(crate) fn schedule_dialog(
        &mut self,
        tag: TimerTag,
        dialog: DialogId,
        delay: Duration,
    ) -> TimerSlot {
        let gen = self.gen();
        timer::schedule(&self.mailbox, tag, TimerSubject::Dialog(dialog), gen, delay)
    }

    pub(crate) fn find_dialog_mut(&mut self, id: &DialogId) -> Option<&mut Dialog> {
        self.dialogs.iter_mut().find(|d| d.id == *id)
    }

    pub(crate) fn remove_dialog(&mut self, id: &DialogId) -> bool {
        let before = self.dialogs.len();
        self.dialogs.retain(|d| d.id != *id);
        self.dests.remove(id);
        before != self.dialogs.len()
    }

    /// Store a dialog, replacing any previous record with the same id, and
    /// remember the peer's connection for reversed-dialog routing.
    pub(crate) fn store_dialog(&mut self, dialog: Dialog) {
        if let Some(binding) = dialog.dest {
            self.dests.insert(dialog.id.clone(), binding);
        }
        self.dialogs.retain(|d| d.id != dialog.id);
        self.dialogs.push(dialog);
    }

    fn info(&self) -> CallInfo {
        CallInfo {
            call_id: self.call_id.clone(),
            transactions: self.transactions.iter().map(trans_info).collect(),
            dialogs: self
                .dialogs
                .iter()
                .map(|d| DialogInfo {
                    id: d.id.clone(),
                    invite_state: d.invite_state,
                    local_cseq: d.local_cseq,
                    remote_cseq: d.remote_cseq,
                    remote_target: d.remote_target.to_string(),
                })
                .collect(),
            forks: self.forks.len(),
            hibernating: self.hibernate,
        }
    }

    /// Arm the dialog refresh timer from a Session-Expires header
    /// (RFC 4028): the refresher re-INVITEs or UPDATEs at half the interval.
    pub(crate) fn arm_refresh(&mut self, id: &DialogId, request: &Request) {
        let Some(interval) = request
            .headers
            .get("session-expires")
            .and_then(|v| v.split(';').next())
            .and_then(|v| v.trim().parse::<u64>().ok())
        else {
            return;
        };
        let slot = self.schedule_dialog(
            TimerTag::Refresh,
            id.clone(),
            Duration::from_secs(interval / 2),
        );
        if let Some(dialog) = self.find_dialog_mut(id) {
            dialog.refresh_timer = Some(slot);
        }
    }

    /// Build a locally synthesised response for a sent request.
    pub(crate) fn synthetic(
        &self,
        request: &Request,
        status: StatusCode,
        reason: &str,
    ) -> Response {
        Response::to_request(request, status).with_reason(reason)
    }

    /// Deliver a response to whoever launched the transaction.
    pub(crate) async fn deliver(&mut self, sink: ReplySink, branch: TransId, response: Response) {
        match sink {
            ReplySink::Caller(tx) => {
                let _ = tx.send(response);
            }
            ReplySink::Fork(fork_id) => {
                self.fork_response(fork_id, branch, response).await;
            }
            ReplySink::None => {}
        }
    }
}

fn trans_info(t: &Transaction) -> TransInfo {
    TransInfo {
        id: t.id,
        class: t.class,
        method: t.method.clone(),
        status: t.status,
        branch: t.branch.clone(),
    }
}
