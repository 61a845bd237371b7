//! Transaction records.
//!
//! Transactions are plain values owned by their call actor; there is no
//! shared state and no locking. UAC children launched by a fork point back
//! at it through an id, never an owning reference.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::warn;

use sipflow_sip_core::{Method, Request, Response, TransportBinding};

use crate::timer::TimerSlot;

/// Locally unique transaction id.
pub type TransId = u64;

/// Fork id: the id of the originating UAS transaction.
pub type ForkId = TransId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransClass {
    Uac,
    Uas,
}

/// Transaction FSM states (RFC 3261 §17), shared between the INVITE and
/// non-INVITE machines. [`TransStatus::rank`] gives the forward-only order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransStatus {
    // INVITE
    InviteCalling,
    InviteProceeding,
    InviteCompleted,
    InviteAccepted,
    InviteConfirmed,
    // non-INVITE
    Trying,
    Proceeding,
    Completed,
    // terminal for both
    Finished,
}

impl TransStatus {
    /// Position in the FSM; states never move to a lower rank.
    pub fn rank(self) -> u8 {
        match self {
            TransStatus::InviteCalling | TransStatus::Trying => 0,
            TransStatus::InviteProceeding | TransStatus::Proceeding => 1,
            TransStatus::InviteCompleted | TransStatus::Completed => 2,
            TransStatus::InviteAccepted => 3,
            TransStatus::InviteConfirmed => 4,
            TransStatus::Finished => 5,
        }
    }
}

/// Where responses for a UAC transaction are delivered.
#[derive(Debug, Clone)]
pub enum ReplySink {
    /// A local caller; provisional and final responses are pushed in order.
    Caller(mpsc::UnboundedSender<Response>),
    /// A fork branch; responses feed the fork engine.
    Fork(ForkId),
    /// Nobody is listening (fire-and-forget, e.g. in-dialog ACK).
    None,
}

impl ReplySink {
    pub fn fork_id(&self) -> Option<ForkId> {
        match self {
            ReplySink::Fork(id) => Some(*id),
            _ => None,
        }
    }
}

/// CANCEL handling state of an INVITE transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    None,
    /// A cancel was requested before any provisional arrived; it goes out at
    /// the first 1xx.
    Pending,
    Cancelled,
}

/// Options for an outgoing request.
#[derive(Debug, Clone, Default)]
pub struct RequestOpts {
    /// Do not insert the transaction into the call table; match the response
    /// by Via branch only.
    pub stateless: bool,
    /// Suppress the automatic CANCEL when the Expires timer fires.
    pub no_auto_expire: bool,
    /// Generate a Contact header.
    pub contact: bool,
    /// This transaction is a proxy branch: arm Timer C instead of trusting
    /// Timer B alone.
    pub proxy: bool,
    /// Per-branch Timer C override.
    pub timer_c: Option<Duration>,
    /// Client-side outbound: request a `reg-id` contact on REGISTER.
    pub reg_id: Option<u32>,
}

/// One client or server transaction.
#[derive(Debug)]
pub struct Transaction {
    pub id: TransId,
    pub class: TransClass,
    pub method: Method,
    pub status: TransStatus,
    /// The request as sent (UAC) or received (UAS).
    pub request: Request,
    /// Last response received (UAC) or sent (UAS).
    pub response: Option<Response>,
    pub opts: RequestOpts,
    pub from: ReplySink,
    /// Branch key this transaction matches on.
    pub branch: String,
    /// Where the request goes (UAC) or the reply returns (UAS).
    pub dest: Option<TransportBinding>,
    pub timeout_timer: Option<TimerSlot>,
    pub retrans_timer: Option<TimerSlot>,
    pub expire_timer: Option<TimerSlot>,
    pub retrans_count: u32,
    pub next_retrans: Duration,
    pub stateless: bool,
    pub cancel: CancelState,
    pub created: Instant,
    pub touched: Instant,
}

impl Transaction {
    /// Advance the FSM. Backward transitions are a bug in the caller; they
    /// are refused and logged rather than corrupting the invariant.
    pub fn set_status(&mut self, status: TransStatus) {
        if status.rank() < self.status.rank() {
            warn!(
                id = self.id,
                from = ?self.status,
                to = ?status,
                "refusing backward transaction transition"
            );
            return;
        }
        self.status = status;
        self.touched = Instant::now();
    }

    pub fn is_invite(&self) -> bool {
        self.method == Method::Invite
    }

    pub fn is_finished(&self) -> bool {
        self.status == TransStatus::Finished
    }

    /// Whether this UAC transaction may still be cancelled usefully.
    pub fn cancellable(&self) -> bool {
        matches!(
            self.status,
            TransStatus::InviteCalling | TransStatus::InviteProceeding
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipflow_sip_core::{NameAddr, Uri};

    fn transaction() -> Transaction {
        let uri = Uri::new("h");
        Transaction {
            id: 1,
            class: TransClass::Uac,
            method: Method::Invite,
            status: TransStatus::InviteCalling,
            request: Request::new(
                Method::Invite,
                uri.clone(),
                NameAddr::new(uri.clone()).with_tag("t"),
                NameAddr::new(uri),
                "c",
                1,
            ),
            response: None,
            opts: RequestOpts::default(),
            from: ReplySink::None,
            branch: "z9hG4bKtest".into(),
            dest: None,
            timeout_timer: None,
            retrans_timer: None,
            expire_timer: None,
            retrans_count: 0,
            next_retrans: Duration::from_millis(500),
            stateless: false,
            cancel: CancelState::None,
            created: Instant::now(),
            touched: Instant::now(),
        }
    }

    #[test]
    fn status_never_moves_backward() {
        let mut t = transaction();
        t.set_status(TransStatus::InviteProceeding);
        t.set_status(TransStatus::InviteAccepted);
        t.set_status(TransStatus::InviteProceeding);
        assert_eq!(t.status, TransStatus::InviteAccepted);
        t.set_status(TransStatus::Finished);
        assert_eq!(t.status, TransStatus::Finished);
    }

    #[test]
    fn cancellable_window() {
        let mut t = transaction();
        assert!(t.cancellable());
        t.set_status(TransStatus::InviteCompleted);
        assert!(!t.cancellable());
    }
}
