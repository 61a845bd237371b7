//! Timer events for call actors.
//!
//! Timers are one-shot sleep tasks that post a tagged event back into the
//! owning call's mailbox. Cancellation never races expiry: every armed timer
//! carries a generation number, and the actor discards an event whose
//! generation no longer matches the slot it would fire. Re-arming a slot
//! bumps the generation, so cancelling is both idempotent and free.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::trace;

use sipflow_sip_core::DialogId;

use crate::call::CallMsg;
use crate::trans::TransId;

/// The RFC 3261 timer alphabet plus the stack's own housekeeping timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTag {
    /// INVITE client retransmission.
    A,
    /// INVITE client timeout (64·T1).
    B,
    /// Proxy INVITE no-final-response.
    C,
    /// Wait for 3xx-6xx retransmissions after a final non-2xx (client).
    D,
    /// Non-INVITE client retransmission.
    E,
    /// Non-INVITE client timeout (64·T1).
    F,
    /// INVITE server final-response retransmission.
    G,
    /// INVITE server wait-for-ACK.
    H,
    /// INVITE server Confirmed linger (T4).
    I,
    /// Non-INVITE server Completed linger.
    J,
    /// Non-INVITE client Completed linger (T4).
    K,
    /// INVITE server Accepted linger (64·T1).
    L,
    /// INVITE client Accepted linger (64·T1).
    M,
    /// Expires-header expiry on a pending request.
    Expire,
    /// Dialog target refresh.
    Refresh,
    /// Periodic call sweep.
    CheckCall,
}

/// What a timer fires against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerSubject {
    Trans(TransId),
    Dialog(DialogId),
    Call,
}

/// A fired timer.
#[derive(Debug, Clone)]
pub struct TimerEvent {
    pub tag: TimerTag,
    pub subject: TimerSubject,
    pub generation: u64,
}

/// An armed timer slot: what is scheduled and under which generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSlot {
    pub tag: TimerTag,
    pub generation: u64,
}

impl TimerSlot {
    /// Whether a fired event is the one this slot is waiting for.
    pub fn matches(&self, event: &TimerEvent) -> bool {
        self.tag == event.tag && self.generation == event.generation
    }
}

/// Arm a timer: sleep, then post the event into the call mailbox. The
/// returned slot must be stored on the subject; an event that no longer
/// matches the stored slot is stale and gets dropped on receipt.
pub fn schedule(
    mailbox: &mpsc::Sender<CallMsg>,
    tag: TimerTag,
    subject: TimerSubject,
    generation: u64,
    delay: Duration,
) -> TimerSlot {
    let tx = mailbox.clone();
    let event = TimerEvent {
        tag,
        subject,
        generation,
    };
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        trace!(?event.tag, gen = event.generation, "timer fired");
        // The call may be gone; a dead mailbox just swallows the event.
        let _ = tx.send(CallMsg::Timer(event)).await;
    });
    TimerSlot { tag, generation }
}
