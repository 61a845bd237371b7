//! Call engine errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of the stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The `max_calls` cap was hit; nothing was enqueued.
    #[error("too many calls")]
    TooManyCalls,

    /// The stack is not running.
    #[error("service not started")]
    ServiceNotStarted,

    /// A malformed field in an outgoing request; no state was changed.
    #[error("invalid {0}")]
    Invalid(&'static str),

    /// No transaction with the given id.
    #[error("unknown transaction")]
    NoTransaction,

    /// No dialog with the given id.
    #[error("unknown dialog")]
    NoDialog,

    /// The call actor terminated while the work item was in flight.
    #[error("call terminated")]
    CallTerminated,

    /// A synchronous submission outlived `sync_call_time`.
    #[error("timeout waiting for call")]
    SyncCallTimeout,

    /// Transport failures (includes flow failures).
    #[error(transparent)]
    Transport(#[from] sipflow_sip_transport::Error),

    /// Message model failures.
    #[error(transparent)]
    Core(#[from] sipflow_sip_core::Error),
}
