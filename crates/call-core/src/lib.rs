//! Call engine for the sipflow stack.
//!
//! The crate is organised around one idea: a single-writer actor per
//! Call-ID. The router ([`SipStack`]) maps (service, Call-ID) to a live
//! actor and spawns one on first reference; the actor owns every
//! transaction, dialog and fork of its call and processes work items and
//! timer events strictly in order. RFC 3261 §17 client/server transactions,
//! the dialog layer, the proxy/fork engine and RFC 5626 outbound flow
//! handling all live inside the actor; the host application plugs in
//! through the synchronous [`ServiceHandler`] callbacks.

pub mod call;
pub mod config;
pub mod dialog;
pub mod error;
pub mod fork;
pub mod handler;
pub mod outbound;
pub mod router;
pub mod timer;
pub mod trans;

pub use call::{CallInfo, DialogInfo, TransInfo, WorkItem};
pub use config::{Plugin, ServiceConfig};
pub use error::{Error, Result};
pub use fork::{best_response, COMPLETED_ELSEWHERE};
pub use handler::{
    AuthContext, Authorize, CallCtx, DefaultHandler, DigestAuth, PassOutcome, ProxyOpts,
    RequestReply, RouteAction, ServiceHandler, SipReply, UriSet,
};
pub use router::{new_call_id, RequestHandle, SipStack};
pub use trans::{RequestOpts, TransClass, TransId, TransStatus};

/// Commonly used imports for services built on the stack.
pub mod prelude {
    pub use crate::config::{Plugin, ServiceConfig};
    pub use crate::error::{Error, Result};
    pub use crate::handler::{
        AuthContext, Authorize, CallCtx, DefaultHandler, PassOutcome, ProxyOpts, RequestReply,
        RouteAction, ServiceHandler, SipReply, UriSet,
    };
    pub use crate::router::{RequestHandle, SipStack};
    pub use crate::trans::RequestOpts;
    pub use sipflow_sip_core::prelude::*;
}
