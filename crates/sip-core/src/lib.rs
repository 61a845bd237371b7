//! Immutable SIP message model for the sipflow stack.
//!
//! This crate holds the value types the rest of the stack is built on:
//! requests and responses, URIs, Via entries, name-addrs, dialog identifiers
//! and transport bindings. It deliberately contains no I/O and no byte-exact
//! wire codec; the transport layer parses frames into these types before
//! handing them to a call actor.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    new_branch, new_tag, CSeq, DialogId, FlowId, HeaderMap, MessageId, Method, NameAddr, Param,
    Request, Response, Scheme, SipMessage, StatusCode, TransportBinding, TransportKind, Uri, Via,
    BRANCH_MAGIC,
};

/// Commonly used imports.
pub mod prelude {
    pub use crate::types::{
        new_branch, new_tag, CSeq, DialogId, FlowId, HeaderMap, MessageId, Method, NameAddr,
        Param, Request, Response, Scheme, SipMessage, StatusCode, TransportBinding, TransportKind,
        Uri, Via, BRANCH_MAGIC,
    };
    pub use crate::error::{Error, Result};
}
