//! The SIP value types.

pub mod address;
pub mod dialog_id;
pub mod headers;
pub mod message;
pub mod method;
pub mod status;
pub mod transport;
pub mod uri;
pub mod via;

pub use address::{new_tag, NameAddr};
pub use dialog_id::DialogId;
pub use headers::HeaderMap;
pub use message::{CSeq, MessageId, Request, Response, SipMessage};
pub use method::Method;
pub use status::StatusCode;
pub use transport::{FlowId, TransportBinding, TransportKind};
pub use uri::{Param, Scheme, Uri};
pub use via::{new_branch, Via, BRANCH_MAGIC};
