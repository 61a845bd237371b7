//! Transport interface for the sipflow stack.
//!
//! This crate defines the seam the call engine talks through: the
//! [`Transport`] trait, the [`ConnectionRegistry`] that backs RFC 5626 flow
//! tokens, and an in-memory transport for tests. Real socket transports are
//! external collaborators implementing the same trait.

pub mod error;
pub mod mem;
pub mod registry;
pub mod transport;

pub use error::{Error, Result};
pub use mem::{Frame, MemHub, MemTransport};
pub use registry::{
    branch_token, decode_flow_token, encode_flow_token, instance_hash, is_flow_token,
    ConnectionRegistry, BRANCH_TOKEN_PREFIX, FLOW_TOKEN_PREFIX,
};
pub use transport::{resolve_uri, Transport};
