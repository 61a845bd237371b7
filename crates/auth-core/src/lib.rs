//! Digest authentication for the sipflow stack.
//!
//! Challenge generation, credential verification and the time-bounded nonce
//! table. Password lookup stays with the host application; this crate only
//! computes and compares digests.

pub mod digest;
pub mod error;
pub mod nonce;

pub use digest::{
    expected_response, md5_hex, opaque_for, verify_credentials, DigestChallenge,
    DigestCredentials, DigestOutcome, Secret, HA1_PREFIX,
};
pub use error::{Error, Result};
pub use nonce::{make_nonce, NonceStore};
