//! Dialog identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::message::{Request, Response};

/// Identifies a dialog: Call-ID plus local and remote tags (RFC 3261 §12).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<String>,
        local_tag: impl Into<String>,
        remote_tag: impl Into<String>,
    ) -> Self {
        DialogId {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }

    /// Dialog id as seen by the UAC: local = From tag, remote = To tag.
    pub fn from_uac_response(request: &Request, response: &Response) -> Option<Self> {
        Some(DialogId::new(
            request.call_id.clone(),
            request.from.tag()?,
            response.to.tag()?,
        ))
    }

    /// Dialog id as seen by the UAS: local = To tag, remote = From tag.
    pub fn from_uas_request(request: &Request) -> Option<Self> {
        Some(DialogId::new(
            request.call_id.clone(),
            request.to.tag()?,
            request.from.tag()?,
        ))
    }

    /// The same dialog seen from the other side.
    pub fn reversed(&self) -> Self {
        DialogId {
            call_id: self.call_id.clone(),
            local_tag: self.remote_tag.clone(),
            remote_tag: self.local_tag.clone(),
        }
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.call_id, self.local_tag, self.remote_tag)
    }
}
