//! Via entries.
//!
//! Each request carries an ordered Via list tracing the path it took; the
//! topmost entry identifies the transaction attempt through its `branch`
//! parameter ([RFC 3261 §20.42]).
//!
//! [RFC 3261 §20.42]: https://datatracker.ietf.org/doc/html/rfc3261#section-20.42

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::transport::TransportKind;
use crate::types::uri::Param;

/// Magic cookie that starts every RFC 3261 compliant branch.
pub const BRANCH_MAGIC: &str = "z9hG4bK";

/// A single Via entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Via {
    pub kind: TransportKind,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<Param>,
}

impl Via {
    pub fn new(kind: TransportKind, host: impl Into<String>, port: u16) -> Self {
        Via {
            kind,
            host: host.into(),
            port: Some(port),
            params: Vec::new(),
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.set_param(Param::new("branch", branch));
        self
    }

    pub fn branch(&self) -> Option<&str> {
        self.param("branch").flatten()
    }

    /// Whether the branch carries the RFC 3261 magic cookie.
    ///
    /// Pre-RFC branches are accepted on the wire; they are keyed through a
    /// legacy hash instead of the branch itself.
    pub fn has_rfc_branch(&self) -> bool {
        self.branch().is_some_and(|b| b.starts_with(BRANCH_MAGIC))
    }

    pub fn received(&self) -> Option<IpAddr> {
        self.param("received").flatten().and_then(|v| v.parse().ok())
    }

    pub fn set_received(&mut self, addr: IpAddr) {
        self.set_param(Param::new("received", addr.to_string()));
    }

    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| p.value.as_deref())
    }

    pub fn set_param(&mut self, param: Param) {
        match self
            .params
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(&param.name))
        {
            Some(slot) => *slot = param,
            None => self.params.push(param),
        }
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.kind, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for p in &self.params {
            write!(f, ";{}", p)?;
        }
        Ok(())
    }
}

impl FromStr for Via {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let rest = s
            .strip_prefix("SIP/2.0/")
            .ok_or_else(|| Error::InvalidVia(s.to_string()))?;
        let (kind, rest) = rest
            .split_once(' ')
            .ok_or_else(|| Error::InvalidVia(s.to_string()))?;
        let kind: TransportKind = kind.trim().parse()?;

        let mut parts = rest.split(';');
        let hostport = parts.next().unwrap_or_default().trim();
        let params = parts
            .filter(|p| !p.trim().is_empty())
            .map(|p| match p.split_once('=') {
                Some((n, v)) => Param::new(n.trim(), v.trim()),
                None => Param::flag(p.trim()),
            })
            .collect();

        let (host, port) = match hostport.split_once(':') {
            Some((h, p)) => (
                h,
                Some(p.parse().map_err(|_| Error::InvalidVia(s.to_string()))?),
            ),
            None => (hostport, None),
        };
        if host.is_empty() {
            return Err(Error::InvalidVia(s.to_string()));
        }

        Ok(Via {
            kind,
            host: host.to_string(),
            port,
            params,
        })
    }
}

/// A fresh RFC 3261 branch.
pub fn new_branch() -> String {
    let n: u64 = rand::thread_rng().gen();
    format!("{}{:016x}", BRANCH_MAGIC, n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let via: Via = "SIP/2.0/UDP pc33.atlanta.com:5060;branch=z9hG4bK776asdhds"
            .parse()
            .unwrap();
        assert_eq!(via.kind, TransportKind::Udp);
        assert_eq!(via.port, Some(5060));
        assert_eq!(via.branch(), Some("z9hG4bK776asdhds"));
        assert!(via.has_rfc_branch());
        assert_eq!(
            via.to_string(),
            "SIP/2.0/UDP pc33.atlanta.com:5060;branch=z9hG4bK776asdhds"
        );
    }

    #[test]
    fn legacy_branch_detected() {
        let via: Via = "SIP/2.0/UDP h:5060;branch=oldstyle".parse().unwrap();
        assert!(!via.has_rfc_branch());
    }

    #[test]
    fn generated_branches_are_unique() {
        let a = new_branch();
        let b = new_branch();
        assert!(a.starts_with(BRANCH_MAGIC));
        assert_ne!(a, b);
    }

    #[test]
    fn serde_round_trip() {
        let via: Via = "SIP/2.0/TCP proxy.example:5061;branch=z9hG4bKabc;rport"
            .parse()
            .unwrap();
        let json = serde_json::to_string(&via).unwrap();
        let back: Via = serde_json::from_str(&json).unwrap();
        assert_eq!(back, via);
    }
}
