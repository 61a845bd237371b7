//! SIP URIs.
//!
//! A compact structured form of `sip:`/`sips:` URIs sufficient for routing
//! decisions: scheme, user, host, port, ordered parameters and headers.
//! Byte-exact escaping rules belong to the wire codec, not to this model.
//!
//! ```
//! use sipflow_sip_core::types::uri::Uri;
//!
//! let uri: Uri = "sip:alice@example.com:5070;transport=tcp;lr".parse().unwrap();
//! assert_eq!(uri.user.as_deref(), Some("alice"));
//! assert_eq!(uri.port, Some(5070));
//! assert!(uri.is_lr());
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::transport::TransportKind;

/// URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    Sip,
    Sips,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `;name` or `;name=value` parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub value: Option<String>,
}

impl Param {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Param {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    pub fn flag(name: impl Into<String>) -> Self {
        Param {
            name: name.into(),
            value: None,
        }
    }

    fn parse(s: &str) -> Param {
        match s.split_once('=') {
            Some((n, v)) => Param::new(n.trim(), v.trim()),
            None => Param::flag(s.trim()),
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}={}", self.name, v),
            None => f.write_str(&self.name),
        }
    }
}

/// A structured SIP URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Uri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<Param>,
    pub headers: Vec<(String, String)>,
}

impl Uri {
    /// A bare `sip:host` URI.
    pub fn new(host: impl Into<String>) -> Self {
        Uri {
            scheme: Scheme::Sip,
            user: None,
            host: host.into(),
            port: None,
            params: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_param(mut self, param: Param) -> Self {
        self.set_param(param);
        self
    }

    /// Value of a parameter, `None` if absent, `Some(None)` for flags.
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| p.value.as_deref())
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.param(name).is_some()
    }

    /// Insert or replace a parameter, keeping the original position on
    /// replacement.
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

    pub fn remove_param(&mut self, name: &str) {
        self.params.retain(|p| !p.name.eq_ignore_ascii_case(name));
    }

    /// Whether the URI carries the loose-routing flag.
    pub fn is_lr(&self) -> bool {
        self.has_param("lr")
    }

    /// The `;transport=` parameter, if present and recognised.
    pub fn transport(&self) -> Option<TransportKind> {
        self.param("transport")?.and_then(|v| v.parse().ok())
    }

    /// (scheme, user, host, port) with the scheme-default port filled in,
    /// used as part of pre-outbound registrar keys.
    pub fn contact_index(&self) -> (Scheme, Option<String>, String, u16) {
        let default = match self.scheme {
            Scheme::Sip => 5060,
            Scheme::Sips => 5061,
        };
        (
            self.scheme,
            self.user.clone(),
            self.host.to_ascii_lowercase(),
            self.port.unwrap_or(default),
        )
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for p in &self.params {
            write!(f, ";{}", p)?;
        }
        for (i, (n, v)) in self.headers.iter().enumerate() {
            write!(f, "{}{}={}", if i == 0 { "?" } else { "&" }, n, v)?;
        }
        Ok(())
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (scheme, rest) = if let Some(rest) = strip_scheme(s, "sip:") {
            (Scheme::Sip, rest)
        } else if let Some(rest) = strip_scheme(s, "sips:") {
            (Scheme::Sips, rest)
        } else {
            return Err(Error::InvalidUri(s.to_string()));
        };

        let (rest, headers) = match rest.split_once('?') {
            Some((r, h)) => {
                let headers = h
                    .split('&')
                    .filter(|p| !p.is_empty())
                    .map(|p| match p.split_once('=') {
                        Some((n, v)) => (n.to_string(), v.to_string()),
                        None => (p.to_string(), String::new()),
                    })
                    .collect();
                (r, headers)
            }
            None => (rest, Vec::new()),
        };

        let mut parts = rest.split(';');
        let addr = parts.next().unwrap_or_default();
        let params: Vec<Param> = parts.filter(|p| !p.is_empty()).map(Param::parse).collect();

        let (user, hostport) = match addr.rsplit_once('@') {
            Some((u, h)) => (Some(u.to_string()), h),
            None => (None, addr),
        };

        let (host, port) = split_host_port(hostport).ok_or_else(|| Error::InvalidUri(s.to_string()))?;
        if host.is_empty() {
            return Err(Error::InvalidUri(s.to_string()));
        }

        Ok(Uri {
            scheme,
            user,
            host: host.to_string(),
            port,
            params,
            headers,
        })
    }
}

fn strip_scheme<'a>(s: &'a str, scheme: &str) -> Option<&'a str> {
    if s.len() >= scheme.len() && s[..scheme.len()].eq_ignore_ascii_case(scheme) {
        Some(&s[scheme.len()..])
    } else {
        None
    }
}

/// Split `host[:port]`, tolerating bracketed IPv6 literals.
fn split_host_port(s: &str) -> Option<(&str, Option<u16>)> {
    if let Some(rest) = s.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        let tail = &rest[end + 1..];
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p.parse().ok()?),
            None if tail.is_empty() => None,
            None => return None,
        };
        return Some((host, port));
    }
    match s.split_once(':') {
        Some((h, p)) => Some((h, Some(p.parse().ok()?))),
        None => Some((s, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_uri() {
        let uri: Uri = "sip:bob@biloxi.com:5062;transport=tcp;lr?subject=x".parse().unwrap();
        assert_eq!(uri.scheme, Scheme::Sip);
        assert_eq!(uri.user.as_deref(), Some("bob"));
        assert_eq!(uri.host, "biloxi.com");
        assert_eq!(uri.port, Some(5062));
        assert_eq!(uri.transport(), Some(TransportKind::Tcp));
        assert!(uri.is_lr());
        assert_eq!(uri.headers, vec![("subject".to_string(), "x".to_string())]);
    }

    #[test]
    fn display_round_trip() {
        let s = "sips:alice@atlanta.com;transport=tls";
        let uri: Uri = s.parse().unwrap();
        assert_eq!(uri.to_string(), s);
    }

    #[test]
    fn ipv6_host() {
        let uri: Uri = "sip:[2001:db8::1]:5060".parse().unwrap();
        assert_eq!(uri.host, "2001:db8::1");
        assert_eq!(uri.port, Some(5060));
    }

    #[test]
    fn rejects_garbage() {
        assert!("http://x".parse::<Uri>().is_err());
        assert!("sip:".parse::<Uri>().is_err());
    }

    #[test]
    fn set_param_replaces_in_place() {
        let mut uri = Uri::new("h").with_param(Param::new("transport", "udp"));
        uri.set_param(Param::new("transport", "tcp"));
        assert_eq!(uri.transport(), Some(TransportKind::Tcp));
        assert_eq!(uri.params.len(), 1);
    }
}
