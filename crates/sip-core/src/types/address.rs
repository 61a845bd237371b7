//! Name-addr values: From, To, Contact, Route, Record-Route and Path entries.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::uri::{Param, Uri};

/// A display name, URI and header parameters.
///
/// Header parameters (`;tag=`, `;reg-id=`, `;ob`, `;expires=`) live outside
/// the angle brackets and are distinct from the URI's own parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameAddr {
    pub display: Option<String>,
    pub uri: Uri,
    pub params: Vec<Param>,
}

impl NameAddr {
    pub fn new(uri: Uri) -> Self {
        NameAddr {
            display: None,
            uri,
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, param: Param) -> Self {
        self.set_param(param);
        self
    }

    pub fn with_tag(self, tag: impl Into<String>) -> Self {
        self.with_param(Param::new("tag", tag))
    }

    /// The `tag` parameter, if any.
    pub fn tag(&self) -> Option<&str> {
        self.param("tag").flatten()
    }

    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| p.value.as_deref())
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.param(name).is_some()
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

    pub fn remove_param(&mut self, name: &str) {
        self.params.retain(|p| !p.name.eq_ignore_ascii_case(name));
    }

    /// Set a fresh random tag if none is present, returning the tag in use.
    pub fn ensure_tag(&mut self) -> String {
        if let Some(tag) = self.tag() {
            return tag.to_string();
        }
        let tag = new_tag();
        self.set_param(Param::new("tag", tag.clone()));
        tag
    }
}

impl From<Uri> for NameAddr {
    fn from(uri: Uri) -> Self {
        NameAddr::new(uri)
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(d) = &self.display {
            write!(f, "\"{}\" ", d)?;
        }
        write!(f, "<{}>", self.uri)?;
        for p in &self.params {
            write!(f, ";{}", p)?;
        }
        Ok(())
    }
}

impl FromStr for NameAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(open) = s.find('<') {
            let close = s
                .find('>')
                .ok_or_else(|| Error::InvalidNameAddr(s.to_string()))?;
            if close < open {
                return Err(Error::InvalidNameAddr(s.to_string()));
            }
            let display = s[..open].trim().trim_matches('"');
            let uri: Uri = s[open + 1..close].parse()?;
            let params = s[close + 1..]
                .split(';')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| match p.split_once('=') {
                    Some((n, v)) => Param::new(n.trim(), v.trim()),
                    None => Param::flag(p),
                })
                .collect();
            Ok(NameAddr {
                display: if display.is_empty() {
                    None
                } else {
                    Some(display.to_string())
                },
                uri,
                params,
            })
        } else {
            // Bare form: everything after the first ';' is a header parameter.
            let (uri_part, params_part) = match s.split_once(';') {
                Some((u, p)) => (u, Some(p)),
                None => (s, None),
            };
            let uri: Uri = uri_part.parse()?;
            let params = params_part
                .map(|pp| {
                    pp.split(';')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(|p| match p.split_once('=') {
                            Some((n, v)) => Param::new(n.trim(), v.trim()),
                            None => Param::flag(p),
                        })
                        .collect()
                })
                .unwrap_or_default();
            Ok(NameAddr {
                display: None,
                uri,
                params,
            })
        }
    }
}

/// A random 8-hex-digit tag.
pub fn new_tag() -> String {
    format!("{:08x}", rand::thread_rng().gen::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_angle_form_with_tag() {
        let a: NameAddr = "\"Bob\" <sip:bob@biloxi.com>;tag=a6c85cf".parse().unwrap();
        assert_eq!(a.display.as_deref(), Some("Bob"));
        assert_eq!(a.uri.user.as_deref(), Some("bob"));
        assert_eq!(a.tag(), Some("a6c85cf"));
    }

    #[test]
    fn bare_form_params_are_header_params() {
        let a: NameAddr = "sip:carol@chicago.com;tag=xyz".parse().unwrap();
        assert_eq!(a.tag(), Some("xyz"));
        assert!(a.uri.params.is_empty());
    }

    #[test]
    fn uri_params_stay_inside_brackets() {
        let a: NameAddr = "<sip:p1.example.com;lr>;ob".parse().unwrap();
        assert!(a.uri.is_lr());
        assert!(a.has_param("ob"));
        assert!(!a.uri.has_param("ob"));
    }

    #[test]
    fn ensure_tag_is_stable() {
        let mut a = NameAddr::new(Uri::new("h"));
        let t1 = a.ensure_tag();
        let t2 = a.ensure_tag();
        assert_eq!(t1, t2);
    }
}
