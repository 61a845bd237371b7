//! Digest challenge generation and verification (RFC 2617 as profiled by
//! RFC 3261 §22): `qop=auth`, `algorithm=MD5`.

use std::fmt;
use std::net::IpAddr;

use md5::{Digest as _, Md5};
use sha2::Sha256;
use tracing::debug;

use sipflow_sip_core::Method;

use crate::error::{Error, Result};
use crate::nonce::NonceStore;

/// Prefix marking a stored secret as a pre-computed HA1.
pub const HA1_PREFIX: &str = "HA1!";

/// A challenge to embed in a 401/407 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: String,
}

impl DigestChallenge {
    pub fn new(realm: impl Into<String>, nonce: impl Into<String>, service: &str) -> Self {
        DigestChallenge {
            realm: realm.into(),
            nonce: nonce.into(),
            opaque: opaque_for(service),
        }
    }
}

impl fmt::Display for DigestChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Digest realm=\"{}\", nonce=\"{}\", opaque=\"{}\", algorithm=MD5, qop=\"auth\"",
            self.realm, self.nonce, self.opaque
        )
    }
}

/// Parsed Authorization/Proxy-Authorization credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub cnonce: String,
    pub nc: String,
    pub qop: Option<String>,
    pub algorithm: Option<String>,
    pub opaque: Option<String>,
}

impl DigestCredentials {
    /// Parse a `Digest k="v", ...` header value.
    pub fn parse(value: &str) -> Result<Self> {
        let rest = value
            .trim()
            .strip_prefix("Digest")
            .ok_or_else(|| Error::InvalidAuthHeader(value.to_string()))?;

        let mut creds = DigestCredentials::default();
        for item in split_comma_params(rest) {
            let Some((k, v)) = item.split_once('=') else {
                continue;
            };
            let k = k.trim().to_ascii_lowercase();
            let v = v.trim().trim_matches('"').to_string();
            match k.as_str() {
                "username" => creds.username = v,
                "realm" => creds.realm = v,
                "nonce" => creds.nonce = v,
                "uri" => creds.uri = v,
                "response" => creds.response = v,
                "cnonce" => creds.cnonce = v,
                "nc" => creds.nc = v,
                "qop" => creds.qop = Some(v),
                "algorithm" => creds.algorithm = Some(v),
                "opaque" => creds.opaque = Some(v),
                _ => {}
            }
        }
        if creds.username.is_empty() || creds.nonce.is_empty() || creds.response.is_empty() {
            return Err(Error::InvalidAuthHeader(value.to_string()));
        }
        Ok(creds)
    }
}

/// Comma-split that respects quoted values.
fn split_comma_params(s: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                items.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(s[start..].trim());
    items.into_iter().filter(|i| !i.is_empty()).collect()
}

/// A stored secret: either a plain password or a pre-hashed HA1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Secret {
    Password(String),
    Ha1(String),
}

impl Secret {
    /// Interpret a stored value, honouring the `HA1!` prefix.
    pub fn from_stored(value: &str) -> Self {
        match value.strip_prefix(HA1_PREFIX) {
            Some(ha1) => Secret::Ha1(ha1.to_string()),
            None => Secret::Password(value.to_string()),
        }
    }

    fn ha1(&self, user: &str, realm: &str) -> String {
        match self {
            Secret::Ha1(h) => h.clone(),
            Secret::Password(pass) => md5_hex(&format!("{}:{}:{}", user, realm, pass)),
        }
    }
}

/// Outcome of verifying a request's credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestOutcome {
    /// Credentials check out.
    Valid,
    /// The nonce is stale but the opaque matched; the client should retry
    /// against a fresh challenge.
    Invalid,
    /// Hard failure: wrong digest, wrong source, or a foreign opaque.
    Failed,
}

/// Verify credentials against the nonce table and a stored secret.
///
/// The source-address check is waived for ACK, which may arrive after the
/// nonce was consumed by the INVITE but must still digest over `INVITE`.
pub fn verify_credentials(
    service: &str,
    call_id: &str,
    method: &Method,
    source_ip: IpAddr,
    creds: &DigestCredentials,
    secret: &Secret,
    nonces: &NonceStore,
) -> Result<DigestOutcome> {
    if let Some(qop) = &creds.qop {
        if !qop.eq_ignore_ascii_case("auth") {
            return Err(Error::InvalidAuthHeader(format!("qop={}", qop)));
        }
    }
    if let Some(alg) = &creds.algorithm {
        if !alg.eq_ignore_ascii_case("md5") {
            return Err(Error::InvalidAuthHeader(format!("algorithm={}", alg)));
        }
    }

    let is_ack = *method == Method::Ack;
    match nonces.get(service, call_id, &creds.nonce) {
        Some(issued_to) => {
            if !is_ack && issued_to != source_ip {
                debug!(user = %creds.username, "digest source address mismatch");
                return Ok(DigestOutcome::Failed);
            }
        }
        None => {
            // Nonce miss: a matching opaque means "ours, but expired".
            return if creds.opaque.as_deref() == Some(opaque_for(service).as_str()) {
                Ok(DigestOutcome::Invalid)
            } else {
                Err(Error::UnknownNonce)
            };
        }
    }

    let expected = expected_response(creds, method, secret);
    if expected == creds.response {
        Ok(DigestOutcome::Valid)
    } else {
        debug!(user = %creds.username, "digest response mismatch");
        Ok(DigestOutcome::Failed)
    }
}

/// The digest the client should have produced.
///
/// `response = MD5(HA1:nonce:nc:cnonce:auth:HA2)` with `HA2 = MD5(method:uri)`;
/// an ACK digests over `INVITE`.
pub fn expected_response(creds: &DigestCredentials, method: &Method, secret: &Secret) -> String {
    let method = match method {
        Method::Ack => Method::Invite,
        m => m.clone(),
    };
    let ha1 = secret.ha1(&creds.username, &creds.realm);
    let ha2 = md5_hex(&format!("{}:{}", method, creds.uri));
    if creds.qop.is_some() {
        md5_hex(&format!(
            "{}:{}:{}:{}:auth:{}",
            ha1, creds.nonce, creds.nc, creds.cnonce, ha2
        ))
    } else {
        md5_hex(&format!("{}:{}:{}", ha1, creds.nonce, ha2))
    }
}

/// The opaque value identifying this service in challenges.
pub fn opaque_for(service: &str) -> String {
    let digest = Sha256::digest(service.as_bytes());
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn md5_hex(input: &str) -> String {
    let digest = Md5::digest(input.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn creds(nonce: &str, response: &str) -> DigestCredentials {
        DigestCredentials {
            username: "alice".into(),
            realm: "sipflow".into(),
            nonce: nonce.into(),
            uri: "sip:registrar.example".into(),
            response: response.into(),
            cnonce: "abc".into(),
            nc: "00000001".into(),
            qop: Some("auth".into()),
            algorithm: Some("MD5".into()),
            opaque: Some(opaque_for("svc")),
        }
    }

    fn valid_response(c: &DigestCredentials, method: &Method, secret: &Secret) -> String {
        expected_response(c, method, secret)
    }

    #[test]
    fn parses_quoted_header() {
        let c = DigestCredentials::parse(
            "Digest username=\"alice\", realm=\"r\", nonce=\"n1\", uri=\"sip:h\", \
             response=\"cafe\", cnonce=\"x\", nc=00000001, qop=auth, algorithm=MD5",
        )
        .unwrap();
        assert_eq!(c.username, "alice");
        assert_eq!(c.nc, "00000001");
        assert_eq!(c.qop.as_deref(), Some("auth"));
    }

    #[test]
    fn rejects_non_digest() {
        assert!(DigestCredentials::parse("Basic dXNlcjpwYXNz").is_err());
    }

    #[test]
    fn verifies_good_credentials() {
        let store = NonceStore::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        store.insert("svc", "c1", "n1", ip, Duration::from_secs(30));

        let secret = Secret::Password("secret".into());
        let mut c = creds("n1", "");
        c.response = valid_response(&c, &Method::Register, &secret);

        let out =
            verify_credentials("svc", "c1", &Method::Register, ip, &c, &secret, &store).unwrap();
        assert_eq!(out, DigestOutcome::Valid);
    }

    #[test]
    fn wrong_source_ip_fails_but_ack_is_waived() {
        let store = NonceStore::new();
        let issued: IpAddr = "10.0.0.1".parse().unwrap();
        let other: IpAddr = "10.9.9.9".parse().unwrap();
        store.insert("svc", "c1", "n1", issued, Duration::from_secs(30));

        let secret = Secret::Password("secret".into());
        let mut c = creds("n1", "");
        c.response = valid_response(&c, &Method::Invite, &secret);
        let out =
            verify_credentials("svc", "c1", &Method::Invite, other, &c, &secret, &store).unwrap();
        assert_eq!(out, DigestOutcome::Failed);

        // Same credentials from the wrong address are fine for ACK, which
        // also digests over INVITE.
        let out =
            verify_credentials("svc", "c1", &Method::Ack, other, &c, &secret, &store).unwrap();
        assert_eq!(out, DigestOutcome::Valid);
    }

    #[test]
    fn stale_nonce_with_our_opaque_is_retryable() {
        let store = NonceStore::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let secret = Secret::Password("secret".into());
        let c = creds("gone", "whatever");
        let out =
            verify_credentials("svc", "c1", &Method::Register, ip, &c, &secret, &store).unwrap();
        assert_eq!(out, DigestOutcome::Invalid);
    }

    #[test]
    fn foreign_opaque_is_a_hard_failure() {
        let store = NonceStore::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let secret = Secret::Password("secret".into());
        let mut c = creds("gone", "whatever");
        c.opaque = Some("feedface00000000".into());
        let err = verify_credentials("svc", "c1", &Method::Register, ip, &c, &secret, &store);
        assert_eq!(err, Err(Error::UnknownNonce));
    }

    #[test]
    fn prehashed_ha1_is_used_directly() {
        let pass_secret = Secret::Password("secret".into());
        let ha1 = md5_hex("alice:sipflow:secret");
        let ha1_secret = Secret::from_stored(&format!("HA1!{}", ha1));
        let c = creds("n1", "");
        assert_eq!(
            expected_response(&c, &Method::Register, &pass_secret),
            expected_response(&c, &Method::Register, &ha1_secret),
        );
    }
}
