//! SIP request methods.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A SIP request method.
///
/// The variants cover the methods the stack treats specially; anything else
/// is carried verbatim in [`Method::Extension`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Subscribe,
    Notify,
    Refer,
    Update,
    Info,
    Message,
    Prack,
    Publish,
    /// Any other method, stored in its wire spelling.
    Extension(String),
}

impl Method {
    /// Whether a 1xx-with-tag or 2xx response to this method creates a dialog.
    pub fn is_dialog_forming(&self) -> bool {
        matches!(
            self,
            Method::Invite | Method::Subscribe | Method::Refer | Method::Notify
        )
    }

    /// Whether requests with this method may be record-routed by a proxy.
    pub fn allows_record_route(&self) -> bool {
        matches!(
            self,
            Method::Invite | Method::Subscribe | Method::Notify | Method::Refer
        )
    }

    /// The wire spelling of the method.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Refer => "REFER",
            Method::Update => "UPDATE",
            Method::Info => "INFO",
            Method::Message => "MESSAGE",
            Method::Prack => "PRACK",
            Method::Publish => "PUBLISH",
            Method::Extension(s) => s,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "REGISTER" => Method::Register,
            "OPTIONS" => Method::Options,
            "SUBSCRIBE" => Method::Subscribe,
            "NOTIFY" => Method::Notify,
            "REFER" => Method::Refer,
            "UPDATE" => Method::Update,
            "INFO" => Method::Info,
            "MESSAGE" => Method::Message,
            "PRACK" => Method::Prack,
            "PUBLISH" => Method::Publish,
            _ => Method::Extension(s.to_ascii_uppercase()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_methods_case_insensitively() {
        assert_eq!("invite".parse::<Method>().unwrap(), Method::Invite);
        assert_eq!("REGISTER".parse::<Method>().unwrap(), Method::Register);
    }

    #[test]
    fn unknown_method_round_trips() {
        let m: Method = "PING".parse().unwrap();
        assert_eq!(m, Method::Extension("PING".into()));
        assert_eq!(m.to_string(), "PING");
    }

    #[test]
    fn dialog_forming_set() {
        assert!(Method::Invite.is_dialog_forming());
        assert!(Method::Subscribe.is_dialog_forming());
        assert!(!Method::Options.is_dialog_forming());
        assert!(!Method::Register.is_dialog_forming());
    }
}
