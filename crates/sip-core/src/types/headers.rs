//! Opaque header storage.

use serde::{Deserialize, Serialize};

/// Order-preserving, case-insensitive multi-map for headers the model does
/// not interpret. Names are stored lowercased; values are raw strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        HeaderMap::default()
    }

    /// Append a value, keeping any existing values for the same name.
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push((name.to_ascii_lowercase(), value.into()));
    }

    /// Replace all values for `name` with a single value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.append(name, value);
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(move |(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        self.entries.retain(|(n, _)| *n != name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// All entries in insertion order as (lowercased-name, value).
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_ordered() {
        let mut h = HeaderMap::new();
        h.append("X-Trace", "a");
        h.append("x-trace", "b");
        h.append("User-Agent", "sipflow");
        assert_eq!(h.get("X-TRACE"), Some("a"));
        assert_eq!(h.get_all("x-trace").collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(h.contains("user-agent"));
    }

    #[test]
    fn set_replaces_all() {
        let mut h = HeaderMap::new();
        h.append("warning", "1");
        h.append("warning", "2");
        h.set("Warning", "3");
        assert_eq!(h.get_all("warning").collect::<Vec<_>>(), vec!["3"]);
    }
}
