//! Operation hints.
//!
//! Hints are free-form `KEY:value` pairs attached to operations, used by
//! servers for request tracing and scheduling.  The dispatcher parses
//! the `PVFS2_HINTS` environment variable once at startup and merges the
//! result into every operation's hint set without overwriting hints the
//! request already carries.

use std::env;

use log::warn;

/// An ordered set of hints.  Order is preserved (servers see hints in
/// the order they were added) and keys are unique.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HintSet {
    entries: Vec<(String, String)>,
}

impl HintSet {
    pub fn new() -> HintSet {
        HintSet::default()
    }

    /// Parse the `PVFS2_HINTS` environment variable.
    ///
    /// Format: `KEY:val[+KEY:val...]`.  Malformed elements are skipped
    /// with a warning rather than failing dispatcher startup.
    pub fn from_env() -> HintSet {
        match env::var("PVFS2_HINTS") {
            Ok(val) => Self::parse(&val),
            Err(_) => HintSet::new(),
        }
    }

    pub fn parse(spec: &str) -> HintSet {
        let mut set = HintSet::new();
        for element in spec.split('+') {
            if element.is_empty() {
                continue;
            }
            match element.split_once(':') {
                Some((key, value)) if !key.is_empty() => {
                    set.add(key, value);
                }
                _ => {
                    warn!("malformed hint element ignored: {:?}", element);
                }
            }
        }
        set
    }

    /// Add a hint, replacing any existing value for the key.
    pub fn add(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_owned(),
            None => self.entries.push((key.to_owned(), value.to_owned())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Merge `other` into `self`, keeping existing values on key
    /// collisions.  This is how environment hints join per-request
    /// hints: the request wins.
    pub fn merge_from(&mut self, other: &HintSet) {
        for (key, value) in &other.entries {
            if self.get(key).is_none() {
                self.entries.push((key.clone(), value.clone()));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_multiple() {
        let set = HintSet::parse("REQUEST_ID:42+CLIENT_ID:web3");
        assert_eq!(set.get("REQUEST_ID"), Some("42"));
        assert_eq!(set.get("CLIENT_ID"), Some("web3"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn parse_skips_malformed() {
        let set = HintSet::parse("GOOD:1+bogus+:empty+ALSO:2");
        assert_eq!(set.get("GOOD"), Some("1"));
        assert_eq!(set.get("ALSO"), Some("2"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn merge_does_not_overwrite() {
        let mut request = HintSet::parse("REQUEST_ID:7");
        let env = HintSet::parse("REQUEST_ID:global+TRACE:on");
        request.merge_from(&env);
        assert_eq!(request.get("REQUEST_ID"), Some("7"));
        assert_eq!(request.get("TRACE"), Some("on"));
    }
}
