//! Verified JWT claim sets.
//!
//! The `sub` claim identifies a user or client and is redacted in Debug
//! output so that claim sets can appear in logs safely.

use serde_json::{Map, Value};
use std::fmt;

/// Decoded claims of a token that passed verification.
#[derive(Clone, Default, PartialEq)]
pub struct ClaimSet(Map<String, Value>);

impl ClaimSet {
    pub fn new(claims: Map<String, Value>) -> Self {
        Self(claims)
    }

    /// Look up a claim by name or dotted path (`realm_access.roles`).
    ///
    /// A top-level claim whose name contains dots wins over nested lookup.
    pub fn get(&self, field: &str) -> Option<&Value> {
        if let Some(value) = self.0.get(field) {
            return Some(value);
        }
        let mut segments = field.split('.');
        let first = self.0.get(segments.next()?)?;
        segments.try_fold(first, |value, segment| value.as_object()?.get(segment))
    }

    /// Whether the claim at `field` contains `expected`.
    ///
    /// Strings, numbers and booleans count as one value; arrays contribute
    /// their scalar members; objects and nulls contribute nothing.
    pub fn contains(&self, field: &str, expected: &str) -> bool {
        match self.get(field) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(scalar_string)
                .any(|v| v == expected),
            Some(value) => scalar_string(value).is_some_and(|v| v == expected),
            None => false,
        }
    }

    pub fn issuer(&self) -> Option<&str> {
        self.0.get("iss").and_then(Value::as_str)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Custom Debug implementation that redacts the `sub` claim.
impl fmt::Debug for ClaimSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in &self.0 {
            if name == "sub" {
                map.entry(name, &"[REDACTED]");
            } else {
                map.entry(name, value);
            }
        }
        map.finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims(value: Value) -> ClaimSet {
        match value {
            Value::Object(map) => ClaimSet::new(map),
            _ => ClaimSet::default(),
        }
    }

    #[test]
    fn test_debug_redacts_sub() {
        let set = claims(json!({"sub": "secret-user-id", "iss": "https://issuer"}));
        let debug_str = format!("{set:?}");

        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("secret-user-id"));
        assert!(debug_str.contains("https://issuer"));
    }

    #[test]
    fn test_contains_scalar_and_list() {
        let set = claims(json!({
            "authorities": ["team1", "team2", 7, {"nested": true}, null],
            "team": "team3",
            "level": 3,
            "admin": false,
            "object": {"a": 1}
        }));

        assert!(set.contains("authorities", "team2"));
        assert!(set.contains("authorities", "7"));
        assert!(!set.contains("authorities", "null"));
        assert!(set.contains("team", "team3"));
        assert!(set.contains("level", "3"));
        assert!(set.contains("admin", "false"));
        assert!(!set.contains("object", "{\"a\":1}"));
        assert!(!set.contains("missing", "team1"));
    }

    #[test]
    fn test_contains() {
        let set = claims(json!({"authorities": ["team1"], "team": "team3"}));
        assert!(set.contains("authorities", "team1"));
        assert!(!set.contains("authorities", "team2"));
        assert!(set.contains("team", "team3"));
        assert!(!set.contains("missing", "team1"));
    }

    #[test]
    fn test_nested_fields() {
        let set = claims(json!({
            "realm_access": {"roles": ["reader", "writer"]},
            "dotted.name": "literal"
        }));

        assert!(set.contains("realm_access.roles", "writer"));
        assert!(!set.contains("realm_access.missing", "writer"));
        assert!(!set.contains("realm_access.roles.deeper", "writer"));
        assert!(set.contains("dotted.name", "literal"));
    }

    #[test]
    fn test_issuer() {
        assert_eq!(
            claims(json!({"iss": "https://a"})).issuer(),
            Some("https://a")
        );
        assert_eq!(claims(json!({"iss": 5})).issuer(), None);
    }
}
