//! Validated incoming-permission model.
//!
//! Values here are only produced by [`super::loader::compile`] and are
//! immutable afterwards. Endpoint order is precedence order: the first rule
//! whose matcher and method filter accept a request wins.

use regex::Regex;
use serde::{Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Default action when no endpoint or client rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnlistedPolicy {
    Block,
    Log,
    Allow,
}

impl FromStr for UnlistedPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(Self::Block),
            "log" => Ok(Self::Log),
            "allow" => Ok(Self::Allow),
            _ => Err(()),
        }
    }
}

impl fmt::Display for UnlistedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Block => "block",
            Self::Log => "log",
            Self::Allow => "allow",
        })
    }
}

// === PathMatcher ===

/// How an endpoint rule selects request paths.
#[derive(Clone, Debug)]
pub enum PathMatcher {
    Exact(String),
    Prefix(String),
    /// Anchored so that it must match the whole path.
    Regex(Regex),
}

impl PartialEq for PathMatcher {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Exact(l0), Self::Exact(r0)) => l0 == r0,
            (Self::Prefix(l0), Self::Prefix(r0)) => l0 == r0,
            (Self::Regex(l0), Self::Regex(r0)) => l0.as_str() == r0.as_str(),
            _ => false,
        }
    }
}

impl Eq for PathMatcher {}

impl PathMatcher {
    /// Compile a full-match regular expression.
    ///
    /// # Errors
    ///
    /// Returns the regex error for invalid patterns.
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::Regex(Regex::new(&format!("^(?:{pattern})$"))?))
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(exact) => path == exact,
            Self::Prefix(prefix) => path.starts_with(prefix.as_str()),
            Self::Regex(re) => re.is_match(path),
        }
    }

    /// Whether every path this matcher accepts is also accepted by `self`.
    ///
    /// Conservative: regexes only cover exact paths they match and
    /// identical regexes.
    pub fn covers(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Prefix(p), _) if p.is_empty() => true,
            (_, Self::Exact(path)) => self.matches(path),
            (Self::Prefix(p), Self::Prefix(q)) => q.starts_with(p.as_str()),
            (Self::Regex(l), Self::Regex(r)) => l.as_str() == r.as_str(),
            _ => false,
        }
    }
}

impl fmt::Display for PathMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(p) => write!(f, "path={p}"),
            Self::Prefix(p) => write!(f, "pathPrefix={p}"),
            Self::Regex(re) => write!(f, "pathRegex={}", re.as_str()),
        }
    }
}

impl Serialize for PathMatcher {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        #[serde(rename_all = "lowercase")]
        enum Repr<'a> {
            Exact(&'a str),
            Prefix(&'a str),
            Regex(&'a str),
        }

        match self {
            Self::Exact(p) => Repr::Exact(p),
            Self::Prefix(p) => Repr::Prefix(p),
            Self::Regex(re) => Repr::Regex(re.as_str()),
        }
        .serialize(serializer)
    }
}

// === ClientRef ===

/// A permitted caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientRef {
    /// Matched against the mTLS peer identity.
    Service { name: String },
    /// Matched against the claim the selector maps to.
    Selector { name: String, selector: String },
}

impl ClientRef {
    /// Parse `service` or `service:selector`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.split_once(':') {
            None if !value.is_empty() => Some(Self::Service {
                name: value.to_string(),
            }),
            Some((name, selector))
                if !name.is_empty() && !selector.is_empty() && !selector.contains(':') =>
            {
                Some(Self::Selector {
                    name: name.to_string(),
                    selector: selector.to_string(),
                })
            }
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Service { name } | Self::Selector { name, .. } => name,
        }
    }
}

impl fmt::Display for ClientRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service { name } => f.write_str(name),
            Self::Selector { name, selector } => write!(f, "{name}:{selector}"),
        }
    }
}

// === OAuth ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMode {
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthPolicy {
    /// A token is required and must verify.
    Strict,
    /// No token is fine; a presented token must still verify.
    AllowMissing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthRequirement {
    pub provider: String,
    pub verification: VerificationMode,
    pub policy: OAuthPolicy,
}

// === Rules ===

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointRule {
    pub matcher: PathMatcher,
    /// Upper-case methods; empty accepts any method.
    pub methods: BTreeSet<String>,
    pub clients: Vec<ClientRef>,
    pub unlisted_clients_policy: UnlistedPolicy,
    pub oauth: Option<OAuthRequirement>,
}

impl EndpointRule {
    pub fn matches(&self, path: &str, method: &str) -> bool {
        self.matcher.matches(path) && self.accepts_method(method)
    }

    fn accepts_method(&self, method: &str) -> bool {
        self.methods.is_empty()
            || self
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method))
    }

    /// Whether every request this rule could see is taken by `self` first.
    pub fn covers(&self, later: &Self) -> bool {
        let methods_covered = self.methods.is_empty()
            || (!later.methods.is_empty() && later.methods.is_subset(&self.methods));
        methods_covered && self.matcher.covers(&later.matcher)
    }
}

/// A rule that can never match because an earlier rule takes all its traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowedRule {
    pub index: usize,
    pub shadowed_by: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingPermissions {
    pub unlisted_endpoints_policy: UnlistedPolicy,
    pub endpoints: Vec<EndpointRule>,
    pub shadowed: Vec<ShadowedRule>,
}

impl IncomingPermissions {
    /// First rule accepting the request, with its index.
    pub fn match_endpoint(&self, path: &str, method: &str) -> Option<(usize, &EndpointRule)> {
        self.endpoints
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.matches(path, method))
    }

    /// Distinct providers referenced by `oauth` blocks.
    pub fn referenced_providers(&self) -> BTreeSet<&str> {
        self.endpoints
            .iter()
            .filter_map(|rule| rule.oauth.as_ref())
            .map(|oauth| oauth.provider.as_str())
            .collect()
    }
}

/// Rules unreachable because an earlier rule covers them.
pub fn find_shadowed(endpoints: &[EndpointRule]) -> Vec<ShadowedRule> {
    endpoints
        .iter()
        .enumerate()
        .filter_map(|(index, later)| {
            endpoints
                .iter()
                .take(index)
                .position(|earlier| earlier.covers(later))
                .map(|shadowed_by| ShadowedRule { index, shadowed_by })
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn rule(matcher: PathMatcher, methods: &[&str]) -> EndpointRule {
        EndpointRule {
            matcher,
            methods: methods.iter().map(|m| (*m).to_string()).collect(),
            clients: vec![],
            unlisted_clients_policy: UnlistedPolicy::Block,
            oauth: None,
        }
    }

    #[test]
    fn test_path_matching() {
        let exact = PathMatcher::Exact("/api".to_string());
        assert!(exact.matches("/api"));
        assert!(!exact.matches("/api/x"));

        let prefix = PathMatcher::Prefix("/api/".to_string());
        assert!(prefix.matches("/api/x"));
        assert!(!prefix.matches("/apix"));

        let re = PathMatcher::regex("/users/[0-9]+").unwrap();
        assert!(re.matches("/users/42"));
        assert!(!re.matches("/users/42/orders"));
        assert!(!re.matches("/v1/users/42"));
    }

    #[test]
    fn test_invalid_regex() {
        assert!(PathMatcher::regex("/users/(").is_err());
    }

    #[test]
    fn test_regex_equality_by_pattern() {
        assert_eq!(
            PathMatcher::regex("/a.*").unwrap(),
            PathMatcher::regex("/a.*").unwrap()
        );
        assert_ne!(
            PathMatcher::regex("/a.*").unwrap(),
            PathMatcher::Prefix("/a".to_string())
        );
    }

    #[test]
    fn test_client_ref_parse() {
        assert_eq!(
            ClientRef::parse("billing"),
            Some(ClientRef::Service {
                name: "billing".to_string()
            })
        );
        assert_eq!(
            ClientRef::parse("team1:oauth-selector"),
            Some(ClientRef::Selector {
                name: "team1".to_string(),
                selector: "oauth-selector".to_string()
            })
        );
        for bad in ["", ":sel", "svc:", "a:b:c"] {
            assert_eq!(ClientRef::parse(bad), None, "{bad:?}");
        }
        assert_eq!(
            ClientRef::parse("team1:s").unwrap().to_string(),
            "team1:s"
        );
    }

    #[test]
    fn test_method_filter() {
        let r = rule(PathMatcher::Exact("/x".to_string()), &["GET", "POST"]);
        assert!(r.matches("/x", "get"));
        assert!(r.matches("/x", "POST"));
        assert!(!r.matches("/x", "DELETE"));

        let any = rule(PathMatcher::Exact("/x".to_string()), &[]);
        assert!(any.matches("/x", "PATCH"));
    }

    #[test]
    fn test_first_match_wins() {
        let permissions = IncomingPermissions {
            unlisted_endpoints_policy: UnlistedPolicy::Block,
            endpoints: vec![
                rule(PathMatcher::Prefix("/api/admin".to_string()), &[]),
                rule(PathMatcher::Prefix("/api".to_string()), &[]),
            ],
            shadowed: vec![],
        };

        assert_eq!(permissions.match_endpoint("/api/admin/x", "GET").unwrap().0, 0);
        assert_eq!(permissions.match_endpoint("/api/users", "GET").unwrap().0, 1);
        assert!(permissions.match_endpoint("/other", "GET").is_none());
    }

    #[test]
    fn test_shadowing() {
        let endpoints = vec![
            rule(PathMatcher::Prefix("/api".to_string()), &["GET"]),
            // covered: GET only under /api
            rule(PathMatcher::Exact("/api/users".to_string()), &["GET"]),
            // not covered: POST is not in the earlier method set
            rule(PathMatcher::Exact("/api/users".to_string()), &["POST"]),
            // not covered: any-method rule is wider than GET
            rule(PathMatcher::Prefix("/api/v2".to_string()), &[]),
            rule(PathMatcher::Prefix(String::new()), &[]),
            // everything after a catch-all is shadowed
            rule(PathMatcher::regex("/z.*").unwrap(), &[]),
        ];

        let shadowed = find_shadowed(&endpoints);
        assert_eq!(
            shadowed,
            vec![
                ShadowedRule {
                    index: 1,
                    shadowed_by: 0
                },
                ShadowedRule {
                    index: 5,
                    shadowed_by: 4
                },
            ]
        );
    }

    #[test]
    fn test_matcher_serialization() {
        let json = serde_json::to_value(PathMatcher::regex("/a").unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"regex": "^(?:/a)$"}));
        let json = serde_json::to_value(PathMatcher::Prefix("/p".to_string())).unwrap();
        assert_eq!(json, serde_json::json!({"prefix": "/p"}));
    }
}
