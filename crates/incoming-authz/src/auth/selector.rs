//! Claim Selector Resolver.
//!
//! A selector is a provider-scoped name for a claim field. A selector client
//! `team1:oauth-selector` on an endpoint requiring provider `p` matches when
//! the claim `p` maps `oauth-selector` to contains `team1`.

use crate::auth::claims::ClaimSet;
use crate::providers::OAuthProvider;

/// Whether `claims` name `expected_client` through `selector` of `provider`.
///
/// An undefined selector never matches; the loader rejects them before they
/// can reach a published snapshot.
pub fn matches_provider(
    provider: &OAuthProvider,
    selector: &str,
    claims: &ClaimSet,
    expected_client: &str,
) -> bool {
    let Some(field) = provider.claim_field(selector) else {
        tracing::debug!(
            target: "authz.decision",
            provider = %provider.name,
            selector = %selector,
            "Selector is not defined by provider"
        );
        return false;
    };
    claims.contains(field, expected_client)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn provider(name: &str, field: &str) -> OAuthProvider {
        OAuthProvider {
            name: name.to_string(),
            issuer: format!("https://{name}"),
            jwks_uri: format!("https://{name}/jwks"),
            cluster_name: name.to_string(),
            cluster_port: 443,
            selector_to_claim_field: BTreeMap::from([("s".to_string(), field.to_string())]),
        }
    }

    fn claims() -> ClaimSet {
        match json!({"authorities": ["team1"], "groups": "team9"}) {
            serde_json::Value::Object(map) => ClaimSet::new(map),
            _ => ClaimSet::default(),
        }
    }

    #[test]
    fn test_selector_resolves_per_provider() {
        let oauth1 = provider("oauth1", "authorities");
        let oauth2 = provider("oauth2", "groups");
        let claims = claims();

        assert!(matches_provider(&oauth1, "s", &claims, "team1"));
        assert!(!matches_provider(&oauth2, "s", &claims, "team1"));
        assert!(matches_provider(&oauth2, "s", &claims, "team9"));
    }

    #[test]
    fn test_unknown_selector_does_not_match() {
        let oauth1 = provider("oauth1", "authorities");
        assert!(!matches_provider(&oauth1, "other", &claims(), "team1"));
    }

    #[test]
    fn test_absent_claim_is_no_match() {
        let oauth1 = provider("oauth1", "authorities");
        assert!(!matches_provider(&oauth1, "s", &ClaimSet::default(), "team1"));
    }
}
