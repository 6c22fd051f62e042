//! Declarative file fixtures
//!
//! Provider YAML builders and a temporary directory holding the provider and
//! policy files a reloader watches.

use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// One provider entry for [`providers_yaml`].
#[derive(Debug, Clone)]
pub struct ProviderDef {
    pub name: String,
    pub issuer: String,
    pub jwks_uri: String,
    pub cluster_port: u16,
    pub selectors: Vec<(String, String)>,
}

impl ProviderDef {
    /// Provider `name` with issuer `https://{name}.example.com`.
    pub fn new(name: &str, jwks_uri: &str) -> Self {
        Self {
            name: name.to_string(),
            issuer: issuer_for(name),
            jwks_uri: jwks_uri.to_string(),
            cluster_port: 8080,
            selectors: Vec::new(),
        }
    }

    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.issuer = issuer.to_string();
        self
    }

    /// Map `selector` to claim `field`.
    pub fn with_selector(mut self, selector: &str, field: &str) -> Self {
        self.selectors.push((selector.to_string(), field.to_string()));
        self
    }
}

/// Default issuer of a provider built with [`ProviderDef::new`].
pub fn issuer_for(name: &str) -> String {
    format!("https://{name}.example.com")
}

/// Render a providers file.
pub fn providers_yaml(providers: &[ProviderDef]) -> String {
    let mut yaml = String::from("providers:\n");
    for p in providers {
        yaml.push_str(&format!("  {}:\n", p.name));
        yaml.push_str(&format!("    issuer: \"{}\"\n", p.issuer));
        yaml.push_str(&format!("    jwksUri: \"{}\"\n", p.jwks_uri));
        yaml.push_str(&format!("    clusterName: {}\n", p.name));
        yaml.push_str(&format!("    clusterPort: {}\n", p.cluster_port));
        if !p.selectors.is_empty() {
            yaml.push_str("    selectorToClaimField:\n");
            for (selector, field) in &p.selectors {
                yaml.push_str(&format!("      {selector}: {field}\n"));
            }
        }
    }
    yaml
}

/// Policy used across the integration tests.
///
/// - `/strict`: frontend by mTLS or `team1` via oauth1, strict token, block
/// - `/optional`: oauth1 with `allow_missing`, unlisted clients allowed
/// - `/logged`: oauth2 selector client, unlisted clients logged
/// - `/public/`: prefix, GET only, anyone
/// - unlisted endpoints blocked
pub const STANDARD_POLICY: &str = r#"
incoming:
  unlistedEndpointsPolicy: block
  endpoints:
    - path: /strict
      clients: [frontend, "team1:oauth1-selector"]
      unlistedClientsPolicy: block
      oauth:
        provider: oauth1
        verification: offline
        policy: strict
    - path: /optional
      unlistedClientsPolicy: allow
      oauth:
        provider: oauth1
        policy: allow_missing
    - path: /logged
      clients: ["team2:oauth2-selector"]
      unlistedClientsPolicy: log
      oauth:
        provider: oauth2
    - pathPrefix: /public/
      methods: [GET]
      unlistedClientsPolicy: allow
"#;

/// Temporary directory with `providers.yaml` and `policy.yaml`.
pub struct ConfigDir {
    dir: TempDir,
}

impl ConfigDir {
    pub fn new(providers: &str, policy: &str) -> Self {
        let config = Self {
            dir: TempDir::new().expect("temp dir should be created"),
        };
        config.write_providers(providers);
        config.write_policy(policy);
        config
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn providers_path(&self) -> PathBuf {
        self.dir.path().join("providers.yaml")
    }

    pub fn policy_path(&self) -> PathBuf {
        self.dir.path().join("policy.yaml")
    }

    pub fn write_providers(&self, yaml: &str) {
        std::fs::write(self.providers_path(), yaml).expect("providers file should be written");
    }

    pub fn write_policy(&self, yaml: &str) {
        std::fs::write(self.policy_path(), yaml).expect("policy file should be written");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_providers_yaml_renders_selectors() {
        let yaml = providers_yaml(&[
            ProviderDef::new("oauth1", "http://localhost/jwks").with_selector("s1", "authorities"),
            ProviderDef::new("oauth2", "http://localhost/jwks2"),
        ]);
        assert!(yaml.contains("  oauth1:\n"));
        assert!(yaml.contains("      s1: authorities\n"));
        assert!(yaml.contains("issuer: \"https://oauth2.example.com\""));
    }

    #[test]
    fn test_providers_yaml_renders_every_field() {
        let yaml = providers_yaml(&[ProviderDef::new("oauth1", "http://localhost/jwks")
            .with_issuer("https://issuer.test")
            .with_selector("s1", "authorities")]);
        assert_eq!(
            yaml,
            concat!(
                "providers:\n",
                "  oauth1:\n",
                "    issuer: \"https://issuer.test\"\n",
                "    jwksUri: \"http://localhost/jwks\"\n",
                "    clusterName: oauth1\n",
                "    clusterPort: 8080\n",
                "    selectorToClaimField:\n",
                "      s1: authorities\n",
            )
        );
    }

    #[test]
    fn test_config_dir_writes_files() {
        let dir = ConfigDir::new("providers: {}\n", STANDARD_POLICY);
        assert_eq!(
            std::fs::read_to_string(dir.providers_path()).unwrap(),
            "providers: {}\n"
        );
        dir.write_policy("incoming: {}\n");
        assert_eq!(
            std::fs::read_to_string(dir.policy_path()).unwrap(),
            "incoming: {}\n"
        );
    }
}
