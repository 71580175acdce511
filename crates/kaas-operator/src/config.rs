//! Control plane settings
//!
//! Settings come from an optional YAML file; command-line flags and their
//! environment variables override individual fields.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use kaas_common::{Error, Result};
use kaas_hierarchy::controller::DEFAULT_CONTROLLER_IMAGE;

fn default_database_path() -> PathBuf {
    PathBuf::from("kaas.db")
}

fn default_workers() -> usize {
    4
}

fn default_issuer_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_token_ttl_secs() -> u64 {
    10 * 60
}

fn default_key_rotation_secs() -> u64 {
    24 * 60 * 60
}

fn default_key_lead_secs() -> u64 {
    10 * 60
}

fn default_controller_image() -> String {
    DEFAULT_CONTROLLER_IMAGE.to_string()
}

/// Everything the control plane needs to start
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Settings {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Concurrent task workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Public base URL of the identity endpoints
    #[serde(default = "default_issuer_base_url")]
    pub issuer_base_url: String,
    /// Token endpoint advertised in discovery documents
    #[serde(default)]
    pub token_endpoint: Option<String>,
    /// Address the identity endpoints listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Lifetime of issued tokens, seconds
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    /// Active lifetime of a signing key, seconds
    #[serde(default = "default_key_rotation_secs")]
    pub key_rotation_secs: u64,
    /// Publication lead time of a staged key, seconds
    #[serde(default = "default_key_lead_secs")]
    pub key_publication_lead_secs: u64,
    /// Host cluster kubeconfig; in-cluster config when unset
    #[serde(default)]
    pub host_kubeconfig: Option<PathBuf>,
    /// Domain under which virtual API servers are exposed
    #[serde(default)]
    pub endpoint_domain: Option<String>,
    /// Hierarchy controller image installed into each workspace
    #[serde(default = "default_controller_image")]
    pub hierarchy_controller_image: String,
    /// Where external webhook events are forwarded
    #[serde(default)]
    pub webhook_forward_url: Option<String>,
    /// Plan catalog file; built-in plans when unset
    #[serde(default)]
    pub plan_catalog: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            workers: default_workers(),
            issuer_base_url: default_issuer_base_url(),
            token_endpoint: None,
            listen_addr: default_listen_addr(),
            token_ttl_secs: default_token_ttl_secs(),
            key_rotation_secs: default_key_rotation_secs(),
            key_publication_lead_secs: default_key_lead_secs(),
            host_kubeconfig: None,
            endpoint_domain: None,
            hierarchy_controller_image: default_controller_image(),
            webhook_forward_url: None,
            plan_catalog: None,
        }
    }
}

impl Settings {
    /// Parse settings from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(yaml)
            .map_err(|e| Error::serialization_for("settings", e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read settings from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::internal_with_context("settings", format!("{}: {e}", path.display()))
        })?;
        Self::from_yaml(&yaml)
    }

    /// Reject settings the control plane cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::validation_for_field("settings", "workers", "must be at least 1"));
        }
        if self.token_ttl_secs == 0 {
            return Err(Error::validation_for_field(
                "settings",
                "tokenTtlSecs",
                "must be positive",
            ));
        }
        if self.key_publication_lead_secs >= self.key_rotation_secs {
            return Err(Error::validation_for_field(
                "settings",
                "keyPublicationLeadSecs",
                "must be shorter than the key rotation interval",
            ));
        }
        if !self.issuer_base_url.starts_with("https://")
            && !self.issuer_base_url.starts_with("http://")
        {
            return Err(Error::validation_for_field(
                "settings",
                "issuerBaseUrl",
                "must be an http(s) URL",
            ));
        }
        Ok(())
    }

    /// Token lifetime
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings = Settings::from_yaml(
            "issuerBaseUrl: https://id.example.com\nworkers: 8\nendpointDomain: kaas.example.com\n",
        )
        .expect("settings");
        assert_eq!(settings.workers, 8);
        assert_eq!(settings.issuer_base_url, "https://id.example.com");
        assert_eq!(settings.endpoint_domain.as_deref(), Some("kaas.example.com"));
        assert_eq!(settings.token_ttl(), Duration::from_secs(600));
        assert_eq!(settings.database_path, PathBuf::from("kaas.db"));
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        assert!(Settings::from_yaml("workers: 0\n").is_err());
        assert!(Settings::from_yaml("keyRotationSecs: 60\nkeyPublicationLeadSecs: 60\n").is_err());
        assert!(Settings::from_yaml("issuerBaseUrl: id.example.com\n").is_err());
        assert!(Settings::from_yaml("unknownField: 1\n").is_err());
    }
}
