//! Driver configuration loading via `ortho-config`.

use std::ffi::OsString;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::device::DeviceLocator;

/// Configuration shared by the controller and node roles, merged from
/// defaults, `volplane.toml`, `VOLPLANE_*` environment variables, and CLI
/// flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "VOLPLANE")]
pub struct DriverConfig {
    /// Scaleway API secret key. Required by the controller role.
    pub secret_key: Option<String>,
    /// Project owning the created volumes. Required by the controller role.
    pub project_id: Option<String>,
    /// Zone used when a request carries no placement hint.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub zone: String,
    /// Identifier of the server this process runs on. Required by the node
    /// role.
    pub node_id: Option<String>,
    /// Disk type used when the request parameters name none.
    #[ortho_config(default = "sbs_5k".to_owned())]
    pub default_disk_type: String,
    /// Base URL of the provider API.
    #[ortho_config(default = "https://api.scaleway.com".to_owned())]
    pub api_url: String,
    /// Directory of stable disk symlinks.
    #[ortho_config(default = "/dev/disk/by-id".to_owned())]
    pub by_id_root: String,
    /// Prefix prepended to a disk id to form its symlink name.
    #[ortho_config(default = "scsi-0SCW_sbs_volume-".to_owned())]
    pub device_prefix: String,
    /// Namespace resolved devices must live under.
    #[ortho_config(default = "/dev".to_owned())]
    pub device_root: String,
    /// Directory holding persisted snapshot records.
    #[ortho_config(default = "/var/lib/volplane/metadata".to_owned())]
    pub metadata_dir: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

/// Credentials and scoping validated for the controller role.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ControllerCredentials {
    /// API secret key.
    pub secret_key: String,
    /// Project identifier.
    pub project_id: String,
}

impl DriverConfig {
    fn require_field(value: Option<&str>, metadata: &FieldMetadata) -> Result<String, ConfigError> {
        match value.map(str::trim) {
            Some(text) if !text.is_empty() => Ok(text.to_owned()),
            _ => Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to volplane.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            ))),
        }
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("volplane")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Validates the fields the controller role needs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when the secret key or project
    /// id is empty.
    pub fn validate_controller(&self) -> Result<ControllerCredentials, ConfigError> {
        let secret_key = Self::require_field(
            self.secret_key.as_deref(),
            &FieldMetadata::new("Scaleway API secret key", "VOLPLANE_SECRET_KEY", "secret_key"),
        )?;
        let project_id = Self::require_field(
            self.project_id.as_deref(),
            &FieldMetadata::new("Scaleway project ID", "VOLPLANE_PROJECT_ID", "project_id"),
        )?;
        Ok(ControllerCredentials {
            secret_key,
            project_id,
        })
    }

    /// Validates the fields the node role needs and returns the node id.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when the node id is empty.
    pub fn validate_node(&self) -> Result<String, ConfigError> {
        Self::require_field(
            self.node_id.as_deref(),
            &FieldMetadata::new("node server ID", "VOLPLANE_NODE_ID", "node_id"),
        )
    }

    /// Builds the device locator described by this configuration.
    #[must_use]
    pub fn device_locator(&self) -> DeviceLocator {
        DeviceLocator::new(
            Utf8PathBuf::from(&self.by_id_root),
            self.device_prefix.clone(),
            Utf8PathBuf::from(&self.device_root),
        )
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::EnvGuard;
    use rstest::{fixture, rstest};

    #[fixture]
    fn config() -> DriverConfig {
        DriverConfig {
            secret_key: Some(String::from("secret")),
            project_id: Some(String::from("project")),
            zone: String::from("fr-par-1"),
            node_id: None,
            default_disk_type: String::from("sbs_5k"),
            api_url: String::from("https://api.scaleway.com"),
            by_id_root: String::from("/dev/disk/by-id"),
            device_prefix: String::from("scsi-0SCW_sbs_volume-"),
            device_root: String::from("/dev"),
            metadata_dir: String::from("/var/lib/volplane/metadata"),
        }
    }

    #[rstest]
    fn controller_validation_returns_credentials(config: DriverConfig) {
        let credentials = config.validate_controller().expect("valid");
        assert_eq!(credentials.secret_key, "secret");
        assert_eq!(credentials.project_id, "project");
    }

    #[rstest]
    fn controller_validation_names_env_var(mut config: DriverConfig) {
        config.project_id = Some(String::from("   "));

        let err = config.validate_controller().expect_err("blank project");

        let ConfigError::MissingField(message) = err else {
            panic!("expected missing field, got {err:?}");
        };
        assert!(message.contains("VOLPLANE_PROJECT_ID"), "message: {message}");
    }

    #[rstest]
    fn node_validation_requires_node_id(mut config: DriverConfig) {
        assert!(config.validate_node().is_err());
        config.node_id = Some(String::from("srv-1"));
        assert_eq!(config.validate_node().expect("valid"), "srv-1");
    }

    #[tokio::test]
    async fn load_merges_environment_over_defaults() {
        let _guard = EnvGuard::set_vars(&[
            ("VOLPLANE_ZONE", "nl-ams-1"),
            ("VOLPLANE_NODE_ID", "srv-env"),
        ])
        .await;

        let loaded = DriverConfig::load_without_cli_args().expect("load");

        assert_eq!(loaded.zone, "nl-ams-1");
        assert_eq!(loaded.node_id.as_deref(), Some("srv-env"));
        assert_eq!(loaded.default_disk_type, "sbs_5k");
    }
}
