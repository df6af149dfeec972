// ABOUTME: Configuration loading for the credential authorizer
// ABOUTME: TOML file under the XDG config directory with defaults for every field

use crate::policy::{AuthorizationMethod, AuthorizationMethods};
use anyhow::{Context, Result};
use keywarden_ssh::SshKeyType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Authorizer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizerConfig {
    /// Type of the key to authorize
    pub key_type: SshKeyType,
    /// How long a published key stays valid
    pub key_validity_secs: u64,
    /// POSIX username to log in as (derived from the login name if unset)
    pub preferred_username: Option<String>,
    /// Backends the authorizer may use
    pub allowed_methods: Vec<AuthorizationMethod>,
    /// Bound on optimistic-concurrency retries for metadata writes
    pub max_metadata_update_attempts: u32,
    /// OpenSSH private key file to use instead of an ephemeral key
    pub persistent_key_path: Option<PathBuf>,
}

impl Default for AuthorizerConfig {
    fn default() -> Self {
        Self {
            key_type: SshKeyType::default(),
            key_validity_secs: 24 * 60 * 60,
            preferred_username: None,
            allowed_methods: AuthorizationMethod::ALL.to_vec(),
            max_metadata_update_attempts: crate::metadata::DEFAULT_MAX_UPDATE_ATTEMPTS,
            persistent_key_path: None,
        }
    }
}

impl AuthorizerConfig {
    /// Get the XDG config directory (~/.config/keywarden)
    pub fn config_dir() -> PathBuf {
        keywarden_ssh::xdg_config_dir().unwrap_or_else(|| PathBuf::from(".").join("keywarden"))
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load config from the XDG config directory, or defaults if absent
    pub fn load() -> Result<Self> {
        let path = Self::config_path();

        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: AuthorizerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        Ok(config)
    }

    pub fn allowed_methods(&self) -> AuthorizationMethods {
        self.allowed_methods.iter().copied().collect()
    }

    pub fn key_validity(&self) -> Duration {
        Duration::from_secs(self.key_validity_secs)
    }

    /// Generate a default config file content
    pub fn default_toml() -> String {
        format!(
            r#"# keywarden configuration
# Location: ~/.config/keywarden/config.toml

# Key type: "ed25519" or "ecdsa-nistp256"
key_type = "ed25519"

# Validity of published keys, in seconds
key_validity_secs = 86400

# preferred_username = "alice"

# Any of "instance-metadata", "project-metadata", "oslogin"
allowed_methods = ["instance-metadata", "project-metadata", "oslogin"]

max_metadata_update_attempts = {attempts}

# Use a persistent key instead of an ephemeral one
# persistent_key_path = "~/.config/keywarden/id_keywarden"
"#,
            attempts = crate::metadata::DEFAULT_MAX_UPDATE_ATTEMPTS,
        )
    }

    /// Initialize config directory and create default config if needed
    pub fn init() -> Result<PathBuf> {
        let config_dir = Self::config_dir();
        let config_path = Self::config_path();

        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

        if !config_path.exists() {
            std::fs::write(&config_path, Self::default_toml())
                .with_context(|| format!("Failed to write config: {}", config_path.display()))?;
        }

        Ok(config_path)
    }
}
