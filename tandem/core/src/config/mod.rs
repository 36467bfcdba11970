//! Client Configuration
//!
//! Where the server lives, how to authenticate, and which models answer a
//! turn. Read from `~/.config/tandem/client.toml`.
//!
//! # Layering
//!
//! Later layers win:
//! 1. Built-in defaults
//! 2. `client.toml`
//! 3. `TANDEM_*` environment variables
//! 4. Command-line flags, applied by the caller through [`ConfigOverrides`]
//!
//! # client.toml
//!
//! ```toml
//! [server]
//! base_url = "http://localhost:3030/api"
//! token = "eyJhbGciOi..."
//! connect_timeout_secs = 10
//! request_timeout_secs = 300
//!
//! [chat]
//! default_model = "qwen3:latest"
//! second_model = "llama3.2"
//! dual = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conversation::{ChatMode, DEFAULT_MODEL};

// =============================================================================
// Error Types
// =============================================================================

/// Configuration could not be loaded
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read
    #[error("cannot read {path}: {source}")]
    ReadError {
        /// File path
        path: PathBuf,
        /// Cause
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema
    #[error("invalid client.toml: {0}")]
    ParseError(#[from] toml::de::Error),

    /// A value failed validation
    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// The highest layer that contributed a value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Command-line flag
    Cli,
    /// `TANDEM_*` variable
    Env,
    /// `client.toml`
    File,
    /// Built-in default
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Base URL including the API prefix
    pub base_url: Option<String>,

    /// Bearer token
    pub token: Option<String>,

    /// Connection timeout in seconds
    pub connect_timeout_secs: Option<u64>,

    /// Whole-stream timeout in seconds
    pub request_timeout_secs: Option<u64>,
}

/// Chat section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatToml {
    /// Model for new conversations
    pub default_model: Option<String>,

    /// Model answering as side B in dual mode
    pub second_model: Option<String>,

    /// Start in dual mode
    pub dual: Option<bool>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientToml {
    /// Server configuration section
    pub server: ServerToml,

    /// Chat configuration section
    pub chat: ChatToml,
}

// =============================================================================
// Main Configuration Structs
// =============================================================================

/// Connection settings for the chat server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Base URL including the API prefix
    pub base_url: String,
    /// Bearer token (None = unauthenticated)
    pub token: Option<String>,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Whole-stream timeout; expiry surfaces as a stream error
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3030/api".to_string(),
            token: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(300),
        }
    }
}

/// Chat behaviour settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatConfig {
    /// Model for new conversations
    pub default_model: String,
    /// Model answering as side B in dual mode
    pub second_model: Option<String>,
    /// Start in dual mode
    pub dual: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL.to_string(),
            second_model: None,
            dual: false,
        }
    }
}

impl ChatConfig {
    /// The mode a session starts in
    #[must_use]
    pub fn initial_mode(&self) -> ChatMode {
        match (self.dual, &self.second_model) {
            (true, Some(second)) => ChatMode::Dual {
                second_model: second.clone(),
            },
            _ => ChatMode::Single,
        }
    }
}

/// Centralized client configuration
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Server connection settings
    pub server: ServerConfig,
    /// Chat settings
    pub chat: ChatConfig,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Source of configuration values
    source: ConfigSource,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            chat: ChatConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ClientConfig {
    /// Get the highest-priority source that contributed a value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for an unusable base URL or
    /// dual mode without a second model.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.server.base_url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::ValidationError(format!(
                "base_url must start with http:// or https:// (got '{url}')"
            )));
        }
        if self.chat.dual && self.chat.second_model.is_none() {
            return Err(ConfigError::ValidationError(
                "dual mode requires a second_model".to_string(),
            ));
        }
        if self.server.request_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "request_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/tandem/client.toml` or
/// `~/.config/tandem/client.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("tandem").join("client.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub async fn load_config() -> Result<ClientConfig, ConfigError> {
    load_config_from_path(default_config_path()).await
}

/// Load configuration from a specific path, then the environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub async fn load_config_from_path(path: Option<PathBuf>) -> Result<ClientConfig, ConfigError> {
    let mut config = ClientConfig::default();

    if let Some(ref config_path) = path {
        match tokio::fs::read_to_string(config_path).await {
            Ok(toml_content) => {
                let toml_config: ClientToml = toml::from_str(&toml_content)?;
                apply_toml_config(&mut config, &toml_config);
                config.config_file_path = Some(config_path.clone());
                config.source = ConfigSource::File;

                tracing::info!(
                    path = %config_path.display(),
                    "Loaded configuration from file"
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(
                    path = %config_path.display(),
                    "Config file not found, using defaults"
                );
            }
            Err(e) => {
                return Err(ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                });
            }
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut ClientConfig, toml: &ClientToml) {
    if let Some(ref url) = toml.server.base_url {
        config.server.base_url.clone_from(url);
    }
    if toml.server.token.is_some() {
        config.server.token.clone_from(&toml.server.token);
    }
    if let Some(secs) = toml.server.connect_timeout_secs {
        config.server.connect_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.server.request_timeout_secs {
        config.server.request_timeout = Duration::from_secs(secs);
    }

    if let Some(ref model) = toml.chat.default_model {
        config.chat.default_model.clone_from(model);
    }
    if toml.chat.second_model.is_some() {
        config.chat.second_model.clone_from(&toml.chat.second_model);
    }
    if let Some(dual) = toml.chat.dual {
        config.chat.dual = dual;
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut ClientConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(url) = var("TANDEM_BASE_URL") {
        config.server.base_url = url;
        config.source = ConfigSource::Env;
    }
    if let Some(token) = var("TANDEM_TOKEN") {
        config.server.token = Some(token);
        config.source = ConfigSource::Env;
    }
    if let Some(timeout) = var("TANDEM_REQUEST_TIMEOUT") {
        if let Ok(secs) = timeout.parse::<u64>() {
            config.server.request_timeout = Duration::from_secs(secs);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(model) = var("TANDEM_MODEL") {
        config.chat.default_model = model;
        config.source = ConfigSource::Env;
    }
    if let Some(model) = var("TANDEM_SECOND_MODEL") {
        config.chat.second_model = Some(model);
        config.source = ConfigSource::Env;
    }
    if let Some(dual) = var("TANDEM_DUAL") {
        config.chat.dual = dual == "1" || dual.eq_ignore_ascii_case("true");
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Base URL override
    pub base_url: Option<String>,

    /// Token override
    pub token: Option<String>,

    /// Default model override
    pub default_model: Option<String>,

    /// Second model override
    pub second_model: Option<String>,

    /// Dual mode override
    pub dual: Option<bool>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set base URL override
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set token override
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set default model override
    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    /// Set second model override
    #[must_use]
    pub fn with_second_model(mut self, model: impl Into<String>) -> Self {
        self.second_model = Some(model.into());
        self
    }

    /// Set dual mode override
    #[must_use]
    pub fn with_dual(mut self, dual: bool) -> Self {
        self.dual = Some(dual);
        self
    }

    /// Whether any override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.base_url.is_none()
            && self.token.is_none()
            && self.default_model.is_none()
            && self.second_model.is_none()
            && self.dual.is_none()
    }

    /// Apply overrides to a loaded configuration
    pub fn apply(self, config: &mut ClientConfig) {
        if self.is_empty() {
            return;
        }
        if let Some(url) = self.base_url {
            config.server.base_url = url;
        }
        if let Some(token) = self.token {
            config.server.token = Some(token);
        }
        if let Some(model) = self.default_model {
            config.chat.default_model = model;
        }
        if let Some(model) = self.second_model {
            config.chat.second_model = Some(model);
        }
        if let Some(dual) = self.dual {
            config.chat.dual = dual;
        }
        config.source = ConfigSource::Cli;
    }
}

/// Read the path of a config file for display
#[must_use]
pub fn describe_path(path: Option<&Path>) -> String {
    path.map_or_else(|| "<defaults>".to_string(), |p| p.display().to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.server.base_url, "http://localhost:3030/api");
        assert_eq!(config.chat.default_model, "qwen3:latest");
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
        assert_eq!(config.chat.initial_mode(), ChatMode::Single);
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
base_url = "https://chat.example.com/api"
token = "secret"
request_timeout_secs = 60

[chat]
default_model = "llama3.2"
second_model = "mistral"
dual = true
"#
        )
        .unwrap();

        let mut config = ClientConfig::default();
        let content = tokio::fs::read_to_string(file.path()).await.unwrap();
        let toml_config: ClientToml = toml::from_str(&content).unwrap();
        apply_toml_config(&mut config, &toml_config);

        assert_eq!(config.server.base_url, "https://chat.example.com/api");
        assert_eq!(config.server.token.as_deref(), Some("secret"));
        assert_eq!(config.server.request_timeout, Duration::from_secs(60));
        assert_eq!(
            config.chat.initial_mode(),
            ChatMode::Dual {
                second_model: "mistral".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from_path(Some(dir.path().join("absent.toml")))
            .await
            .unwrap();
        assert!(config.config_file_path.is_none());
    }

    #[tokio::test]
    async fn test_invalid_toml_is_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server\nbase_url = 3").unwrap();
        let result = load_config_from_path(Some(file.path().to_path_buf())).await;
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_env_overrides_file() {
        let vars: HashMap<&str, &str> = [
            ("TANDEM_BASE_URL", "http://10.0.0.2:3030/api"),
            ("TANDEM_DUAL", "true"),
            ("TANDEM_SECOND_MODEL", "phi3"),
            ("TANDEM_REQUEST_TIMEOUT", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = ClientConfig::default();
        apply_env_config(&mut config, |k| vars.get(k).map(|v| (*v).to_string()));

        assert_eq!(config.server.base_url, "http://10.0.0.2:3030/api");
        assert!(config.chat.dual);
        assert_eq!(config.chat.second_model.as_deref(), Some("phi3"));
        assert_eq!(config.server.request_timeout, Duration::from_secs(300));
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = ClientConfig::default();
        ConfigOverrides::new()
            .with_default_model("gemma")
            .with_second_model("phi3")
            .with_dual(true)
            .apply(&mut config);

        assert_eq!(config.chat.default_model, "gemma");
        assert_eq!(config.source(), ConfigSource::Cli);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_overrides_keep_source() {
        let mut config = ClientConfig::default();
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_validation() {
        let mut config = ClientConfig::default();
        config.chat.dual = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = ClientConfig::default();
        config.server.base_url = "localhost:3030".to_string();
        assert!(config.validate().is_err());
    }
}
