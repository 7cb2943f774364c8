//! Gateway configuration

use crate::{Error, Result, RetryPolicy};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix, e.g. `EMX_GATE_PORT`
pub const ENV_PREFIX: &str = "EMX_GATE";

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Host address to listen on
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Directory holding the key log and provider document
    pub data_dir: PathBuf,

    /// Key log file name, relative to `data_dir`
    pub keys_file: String,

    /// Provider document file name, relative to `data_dir`
    pub providers_file: String,

    /// Upper bound for a non-streaming upstream call (default: 30)
    pub request_timeout_secs: u64,

    /// Upper bound for a gap between stream chunks (default: 120)
    pub stream_idle_timeout_secs: u64,

    /// Upper bound for one probe (default: 10)
    pub probe_timeout_secs: u64,

    /// Retries for rate-limited upstream responses
    pub max_retries: u32,

    pub initial_backoff_ms: u64,

    /// Probe every model when the server starts
    pub probe_on_startup: bool,

    /// Require a valid API key on `GET /v1/models`
    pub require_auth_for_models: bool,

    /// Bearer token for `/admin`; the admin API is disabled when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,

    /// Audit entries kept in memory
    pub audit_capacity: usize,

    pub log_format: LogFormat,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 54658,
            data_dir: default_data_dir(),
            keys_file: "keys.jsonl".to_string(),
            providers_file: "providers.toml".to_string(),
            request_timeout_secs: 30,
            stream_idle_timeout_secs: 120,
            probe_timeout_secs: 10,
            max_retries: 2,
            initial_backoff_ms: 200,
            probe_on_startup: true,
            require_auth_for_models: false,
            admin_token: None,
            audit_capacity: 1000,
            log_format: LogFormat::Text,
        }
    }
}

/// `~/.emx/gate`, or `.emx/gate` when no home directory is known
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".emx").join("gate"))
        .unwrap_or_else(|| PathBuf::from(".emx").join("gate"))
}

/// First existing default config file: `./emx-gate.toml`, then
/// `~/.emx/gate/config.toml`
pub fn default_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("emx-gate.toml");
    if local.exists() {
        return Some(local);
    }
    let home = default_data_dir().join("config.toml");
    home.exists().then_some(home)
}

impl GatewayConfig {
    /// Load defaults, then `file` (or the first default config file), then
    /// `EMX_GATE_*` environment variables
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::load_with_env(file, Environment::with_prefix(ENV_PREFIX))
    }

    fn load_with_env(file: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        match file {
            Some(path) => {
                builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
            }
            None => {
                if let Some(path) = default_config_file() {
                    builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
                }
            }
        }

        let config: GatewayConfig = builder
            .add_source(env.try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::Config("port must be non-zero".into()));
        }
        for (name, value) in [
            ("request_timeout_secs", self.request_timeout_secs),
            ("stream_idle_timeout_secs", self.stream_idle_timeout_secs),
            ("probe_timeout_secs", self.probe_timeout_secs),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{} must be positive", name)));
            }
        }
        if self.admin_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(Error::Config("admin_token must not be empty".into()));
        }
        Ok(())
    }

    pub fn keys_path(&self) -> PathBuf {
        self.data_dir.join(&self.keys_file)
    }

    pub fn providers_path(&self) -> PathBuf {
        self.data_dir.join(&self.providers_file)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            retry_unavailable: true,
        }
    }
}
