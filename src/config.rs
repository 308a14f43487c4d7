use auth::config::AuthConfig;
use proxy::{ServerConfig, ServerConfigDeserialize};
use runner::{SupervisorConfig, SupervisorConfigDeserialize};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub static DEFAULT_CONFIG_PATH: &str = "Config.toml";
pub static CONFIG_PATH_ENV: &str = "BROKER_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_path_to_error::Error<toml::de::Error>),
    #[error("invalid [server] section: {0}")]
    Server(String),
    #[error("invalid [auth] section: {0}")]
    Auth(#[from] auth::AuthError),
    #[error("invalid [processes] section: {0}")]
    Processes(#[from] runner::SupervisorError),
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct BrokerConfigDeserialize {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub server: ServerConfigDeserialize,
    #[serde(default)]
    pub auth: AuthConfig,
    pub processes: SupervisorConfigDeserialize,
}

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub log_level: String,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub processes: SupervisorConfig,
}

impl BrokerConfig {
    pub fn new(other: BrokerConfigDeserialize) -> Result<BrokerConfig, ConfigError> {
        other.auth.validate()?;
        Ok(BrokerConfig {
            log_level: other.log_level,
            server: ServerConfig::new(other.server).map_err(ConfigError::Server)?,
            auth: other.auth,
            processes: SupervisorConfig::new(other.processes)?,
        })
    }

    /// Parses TOML, reporting the path of the offending key on failure.
    pub fn from_toml(contents: &str) -> Result<BrokerConfig, ConfigError> {
        let deserializer = toml::Deserializer::new(contents);
        let config: BrokerConfigDeserialize = serde_path_to_error::deserialize(deserializer)?;
        Self::new(config)
    }

    pub fn load(path: &Path) -> Result<BrokerConfig, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }
}

/// Explicit argument first, then the environment, then `Config.toml`.
pub fn config_path(argument: Option<&str>, env: Option<String>) -> PathBuf {
    argument
        .map(PathBuf::from)
        .or_else(|| env.map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
