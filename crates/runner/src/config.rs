use serde::Deserialize;
use std::{ops::Range, time::Duration};

use crate::error::SupervisorError;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
pub struct PortRange {
    pub min: u16,
    /// Exclusive.
    pub max: u16,
}

fn default_true() -> bool {
    true
}

/// `[processes]` as written in the config file.
#[derive(Clone, Debug, Deserialize)]
pub struct SupervisorConfigDeserialize {
    pub process_command: String,
    /// Each argument may use `{username}` and `{port}`.
    #[serde(default)]
    pub process_args: Vec<String>,
    pub port_range: PortRange,
    /// Run workers (and the kill helper) as the target user through sudo.
    #[serde(default = "default_true")]
    pub use_sudo: bool,
    /// Called as `kill_command <pid>`. Workers get SIGTERM when absent.
    pub kill_command: Option<String>,
    /// Environment variable carrying the per-process secret to the worker.
    #[serde(default = "SupervisorConfigDeserialize::default_secret_env_var")]
    pub secret_env_var: String,
    /// `{username}`, `{pid}` and `{datetime}` are substituted.
    pub log_file_template: Option<String>,
    #[serde(default = "SupervisorConfigDeserialize::default_start_delay_ms")]
    pub start_delay_ms: u64,
    #[serde(default = "SupervisorConfigDeserialize::default_log_lines")]
    pub log_lines: usize,
    #[serde(default = "SupervisorConfigDeserialize::default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

impl SupervisorConfigDeserialize {
    fn default_secret_env_var() -> String {
        "BROKER_AUTH_TOKEN".to_string()
    }
    fn default_start_delay_ms() -> u64 {
        250
    }
    fn default_log_lines() -> usize {
        1000
    }
    fn default_stop_grace_ms() -> u64 {
        10
    }
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub process_command: String,
    pub process_args: Vec<String>,
    pub ports: Range<u16>,
    pub use_sudo: bool,
    pub kill_command: Option<String>,
    pub secret_env_var: String,
    pub log_file_template: Option<String>,
    pub start_delay: Duration,
    pub log_lines: usize,
    pub stop_grace: Duration,
}

impl SupervisorConfig {
    pub fn new(other: SupervisorConfigDeserialize) -> Result<SupervisorConfig, SupervisorError> {
        if other.port_range.min >= other.port_range.max {
            return Err(SupervisorError::Config(format!(
                "empty port range {}..{}",
                other.port_range.min, other.port_range.max
            )));
        }
        if other.process_command.trim().is_empty() {
            return Err(SupervisorError::Config("process_command is empty".to_string()));
        }
        if other.log_lines == 0 {
            return Err(SupervisorError::Config("log_lines must be positive".to_string()));
        }
        Ok(SupervisorConfig {
            process_command: other.process_command,
            process_args: other.process_args,
            ports: other.port_range.min..other.port_range.max,
            use_sudo: other.use_sudo,
            kill_command: other.kill_command,
            secret_env_var: other.secret_env_var,
            log_file_template: other.log_file_template,
            start_delay: Duration::from_millis(other.start_delay_ms),
            log_lines: other.log_lines,
            stop_grace: Duration::from_millis(other.stop_grace_ms),
        })
    }

    /// The worker's argument list for one user and port.
    pub fn args_for(&self, username: &str, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.process_args
            .iter()
            .map(|arg| arg.replace("{username}", username).replace("{port}", &port))
            .collect()
    }

    #[cfg(test)]
    pub fn new_test(script: &str) -> Self {
        let config: SupervisorConfigDeserialize = toml::from_str(
            r#"
            process_command = "sh"
            use_sudo = false
            start_delay_ms = 150
            log_lines = 5
            port_range = { min = 47100, max = 47200 }
            "#,
        )
        .expect("test config to be valid toml");
        let mut config = Self::new(config).expect("test config to be valid");
        config.process_args = vec!["-c".to_string(), script.to_string()];
        config
    }
}
