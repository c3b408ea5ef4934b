//! Console configuration.
//!
//! Resolution order: built-in defaults, then `config.json` (the one named by
//! `--config`, else the one in the app data directory if present), then the
//! environment, then the command line.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::paths::AppPaths;

pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:8000";
pub const ENV_ENDPOINT: &str = "NEUROLOOP_ENDPOINT";
pub const ENV_RECORD: &str = "NEUROLOOP_RECORD";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Backend `host:port`. A leading `http://` or `tcp://` is accepted and stripped.
    pub endpoint: String,
    pub alert_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    /// How often the console re-checks state for its status line.
    pub status_interval_ms: u64,
    pub record: bool,
    pub record_path: Option<PathBuf>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            alert_timeout_ms: 6000,
            reconnect_delay_ms: 1000,
            status_interval_ms: 1000,
            record: false,
            record_path: None,
        }
    }
}

/// Command-line overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArgs {
    pub addr: Option<String>,
    pub record: bool,
    pub config: Option<PathBuf>,
    pub help: bool,
}

impl CliArgs {
    /// Parse everything after the program name.
    pub fn parse<I>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut cli = CliArgs::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--addr" => {
                    let v = args
                        .next()
                        .ok_or_else(|| ConfigError::MissingValue(arg.clone()))?;
                    cli.addr = Some(v);
                }
                "--config" => {
                    let v = args
                        .next()
                        .ok_or_else(|| ConfigError::MissingValue(arg.clone()))?;
                    cli.config = Some(PathBuf::from(v));
                }
                "--record" => cli.record = true,
                "-h" | "--help" => cli.help = true,
                _ => return Err(ConfigError::UnknownArgument(arg)),
            }
        }
        Ok(cli)
    }
}

impl ConsoleConfig {
    pub fn resolve<F>(cli: &CliArgs, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match &cli.config {
            Some(path) => Self::load_file(path)?,
            None => match AppPaths::default_config_file() {
                Some(path) if path.is_file() => Self::load_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(env)?;
        config.apply_args(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.endpoint = normalize_endpoint(&config.endpoint);
        debug!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup(ENV_ENDPOINT) {
            self.endpoint = normalize_endpoint(&endpoint);
        }
        if let Some(record) = lookup(ENV_RECORD) {
            self.record = parse_flag(&record).ok_or_else(|| ConfigError::InvalidValue {
                key: ENV_RECORD.to_string(),
                value: record.clone(),
            })?;
        }
        Ok(())
    }

    pub fn apply_args(&mut self, cli: &CliArgs) {
        if let Some(addr) = &cli.addr {
            self.endpoint = normalize_endpoint(addr);
        }
        if cli.record {
            self.record = true;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let port_ok = self
            .endpoint
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if !port_ok {
            return Err(ConfigError::InvalidValue {
                key: "endpoint".to_string(),
                value: self.endpoint.clone(),
            });
        }
        for (key, value) in [
            ("alert_timeout_ms", self.alert_timeout_ms),
            ("reconnect_delay_ms", self.reconnect_delay_ms),
            ("status_interval_ms", self.status_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn alert_timeout(&self) -> Duration {
        Duration::from_millis(self.alert_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    /// Where to record the session, if recording is on. Falls back to the
    /// data directory's session log.
    pub fn recording_target(&self, paths: Option<&AppPaths>) -> Option<PathBuf> {
        if !self.record {
            return None;
        }
        self.record_path
            .clone()
            .or_else(|| paths.map(AppPaths::session_log_file))
    }
}

fn normalize_endpoint(raw: &str) -> String {
    let s = raw.trim();
    let s = s
        .strip_prefix("http://")
        .or_else(|| s.strip_prefix("tcp://"))
        .unwrap_or(s);
    s.trim_end_matches('/').to_string()
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "" | "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
