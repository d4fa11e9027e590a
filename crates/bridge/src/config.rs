use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const WORKER_BIN_VAR: &str = "MODBRIDGE_WORKER_BIN";
pub const TRANSPORT_VAR: &str = "MODBRIDGE_TRANSPORT";
pub const FUNCTIONS_VAR: &str = "MODBRIDGE_FUNCTIONS";
pub const SHUTDOWN_GRACE_VAR: &str = "MODBRIDGE_SHUTDOWN_GRACE_MS";

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(2000);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown transport {0:?}, expected \"thread\" or \"process\"")]
    Transport(String),
    #[error("{name} must be a number of milliseconds, got {value:?}")]
    Millis { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportMode {
    /// Worker thread in this process, connected by channels.
    #[default]
    Thread,
    /// Separate worker process speaking JSON lines over stdio.
    Process,
}

impl FromStr for TransportMode {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "thread" => Ok(Self::Thread),
            "process" => Ok(Self::Process),
            _ => Err(ConfigError::Transport(raw.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub transport: TransportMode,
    pub worker_bin: Option<PathBuf>,
    pub functions: Vec<String>,
    pub shutdown_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            transport: TransportMode::default(),
            worker_bin: None,
            functions: guest::toolbox::FUNCTIONS
                .iter()
                .map(|name| (*name).to_owned())
                .collect(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a config from `lookup`, falling back to defaults for unset or
    /// empty variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let read = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();
        if let Some(raw) = read(TRANSPORT_VAR) {
            config.transport = raw.parse()?;
        }
        if let Some(raw) = read(WORKER_BIN_VAR) {
            config.worker_bin = Some(PathBuf::from(raw));
        }
        if let Some(raw) = read(FUNCTIONS_VAR) {
            config.functions = raw
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_owned)
                .collect();
        }
        if let Some(raw) = read(SHUTDOWN_GRACE_VAR) {
            let millis = raw.trim().parse::<u64>().map_err(|_| ConfigError::Millis {
                name: SHUTDOWN_GRACE_VAR,
                value: raw.clone(),
            })?;
            config.shutdown_grace = Duration::from_millis(millis);
        }
        Ok(config)
    }
}
