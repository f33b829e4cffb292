//! Configuration file loading

pub mod workers;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use workers::{TransportKind, WorkerConfig, WorkerConfigSet};

const DEFAULT_INVOCATION_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Timing knobs that apply to every worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub invocation_timeout: Duration,
    /// How long to keep retrying the first connection to a network worker
    pub connect_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            invocation_timeout: Duration::from_secs(DEFAULT_INVOCATION_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

/// A fully validated configuration file
#[derive(Debug, Clone)]
pub struct Config {
    pub workers: WorkerConfigSet,
    pub settings: Settings,
}

/// On-disk layout, shared by the TOML and JSON formats
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default, alias = "default_worker", alias = "default_server")]
    default_worker: Option<String>,
    #[serde(alias = "servers", deserialize_with = "workers::unique_workers")]
    workers: Vec<WorkerConfig>,
    #[serde(default = "default_invocation_timeout", alias = "invocation_timeout_secs")]
    invocation_timeout_secs: u64,
    #[serde(default = "default_connect_timeout", alias = "connect_timeout_secs")]
    connect_timeout_secs: u64,
}

fn default_invocation_timeout() -> u64 {
    DEFAULT_INVOCATION_TIMEOUT_SECS
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

impl Config {
    /// Parse configuration text. `.json` files are JSON, everything else TOML.
    pub fn parse(content: &str, json: bool) -> Result<Self> {
        let file: ConfigFile = if json {
            serde_json::from_str(content).context("Failed to parse JSON worker configuration")?
        } else {
            toml::from_str(content).context("Failed to parse TOML worker configuration")?
        };

        if file.invocation_timeout_secs == 0 {
            bail!("invocationTimeoutSecs must be greater than zero");
        }

        let workers = WorkerConfigSet::new(file.workers, file.default_worker.as_deref())?;

        Ok(Self {
            workers,
            settings: Settings {
                invocation_timeout: Duration::from_secs(file.invocation_timeout_secs),
                connect_timeout: Duration::from_secs(file.connect_timeout_secs),
            },
        })
    }

    /// Load and validate a configuration file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let json = path.extension().and_then(|e| e.to_str()) == Some("json");
        Self::parse(&content, json).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Load from an explicit path, or the first existing default location
    pub fn discover(explicit: Option<&Path>) -> Result<(PathBuf, Self)> {
        if let Some(path) = explicit {
            return Ok((path.to_path_buf(), Self::load_from(path)?));
        }

        let candidates = Self::candidate_paths();
        for path in &candidates {
            if path.exists() {
                return Ok((path.clone(), Self::load_from(path)?));
            }
        }

        let searched: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
        bail!(
            "No worker configuration found (searched: {})",
            searched.join(", ")
        )
    }

    fn candidate_paths() -> Vec<PathBuf> {
        [
            dirs::config_dir().map(|p| p.join("mcpswitch/workers.toml")),
            dirs::home_dir().map(|p| p.join(".mcpswitch.toml")),
            Some(PathBuf::from("mcpswitch.toml")),
            Some(PathBuf::from("server_config.json")),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}
