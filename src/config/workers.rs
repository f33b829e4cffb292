//! Worker configurations: what to launch for each named worker

use anyhow::{bail, Result};
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Host used for network workers that don't name one
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// How the control process talks to a worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Newline-delimited envelopes over the worker's stdin/stdout
    #[default]
    #[serde(alias = "pipe")]
    Stdio,
    /// Newline-delimited envelopes over a TCP connection to host:port
    #[serde(alias = "tcp")]
    Network,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stdio => f.write_str("stdio"),
            TransportKind::Network => f.write_str("network"),
        }
    }
}

/// Immutable description of a launchable worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Unique key; filled in from the map key when loaded from a file
    #[serde(skip_deserializing)]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, alias = "transport", alias = "transport_kind")]
    pub transport_kind: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Working directory for the worker process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Extra environment variables for the worker process
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl WorkerConfig {
    pub fn stdio(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            transport_kind: TransportKind::Stdio,
            host: None,
            port: None,
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn network(name: &str, command: &str, args: &[&str], host: &str, port: u16) -> Self {
        Self {
            transport_kind: TransportKind::Network,
            host: Some(host.to_string()),
            port: Some(port),
            ..Self::stdio(name, command, args)
        }
    }

    /// Command and arguments joined for display and logs
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// `host:port` for network workers
    pub fn address(&self) -> Option<String> {
        match (self.transport_kind, self.port) {
            (TransportKind::Network, Some(port)) => Some(format!(
                "{}:{}",
                self.host.as_deref().unwrap_or(DEFAULT_HOST),
                port
            )),
            _ => None,
        }
    }

    fn validate(&self) -> Result<()> {
        validate_worker_name(&self.name)?;
        if self.command.trim().is_empty() {
            bail!("Worker '{}' has an empty command", self.name);
        }
        if self.transport_kind == TransportKind::Network && self.port.is_none() {
            bail!("Network worker '{}' needs a port", self.name);
        }
        Ok(())
    }
}

/// Worker names end up in logs and console commands; keep them simple
fn validate_worker_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        bail!(
            "Invalid worker name (use alphanumeric, dash, underscore, dot): '{}'",
            name
        );
    }
    Ok(())
}

/// Validated, read-only set of worker configurations plus the default name.
///
/// Never mutated after construction; a reload builds a new set and swaps it
/// in whole.
#[derive(Debug, Clone)]
pub struct WorkerConfigSet {
    workers: BTreeMap<String, Arc<WorkerConfig>>,
    default_worker: String,
}

impl WorkerConfigSet {
    /// Build and validate a set. Fails on duplicate or invalid names, an
    /// empty set, or a default that doesn't resolve.
    pub fn new(
        configs: impl IntoIterator<Item = WorkerConfig>,
        default_worker: Option<&str>,
    ) -> Result<Self> {
        let mut workers = BTreeMap::new();
        let mut first = None;

        for config in configs {
            config.validate()?;
            if workers.contains_key(&config.name) {
                bail!("Duplicate worker name '{}'", config.name);
            }
            first.get_or_insert_with(|| config.name.clone());
            workers.insert(config.name.clone(), Arc::new(config));
        }

        let Some(first) = first else {
            bail!("No workers configured");
        };

        let default_worker = default_worker.map(str::to_string).unwrap_or(first);
        if !workers.contains_key(&default_worker) {
            bail!("Default worker '{}' is not configured", default_worker);
        }

        Ok(Self {
            workers,
            default_worker,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<WorkerConfig>> {
        self.workers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    /// All configurations, ordered by name
    pub fn iter(&self) -> impl Iterator<Item = &Arc<WorkerConfig>> {
        self.workers.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    pub fn default_worker(&self) -> &str {
        &self.default_worker
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Deserialize a name → config map, keeping declaration order and rejecting
/// repeated keys (serde_json would otherwise keep the last one silently).
pub(crate) fn unique_workers<'de, D>(deserializer: D) -> Result<Vec<WorkerConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    struct WorkersVisitor;

    impl<'de> Visitor<'de> for WorkersVisitor {
        type Value = Vec<WorkerConfig>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of worker name to worker configuration")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut seen = HashSet::new();
            let mut workers = Vec::new();
            while let Some((name, mut config)) = map.next_entry::<String, WorkerConfig>()? {
                if !seen.insert(name.clone()) {
                    return Err(de::Error::custom(format!("duplicate worker name '{name}'")));
                }
                config.name = name;
                workers.push(config);
            }
            Ok(workers)
        }
    }

    deserializer.deserialize_map(WorkersVisitor)
}
