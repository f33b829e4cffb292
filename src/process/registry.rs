//! Worker registry - configured workers and the live map of running ones

use crate::config::{WorkerConfig, WorkerConfigSet};
use crate::process::handle::{resident_memory, ProcessHandle};
use crate::transport::WorkerChannel;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tracing::{info, warn};

/// Phase of a worker present in the running map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerState {
    Running,
    /// Termination requested, exit not yet confirmed
    Stopping,
    /// A stop gave up because the OS refused the kill. The channel is already
    /// shut, so the worker takes no calls; `stop` may be retried.
    KillFailed,
}

/// Mutable record of a started worker
pub struct RunningWorker {
    name: String,
    config: Weak<WorkerConfig>,
    handle: ProcessHandle,
    channel: Arc<WorkerChannel>,
    state: WorkerState,
}

impl RunningWorker {
    pub fn new(config: &Arc<WorkerConfig>, handle: ProcessHandle, channel: WorkerChannel) -> Self {
        Self {
            name: config.name.clone(),
            config: Arc::downgrade(config),
            handle,
            channel: Arc::new(channel),
            state: WorkerState::Running,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration this worker was started from, while the set that
    /// owns it is still loaded
    pub fn config(&self) -> Option<Arc<WorkerConfig>> {
        self.config.upgrade()
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut ProcessHandle {
        &mut self.handle
    }

    pub fn channel(&self) -> &Arc<WorkerChannel> {
        &self.channel
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn set_state(&mut self, state: WorkerState) {
        self.state = state;
    }
}

/// Live facts about a running worker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "uptimeSecs", serialize_with = "as_secs")]
    pub uptime: Duration,
    pub state: WorkerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
}

fn as_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Answer to a status query
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum WorkerStatus {
    /// Not in the running map. `exit_code` is set when this query is the one
    /// that discovered the exit.
    #[serde(rename_all = "camelCase")]
    NotRunning { exit_code: Option<i32> },
    Running(RunningInfo),
}

impl WorkerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, WorkerStatus::Running(_))
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            WorkerStatus::Running(info) => Some(info.pid),
            WorkerStatus::NotRunning { .. } => None,
        }
    }
}

/// Configured workers plus the map of running ones.
///
/// The map lock is only ever held for short, non-blocking sections. Callers
/// that mutate the map (register/unregister) must additionally be serialized
/// by the controller's lifecycle lock.
pub struct WorkerRegistry {
    configs: RwLock<Arc<WorkerConfigSet>>,
    running: Mutex<HashMap<String, RunningWorker>>,
}

impl WorkerRegistry {
    pub fn new(configs: WorkerConfigSet) -> Self {
        Self {
            configs: RwLock::new(Arc::new(configs)),
            running: Mutex::new(HashMap::new()),
        }
    }

    fn running(&self) -> MutexGuard<'_, HashMap<String, RunningWorker>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of the current configuration set
    pub fn configs(&self) -> Arc<WorkerConfigSet> {
        self.configs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Swap in a new configuration set as a whole
    pub fn replace_configs(&self, configs: WorkerConfigSet) {
        *self.configs.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(configs);
    }

    pub fn list_configured(&self) -> Vec<Arc<WorkerConfig>> {
        self.configs().iter().cloned().collect()
    }

    /// Check liveness with the OS and, if alive, look at the entry with `f`.
    /// A worker found to have exited is removed as part of the check.
    fn inspect<R>(&self, name: &str, f: impl FnOnce(&RunningWorker) -> R) -> Result<R, WorkerStatus> {
        let mut running = self.running();
        let Some(worker) = running.get_mut(name) else {
            return Err(WorkerStatus::NotRunning { exit_code: None });
        };

        match worker.handle.poll_exit() {
            Ok(None) => Ok(f(worker)),
            Ok(Some(status)) => {
                running.remove(name);
                info!(worker = name, exit_code = ?status.code(), "Worker exited");
                Err(WorkerStatus::NotRunning {
                    exit_code: status.code(),
                })
            }
            Err(e) => {
                running.remove(name);
                warn!(worker = name, error = %e, "Lost track of worker process");
                Err(WorkerStatus::NotRunning { exit_code: None })
            }
        }
    }

    /// Live status of `name`; never served from a cache
    pub fn status_of(&self, name: &str) -> WorkerStatus {
        let inspected = self.inspect(name, |worker| RunningInfo {
            pid: worker.handle.pid(),
            started_at: worker.handle.started_at(),
            uptime: worker.handle.uptime(),
            state: worker.state,
            memory_bytes: None,
        });

        match inspected {
            // sysinfo reads /proc; keep that outside the map lock
            Ok(info) => WorkerStatus::Running(RunningInfo {
                memory_bytes: resident_memory(info.pid),
                ..info
            }),
            Err(status) => status,
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.inspect(name, |_| ()).is_ok()
    }

    /// Names currently in the running map, without liveness checks
    pub fn running_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.running().keys().cloned().collect();
        names.sort();
        names
    }

    /// Channel of `name` if it is alive and not being stopped
    pub fn live_channel(&self, name: &str) -> Option<Arc<WorkerChannel>> {
        self.inspect(name, |worker| {
            (worker.state == WorkerState::Running).then(|| worker.channel.clone())
        })
        .ok()
        .flatten()
    }

    /// State of `name` after a liveness check, `None` if it isn't running
    pub fn state_of(&self, name: &str) -> Option<WorkerState> {
        self.inspect(name, |worker| worker.state).ok()
    }

    /// Claim `name` for a stop: a live worker that is `Running` or
    /// `KillFailed` moves to `Stopping`. Returns the pid that identifies this
    /// process instance and its channel. `None` if it is not running or
    /// another stop already owns it.
    pub fn begin_stop(&self, name: &str) -> Option<(u32, Arc<WorkerChannel>)> {
        // Reaps a worker that already exited, so it reports as not running
        if !self.is_running(name) {
            return None;
        }
        let mut running = self.running();
        let worker = running.get_mut(name)?;
        if worker.state == WorkerState::Stopping {
            return None;
        }
        worker.state = WorkerState::Stopping;
        Some((worker.handle.pid(), worker.channel.clone()))
    }

    /// Run `f` against the running entry for `name`, but only while it is
    /// still the process with `pid`. Once a stopped worker is reaped, the
    /// name may be reused by a fresh start that must not be touched.
    pub fn with_instance<R>(
        &self,
        name: &str,
        pid: u32,
        f: impl FnOnce(&mut RunningWorker) -> R,
    ) -> Option<R> {
        self.running()
            .get_mut(name)
            .filter(|worker| worker.handle.pid() == pid)
            .map(f)
    }

    /// Remove `name` if it is still the process with `pid`
    pub fn unregister_instance(&self, name: &str, pid: u32) -> Option<RunningWorker> {
        let mut running = self.running();
        if running.get(name)?.handle.pid() != pid {
            return None;
        }
        running.remove(name)
    }

    /// Insert a freshly started worker. Hands the worker back if the name is
    /// already taken.
    pub fn register(&self, worker: RunningWorker) -> Result<(), RunningWorker> {
        let mut running = self.running();
        if running.contains_key(&worker.name) {
            return Err(worker);
        }
        running.insert(worker.name.clone(), worker);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Option<RunningWorker> {
        self.running().remove(name)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn registry_with_cat() -> (WorkerRegistry, u32) {
        let config = WorkerConfig::stdio("cat", "cat", &[]);
        let configs = WorkerConfigSet::new(vec![config], None).unwrap();
        let registry = WorkerRegistry::new(configs);

        let config = registry.configs().get("cat").unwrap().clone();
        let (handle, pipes) = ProcessHandle::spawn(&config).unwrap();
        let pipes = pipes.unwrap();
        let pid = handle.pid();
        let channel = WorkerChannel::from_stream("cat", pipes.stdout, pipes.stdin);
        assert!(registry
            .register(RunningWorker::new(&config, handle, channel))
            .is_ok());
        (registry, pid)
    }

    #[tokio::test]
    async fn test_begin_stop_claims_worker_once() {
        let (registry, pid) = registry_with_cat();
        assert!(registry.live_channel("cat").is_some());

        let (claimed_pid, _channel) = registry.begin_stop("cat").unwrap();
        assert_eq!(claimed_pid, pid);
        assert_eq!(registry.state_of("cat"), Some(WorkerState::Stopping));
        assert!(registry.live_channel("cat").is_none(), "stopping worker takes no calls");
        assert!(registry.begin_stop("cat").is_none(), "second stop must not claim it");

        let mut removed = registry.unregister("cat").unwrap();
        removed.handle_mut().kill().unwrap();
        assert!(registry.state_of("cat").is_none());
    }

    #[tokio::test]
    async fn test_kill_failed_worker_stays_out_of_service_but_can_be_stopped_again() {
        let (registry, pid) = registry_with_cat();
        registry.begin_stop("cat").unwrap();
        registry.with_instance("cat", pid, |w| w.set_state(WorkerState::KillFailed));

        assert!(registry.is_running("cat"));
        assert!(registry.live_channel("cat").is_none());
        assert!(registry.begin_stop("cat").is_some(), "a failed stop may be retried");

        registry.with_instance("cat", pid, |w| w.handle_mut().kill().unwrap());
    }

    #[tokio::test]
    async fn test_instance_helpers_ignore_other_pids() {
        let (registry, pid) = registry_with_cat();

        assert!(registry.with_instance("cat", pid + 1, |_| ()).is_none());
        assert!(registry.unregister_instance("cat", pid + 1).is_none());
        assert!(registry.is_running("cat"));

        let mut removed = registry.unregister_instance("cat", pid).unwrap();
        removed.handle_mut().kill().unwrap();
        assert!(registry.running_names().is_empty());
    }
}
