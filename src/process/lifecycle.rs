//! Lifecycle controller - start, stop and switch workers
//!
//! Every operation that mutates the running map or the active pointer runs
//! under one async lifecycle lock, so two starts of the same name can't both
//! spawn. A stop claims its worker (`Stopping`) under that lock and then
//! drains, signals and reaps it without holding it; start and switch refuse
//! a worker in that state. Status queries and the invoker's active-worker
//! snapshot only take the registry's short map lock.

use crate::config::{Config, Settings, WorkerConfig, WorkerConfigSet};
use crate::error::{WorkerError, WorkerResult};
use crate::process::handle::ProcessHandle;
use crate::process::registry::{RunningWorker, WorkerRegistry, WorkerState, WorkerStatus};
use crate::transport::WorkerChannel;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// How long a worker gets to exit after SIGTERM before it is killed
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How a stopped worker went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StopOutcome {
    /// Exited within the grace period
    Exited { exit_code: Option<i32> },
    /// Ignored termination and was killed
    ForceKilled,
}

/// One row of the worker overview
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerOverview {
    pub config: WorkerConfig,
    pub status: WorkerStatus,
    pub is_active: bool,
    pub is_default: bool,
}

/// Source of the transport the invoker should talk to
pub trait ActiveWorker: Send + Sync {
    /// Channel of the active worker, checked for liveness at call time
    fn active_channel(&self) -> WorkerResult<Arc<WorkerChannel>>;
}

pub struct LifecycleController {
    registry: WorkerRegistry,
    lifecycle: tokio::sync::Mutex<()>,
    /// Written only while `lifecycle` is held
    active: RwLock<Option<String>>,
    settings: Settings,
}

impl LifecycleController {
    pub fn new(configs: WorkerConfigSet, settings: Settings) -> Self {
        Self {
            registry: WorkerRegistry::new(configs),
            lifecycle: tokio::sync::Mutex::new(()),
            active: RwLock::new(None),
            settings,
        }
    }

    pub fn from_config(config: Config) -> Self {
        Self::new(config.workers, config.settings)
    }

    pub fn settings(&self) -> Settings {
        self.settings
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn list_configured(&self) -> Vec<Arc<WorkerConfig>> {
        self.registry.list_configured()
    }

    pub fn default_worker(&self) -> String {
        self.registry.configs().default_worker().to_string()
    }

    pub fn status_of(&self, name: &str) -> WorkerStatus {
        self.registry.status_of(name)
    }

    pub fn current_active(&self) -> Option<String> {
        self.active.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_active(&self, name: Option<String>) {
        *self.active.write().unwrap_or_else(|e| e.into_inner()) = name;
    }

    /// Every configured worker with its live status, ordered by name
    pub fn overview(&self) -> Vec<WorkerOverview> {
        let configs = self.registry.configs();
        let active = self.current_active();
        configs
            .iter()
            .map(|config| WorkerOverview {
                status: self.registry.status_of(&config.name),
                is_active: active.as_deref() == Some(config.name.as_str()),
                is_default: configs.default_worker() == config.name,
                config: WorkerConfig::clone(config),
            })
            .collect()
    }

    /// Launch `name`. Returns the pid of the new process.
    pub async fn start(&self, name: &str) -> WorkerResult<u32> {
        let _lifecycle = self.lifecycle.lock().await;
        self.start_locked(name)
    }

    fn start_locked(&self, name: &str) -> WorkerResult<u32> {
        let configs = self.registry.configs();
        let config = configs
            .get(name)
            .ok_or_else(|| WorkerError::NotConfigured(name.to_string()))?;

        match self.registry.state_of(name) {
            Some(WorkerState::Running) => {
                return Err(WorkerError::AlreadyRunning(name.to_string()))
            }
            Some(_) => return Err(WorkerError::Stopping(name.to_string())),
            None => {}
        }

        let command = config.command_line();
        info!(worker = name, %command, transport = %config.transport_kind, "Starting worker");

        let (handle, pipes) = ProcessHandle::spawn(config).map_err(|source| {
            error!(worker = name, %command, error = %source, "Failed to spawn worker");
            WorkerError::StartFailed {
                worker: name.to_string(),
                command: command.clone(),
                source,
            }
        })?;

        let pid = handle.pid();
        let channel = match (pipes, config.address()) {
            (Some(pipes), _) => WorkerChannel::from_stream(name, pipes.stdout, pipes.stdin),
            (None, Some(address)) => {
                WorkerChannel::tcp(name, address, self.settings.connect_timeout)
            }
            // Validation guarantees network workers carry a port
            (None, None) => return Err(WorkerError::NotConfigured(name.to_string())),
        };

        if self
            .registry
            .register(RunningWorker::new(config, handle, channel))
            .is_err()
        {
            // Unreachable while the lifecycle lock is held; the rejected
            // handle is dropped, which kills the duplicate process.
            return Err(WorkerError::AlreadyRunning(name.to_string()));
        }

        info!(worker = name, pid, "Worker running");
        Ok(pid)
    }

    /// Stop `name`: SIGTERM, wait up to the grace period, then kill. The
    /// worker stays registered (as `Stopping`) until its exit is confirmed.
    ///
    /// Stopping the active worker clears the active pointer. The pointer is
    /// cleared even when the answer is `NotRunning`: an active worker that
    /// already exited on its own must not stay active either.
    ///
    /// A call in flight on the worker is allowed to finish (or time out)
    /// before the worker is signalled, so a concurrent invoke resolves as a
    /// normal answer or `InvocationTimeout`, never as a disconnect caused by
    /// this stop. Neither that wait nor the grace period holds the lifecycle
    /// lock, so other workers can be started and stopped meanwhile.
    pub async fn stop(&self, name: &str) -> WorkerResult<StopOutcome> {
        let (pid, channel) = {
            let _lifecycle = self.lifecycle.lock().await;
            self.begin_stop(name)?
        };
        self.finish_stop(name, pid, &channel).await
    }

    /// Clear the active pointer and claim the worker. Caller holds the
    /// lifecycle lock.
    fn begin_stop(&self, name: &str) -> WorkerResult<(u32, Arc<WorkerChannel>)> {
        if self.current_active().as_deref() == Some(name) {
            self.set_active(None);
            info!(worker = name, "Cleared active worker");
        }

        match self.registry.begin_stop(name) {
            Some(claimed) => {
                info!(worker = name, pid = claimed.0, "Stopping worker");
                Ok(claimed)
            }
            None if self.registry.state_of(name) == Some(WorkerState::Stopping) => {
                Err(WorkerError::Stopping(name.to_string()))
            }
            None => Err(WorkerError::NotRunning(name.to_string())),
        }
    }

    /// Drain, signal, reap and unregister one claimed worker instance.
    /// Registry access is per call and keyed by `pid`; the lifecycle lock is
    /// only taken for the final unregister.
    async fn finish_stop(
        &self,
        name: &str,
        pid: u32,
        channel: &WorkerChannel,
    ) -> WorkerResult<StopOutcome> {
        if !channel.shut(self.settings.invocation_timeout).await {
            warn!(worker = name, "In-flight call still running; terminating anyway");
        }

        let signalled = self
            .registry
            .with_instance(name, pid, |w| w.handle_mut().terminate());
        if let Some(Err(source)) = signalled {
            warn!(worker = name, pid, error = %source, "Failed to send termination signal");
        }

        if let Some(exit_code) = self.wait_for_exit(name, pid, Some(STOP_GRACE_PERIOD)).await {
            self.unregister(name, pid).await;
            info!(worker = name, pid, ?exit_code, "Worker stopped");
            return Ok(StopOutcome::Exited { exit_code });
        }

        let command = self
            .registry
            .with_instance(name, pid, |w| w.config().map(|c| c.command_line()))
            .flatten()
            .unwrap_or_default();
        warn!(
            worker = name,
            pid,
            %command,
            grace_secs = STOP_GRACE_PERIOD.as_secs(),
            "Worker ignored termination; killing"
        );

        let killed = self
            .registry
            .with_instance(name, pid, |w| w.handle_mut().kill());
        if let Some(Err(source)) = killed {
            error!(worker = name, pid, %command, error = %source, "Failed to kill worker");
            // The channel is gone for good; keep the worker out of service
            // until a retried stop or a lazy reap removes it
            self.registry
                .with_instance(name, pid, |w| w.set_state(WorkerState::KillFailed));
            return Err(WorkerError::StopFailed {
                worker: name.to_string(),
                source,
            });
        }

        self.wait_for_exit(name, pid, None).await;
        self.unregister(name, pid).await;
        info!(worker = name, pid, "Worker killed");
        Ok(StopOutcome::ForceKilled)
    }

    async fn unregister(&self, name: &str, pid: u32) {
        let _lifecycle = self.lifecycle.lock().await;
        self.registry.unregister_instance(name, pid);
    }

    /// Poll the OS until the worker instance exits or `limit` passes.
    /// Returns the exit code (if known) once the exit is confirmed, `None` on
    /// timeout.
    async fn wait_for_exit(
        &self,
        name: &str,
        pid: u32,
        limit: Option<Duration>,
    ) -> Option<Option<i32>> {
        let started = Instant::now();
        loop {
            let polled = self
                .registry
                .with_instance(name, pid, |w| w.handle_mut().poll_exit());
            match polled {
                Some(Ok(Some(status))) => return Some(status.code()),
                Some(Ok(None)) => {}
                Some(Err(e)) => {
                    warn!(worker = name, pid, error = %e, "Lost track of worker while stopping");
                    return Some(None);
                }
                // A concurrent status query already reaped it
                None => return Some(None),
            }

            if limit.is_some_and(|limit| started.elapsed() >= limit) {
                return None;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Make `name` the active worker, starting it first if needed. On a
    /// failed start the active pointer is left as it was.
    pub async fn switch_to(&self, name: &str) -> WorkerResult<()> {
        let _lifecycle = self.lifecycle.lock().await;

        if !self.registry.configs().contains(name) {
            return Err(WorkerError::NotConfigured(name.to_string()));
        }

        match self.registry.state_of(name) {
            Some(WorkerState::Running) => {}
            Some(_) => return Err(WorkerError::Stopping(name.to_string())),
            None => {
                self.start_locked(name)?;
            }
        }

        self.set_active(Some(name.to_string()));
        debug_assert!(self.registry.running_names().iter().any(|n| n == name));
        info!(worker = name, "Switched active worker");
        Ok(())
    }

    /// Replace the whole configuration set. Running workers are untouched;
    /// they keep working until stopped.
    pub async fn reload(&self, configs: WorkerConfigSet) {
        let _lifecycle = self.lifecycle.lock().await;
        info!(workers = configs.len(), "Reloading worker configuration");
        self.registry.replace_configs(configs);
    }

    /// Stop every running worker. Failures are logged and returned.
    pub async fn shutdown_all(&self) -> Vec<(String, WorkerError)> {
        let mut failures = Vec::new();
        for name in self.registry.running_names() {
            match self.stop(&name).await {
                Ok(_) | Err(WorkerError::NotRunning(_)) | Err(WorkerError::Stopping(_)) => {}
                Err(e) => {
                    error!(worker = %name, error = %e, "Failed to stop worker during shutdown");
                    failures.push((name, e));
                }
            }
        }
        failures
    }
}

impl ActiveWorker for LifecycleController {
    fn active_channel(&self) -> WorkerResult<Arc<WorkerChannel>> {
        let name = self.current_active().ok_or(WorkerError::NoActiveWorker)?;
        self.registry
            .live_channel(&name)
            .ok_or(WorkerError::WorkerNotRunning(name))
    }
}
