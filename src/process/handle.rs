//! OS-level handle for one spawned worker process

use crate::config::{TransportKind, WorkerConfig};
use chrono::{DateTime, Utc};
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

/// Pipes of a stdio worker, handed to its channel
pub struct StdioPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// A spawned worker process.
///
/// Liveness is never cached: every `poll_exit` asks the OS.
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl ProcessHandle {
    /// Spawn the worker described by `config`.
    ///
    /// Stdio workers get piped stdin/stdout, returned for the channel.
    /// Output the channel doesn't consume (stderr, and stdout of network
    /// workers) is forwarded to the log.
    pub fn spawn(config: &WorkerConfig) -> io::Result<(Self, Option<StdioPipes>)> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        match config.transport_kind {
            TransportKind::Stdio => cmd.stdin(Stdio::piped()),
            TransportKind::Network => cmd.stdin(Stdio::null()),
        };

        let mut child = cmd.spawn()?;
        let pid = child.id().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "process exited before reporting a pid")
        })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(config.name.clone(), "stderr", stderr));
        }

        let pipes = match config.transport_kind {
            TransportKind::Stdio => match (child.stdin.take(), child.stdout.take()) {
                (Some(stdin), Some(stdout)) => Some(StdioPipes { stdin, stdout }),
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "worker stdio pipes unavailable",
                    ))
                }
            },
            TransportKind::Network => {
                if let Some(stdout) = child.stdout.take() {
                    tokio::spawn(forward_output(config.name.clone(), "stdout", stdout));
                }
                None
            }
        };

        Ok((
            Self {
                child,
                pid,
                started_at: Utc::now(),
                started: Instant::now(),
            },
            pipes,
        ))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Ask the OS whether the process has exited (non-blocking)
    pub fn poll_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Request graceful termination (SIGTERM on unix)
    #[cfg(unix)]
    pub fn terminate(&mut self) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid as NixPid;

        // Never signal a pid the OS may already have handed to someone else
        if self.poll_exit()?.is_some() {
            return Ok(());
        }

        match kill(NixPid::from_raw(self.pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    #[cfg(not(unix))]
    pub fn terminate(&mut self) -> io::Result<()> {
        self.kill()
    }

    /// Forcibly kill the process; reaping happens through `poll_exit`
    pub fn kill(&mut self) -> io::Result<()> {
        match self.child.start_kill() {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }
}

/// Resident memory of `pid` as reported by the OS
pub fn resident_memory(pid: u32) -> Option<u64> {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    if sys.refresh_process(pid) {
        sys.process(pid).map(|p| p.memory())
    } else {
        None
    }
}

async fn forward_output<R>(worker: String, stream: &'static str, output: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(output).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(worker = %worker, stream, "{line}");
    }
}
