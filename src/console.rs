//! Line-oriented management console
//!
//! Reads one command per line and prints a human-readable answer. It drives
//! the controller and invoker exactly the way an outer management UI would.

use crate::error::WorkerError;
use crate::invoker::ToolInvoker;
use crate::process::{LifecycleController, StopOutcome, WorkerState, WorkerStatus};
use anyhow::Result;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const HELP: &str = "\
Commands:
  list                  configured workers with status
  status [name]         status of one worker (default: active)
  start <name>          launch a worker
  stop <name>           stop a worker
  switch <name>         make a worker active, starting it if needed
  active                show the active worker
  call <tool> [json]    invoke a tool on the active worker
  describe              capability descriptor of the active worker
  resource <uri>        read a resource from the active worker
  help                  this text
  quit                  stop all workers and exit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    List,
    Status(Option<String>),
    Start(String),
    Stop(String),
    Switch(String),
    Active,
    Call {
        tool: String,
        arguments: Map<String, Value>,
    },
    Describe,
    Resource(String),
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parse one input line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        let required = |what: &str| {
            if rest.is_empty() {
                Err(format!("usage: {verb} <{what}>"))
            } else {
                Ok(rest.to_string())
            }
        };

        let command = match verb {
            "list" | "ls" => ConsoleCommand::List,
            "status" => ConsoleCommand::Status((!rest.is_empty()).then(|| rest.to_string())),
            "start" => ConsoleCommand::Start(required("name")?),
            "stop" => ConsoleCommand::Stop(required("name")?),
            "switch" | "use" => ConsoleCommand::Switch(required("name")?),
            "active" => ConsoleCommand::Active,
            "call" => {
                let rest = required("tool")?;
                let (tool, json) = match rest.split_once(char::is_whitespace) {
                    Some((tool, json)) => (tool.to_string(), json.trim()),
                    None => (rest.clone(), ""),
                };
                ConsoleCommand::Call {
                    tool,
                    arguments: parse_arguments(json)?,
                }
            }
            "describe" => ConsoleCommand::Describe,
            "resource" => ConsoleCommand::Resource(required("uri")?),
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" => ConsoleCommand::Quit,
            other => return Err(format!("unknown command '{other}' (try 'help')")),
        };
        Ok(Some(command))
    }
}

/// Tool arguments must be a JSON object; empty input means no arguments
pub fn parse_arguments(json: &str) -> Result<Map<String, Value>, String> {
    if json.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(json) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("tool arguments must be a JSON object".to_string()),
        Err(e) => Err(format!("invalid JSON arguments: {e}")),
    }
}

pub struct Console {
    controller: Arc<LifecycleController>,
    invoker: ToolInvoker,
}

impl Console {
    pub fn new(controller: Arc<LifecycleController>) -> Self {
        let timeout = controller.settings().invocation_timeout;
        let invoker = ToolInvoker::new(controller.clone(), timeout);
        Self {
            controller,
            invoker,
        }
    }

    /// Start and activate the configured default worker
    pub async fn activate_default(&self) -> Result<String, WorkerError> {
        let name = self.controller.default_worker();
        self.controller.switch_to(&name).await?;
        Ok(name)
    }

    pub async fn execute(&self, command: ConsoleCommand) -> String {
        match command {
            ConsoleCommand::List => self.render_overview(),
            ConsoleCommand::Status(name) => {
                let Some(name) = name.or_else(|| self.controller.current_active()) else {
                    return "no active worker".to_string();
                };
                format!("{name}: {}", describe_status(&self.controller.status_of(&name)))
            }
            ConsoleCommand::Start(name) => match self.controller.start(&name).await {
                Ok(pid) => format!("started {name} (pid {pid})"),
                Err(e) => format!("error: {e}"),
            },
            ConsoleCommand::Stop(name) => match self.controller.stop(&name).await {
                Ok(StopOutcome::Exited { exit_code }) => match exit_code {
                    Some(code) => format!("stopped {name} (exit code {code})"),
                    None => format!("stopped {name}"),
                },
                Ok(StopOutcome::ForceKilled) => format!("killed {name} after grace period"),
                Err(e) => format!("error: {e}"),
            },
            ConsoleCommand::Switch(name) => match self.controller.switch_to(&name).await {
                Ok(()) => format!("switched to {name}"),
                Err(e) => format!("error: {e}"),
            },
            ConsoleCommand::Active => self
                .controller
                .current_active()
                .unwrap_or_else(|| "no active worker".to_string()),
            ConsoleCommand::Call { tool, arguments } => {
                render_value(self.invoker.invoke(&tool, arguments).await)
            }
            ConsoleCommand::Describe => match self.invoker.initialize().await {
                Ok(caps) => serde_json::to_string_pretty(&caps)
                    .unwrap_or_else(|e| format!("error: {e}")),
                Err(e) => format!("error: {e}"),
            },
            ConsoleCommand::Resource(uri) => render_value(self.invoker.read_resource(&uri).await),
            ConsoleCommand::Help => HELP.to_string(),
            ConsoleCommand::Quit => "bye".to_string(),
        }
    }

    /// Serve commands from `input` until `quit` or end of input, then stop
    /// every worker
    pub async fn run<R, W>(&self, input: R, mut output: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            let reply = match ConsoleCommand::parse(&line) {
                Ok(None) => continue,
                Ok(Some(ConsoleCommand::Quit)) => break,
                Ok(Some(command)) => self.execute(command).await,
                Err(message) => format!("error: {message}"),
            };
            output.write_all(reply.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }

        self.controller.shutdown_all().await;
        Ok(())
    }

    fn render_overview(&self) -> String {
        self.controller
            .overview()
            .iter()
            .map(|row| {
                let mut marks = Vec::new();
                if row.is_active {
                    marks.push("active");
                }
                if row.is_default {
                    marks.push("default");
                }
                let marks = if marks.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", marks.join(", "))
                };
                format!(
                    "{:<20} {:<8} {}{}",
                    row.config.name,
                    row.config.transport_kind.to_string(),
                    describe_status(&row.status),
                    marks
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn describe_status(status: &WorkerStatus) -> String {
    match status {
        WorkerStatus::Running(info) => format!(
            "{} (pid {}, up {}s)",
            match info.state {
                WorkerState::Running => "running",
                WorkerState::Stopping => "stopping",
                WorkerState::KillFailed => "kill failed",
            },
            info.pid,
            info.uptime.as_secs()
        ),
        WorkerStatus::NotRunning {
            exit_code: Some(code),
        } => format!("stopped (exit code {code})"),
        WorkerStatus::NotRunning { exit_code: None } => "stopped".to_string(),
    }
}

fn render_value(result: Result<Value, WorkerError>) -> String {
    match result {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|e| format!("error: {e}")),
        Err(e) => format!("error: {e}"),
    }
}
