//! mcpswitch library - supervise MCP workers and relay tool calls to the active one

pub mod config;
pub mod console;
pub mod error;
pub mod invoker;
pub mod process;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use config::{Config, Settings, TransportKind, WorkerConfig, WorkerConfigSet};
pub use error::{WorkerError, WorkerResult};
pub use invoker::ToolInvoker;
pub use process::{LifecycleController, StopOutcome, WorkerStatus};
