//! Process management for worker processes

pub mod handle;
pub mod lifecycle;
pub mod registry;

pub use handle::{ProcessHandle, StdioPipes};
pub use lifecycle::{ActiveWorker, LifecycleController, StopOutcome, WorkerOverview, STOP_GRACE_PERIOD};
pub use registry::{RunningInfo, RunningWorker, WorkerRegistry, WorkerState, WorkerStatus};
