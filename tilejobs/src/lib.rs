//! Bounded concurrent dispatch of per-tile jobs with completion markers.
//!
//! Jobs are opaque descriptors. Each one gets a directory named by its content
//! digest, a log, and a `DONE` marker once it has succeeded, so a rerun of the same
//! list only does what is left.

mod actors;
pub mod config;
pub mod digest;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod executor;
pub mod guard;
pub mod host;
pub mod input;
pub mod joblog;
pub mod registry;
pub mod report;
pub mod shutdown;
pub mod types;
pub mod workers;

pub use actors::child::{ChildGuard, ChildHandle, CommandLine};
pub use config::{DispatchOptions, SlotBudget};
pub use digest::ContentDigest;
pub use dispatch::{Completions, Dispatcher};
pub use errors::{DispatchError, Result};
pub use events::{Completion, Failure, Outcome};
pub use executor::{Executor, LocalExecutor, ProcessExecutor};
pub use registry::{Invocation, JobLayout, JobTemplate, Worker, WorkerRegistry, WorkerSpec};
pub use report::{BatchReport, BatchSummary, Reporter};
pub use types::JobDescriptor;
pub use workers::command::{CommandSpec, CommandWorker};
