use crate::errors::{DispatchError, Result};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Total parallelism granted by the cluster scheduler for this allocation.
pub const NTASKS_VAR: &str = "SLURM_NTASKS";
/// Cores granted to each task.
pub const CPUS_PER_TASK_VAR: &str = "SLURM_CPUS_PER_TASK";

/// Execution slots available to one batch.
///
/// The upstream allocator decides the total. We only subtract the slots reserved
/// for the coordinating process itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotBudget {
    pub total: usize,
    pub reserved: usize,
}

impl SlotBudget {
    /// Read the allocation once at startup.
    ///
    /// | Env Var          | Default                      |
    /// |------------------|------------------------------|
    /// | `SLURM_NTASKS`   | host available parallelism   |
    pub fn from_env(reserved: usize) -> Result<Self> {
        let total = match std::env::var(NTASKS_VAR) {
            Ok(raw) => parse_count(NTASKS_VAR, &raw)?,
            Err(_) => host_parallelism(),
        };
        Ok(Self { total, reserved })
    }

    /// Never less than one, so a single-slot allocation still makes progress.
    pub fn max_workers(&self) -> usize {
        self.total.saturating_sub(self.reserved).max(1)
    }
}

/// Cores each job may use, as handed to the external program.
///
/// Read once by the coordinator and shipped with every invocation.
///
/// | Env Var               | Default                      |
/// |-----------------------|------------------------------|
/// | `SLURM_CPUS_PER_TASK` | host available parallelism   |
pub fn cpus_per_task() -> Result<usize> {
    cpus_from(std::env::var(CPUS_PER_TASK_VAR).ok())
}

fn cpus_from(raw: Option<String>) -> Result<usize> {
    match raw {
        Some(raw) => parse_count(CPUS_PER_TASK_VAR, &raw),
        None => Ok(host_parallelism()),
    }
}

fn host_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_count(var: &str, raw: &str) -> Result<usize> {
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(DispatchError::InvalidConfig(format!(
            "{var} must be a positive integer, got {raw:?}"
        ))),
    }
}

/// Options for one dispatch call.
#[derive(Clone, Debug)]
pub struct DispatchOptions {
    pub max_workers: usize,
    /// Cancel the rest of the batch on the first failure. Off by default.
    pub fail_fast: bool,
}

impl DispatchOptions {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            fail_fast: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(DispatchError::InvalidConfig(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.max_workers > Semaphore::MAX_PERMITS {
            return Err(DispatchError::InvalidConfig(format!(
                "max_workers must be at most {}, got {}",
                Semaphore::MAX_PERMITS,
                self.max_workers
            )));
        }
        Ok(())
    }
}

/// Default wait between SIGTERM and SIGKILL when tearing a job down.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(10);
