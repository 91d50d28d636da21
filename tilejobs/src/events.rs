use crate::types::{JobDescriptor, OutputBlob};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a job that ran went wrong.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    Exit { code: i32 },
    Signal { signal: i32 },
    Error { message: String },
}

impl Failure {
    pub fn error(message: impl ToString) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Exit { code } => write!(f, "exit code {code}"),
            Failure::Signal { signal } => write!(f, "killed by signal {signal}"),
            Failure::Error { message } => f.write_str(message),
        }
    }
}

/// Result of one job. Produced exactly once per descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success { code: i32 },
    /// A valid completion marker was found, so nothing ran.
    Skipped,
    Failed { failure: Failure },
    TimedOut { after_ms: u64 },
    /// The batch was cancelled before or while this job ran.
    Cancelled,
}

impl Outcome {
    pub fn failed(failure: Failure) -> Self {
        Self::Failed { failure }
    }

    /// Exit code as written in the job log footer. `None` is the skipped sentinel.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Outcome::Success { code } => Some(*code),
            Outcome::Failed {
                failure: Failure::Exit { code },
            } => Some(*code),
            _ => None,
        }
    }

    /// Success or skip. Everything else leaves work for a resumed run.
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Success { .. } | Outcome::Skipped)
    }

    /// Failures that `fail_fast` reacts to.
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed { .. } | Outcome::TimedOut { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::Skipped => "skipped",
            Outcome::Failed { .. } => "failed",
            Outcome::TimedOut { .. } => "timed_out",
            Outcome::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success { code } => write!(f, "success ({code})"),
            Outcome::Skipped => f.write_str("skipped"),
            Outcome::Failed { failure } => write!(f, "failed ({failure})"),
            Outcome::TimedOut { after_ms } => write!(f, "timed out after {after_ms}ms"),
            Outcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// One finished job, as yielded by the dispatcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    /// Position in the submitted job list.
    pub index: usize,
    pub descriptor: JobDescriptor,
    pub outcome: Outcome,
}

/// A chunk of child process output.
#[derive(Clone, Debug)]
pub enum Output {
    Stdout(OutputBlob),
    Stderr(OutputBlob),
}

impl Output {
    pub fn blob(&self) -> &OutputBlob {
        match self {
            Output::Stdout(blob) | Output::Stderr(blob) => blob,
        }
    }
}
