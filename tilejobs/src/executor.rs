//! Execution contexts.
//!
//! An [`Executor`] takes one self-contained [`Invocation`] and drives it to an
//! [`Outcome`] in a context of its own. `Err` is reserved for failing to obtain that
//! context at all, so it fails the batch rather than the job.

use crate::actors::child::{exit_code, ChildGuard, ChildHandle, CommandLine};
use crate::config::DEFAULT_KILL_GRACE;
use crate::digest::ContentDigest;
use crate::errors::{DispatchError, Result};
use crate::events::{Failure, Outcome, Output};
use crate::host::HostReply;
use crate::registry::{invoke, Invocation, WorkerRegistry};
use crate::report::panic_message;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Extra time a host gets beyond the job's own grace: it must tear its job down first.
const HOST_TEARDOWN_MARGIN: Duration = Duration::from_secs(1);

/// Subcommand of the host binary that serves one invocation.
pub const WORKER_HOST_SUBCOMMAND: &str = "worker-host";

#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(&self, invocation: Invocation, cancel: CancellationToken) -> Result<Outcome>;
}

/// Runs each invocation on a Tokio task inside the coordinator.
///
/// Suitable for workers that already isolate their work in an external process.
/// A panicking worker fails its own job only.
#[derive(Clone)]
pub struct LocalExecutor {
    registry: Arc<WorkerRegistry>,
}

impl LocalExecutor {
    pub fn new(registry: WorkerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn execute(&self, invocation: Invocation, cancel: CancellationToken) -> Result<Outcome> {
        let registry = Arc::clone(&self.registry);
        let task = tokio::spawn(async move { invoke(&registry, invocation, cancel).await });
        match task.await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_panic() => Ok(Outcome::failed(Failure::error(format!(
                "worker panicked: {}",
                panic_message(e.into_panic())
            )))),
            Err(_) => Ok(Outcome::Cancelled),
        }
    }
}

/// Runs each invocation in its own OS process.
///
/// The host program is started with `args` (by default the `worker-host`
/// subcommand), receives the invocation on stdin and answers on stdout. A crash or
/// resource blow-up in one job cannot reach its siblings or the coordinator.
#[derive(Clone, Debug)]
pub struct ProcessExecutor {
    program: PathBuf,
    args: Vec<String>,
    grace: Duration,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Re-execute the running binary as the host.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(
            std::env::current_exe()?,
            vec![WORKER_HOST_SUBCOMMAND.to_string()],
        ))
    }

    /// Grace period of the jobs the host runs. The host itself gets a little longer
    /// between SIGTERM and SIGKILL.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn host_grace(&self) -> Duration {
        self.grace + HOST_TEARDOWN_MARGIN
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn execute(&self, invocation: Invocation, cancel: CancellationToken) -> Result<Outcome> {
        let digest = invocation.descriptor.digest();
        // the host enforces the timeout itself, this only catches a host that hangs
        let hard_deadline = invocation.timeout().map(|t| t + self.host_grace());
        let cmd = CommandLine {
            program: self.program.display().to_string(),
            args: self.args.clone(),
            envs: Vec::new(),
            dir: None,
            stdin: Some(serde_json::to_vec(&invocation)?.into()),
        };

        let (output_tx, mut output_rx) = mpsc::unbounded_channel();
        let child = ChildHandle::spawn(cmd, output_tx).map_err(DispatchError::Scheduling)?;
        let child = ChildGuard::new(child, self.host_grace());

        let started = Instant::now();
        let mut stdout = Vec::new();
        let mut stderr = LineForwarder::new(digest.clone());
        let mut interrupted: Option<Outcome> = None;

        let wait = child.handle().wait();
        tokio::pin!(wait);
        let deadline = sleep_or_forever(hard_deadline);
        tokio::pin!(deadline);

        let status = loop {
            tokio::select! {
                Some(output) = output_rx.recv() => match output {
                    Output::Stdout(blob) => stdout.extend_from_slice(&blob),
                    Output::Stderr(blob) => stderr.push(&blob),
                },
                status = &mut wait => break status,
                _ = cancel.cancelled(), if interrupted.is_none() => {
                    child.handle().terminate(self.host_grace());
                    interrupted = Some(Outcome::Cancelled);
                }
                _ = &mut deadline, if interrupted.is_none() => {
                    tracing::warn!(digest = %digest.short(), "worker host overran its deadline, terminating");
                    child.handle().terminate(self.host_grace());
                    interrupted = Some(Outcome::TimedOut {
                        after_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
        };
        while let Ok(Some(output)) =
            tokio::time::timeout(Duration::from_millis(500), output_rx.recv()).await
        {
            match output {
                Output::Stdout(blob) => stdout.extend_from_slice(&blob),
                Output::Stderr(blob) => stderr.push(&blob),
            }
        }
        stderr.flush();

        if let Ok(reply) = serde_json::from_slice::<HostReply>(trim_ascii(&stdout)) {
            return Ok(reply.outcome);
        }
        if let Some(outcome) = interrupted {
            return Ok(outcome);
        }
        let why = match status {
            Ok(status) => match exit_code(status) {
                Ok(code) => format!("worker host exited with code {code} without a reply"),
                Err(failure) => format!("worker host {failure} before replying"),
            },
            Err(e) => format!("lost track of worker host: {e}"),
        };
        Ok(Outcome::failed(Failure::error(why)))
    }
}

async fn sleep_or_forever(deadline: Option<Duration>) {
    match deadline {
        Some(d) => tokio::time::sleep(d).await,
        None => futures::future::pending().await,
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Re-emits a host's stderr into the coordinator log, one record per line.
struct LineForwarder {
    digest: ContentDigest,
    partial: Vec<u8>,
}

impl LineForwarder {
    fn new(digest: ContentDigest) -> Self {
        Self {
            digest,
            partial: Vec::new(),
        }
    }

    fn push(&mut self, blob: &[u8]) {
        self.partial.extend_from_slice(blob);
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            self.emit(&line[..line.len() - 1]);
        }
    }

    fn flush(&mut self) {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.emit(&line);
        }
    }

    fn emit(&self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        if !line.trim().is_empty() {
            tracing::info!(target: "tilejobs::host", digest = %self.digest.short(), "{}", line.trim_end());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{scripted_invocation, scripted_registry};
    use assert_matches::assert_matches;
    use serde_json::json;

    #[tokio::test]
    async fn local_executor_runs_in_process() {
        let root = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new(scripted_registry());
        let inv = scripted_invocation(root.path(), json!({"tile": "local"}));
        let outcome = executor.execute(inv, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, Outcome::Success { code: 0 });
    }

    #[tokio::test]
    async fn local_executor_contains_panics() {
        let root = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new(scripted_registry());
        let inv = scripted_invocation(root.path(), json!({"panic": true}));
        let outcome = executor.execute(inv, CancellationToken::new()).await.unwrap();
        assert_matches!(
            outcome,
            Outcome::Failed { failure: Failure::Error { message } } if message.contains("scripted panic")
        );
    }

    /// A shell stands in for the host binary here. The real one is covered by the
    /// CLI integration tests.
    fn fake_host(script: &str) -> ProcessExecutor {
        ProcessExecutor::new("sh", vec!["-c".into(), script.into()])
            .with_grace(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn reply_on_stdout_is_the_outcome() {
        let root = tempfile::tempdir().unwrap();
        let executor = fake_host(
            r#"cat > /dev/null; echo "host says hi" >&2; echo '{"outcome":{"outcome":"skipped"}}'"#,
        );
        let inv = scripted_invocation(root.path(), json!("tile"));
        let outcome = executor.execute(inv, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, Outcome::Skipped);
    }

    #[tokio::test]
    async fn host_dying_without_reply_fails_the_job() {
        let root = tempfile::tempdir().unwrap();
        let executor = fake_host("cat > /dev/null; exit 3");
        let inv = scripted_invocation(root.path(), json!("tile"));
        let outcome = executor.execute(inv, CancellationToken::new()).await.unwrap();
        assert_matches!(
            outcome,
            Outcome::Failed { failure: Failure::Error { message } } if message.contains("code 3")
        );
    }

    #[tokio::test]
    async fn cancel_terminates_the_host() {
        let root = tempfile::tempdir().unwrap();
        let executor = fake_host("cat > /dev/null; sleep 30");
        let inv = scripted_invocation(root.path(), json!("tile"));
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let run = tokio::spawn({
            let cancel = cancel.clone();
            async move { executor.execute(inv, cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        assert_eq!(run.await.unwrap().unwrap(), Outcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn hung_host_is_timed_out() {
        let root = tempfile::tempdir().unwrap();
        let executor = fake_host("cat > /dev/null; trap '' TERM; sleep 30");
        let mut inv = scripted_invocation(root.path(), json!("tile"));
        inv.timeout_ms = Some(100);
        let outcome = executor.execute(inv, CancellationToken::new()).await.unwrap();
        assert_matches!(outcome, Outcome::TimedOut { .. });
    }

    #[tokio::test]
    async fn unspawnable_host_is_a_scheduling_failure() {
        let root = tempfile::tempdir().unwrap();
        let executor = ProcessExecutor::new("/nonexistent/tilejobs-host", vec![]);
        let inv = scripted_invocation(root.path(), json!("tile"));
        let err = executor.execute(inv, CancellationToken::new()).await.unwrap_err();
        assert_matches!(err, DispatchError::Scheduling(_));
    }

    #[test]
    fn trims_surrounding_whitespace() {
        assert_eq!(trim_ascii(b"\n {} \n"), b"{}");
        assert_eq!(trim_ascii(b"  "), b"");
    }
}
