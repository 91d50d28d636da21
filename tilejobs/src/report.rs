//! Completion reporting.
//!
//! Process-wide logging goes through `tracing`, to stderr and optionally to an
//! append-only file. Only the coordinator writes that file. Jobs write their own logs.
//! A [`Reporter`] is the explicit logging context for one batch.

use crate::errors::{DispatchError, Result};
use crate::events::{Completion, Outcome};
use std::fmt;
use std::fs::OpenOptions;
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Exit status when the batch ran but at least one job did not succeed.
pub const JOBS_FAILED_EXIT: u8 = 2;
const FATAL_EXIT: u8 = 1;
const PANIC_EXIT: u8 = 101;

#[derive(Clone, Debug)]
pub struct ReportConfig {
    /// Default filter directive. `RUST_LOG` takes precedence.
    pub level: String,
    pub log_file: Option<PathBuf>,
    pub ansi: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_file: None,
            ansi: true,
        }
    }
}

/// Install the process-wide subscriber. Call once, at startup.
pub fn init(config: &ReportConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| DispatchError::InvalidConfig(format!("log level {:?}: {e}", config.level)))?;

    let console = tracing_fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(config.ansi);

    let file = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| DispatchError::InvalidConfig(format!("logging already initialised: {e}")))
}

/// Log at critical severity.
pub fn critical(message: impl fmt::Display) {
    tracing::error!(target: "tilejobs::critical", severity = "CRITICAL", "{message}");
}

/// Run the program body in a guarded region.
///
/// An error or a panic escaping `body` is logged at critical severity with its full
/// context, and mapped to a fixed non-zero exit status.
pub async fn guarded<F, E>(body: F) -> ExitCode
where
    F: Future<Output = std::result::Result<ExitCode, E>> + Send + 'static,
    E: fmt::Debug + Send + 'static,
{
    match tokio::spawn(body).await {
        Ok(Ok(code)) => code,
        Ok(Err(e)) => {
            critical(format_args!("Program terminating: {e:?}"));
            ExitCode::from(FATAL_EXIT)
        }
        Err(e) if e.is_panic() => {
            critical(format_args!(
                "Program terminating: panic: {}",
                panic_message(e.into_panic())
            ));
            ExitCode::from(PANIC_EXIT)
        }
        Err(e) => {
            critical(format_args!("Program terminating: {e}"));
            ExitCode::from(FATAL_EXIT)
        }
    }
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Outcome counts for a batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    pub fn record(&mut self, outcome: &Outcome) {
        self.total += 1;
        match outcome {
            Outcome::Success { .. } => self.succeeded += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Failed { .. } => self.failed += 1,
            Outcome::TimedOut { .. } => self.timed_out += 1,
            Outcome::Cancelled => self.cancelled += 1,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed + self.timed_out + self.cancelled == 0
    }

    pub fn exit_code(&self) -> ExitCode {
        if self.is_success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(JOBS_FAILED_EXIT)
        }
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} jobs: {} succeeded, {} skipped, {} failed, {} timed out, {} cancelled",
            self.total, self.succeeded, self.skipped, self.failed, self.timed_out, self.cancelled
        )
    }
}

/// Every job's completion, in input order.
#[derive(Clone, Debug, Default)]
pub struct BatchReport {
    completions: Vec<Completion>,
}

impl BatchReport {
    pub(crate) fn new(completions: Vec<Completion>) -> Self {
        Self { completions }
    }

    pub fn completions(&self) -> &[Completion] {
        &self.completions
    }

    pub fn outcomes(&self) -> Vec<&Outcome> {
        self.completions.iter().map(|c| &c.outcome).collect()
    }

    pub fn summary(&self) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for completion in &self.completions {
            summary.record(&completion.outcome);
        }
        summary
    }

    pub fn is_success(&self) -> bool {
        self.summary().is_success()
    }

    pub fn exit_code(&self) -> ExitCode {
        self.summary().exit_code()
    }

    /// Failed, timed out or cancelled jobs, for resubmission.
    pub fn unfinished(&self) -> Vec<&Completion> {
        self.completions
            .iter()
            .filter(|c| !c.outcome.is_ok())
            .collect()
    }
}

/// Logging context for one batch.
///
/// Counters and the batch id belong to a single batch. A [`Dispatcher`](crate::Dispatcher)
/// keeps the one it was built with as a template and hands every batch a fresh one
/// from [`Reporter::next_batch`].
#[derive(Clone)]
pub struct Reporter {
    inner: Arc<Inner>,
}

struct Inner {
    label: String,
    batch_id: Uuid,
    total: AtomicUsize,
    finished: AtomicUsize,
    started: Mutex<Option<Instant>>,
}

impl Reporter {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                batch_id: Uuid::new_v4(),
                total: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
                started: Mutex::new(None),
            }),
        }
    }

    /// A new context under the same label, with its own batch id and counters.
    pub fn next_batch(&self) -> Self {
        Self::new(self.inner.label.clone())
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn batch_id(&self) -> Uuid {
        self.inner.batch_id
    }

    pub fn finished(&self) -> usize {
        self.inner.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn batch_started(&self, total: usize, unique: usize, max_workers: usize) {
        self.inner.total.store(total, Ordering::SeqCst);
        self.inner.finished.store(0, Ordering::SeqCst);
        if let Ok(mut started) = self.inner.started.lock() {
            *started = Some(Instant::now());
        }
        tracing::info!(
            batch = %self.inner.batch_id,
            label = %self.inner.label,
            total,
            unique,
            max_workers,
            "Dispatching batch"
        );
        if unique < total {
            tracing::warn!(
                batch = %self.inner.batch_id,
                duplicates = total - unique,
                "Duplicate jobs in list, each runs once"
            );
        }
    }

    pub(crate) fn job_started(&self, digest: &str, job: &str) {
        tracing::debug!(batch = %self.inner.batch_id, digest, job, "Job started");
    }

    pub(crate) fn job_finished(&self, completion: &Completion, digest: &str) {
        let done = self.inner.finished.fetch_add(1, Ordering::SeqCst) + 1;
        let total = self.inner.total.load(Ordering::SeqCst);
        let progress = format!("{done}/{total}");
        let outcome = &completion.outcome;
        match outcome {
            Outcome::Success { .. } | Outcome::Skipped => tracing::info!(
                batch = %self.inner.batch_id,
                digest,
                %progress,
                outcome = %outcome,
                "Job finished"
            ),
            Outcome::Cancelled => tracing::warn!(
                batch = %self.inner.batch_id,
                digest,
                %progress,
                "Job cancelled"
            ),
            Outcome::Failed { .. } | Outcome::TimedOut { .. } => tracing::error!(
                batch = %self.inner.batch_id,
                digest,
                %progress,
                outcome = %outcome,
                job = %completion.descriptor,
                "Job failed"
            ),
        }
    }

    pub(crate) fn batch_finished(&self, summary: &BatchSummary) {
        let elapsed_ms = self
            .inner
            .started
            .lock()
            .ok()
            .and_then(|started| *started)
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or_default();
        if summary.is_success() {
            tracing::info!(batch = %self.inner.batch_id, elapsed_ms, "Finished: {summary}");
        } else {
            tracing::warn!(batch = %self.inner.batch_id, elapsed_ms, "Finished with unfinished jobs: {summary}");
        }
    }

    pub(crate) fn batch_aborted(&self, error: &DispatchError) {
        tracing::error!(batch = %self.inner.batch_id, error = %error, "Batch aborted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Failure;
    use crate::types::JobDescriptor;

    fn completion(index: usize, outcome: Outcome) -> Completion {
        Completion {
            index,
            descriptor: JobDescriptor::from(format!("tile-{index}")),
            outcome,
        }
    }

    #[test]
    fn skipped_jobs_count_as_success() {
        let report = BatchReport::new(vec![
            completion(0, Outcome::Success { code: 0 }),
            completion(1, Outcome::Skipped),
        ]);
        assert!(report.is_success());
        assert_eq!(report.exit_code(), ExitCode::SUCCESS);
        assert!(report.unfinished().is_empty());
    }

    #[test]
    fn any_failure_fails_the_batch() {
        let report = BatchReport::new(vec![
            completion(0, Outcome::Success { code: 0 }),
            completion(1, Outcome::failed(Failure::Exit { code: 1 })),
            completion(2, Outcome::Cancelled),
        ]);
        let summary = report.summary();
        assert_eq!((summary.succeeded, summary.failed, summary.cancelled), (1, 1, 1));
        assert!(!report.is_success());
        assert_eq!(report.exit_code(), ExitCode::from(JOBS_FAILED_EXIT));
        assert_eq!(report.unfinished().len(), 2);
        assert_eq!(
            summary.to_string(),
            "3 jobs: 1 succeeded, 0 skipped, 1 failed, 0 timed out, 1 cancelled"
        );
    }

    #[tokio::test]
    async fn guarded_maps_errors_and_panics() {
        assert_eq!(
            guarded(async { Ok::<_, String>(ExitCode::SUCCESS) }).await,
            ExitCode::SUCCESS
        );
        assert_eq!(
            guarded(async { Err::<ExitCode, _>("no job list".to_string()) }).await,
            ExitCode::from(FATAL_EXIT)
        );
        assert_eq!(
            guarded(async {
                if true {
                    panic!("boom");
                }
                Ok::<_, String>(ExitCode::SUCCESS)
            })
            .await,
            ExitCode::from(PANIC_EXIT)
        );
    }

    #[test]
    fn next_batch_starts_from_zero() {
        let first = Reporter::new("tiles");
        first.batch_started(1, 1, 1);
        first.job_finished(&completion(0, Outcome::Skipped), "abc");

        let second = first.next_batch();
        assert_eq!(second.label(), "tiles");
        assert_ne!(second.batch_id(), first.batch_id());
        assert_eq!(second.finished(), 0);
        assert_eq!(first.finished(), 1);
    }

    #[test]
    fn reporter_counts_progress() {
        let reporter = Reporter::new("test");
        reporter.batch_started(2, 2, 1);
        reporter.job_finished(&completion(0, Outcome::Skipped), "abc");
        assert_eq!(reporter.finished(), 1);
    }
}
