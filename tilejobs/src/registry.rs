//! Worker registry and the invocation wrapper.
//!
//! An [`Invocation`] names its worker by registry key plus serialized parameters,
//! so it can be shipped to another process and resolved there. [`invoke`] is what
//! runs inside the execution context: it owns the job directory, the job log and
//! the completion marker around the worker's own work.

use crate::actors::child::ChildHandle;
use crate::digest::ContentDigest;
use crate::errors::{DispatchError, Result};
use crate::events::{Failure, Outcome};
use crate::guard::{JobDir, MarkerState};
use crate::joblog::{JobLog, DEFAULT_LOG_NAME};
use crate::types::JobDescriptor;
use crate::workers::command::CommandWorker;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Registry key plus constructor arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub worker: String,
    #[serde(default)]
    pub params: Value,
}

impl WorkerSpec {
    pub fn new(worker: impl Into<String>, params: Value) -> Self {
        Self {
            worker: worker.into(),
            params,
        }
    }
}

/// Where a job's directory and log live.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLayout {
    pub output_root: PathBuf,
    pub log_name: String,
}

impl JobLayout {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            log_name: DEFAULT_LOG_NAME.to_string(),
        }
    }

    pub fn with_log_name(mut self, log_name: impl Into<String>) -> Self {
        self.log_name = log_name.into();
        self
    }

    pub fn job_dir(&self, digest: ContentDigest) -> JobDir {
        JobDir::locate(&self.output_root, digest)
    }
}

/// A fully self-contained unit of work, as handed to an executor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub spec: WorkerSpec,
    pub descriptor: JobDescriptor,
    pub layout: JobLayout,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Cores each job may use, read once by the coordinator.
    pub cpus_per_task: usize,
}

impl Invocation {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Everything a batch's invocations share.
#[derive(Clone, Debug, PartialEq)]
pub struct JobTemplate {
    pub spec: WorkerSpec,
    pub layout: JobLayout,
    pub timeout: Option<Duration>,
    pub cpus_per_task: usize,
}

impl JobTemplate {
    pub fn new(spec: WorkerSpec, layout: JobLayout) -> Self {
        Self {
            spec,
            layout,
            timeout: None,
            cpus_per_task: 1,
        }
    }

    pub fn with_cpus_per_task(mut self, cpus: usize) -> Self {
        self.cpus_per_task = cpus;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn invocation(&self, descriptor: JobDescriptor) -> Invocation {
        Invocation {
            spec: self.spec.clone(),
            descriptor,
            layout: self.layout.clone(),
            timeout_ms: self.timeout.map(|t| t.as_millis() as u64),
            cpus_per_task: self.cpus_per_task,
        }
    }
}

/// What a worker sees of its job.
pub struct JobContext {
    pub descriptor: JobDescriptor,
    pub dir: JobDir,
    pub log: Mutex<JobLog>,
    pub cpus: usize,
    children: std::sync::Mutex<Vec<(ChildHandle, Duration)>>,
}

impl JobContext {
    pub fn out_dir(&self) -> &Path {
        self.dir.path()
    }

    /// Tie `child` to this job.
    ///
    /// However the worker's future ends, the job's outcome is not final until the
    /// child has been terminated (SIGKILL after `grace`) and reaped.
    pub fn track(&self, child: &ChildHandle, grace: Duration) {
        let mut children = match self.children.lock() {
            Ok(children) => children,
            Err(poisoned) => poisoned.into_inner(),
        };
        children.push((child.clone(), grace));
    }

    async fn reap(&self) {
        let children = match self.children.lock() {
            Ok(mut children) => std::mem::take(&mut *children),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for (child, grace) in children {
            child.terminate(grace);
            if let Err(e) = child.wait().await {
                tracing::warn!(digest = %self.dir.digest().short(), error = %e, "could not reap job process");
            }
        }
    }
}

#[async_trait]
pub trait Worker: Send + Sync {
    /// Digest of the worker definition, recorded in completion markers.
    fn fingerprint(&self) -> ContentDigest;

    /// Do the work. `Ok(code)` is an exit code, zero meaning success.
    ///
    /// The future may be dropped on timeout or cancellation. Processes the worker
    /// launches should be registered with [`JobContext::track`] so they are reaped
    /// before the job ends.
    async fn run(&self, job: &JobContext) -> std::result::Result<i32, Failure>;
}

pub type WorkerFactory = fn(&Value) -> Result<Arc<dyn Worker>>;

#[derive(Clone)]
pub struct WorkerRegistry {
    factories: HashMap<String, WorkerFactory>,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(CommandWorker::NAME, CommandWorker::from_params);
        registry
    }
}

impl WorkerRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, factory: WorkerFactory) -> &mut Self {
        self.factories.insert(name.into(), factory);
        self
    }

    pub fn resolve(&self, spec: &WorkerSpec) -> Result<Arc<dyn Worker>> {
        let factory = self
            .factories
            .get(&spec.worker)
            .ok_or_else(|| DispatchError::UnknownWorker(spec.worker.clone()))?;
        factory(&spec.params)
    }
}

/// Run one invocation to an outcome inside the current execution context.
///
/// Failures of any kind end up in the outcome. Only the log footer and the marker
/// depend on the work having finished, and the marker only on it having succeeded.
pub async fn invoke(
    registry: &WorkerRegistry,
    invocation: Invocation,
    cancel: CancellationToken,
) -> Outcome {
    let Invocation {
        spec,
        descriptor,
        layout,
        timeout_ms,
        cpus_per_task,
    } = invocation;
    let digest = descriptor.digest();

    let dir = match JobDir::prepare(&layout.output_root, digest.clone()).await {
        Ok(dir) => dir,
        Err(e) => {
            return Outcome::failed(Failure::error(format!(
                "creating job directory for {}: {e}",
                digest.short()
            )))
        }
    };
    let mut log = match JobLog::open(dir.path().join(&layout.log_name)).await {
        Ok(log) => log,
        Err(e) => return Outcome::failed(Failure::error(format!("opening job log: {e}"))),
    };
    if let Err(e) = log.header(&descriptor).await {
        return Outcome::failed(Failure::error(format!("writing job log: {e}")));
    }

    let job = JobContext {
        descriptor,
        dir,
        log: Mutex::new(log),
        cpus: cpus_per_task,
        children: std::sync::Mutex::new(Vec::new()),
    };
    let outcome = guarded_run(registry, &spec, &layout, &job, timeout_ms, cancel).await;

    let log = job.log.into_inner();
    if let Err(e) = log.finish(&outcome).await {
        tracing::warn!(digest = %digest.short(), error = %e, "could not finish job log");
    }
    outcome
}

async fn guarded_run(
    registry: &WorkerRegistry,
    spec: &WorkerSpec,
    layout: &JobLayout,
    job: &JobContext,
    timeout_ms: Option<u64>,
    cancel: CancellationToken,
) -> Outcome {
    let worker = match registry.resolve(spec) {
        Ok(worker) => worker,
        Err(e) => return Outcome::failed(Failure::error(e)),
    };
    let fingerprint = worker.fingerprint();

    match job.dir.check(&fingerprint).await {
        Ok(MarkerState::Complete) => {
            let _ = job
                .log
                .lock()
                .await
                .note("Found DONE file (job already complete)")
                .await;
            return Outcome::Skipped;
        }
        Ok(MarkerState::Stale(reason)) => {
            tracing::warn!(digest = %job.dir.digest().short(), %reason, "ignoring stale completion marker");
            let _ = job
                .log
                .lock()
                .await
                .note(&format!("Ignoring stale DONE file ({reason}), running job again"))
                .await;
        }
        Ok(MarkerState::Absent) => {}
        Err(e) => return Outcome::failed(Failure::error(format!("reading marker: {e}"))),
    }

    if cancel.is_cancelled() {
        return Outcome::Cancelled;
    }

    let started = Instant::now();
    let result = tokio::select! {
        result = worker.run(job) => Ok(result),
        _ = cancel.cancelled() => Err(Outcome::Cancelled),
        _ = sleep_or_forever(timeout_ms) => Err(Outcome::TimedOut {
            after_ms: started.elapsed().as_millis() as u64,
        }),
    };
    // the work future is gone, so is anything it launched before we report
    job.reap().await;

    let outcome = match result {
        Err(interrupted) => return interrupted,
        Ok(Ok(0)) => Outcome::Success { code: 0 },
        Ok(Ok(code)) => Outcome::failed(Failure::Exit { code }),
        Ok(Err(failure)) => Outcome::failed(failure),
    };

    if let Outcome::Success { .. } = outcome {
        if let Err(e) = job.dir.mark_complete(&fingerprint, &layout.log_name).await {
            return Outcome::failed(Failure::error(format!("writing DONE marker: {e}")));
        }
    }
    outcome
}

async fn sleep_or_forever(timeout_ms: Option<u64>) {
    match timeout_ms {
        Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    /// Test worker driven by its descriptor: `{"sleep_ms": n, "code": c, "artifact": name}`.
    pub(crate) struct ScriptedWorker;

    #[async_trait]
    impl Worker for ScriptedWorker {
        fn fingerprint(&self) -> ContentDigest {
            ContentDigest::of(b"scripted-v1")
        }

        async fn run(&self, job: &JobContext) -> std::result::Result<i32, Failure> {
            let payload = job.descriptor.payload();
            if let Some(ms) = payload.get("sleep_ms").and_then(Value::as_u64) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            if payload.get("panic").is_some() {
                panic!("scripted panic");
            }
            if let Some(name) = payload.get("artifact").and_then(Value::as_str) {
                tokio::fs::write(job.out_dir().join(name), b"tile")
                    .await
                    .map_err(Failure::error)?;
            }
            job.log.lock().await.note("scripted work").await.map_err(Failure::error)?;
            Ok(payload.get("code").and_then(Value::as_i64).unwrap_or(0) as i32)
        }
    }

    pub(crate) fn scripted_registry() -> WorkerRegistry {
        let mut registry = WorkerRegistry::default();
        registry.register("scripted", |_| Ok(Arc::new(ScriptedWorker) as Arc<dyn Worker>));
        registry
    }

    pub(crate) fn scripted_invocation(root: &Path, payload: Value) -> Invocation {
        Invocation {
            spec: WorkerSpec::new("scripted", Value::Null),
            descriptor: JobDescriptor::new(payload),
            layout: JobLayout::new(root),
            timeout_ms: None,
            cpus_per_task: 1,
        }
    }

    #[tokio::test]
    async fn second_invocation_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        let registry = scripted_registry();
        let inv = scripted_invocation(root.path(), json!({"artifact": "grid.tif", "tile": "skip"}));

        let first = invoke(&registry, inv.clone(), CancellationToken::new()).await;
        assert_eq!(first, Outcome::Success { code: 0 });
        let dir = inv.layout.job_dir(inv.descriptor.digest());
        assert!(dir.marker_path().exists());

        let second = invoke(&registry, inv, CancellationToken::new()).await;
        assert_eq!(second, Outcome::Skipped);

        let log = std::fs::read_to_string(dir.path().join(DEFAULT_LOG_NAME)).unwrap();
        assert_eq!(log.matches("scripted work").count(), 1);
        assert!(log.contains("Found DONE file (job already complete)"));
        assert!(log.contains("EXIT CODE: None"));
    }

    #[tokio::test]
    async fn failure_leaves_no_marker() {
        let root = tempfile::tempdir().unwrap();
        let registry = scripted_registry();
        let inv = scripted_invocation(root.path(), json!({"code": 7, "tile": "fail"}));

        let outcome = invoke(&registry, inv.clone(), CancellationToken::new()).await;
        assert_eq!(outcome, Outcome::failed(Failure::Exit { code: 7 }));
        assert!(!inv.layout.job_dir(inv.descriptor.digest()).marker_path().exists());
    }

    #[tokio::test]
    async fn timeout_is_its_own_outcome() {
        let root = tempfile::tempdir().unwrap();
        let registry = scripted_registry();
        let mut inv = scripted_invocation(root.path(), json!({"sleep_ms": 5_000, "tile": "slow"}));
        inv.timeout_ms = Some(50);

        let outcome = invoke(&registry, inv.clone(), CancellationToken::new()).await;
        assert_matches!(outcome, Outcome::TimedOut { after_ms } if after_ms >= 50);
        let dir = inv.layout.job_dir(inv.descriptor.digest());
        assert!(!dir.marker_path().exists());
        let log = std::fs::read_to_string(dir.path().join(DEFAULT_LOG_NAME)).unwrap();
        assert!(log.contains("OUTCOME: timed out"));
    }

    #[tokio::test]
    async fn cancellation_stops_the_work() {
        let root = tempfile::tempdir().unwrap();
        let registry = scripted_registry();
        let inv = scripted_invocation(root.path(), json!({"sleep_ms": 5_000, "tile": "cancel"}));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { invoke(&registry, inv, cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), Outcome::Cancelled);
    }

    #[tokio::test]
    async fn unknown_worker_fails_the_job() {
        let root = tempfile::tempdir().unwrap();
        let mut inv = scripted_invocation(root.path(), json!("tile"));
        inv.spec.worker = "nope".into();
        let outcome = invoke(&WorkerRegistry::default(), inv, CancellationToken::new()).await;
        assert_matches!(outcome, Outcome::Failed { failure: Failure::Error { message } } if message.contains("nope"));
    }

    #[test]
    fn invocation_survives_the_wire() {
        let inv = scripted_invocation(Path::new("/export"), json!("POLYGON((0 0,1 0,1 1,0 1,0 0))"));
        let text = serde_json::to_string(&inv).unwrap();
        assert_eq!(serde_json::from_str::<Invocation>(&text).unwrap(), inv);
    }
}
