//! External-process worker: one templated command per job.

use crate::actors::child::{exit_code, ChildGuard, ChildHandle, CommandLine};
use crate::config::DEFAULT_KILL_GRACE;
use crate::digest::ContentDigest;
use crate::errors::{DispatchError, Result};
use crate::events::Failure;
use crate::registry::{JobContext, Worker};
use crate::types::{Args, Envs, Program};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output still buffered in the pipes after the child exits gets this long to arrive.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A command template.
///
/// Arguments may contain `{job}` (the descriptor's canonical text), `{out_dir}`,
/// `{digest}` and `{cpus}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: Program,
    #[serde(default)]
    pub args: Args,
    #[serde(default)]
    pub envs: Envs,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_grace_ms")]
    pub kill_grace_ms: u64,
}

fn default_grace_ms() -> u64 {
    DEFAULT_KILL_GRACE.as_millis() as u64
}

impl CommandSpec {
    pub fn new(program: impl Into<Program>, args: Args) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
            working_dir: None,
            kill_grace_ms: default_grace_ms(),
        }
    }

    fn render(&self, job: &JobContext) -> CommandLine {
        let digest = job.dir.digest().to_string();
        let out_dir = job.out_dir().display().to_string();
        let canonical = job.descriptor.canonical();
        let cpus = job.cpus.to_string();
        let expand = |arg: &String| {
            arg.replace("{job}", &canonical)
                .replace("{out_dir}", &out_dir)
                .replace("{digest}", &digest)
                .replace("{cpus}", &cpus)
        };
        CommandLine {
            program: self.program.clone(),
            args: self.args.iter().map(expand).collect(),
            envs: self.envs.clone(),
            dir: self.working_dir.clone(),
            stdin: None,
        }
    }
}

pub struct CommandWorker {
    spec: CommandSpec,
    fingerprint: ContentDigest,
}

impl CommandWorker {
    pub const NAME: &'static str = "command";

    pub fn new(spec: CommandSpec) -> Result<Self> {
        // teardown timing does not change what the command produces
        let fingerprint =
            ContentDigest::of_json(&(&spec.program, &spec.args, &spec.envs, &spec.working_dir))?;
        Ok(Self { spec, fingerprint })
    }

    pub fn from_params(params: &Value) -> Result<Arc<dyn Worker>> {
        let spec: CommandSpec =
            serde_json::from_value(params.clone()).map_err(|e| DispatchError::WorkerParams {
                worker: Self::NAME.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Arc::new(Self::new(spec)?))
    }
}

#[async_trait]
impl Worker for CommandWorker {
    fn fingerprint(&self) -> ContentDigest {
        self.fingerprint.clone()
    }

    async fn run(&self, job: &JobContext) -> std::result::Result<i32, Failure> {
        let cmd = self.spec.render(job);
        let (output_tx, mut output_rx) = mpsc::unbounded_channel();
        let child = ChildHandle::spawn(cmd, output_tx)
            .map_err(|e| Failure::error(format!("spawning {}: {e}", self.spec.program)))?;
        let grace = Duration::from_millis(self.spec.kill_grace_ms);
        job.track(&child, grace);
        let child = ChildGuard::new(child, grace);
        tracing::debug!(digest = %job.dir.digest().short(), pid = ?child.handle().pid(), "external job started");

        let wait = child.handle().wait();
        tokio::pin!(wait);
        let status = loop {
            tokio::select! {
                Some(output) = output_rx.recv() => {
                    write_output(job, output.blob()).await?;
                }
                status = &mut wait => break status,
            }
        };
        let status = status.map_err(|e| Failure::error(format!("waiting for child: {e}")))?;

        let drain = async {
            while let Some(output) = output_rx.recv().await {
                write_output(job, output.blob()).await?;
            }
            Ok::<_, Failure>(())
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::warn!(digest = %job.dir.digest().short(), "child output still open after exit, log may be truncated");
        }

        exit_code(status)
    }
}

async fn write_output(job: &JobContext, blob: &[u8]) -> std::result::Result<(), Failure> {
    job.log
        .lock()
        .await
        .write_output(blob)
        .await
        .map_err(|e| Failure::error(format!("writing job log: {e}")))
}
