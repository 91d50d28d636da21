use crate::arg_parser::{BatchArgs, CommandArgs, GridMetricsArgs, Isolation, Mode, StatusArgs, StatusWorker};
use anyhow::{Context, Result};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tilejobs::config::cpus_per_task;
use tilejobs::guard::MarkerState;
use tilejobs::input::load_job_list;
use tilejobs::report::JOBS_FAILED_EXIT;
use tilejobs::shutdown::install_shutdown_handler;
use tilejobs::{
    BatchSummary, CommandSpec, CommandWorker, Completion, DispatchOptions, Dispatcher, Executor,
    JobLayout, JobTemplate, LocalExecutor, ProcessExecutor, Reporter, SlotBudget, WorkerRegistry,
    WorkerSpec,
};

const GRIDMETRICS_LOG_NAME: &str = "gen-gridmet+chms.log";

/// What every job of a batch runs, and where it logs.
pub struct WorkerDef {
    pub label: String,
    pub spec: WorkerSpec,
    pub log_name: String,
}

impl WorkerDef {
    pub fn command(args: &CommandArgs, grace: Duration) -> Result<Self> {
        let (program, rest) = args
            .command
            .split_first()
            .context("no command given after --")?;
        let mut command = CommandSpec::new(program.clone(), rest.to_vec());
        command.envs = args.envs.clone();
        command.working_dir = args.dir.clone();
        command.kill_grace_ms = grace.as_millis() as u64;
        Ok(Self {
            label: program.clone(),
            spec: command_spec(&command)?,
            log_name: args.log_name.clone(),
        })
    }

    /// One containerised R run per tile, each on its own exclusive Slurm step.
    pub fn gridmetrics(args: &GridMetricsArgs, grace: Duration) -> Result<Self> {
        let sif = absolute(&args.sif)?;
        let catalog = absolute(&args.catalog)?;
        let dtm = absolute(&args.dtm)?;
        let argv = [
            "--export=all",
            "--exclusive",
            "--nodes=1",
            "--ntasks=1",
            "--cpus-per-task={cpus}",
            "--cpu-bind=cores",
            "apptainer",
            "exec",
            "--writable-tmpfs",
        ]
        .into_iter()
        .map(str::to_string)
        .chain([
            sif.display().to_string(),
            args.script.clone(),
            "--dtm-path".to_string(),
            dtm.display().to_string(),
            "--max-threads".to_string(),
            "{cpus}".to_string(),
            catalog.display().to_string(),
            "{out_dir}".to_string(),
            "{job}".to_string(),
            args.buffer.to_string(),
        ])
        .collect();
        let mut command = CommandSpec::new("srun", argv);
        command.kill_grace_ms = grace.as_millis() as u64;
        Ok(Self {
            label: "gridmetrics".to_string(),
            spec: command_spec(&command)?,
            log_name: GRIDMETRICS_LOG_NAME.to_string(),
        })
    }
}

fn command_spec(command: &CommandSpec) -> Result<WorkerSpec> {
    Ok(WorkerSpec::new(
        CommandWorker::NAME,
        serde_json::to_value(command).context("encoding command")?,
    ))
}

/// Resolve against the working directory once, so every job sees the same paths.
fn absolute(path: &Path) -> Result<PathBuf> {
    match std::fs::canonicalize(path) {
        Ok(path) => Ok(path),
        Err(_) => Ok(std::env::current_dir()
            .context("reading working directory")?
            .join(path)),
    }
}

pub async fn run_batch(args: &BatchArgs, worker: WorkerDef) -> Result<ExitCode> {
    let jobs = load_job_list(&args.jobs).await?;
    tokio::fs::create_dir_all(&args.output)
        .await
        .with_context(|| format!("creating output root {}", args.output.display()))?;
    let output = absolute(&args.output)?;

    let max_workers = match args.max_workers {
        Some(n) => n,
        None => SlotBudget::from_env(args.reserve)?.max_workers(),
    };
    let cpus = cpus_per_task()?;
    let options = DispatchOptions {
        max_workers,
        fail_fast: args.fail_fast,
    };
    let grace = Duration::from_secs(args.grace);
    let executor: Arc<dyn Executor> = match args.isolation {
        Isolation::Process => Arc::new(ProcessExecutor::current_exe()?.with_grace(grace)),
        Isolation::Local => Arc::new(LocalExecutor::new(WorkerRegistry::default())),
    };
    let cancel = install_shutdown_handler().context("installing signal handlers")?;
    let dispatcher =
        Dispatcher::from_arc(executor, options, Reporter::new(worker.label))?.with_cancellation(cancel);
    let template = JobTemplate::new(
        worker.spec,
        JobLayout::new(output).with_log_name(worker.log_name),
    )
    .with_timeout(args.timeout.map(Duration::from_secs))
    .with_cpus_per_task(cpus);

    match args.mode {
        Mode::Ordered => {
            let report = dispatcher.dispatch_ordered(jobs, &template).await?;
            for completion in report.completions() {
                print_completion(completion);
            }
            Ok(report.exit_code())
        }
        Mode::Streaming => {
            let mut completions = dispatcher.dispatch_streaming(jobs, &template);
            let mut summary = BatchSummary::default();
            while let Some(completion) = completions.next().await {
                let completion = completion?;
                print_completion(&completion);
                summary.record(&completion.outcome);
            }
            Ok(summary.exit_code())
        }
    }
}

fn print_completion(completion: &Completion) {
    println!(
        "{}\t{}\t{}",
        completion.descriptor.digest(),
        completion.outcome.kind(),
        completion.descriptor
    );
}

pub async fn status(args: &StatusArgs) -> Result<ExitCode> {
    // grace only shapes teardown, it is not part of the fingerprint
    let grace = Duration::from_secs(0);
    let worker = match &args.worker {
        StatusWorker::Command(command) => WorkerDef::command(command, grace)?,
        StatusWorker::Gridmetrics(preset) => WorkerDef::gridmetrics(preset, grace)?,
    };
    let fingerprint = WorkerRegistry::default().resolve(&worker.spec)?.fingerprint();
    let jobs = load_job_list(&args.jobs).await?;
    let layout = JobLayout::new(absolute(&args.output)?);

    let mut complete = 0;
    for job in &jobs {
        let digest = job.digest();
        let dir = layout.job_dir(digest.clone());
        let state = dir
            .check(&fingerprint)
            .await
            .with_context(|| format!("reading marker in {}", dir.path().display()))?;
        let label = match &state {
            MarkerState::Complete => {
                complete += 1;
                "complete"
            }
            MarkerState::Stale(reason) => {
                tracing::info!(digest = %digest.short(), %reason, "stale marker");
                "stale"
            }
            MarkerState::Absent => "pending",
        };
        println!("{digest}\t{label}\t{job}");
    }

    tracing::info!(complete, total = jobs.len(), "Status checked");
    if complete == jobs.len() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(JOBS_FAILED_EXIT))
    }
}
