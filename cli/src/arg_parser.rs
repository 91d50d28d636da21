use clap::{ArgEnum, Args, Parser, Subcommand};
use std::path::PathBuf;

/// Run a list of tile jobs on an HPC allocation, in parallel
#[derive(Debug, Parser)]
#[clap(name = "tilejobs", version)]
pub struct ArgParser {
    /// also append the coordinator log to this file
    #[clap(long, env = "TILEJOBS_LOG_FILE", global = true)]
    pub log_file: Option<PathBuf>,

    /// default log filter, RUST_LOG takes precedence
    #[clap(long, env = "TILEJOBS_LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// The sub-command to use
    #[clap(subcommand)]
    pub sub_command: SubCommand,
}

#[derive(Debug, Subcommand)]
pub enum SubCommand {
    /// run an external command once per job
    Run {
        #[clap(flatten)]
        batch: BatchArgs,

        #[clap(flatten)]
        command: CommandArgs,
    },
    /// generate grid metrics and canopy height models per tile
    Gridmetrics {
        #[clap(flatten)]
        batch: BatchArgs,

        #[clap(flatten)]
        preset: GridMetricsArgs,
    },
    /// report which jobs are complete without running anything
    Status(StatusArgs),
    /// serve one job invocation on stdin/stdout
    #[clap(hide = true)]
    WorkerHost,
}

#[derive(Debug, Args)]
pub struct BatchArgs {
    /// job list: a JSON array, or one job per line
    #[clap(long, env = "TILEJOBS_JOBS")]
    pub jobs: PathBuf,

    /// directory that receives one subdirectory per job
    #[clap(long, env = "TILEJOBS_OUTPUT", default_value = "./export")]
    pub output: PathBuf,

    /// number of concurrent jobs, instead of the allocation size
    #[clap(long, env = "TILEJOBS_MAX_WORKERS")]
    pub max_workers: Option<usize>,

    /// slots of the allocation kept for this process
    #[clap(long, env = "TILEJOBS_RESERVE", default_value_t = 1)]
    pub reserve: usize,

    /// per-job timeout in seconds
    #[clap(long, env = "TILEJOBS_TIMEOUT")]
    pub timeout: Option<u64>,

    /// seconds between SIGTERM and SIGKILL when a job is torn down
    #[clap(long, env = "TILEJOBS_GRACE", default_value_t = 10)]
    pub grace: u64,

    /// cancel the rest of the batch on the first failure
    #[clap(long, env = "TILEJOBS_FAIL_FAST")]
    pub fail_fast: bool,

    /// report completions as they happen, or in job list order at the end
    #[clap(long, arg_enum, env = "TILEJOBS_MODE", default_value = "ordered")]
    pub mode: Mode,

    /// run each job in its own process, or on a task of this one
    #[clap(long, arg_enum, env = "TILEJOBS_ISOLATION", default_value = "process")]
    pub isolation: Isolation,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ArgEnum)]
pub enum Mode {
    Ordered,
    Streaming,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ArgEnum)]
pub enum Isolation {
    /// one worker host process per job
    Process,
    /// in this process, for workers that spawn their own process anyway
    Local,
}

#[derive(Debug, Args)]
pub struct CommandArgs {
    /// environment variable for the command, VAR=VAL
    #[clap(long = "env", multiple_occurrences = true, parse(try_from_str = var_eq_val))]
    pub envs: Vec<(String, String)>,

    /// working directory for the command
    #[clap(long)]
    pub dir: Option<PathBuf>,

    /// name of the log file inside each job directory
    #[clap(long, env = "TILEJOBS_LOG_NAME", default_value = "job.log")]
    pub log_name: String,

    /// program and arguments; {job}, {out_dir}, {digest} and {cpus} are substituted
    #[clap(required = true, last = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Args)]
pub struct GridMetricsArgs {
    /// apptainer image
    #[clap(long, env = "TILEJOBS_SIF", default_value = "./bh_container.sif")]
    pub sif: PathBuf,

    /// script to run inside the container
    #[clap(long, default_value = "/bh/04-grid-metrics/gen-gridmet+chms.R")]
    pub script: String,

    /// point cloud catalog
    #[clap(long, env = "TILEJOBS_CATALOG", default_value = "./ctg.vpc")]
    pub catalog: PathBuf,

    /// digital terrain model
    #[clap(long, env = "TILEJOBS_DTM", default_value = "./dtm.vrt")]
    pub dtm: PathBuf,

    /// tile buffer in map units
    #[clap(long, env = "TILEJOBS_TILE_BUFFER", default_value_t = 40)]
    pub buffer: u32,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// job list: a JSON array, or one job per line
    #[clap(long, env = "TILEJOBS_JOBS")]
    pub jobs: PathBuf,

    /// directory holding one subdirectory per job
    #[clap(long, env = "TILEJOBS_OUTPUT", default_value = "./export")]
    pub output: PathBuf,

    /// worker the markers are checked against
    #[clap(subcommand)]
    pub worker: StatusWorker,
}

#[derive(Debug, Subcommand)]
pub enum StatusWorker {
    /// jobs run with `tilejobs run`
    Command(CommandArgs),
    /// jobs run with `tilejobs gridmetrics`
    Gridmetrics(GridMetricsArgs),
}

/// try_from_str parse function for command env variables
fn var_eq_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((var, val)) if !var.is_empty() => Ok((var.to_string(), val.to_string())),
        _ => Err("Required format is VAR=VAL".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_run() {
        let args = ArgParser::try_parse_from([
            "tilejobs",
            "run",
            "--jobs",
            "jobs.txt",
            "--max-workers",
            "3",
            "--env",
            "A=b=c",
            "--",
            "gen",
            "{job}",
        ])
        .unwrap();
        match args.sub_command {
            SubCommand::Run { batch, command } => {
                assert_eq!(batch.max_workers, Some(3));
                assert_eq!(batch.mode, Mode::Ordered);
                assert_eq!(batch.isolation, Isolation::Process);
                assert_eq!(command.envs, vec![("A".to_string(), "b=c".to_string())]);
                assert_eq!(command.command, vec!["gen", "{job}"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn run_needs_a_command() {
        assert!(ArgParser::try_parse_from(["tilejobs", "run", "--jobs", "jobs.txt"]).is_err());
    }

    #[test]
    fn env_pairs_need_an_equals() {
        assert!(var_eq_val("NOPE").is_err());
        assert!(var_eq_val("=x").is_err());
        assert_eq!(var_eq_val("K=").unwrap(), ("K".to_string(), String::new()));
    }
}
