mod arg_parser;
mod batch;

use arg_parser::{ArgParser, SubCommand};
use batch::WorkerDef;

use clap::Parser;
use std::io::IsTerminal;
use std::process::ExitCode;
use std::time::Duration;
use tilejobs::report::{self, ReportConfig};
use tilejobs::{host, WorkerRegistry};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = ArgParser::parse();

    // a worker host logs to stderr only, the coordinator forwards it
    let is_host = matches!(args.sub_command, SubCommand::WorkerHost);
    let config = ReportConfig {
        level: args.log_level.clone(),
        log_file: if is_host { None } else { args.log_file.clone() },
        ansi: !is_host && std::io::stderr().is_terminal(),
    };
    if let Err(e) = report::init(&config) {
        eprintln!("tilejobs: {e}");
        return ExitCode::from(1);
    }

    report::guarded(run(args)).await
}

async fn run(args: ArgParser) -> anyhow::Result<ExitCode> {
    match args.sub_command {
        SubCommand::Run { batch, command } => {
            let worker = WorkerDef::command(&command, Duration::from_secs(batch.grace))?;
            batch::run_batch(&batch, worker).await
        }
        SubCommand::Gridmetrics { batch, preset } => {
            let worker = WorkerDef::gridmetrics(&preset, Duration::from_secs(batch.grace))?;
            batch::run_batch(&batch, worker).await
        }
        SubCommand::Status(status) => batch::status(&status).await,
        SubCommand::WorkerHost => {
            host::run_host(&WorkerRegistry::default()).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
