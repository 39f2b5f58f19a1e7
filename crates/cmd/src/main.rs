// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use cmd::commands;
use cmd::common::{DriverContext, parse_variable};
use qbench::FailedBenchmarks;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "qbench")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run benchmarks and report their results
    Run(RunArgs),
    /// List the benchmarks the configuration can see
    List(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// Driver configuration file
    #[arg(short, long, default_value = "qbench.yaml")]
    config: PathBuf,

    /// Template variable for the config and benchmark files (key=value)
    #[arg(short = 'v', long = "var", value_parser = parse_variable)]
    variables: Vec<(String, String)>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Benchmark to run; repeat for several. Runs everything when omitted
    #[arg(short, long = "benchmark")]
    benchmarks: Vec<String>,

    /// Execution sequence ids, comma separated; the suite runs once per id.
    /// Defaults to the current UTC time
    #[arg(short, long = "sequence-id", value_delimiter = ',')]
    sequence_ids: Vec<String>,

    /// Stop starting new executions after this many seconds
    #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
    time_limit: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    diagnostics::init();
    let cli = Cli::parse();

    match execute(cli).await {
        Ok(code) => code,
        Err(err) => {
            let err = format!("{err:#}");
            diagnostics::error!("qbench failed: {err}", err: err.as_str());
            _ = writeln!(std::io::stderr(), "Error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::List(args) => {
            let context = DriverContext::load(&args.config, args.variables)?;
            commands::list_command(&context, &mut std::io::stdout().lock())?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run(args) => {
            let mut context = DriverContext::load(&args.config.config, args.config.variables)?;
            if args.time_limit.is_some() {
                context.config.time_limit_secs = args.time_limit;
            }
            let sequence_ids = if args.sequence_ids.is_empty() {
                vec![Utc::now().format("%Y-%m-%d-%H:%M:%S").to_string()]
            } else {
                args.sequence_ids
            };

            let cancel = CancellationToken::new();
            let interrupt = tokio::spawn(stop_on_interrupt(cancel.clone()));
            let results = commands::run_command(
                &context,
                &args.benchmarks,
                &sequence_ids,
                cancel,
                &mut std::io::stdout(),
            )
            .await;
            interrupt.abort();

            match FailedBenchmarks::check(&results?) {
                Ok(()) => Ok(ExitCode::SUCCESS),
                Err(failed) => {
                    _ = writeln!(std::io::stderr(), "{}", failed.describe());
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

/// The first Ctrl-C lets in-flight executions finish; nothing new starts.
async fn stop_on_interrupt(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        diagnostics::warn!("Interrupted, waiting for running executions to finish");
        cancel.cancel();
    }
}
