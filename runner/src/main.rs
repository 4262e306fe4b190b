mod config;
mod environment;
mod executors;
mod harness;
mod launcher;
mod provenance;
mod run;
mod worklist;

use crate::{
    config::{HarnessConfig, Overrides},
    environment::current_hostname,
    harness::{HarnessError, SubmitOptions},
    launcher::{DryRunLauncher, SystemLauncher},
    run::RunDirectory,
    worklist::Worklist,
};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use std::{env, path::PathBuf, process::ExitCode};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cgp-runner", version, about = "Submit cGP simulation arrays to a batch queue")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a run directory, record provenance and submit the simulation array
    Submit(SubmitArgs),

    /// Hand out the next replicate of a run, prints its id or nsims once all are done
    Claim {
        #[arg(long, env = "SimID")]
        run_dir: PathBuf,
        #[arg(long, env = "Nsims")]
        nsims: u32,
    },

    /// Mark a claimed replicate as finished
    Finish {
        #[arg(long, env = "SimID")]
        run_dir: PathBuf,
        id: u32,
    },
}

#[derive(Args)]
struct SubmitArgs {
    #[arg(short, long, default_value = "cgp-runner.yaml")]
    config: PathBuf,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    loci: Option<u32>,
    #[arg(long)]
    reps: Option<u32>,
    /// Number of array tasks to submit
    #[arg(short, long)]
    narray: Option<u32>,
    #[arg(long)]
    output_root: Option<PathBuf>,
    /// Submit the cleanup job once the array succeeded (true/false)
    #[arg(long)]
    cleanup: Option<bool>,
    /// Classify this host instead of the machine's hostname
    #[arg(long)]
    host: Option<String>,
    /// Log scheduler and simulation commands instead of running them
    #[arg(long)]
    dry_run: bool,
}

fn submit(args: SubmitArgs) -> Result<(), HarnessError> {
    let mut config = HarnessConfig::load(&args.config)?;
    config.apply(Overrides {
        model: args.model,
        loci: args.loci,
        reps: args.reps,
        narray: args.narray,
        output_root: args.output_root,
        cleanup: args.cleanup,
    });

    let host = match args.host {
        Some(host) => host,
        None => current_hostname()?,
    };
    let options = SubmitOptions {
        host,
        timestamp: Local::now(),
        working_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };

    let summary = if args.dry_run {
        let mut launcher = DryRunLauncher::new(harness::dry_run_fields(&config));
        harness::submit(&config, &options, &mut launcher, &mut SystemLauncher)?
    } else {
        harness::submit(&config, &options, &mut SystemLauncher, &mut SystemLauncher)?
    };

    harness::log_summary(&summary);
    println!("{}", summary.run.path().display());

    Ok(())
}

fn run(command: Command) -> Result<(), HarnessError> {
    match command {
        Command::Submit(args) => submit(args),
        Command::Claim { run_dir, nsims } => {
            let claim = Worklist::new(&RunDirectory::open(run_dir)).claim(nsims)?;
            println!("{}", claim.id_or(nsims));

            Ok(())
        }
        Command::Finish { run_dir, id } => {
            Worklist::new(&RunDirectory::open(run_dir)).finish(id)?;

            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    // stdout is reserved for results that scripts capture
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}
