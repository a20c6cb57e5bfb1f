//! jobctl v0.1 — entry point
//!
//! All stdout is JSON only. Tracing logs go to stderr.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use jobctl_scheduler::config::{Config, ConfigOverrides};
use jobctl_scheduler::error::StoreError;
use jobctl_scheduler::schema::ErrorResponse;
use jobctl_scheduler::{cancel, list, looper, status, submit, wrapper};

#[derive(Debug, Parser)]
#[command(name = "jobctl")]
#[command(about = "Mainframe-job scheduler", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Override the database URL (sqlite file path, or ":memory:").
    #[arg(long, global = true)]
    db_url: Option<String>,

    /// Override the jobs root directory.
    #[arg(long, global = true)]
    jobs_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler daemon: tick forever until a shutdown signal.
    Run,

    /// Submit a new job request.
    Submit {
        /// Registered job type (e.g. "echo").
        job_type: String,

        /// Job-type-specific parameters, as a JSON object.
        #[arg(long, default_value = "{}")]
        parameters: String,

        /// Higher runs first among otherwise-equal requests.
        #[arg(long, default_value = "0")]
        priority: i32,

        /// Earliest epoch-seconds this job may start; requires --timeout > 0.
        #[arg(long)]
        start_date: Option<i64>,

        /// Reservation length in seconds (0 = unbounded).
        #[arg(long, default_value = "0")]
        timeout: u64,

        /// Submitter identity recorded on the request.
        #[arg(long, default_value = "cli")]
        submitter: String,
    },

    /// Cancel a job by id.
    Cancel {
        job_id: i64,

        #[arg(long, default_value = "cli")]
        submitter: String,
    },

    /// Get the current record of a job.
    Status { job_id: i64 },

    /// List the most recent jobs.
    List {
        #[arg(long, default_value = "50")]
        limit: u32,
    },

    /// [Internal] Run a single job's wrapper lifecycle — not for direct use.
    /// Reads its `WorkerRequest` as one JSON object on stdin.
    #[command(name = "_worker", hide = true)]
    Worker,

    /// [Internal] Run a job's cleanup handoff — not for direct use.
    #[command(name = "_cleanup", hide = true)]
    Cleanup { params_path: String },
}

fn main() {
    let cli = Cli::parse();

    // The internal re-exec subcommands run before a job directory exists as
    // a cwd and don't need a resolved Config; they get a verbosity-only
    // tracing setup instead of the config-driven one below.
    if matches!(cli.command, Command::Worker | Command::Cleanup { .. }) {
        init_tracing(verbosity_directive(cli.verbose));
        if let Err(e) = run(cli) {
            tracing::error!("{e:#}");
            std::process::exit(1);
        }
        return;
    }

    let overrides = ConfigOverrides {
        db_url: cli.db_url.clone(),
        jobs_dir: cli.jobs_dir.clone().map(Into::into),
        log_level: None,
    };
    let config = match Config::resolve(overrides) {
        Ok(c) => c,
        Err(e) => {
            // No tracing yet; the config itself couldn't be resolved.
            ErrorResponse::new("config_error", format!("{e:#}"), false).print();
            std::process::exit(1);
        }
    };

    // CLI -v/-vv/-vvv overrides the configured log level (spec §6: "the
    // configured log level maps onto tracing's filter directive").
    let directive = if cli.verbose > 0 { verbosity_directive(cli.verbose) } else { config.tracing_directive() };
    init_tracing(directive);

    let result = run_with_config(cli, &config);
    if let Err(e) = result {
        if e.downcast_ref::<StoreError>().map(|se| matches!(se, StoreError::JobNotFound(_))).unwrap_or(false) {
            ErrorResponse::new("job_not_found", format!("{e:#}"), false).print();
        } else {
            ErrorResponse::new("internal_error", format!("{e:#}"), false).print();
        }
        std::process::exit(1);
    }
}

fn verbosity_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Logs always go to stderr so stdout remains JSON-only. `RUST_LOG`, if set,
/// wins over everything else.
fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Worker => {
            let rc = wrapper::run_worker_from_reader(std::io::stdin().lock())?;
            std::process::exit(rc.clamp(0, 255));
        }
        Command::Cleanup { params_path } => {
            let rc = wrapper::run_cleanup(std::path::Path::new(&params_path))?;
            std::process::exit(rc.clamp(0, 255));
        }
        _ => unreachable!("caller filters to Worker/Cleanup"),
    }
}

fn run_with_config(cli: Cli, config: &Config) -> Result<()> {
    match cli.command {
        Command::Run => looper::run_daemon(config)?,

        Command::Submit { job_type, parameters, priority, start_date, timeout, submitter } => {
            submit::execute(
                config,
                submit::SubmitOpts {
                    job_type: &job_type,
                    parameters: &parameters,
                    priority,
                    start_date,
                    timeout,
                    submitter: &submitter,
                },
            )?;
        }

        Command::Cancel { job_id, submitter } => {
            cancel::execute(config, cancel::CancelOpts { job_id, submitter: &submitter })?;
        }

        Command::Status { job_id } => {
            status::execute(config, status::StatusOpts { job_id })?;
        }

        Command::List { limit } => {
            list::execute(config, list::ListOpts { limit })?;
        }

        Command::Worker | Command::Cleanup { .. } => unreachable!("handled above"),
    }
    Ok(())
}
