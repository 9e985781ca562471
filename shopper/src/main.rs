//! Promo redemption agent.
//!
//! Reads `shopper.toml`, drives a browser through the configured bridge
//! commands and asks the configured oracle command for every judgment call.
//! `run` prints the job report as JSON and exits with a status-specific code.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use shopper::core::types::{Job, JobReport, JobStatus};
use shopper::exit_codes;
use shopper::io::bridge::{AsyncBridgeDriver, BridgeDriver};
use shopper::io::config::{AgentConfig, load_config, write_config};
use shopper::io::driver::AsyncAdapter;
use shopper::io::oracle::CommandOracle;
use shopper::job::run_job;

const DEFAULT_CONFIG: &str = "shopper.toml";

#[derive(Parser)]
#[command(
    name = "shopper",
    version,
    about = "Find promo-eligible products, fill the cart and redeem a promo code"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file.
    Init {
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Load and check the config file.
    Validate {
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Run one promo redemption job.
    Run {
        /// Shop landing page; `https://` is assumed when no scheme is given.
        #[arg(long)]
        url: String,
        /// Free-form promo description.
        #[arg(long)]
        description: String,
        #[arg(long)]
        promo_code: String,
        /// Job id, also the artifact directory name. Defaults to a timestamp.
        #[arg(long)]
        job_id: Option<String>,
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

fn main() {
    shopper::logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::FAILED
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { config, force } => cmd_init(&config, force),
        Command::Validate { config } => cmd_validate(&config),
        Command::Run {
            url,
            description,
            promo_code,
            job_id,
            config,
        } => {
            let job = Job {
                id: job_id.unwrap_or_else(default_job_id),
                target_url: url,
                promo_description: description,
                promo_code,
            };
            cmd_run(&job, &config)
        }
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if !force && path.exists() {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &AgentConfig::default())?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(path: &Path) -> Result<i32> {
    let config = load_config(path)?;
    config.validate()?;
    Ok(exit_codes::OK)
}

fn cmd_run(job: &Job, path: &Path) -> Result<i32> {
    let config = load_config(path)?;
    config.validate()?;

    let timeout = Duration::from_secs(config.action_timeout_secs);
    let oracle = CommandOracle::from_config(&config.oracle);
    let mut primary = BridgeDriver::new(config.driver.primary.clone(), timeout);
    let mut fallback = AsyncAdapter::new(AsyncBridgeDriver::new(config.driver.fallback.clone()), timeout)
        .context("create fallback driver")?;

    let report = run_job(
        job,
        &mut primary,
        &mut fallback,
        &oracle,
        &oracle,
        &config,
        &config.artifacts_dir,
    );
    let rendered = serde_json::to_string_pretty(&report).context("serialize job report")?;
    println!("{rendered}");
    Ok(exit_code(&report))
}

fn exit_code(report: &JobReport) -> i32 {
    match report.status {
        JobStatus::Processed if report.outcome.as_ref().is_some_and(|o| o.promo_applied) => {
            exit_codes::OK
        }
        JobStatus::Processed => exit_codes::NOT_APPLIED,
        JobStatus::Unreachable => exit_codes::UNREACHABLE,
        JobStatus::Failed => exit_codes::FAILED,
    }
}

fn default_job_id() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    format!("job-{secs}")
}
