//! Pacekeeper - run a shell command over input lines under an admission policy
//!
//! CLI entry point.

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use pacekeeper::cli::{Cli, OutputFormat, RunArgs};
use pacekeeper::config::{Config, PolicyKind};
use pacekeeper::runner::{CommandRunner, RunReport, parse_items};
use pacekeeper::{Batch, Concurrency, Policy, Settled, Throttle};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pacekeeper")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(log_dir.join("pk.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref()).context("Failed to setup logging")?;

    cli.command.apply_overrides(&mut config);
    debug!(command = ?cli.command, "main: dispatching command");

    let Some(run) = cli.command.run_args() else {
        print!("{}", serde_yaml::to_string(&config).context("Failed to render configuration")?);
        return Ok(());
    };
    config.validate()?;

    let kind = cli.command.policy_kind(&config).unwrap_or(config.policy);
    let items = read_items(run).await?;
    let runner = CommandRunner::new(config.runner.shell.clone(), &run.command)?;
    info!(
        policy = %kind,
        items = items.len(),
        template = runner.template(),
        "main: running"
    );

    let failed = match kind {
        PolicyKind::Batch => execute(&Batch::new(config.batch.clone())?, items, &runner, &config, run.format).await,
        PolicyKind::Concurrency => {
            execute(&Concurrency::new(config.concurrency.clone())?, items, &runner, &config, run.format).await
        }
        PolicyKind::Throttle => {
            execute(&Throttle::new(config.throttle.clone())?, items, &runner, &config, run.format).await
        }
    }?;

    if failed > 0 {
        return Err(eyre::eyre!("{} item(s) failed", failed));
    }
    Ok(())
}

async fn read_items(run: &RunArgs) -> Result<Vec<String>> {
    let text = match &run.input {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .context(format!("Failed to read input from {}", path.display()))?,
        None => {
            let mut text = String::new();
            tokio::io::stdin()
                .read_to_string(&mut text)
                .await
                .context("Failed to read input from stdin")?;
            text
        }
    };
    Ok(parse_items(&text))
}

/// Run every item under `policy`, print the results, and return how many failed
async fn execute<P: Policy>(
    policy: &P,
    items: Vec<String>,
    runner: &CommandRunner,
    config: &Config,
    format: OutputFormat,
) -> Result<usize> {
    let settled: Vec<Settled<RunReport, String>> = if config.runner.keep_going {
        policy
            .map_settled(items, |item: String| runner.run(item))
            .await
            .into_iter()
            .map(|outcome| outcome.into_result().map_err(|e| e.to_string()).into())
            .collect()
    } else {
        match policy.map(items, |item: String| runner.run(item)).await {
            Ok(reports) => reports.into_iter().map(|value| Settled::Fulfilled { value }).collect(),
            Err(e) => {
                debug!(%e, "execute: aborting on first failure");
                if let pacekeeper::RunnerError::Failed { stderr, .. } = &e {
                    eprint!("{}", stderr);
                }
                eprintln!("{} {}", "✗".red(), e);
                return Ok(1);
            }
        }
    };

    let failed = settled.iter().filter(|outcome| outcome.is_rejected()).count();
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&settled).context("Failed to render results")?
            );
        }
        OutputFormat::Text => {
            for outcome in &settled {
                match outcome {
                    Settled::Fulfilled { value } => {
                        print!("{}", value.stdout);
                        eprint!("{}", value.stderr);
                    }
                    Settled::Rejected { reason } => eprintln!("{} {}", "✗".red(), reason),
                }
            }
            if config.runner.keep_going {
                eprintln!(
                    "{} {} succeeded, {} failed",
                    if failed == 0 { "✓".green() } else { "✗".red() },
                    settled.len() - failed,
                    failed
                );
            }
        }
    }
    Ok(failed)
}
