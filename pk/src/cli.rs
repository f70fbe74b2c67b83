//! CLI argument parsing for pacekeeper

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use crate::config::{Config, PolicyKind};

#[derive(Parser, Debug)]
#[command(name = "pk")]
#[command(author, version, about = "Run a shell command over input lines under a batch, pool or throttle policy", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run in fixed-size cohorts
    Batch {
        /// Items per cohort
        #[arg(short = 's', long)]
        batch_size: Option<usize>,

        /// Pause between cohorts in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Run with a steady pool of workers
    Pool {
        /// Commands in flight at once
        #[arg(short = 'n', long)]
        max_concurrency: Option<usize>,

        /// How long a finished command keeps its slot, in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Run with a pool capped per time window
    Throttle {
        /// Commands started per window
        #[arg(short = 'n', long)]
        max_concurrency: Option<usize>,

        /// Window length in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Run with the policy named in the config file
    Run {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Print the effective configuration as YAML
    Config,
}

/// Arguments shared by every running subcommand
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Attempt every item and report failures at the end
    #[arg(short, long)]
    pub keep_going: bool,

    /// Read items from this file instead of stdin
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,

    /// Command to run per item; `{}` is replaced by the item
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

impl Command {
    /// Policy this subcommand runs with, falling back to the config for `run`
    pub fn policy_kind(&self, config: &Config) -> Option<PolicyKind> {
        match self {
            Command::Batch { .. } => Some(PolicyKind::Batch),
            Command::Pool { .. } => Some(PolicyKind::Concurrency),
            Command::Throttle { .. } => Some(PolicyKind::Throttle),
            Command::Run { .. } => Some(config.policy),
            Command::Config => None,
        }
    }

    pub fn run_args(&self) -> Option<&RunArgs> {
        match self {
            Command::Batch { run, .. } | Command::Pool { run, .. } | Command::Throttle { run, .. } | Command::Run { run } => {
                Some(run)
            }
            Command::Config => None,
        }
    }

    /// Fold the command-line policy flags into `config`
    pub fn apply_overrides(&self, config: &mut Config) {
        debug!(command = ?self, "Command::apply_overrides: called");
        match self {
            Command::Batch {
                batch_size,
                interval_ms,
                ..
            } => {
                if let Some(size) = batch_size {
                    config.batch.batch_size = *size;
                }
                if let Some(ms) = interval_ms {
                    config.batch.batch_interval_ms = *ms;
                }
            }
            Command::Pool {
                max_concurrency,
                interval_ms,
                ..
            } => {
                if let Some(n) = max_concurrency {
                    config.concurrency.max_concurrency = *n;
                }
                if let Some(ms) = interval_ms {
                    config.concurrency.concurrency_interval_ms = *ms;
                }
            }
            Command::Throttle {
                max_concurrency,
                interval_ms,
                ..
            } => {
                if let Some(n) = max_concurrency {
                    config.throttle.max_concurrency = *n;
                }
                if let Some(ms) = interval_ms {
                    config.throttle.interval_ms = *ms;
                }
            }
            Command::Run { .. } | Command::Config => {}
        }
        if let Some(run) = self.run_args()
            && run.keep_going
        {
            config.runner.keep_going = true;
        }
    }
}

/// Output format for run results
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}
