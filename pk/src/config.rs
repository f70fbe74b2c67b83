//! Pacekeeper configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::policy::{BatchOptions, ConcurrencyOptions, ThrottleOptions};

/// Project-local config file, looked up in the working directory
const LOCAL_CONFIG: &str = ".pacekeeper.yml";

/// Main Pacekeeper configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level used when none is given on the command line
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Policy used when the command line does not pick one
    pub policy: PolicyKind,

    /// Batch policy options
    pub batch: BatchOptions,

    /// Concurrency policy options
    pub concurrency: ConcurrencyOptions,

    /// Throttle policy options
    pub throttle: ThrottleOptions,

    /// Command runner settings
    pub runner: RunnerConfig,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Checks every policy section, not just the selected one, so a broken
    /// section is reported even when it is not in use yet.
    pub fn validate(&self) -> Result<()> {
        self.batch.validate().context("Invalid batch section")?;
        self.concurrency.validate().context("Invalid concurrency section")?;
        self.throttle.validate().context("Invalid throttle section")?;
        if self.runner.shell.trim().is_empty() {
            return Err(eyre::eyre!("Invalid runner section: shell must not be empty"));
        }
        Ok(())
    }

    /// Implicit config locations, most specific first
    ///
    /// `./.pacekeeper.yml`, then `pacekeeper/pacekeeper.yml` under the user
    /// config directory.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(LOCAL_CONFIG)];
        paths.extend(dirs::config_dir().map(|dir| dir.join("pacekeeper").join("pacekeeper.yml")));
        paths
    }

    /// Load the configuration
    ///
    /// An explicit path must load. Otherwise the first implicit file that
    /// loads wins; broken ones are logged and skipped, and with none left the
    /// defaults apply.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).with_context(|| format!("Failed to load config from {}", path.display()));
        }

        for path in Self::search_paths().iter().filter(|path| path.is_file()) {
            match Self::load_from_file(path) {
                Ok(config) => return Ok(config),
                Err(e) => warn!(path = %path.display(), "Config::load: skipping config: {e:#}"),
            }
        }

        debug!("Config::load: no config file found, using defaults");
        Ok(Self::default())
    }

    /// Read and parse one config file; an empty file means all defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&content).context("Failed to parse config file")?
        };

        info!(path = %path.display(), policy = %config.policy, "Config::load_from_file: loaded");
        Ok(config)
    }
}

/// Which admission policy to drive work with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Batch,
    #[default]
    Concurrency,
    Throttle,
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyKind::Batch => write!(f, "batch"),
            PolicyKind::Concurrency => write!(f, "concurrency"),
            PolicyKind::Throttle => write!(f, "throttle"),
        }
    }
}

/// Command runner settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Shell that runs each command with `-c`
    pub shell: String,

    /// Attempt every item instead of stopping at the first failure
    #[serde(rename = "keep-going")]
    pub keep_going: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            keep_going: false,
        }
    }
}
