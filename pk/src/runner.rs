//! Shell command runner used by the `pk` binary
//!
//! Each item becomes one `sh -c` invocation of the command template. Every
//! `{}` in the template is replaced by the item, single-quoted for the shell;
//! a template without `{}` gets the item appended as its last argument.

use serde::Serialize;
use std::process::Stdio;
use thiserror::Error;
use tracing::debug;

/// Placeholder replaced by the item in a command template
pub const PLACEHOLDER: &str = "{}";

/// Errors that can occur while running one item's command
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunnerError {
    #[error("No command given")]
    EmptyCommand,

    #[error("Failed to spawn {shell} for item '{item}': {message}")]
    Spawn {
        shell: String,
        item: String,
        message: String,
    },

    #[error("Command for item '{item}' exited with {}", describe_code(*.code))]
    Failed {
        item: String,
        code: Option<i32>,
        stderr: String,
    },
}

fn describe_code(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

/// Output of one successful command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub item: String,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a command template once per item
#[derive(Debug, Clone)]
pub struct CommandRunner {
    shell: String,
    template: String,
}

impl CommandRunner {
    /// Build a runner from the command words given on the command line
    pub fn new(shell: impl Into<String>, command: &[String]) -> Result<Self, RunnerError> {
        let template = command.join(" ");
        if template.trim().is_empty() {
            return Err(RunnerError::EmptyCommand);
        }
        let shell = shell.into();
        debug!(%shell, %template, "CommandRunner::new: called");
        Ok(Self { shell, template })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Script passed to the shell for `item`
    pub fn render(&self, item: &str) -> String {
        let quoted = quote(item);
        if self.template.contains(PLACEHOLDER) {
            self.template.replace(PLACEHOLDER, &quoted)
        } else {
            format!("{} {}", self.template, quoted)
        }
    }

    /// Run the command for one item, failing on a non-zero exit
    pub async fn run(&self, item: String) -> Result<RunReport, RunnerError> {
        let script = self.render(&item);
        debug!(%item, %script, "CommandRunner::run: spawning command");

        let output = tokio::process::Command::new(&self.shell)
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RunnerError::Spawn {
                shell: self.shell.clone(),
                item: item.clone(),
                message: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() {
            debug!(%item, stdout_len = stdout.len(), "CommandRunner::run: command succeeded");
            Ok(RunReport { item, stdout, stderr })
        } else {
            debug!(%item, exit_code = ?output.status.code(), "CommandRunner::run: command failed");
            Err(RunnerError::Failed {
                item,
                code: output.status.code(),
                stderr,
            })
        }
    }
}

/// Single-quote `item` for a POSIX shell
fn quote(item: &str) -> String {
    format!("'{}'", item.replace('\'', r"'\''"))
}

/// Split input text into items: one per line, blank lines skipped
pub fn parse_items(input: &str) -> Vec<String> {
    input
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}
