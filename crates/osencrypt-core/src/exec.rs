//! Command execution contract. Implementations only know how to spawn a
//! command; logging and the pass/fail policy live in the provided methods so
//! every executor behaves the same way.

use crate::error::{OsEncryptError, OsEncryptResult};
use log::{debug, info, warn};

/// Output size logged per stream before truncation.
pub const DEFAULT_LOG_LIMIT: usize = 4096;

/// How a command line is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    /// Split on whitespace and exec the first word directly.
    Plain,
    /// Hand the full line to bash, so globs, loops and pipes work.
    Bash,
}

/// One command to run and how its result should be treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command: String,
    pub shell: Shell,
    pub check: bool,
    pub quiet: bool,
}

impl Invocation {
    pub fn plain(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            shell: Shell::Plain,
            check: false,
            quiet: false,
        }
    }

    pub fn bash(command: impl Into<String>) -> Self {
        Self {
            shell: Shell::Bash,
            ..Self::plain(command)
        }
    }

    /// Fail with `CommandFailed` on a non-zero exit.
    pub fn checked(mut self) -> Self {
        self.check = true;
        self
    }

    /// Log at debug level only.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }
}

/// Exit status and captured streams of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

pub trait CommandExecutor {
    /// Spawn the command and collect its output. Non-zero exits are not
    /// errors at this layer.
    fn invoke(&self, command: &str, shell: Shell) -> OsEncryptResult<CommandOutput>;

    /// Per-stream log budget.
    fn log_limit(&self) -> usize {
        DEFAULT_LOG_LIMIT
    }

    /// Run `invocation`, log it, and apply its failure policy.
    fn execute(&self, invocation: &Invocation) -> OsEncryptResult<CommandOutput> {
        let output = self.invoke(&invocation.command, invocation.shell)?;
        log_output(invocation, &output, self.log_limit());

        if invocation.check && !output.success() {
            return Err(OsEncryptError::CommandFailed {
                command: invocation.command.clone(),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Plain command, failures tolerated.
    fn run(&self, command: &str) -> OsEncryptResult<CommandOutput> {
        self.execute(&Invocation::plain(command))
    }

    /// Plain command, failures raised.
    fn run_checked(&self, command: &str) -> OsEncryptResult<CommandOutput> {
        self.execute(&Invocation::plain(command).checked())
    }

    /// Bash command, failures tolerated.
    fn bash(&self, command: &str) -> OsEncryptResult<CommandOutput> {
        self.execute(&Invocation::bash(command))
    }

    /// Bash command, failures raised.
    fn bash_checked(&self, command: &str) -> OsEncryptResult<CommandOutput> {
        self.execute(&Invocation::bash(command).checked())
    }
}

fn log_output(invocation: &Invocation, output: &CommandOutput, limit: usize) {
    let line = format!("{} exited with {}", invocation.command, output.status);
    if invocation.quiet {
        debug!("{line}");
    } else if output.success() || !invocation.check {
        info!("{line}");
    } else {
        warn!("{line}");
    }

    let stdout = output.stdout.trim();
    if !stdout.is_empty() {
        debug!("stdout: {}", truncate(stdout, limit));
    }
    let stderr = output.stderr.trim();
    if !stderr.is_empty() {
        debug!("stderr: {}", truncate(stderr, limit));
    }
}

/// Clip `text` to at most `limit` bytes on a char boundary.
pub fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [{} bytes truncated]", &text[..end], text.len() - end)
}
