//! Host-backed `CommandExecutor`. Plain commands are split on whitespace and
//! executed directly; bash commands go through the configured shell.

use crate::command::CommandRunner;
use osencrypt_core::config::{ExecutorCfg, OsEncryptConfig};
use osencrypt_core::error::{OsEncryptError, OsEncryptResult};
use osencrypt_core::exec::{CommandExecutor, CommandOutput, Shell};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SystemExecutor {
    runner: CommandRunner,
    shell: String,
    log_limit: usize,
}

impl SystemExecutor {
    pub fn from_config(config: &OsEncryptConfig) -> Self {
        Self::from_executor_cfg(&config.executor)
    }

    pub fn from_executor_cfg(cfg: &ExecutorCfg) -> Self {
        Self {
            runner: CommandRunner::new(cfg.timeout()),
            shell: cfg.shell.clone(),
            log_limit: cfg.output_log_limit,
        }
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn timeout(&self) -> Duration {
        self.runner.timeout()
    }
}

impl CommandExecutor for SystemExecutor {
    fn invoke(&self, command: &str, shell: Shell) -> OsEncryptResult<CommandOutput> {
        match shell {
            Shell::Plain => {
                let mut words = command.split_whitespace();
                let program = words.next().ok_or_else(|| {
                    OsEncryptError::InvalidConfig("refusing to run an empty command".into())
                })?;
                let args: Vec<&str> = words.collect();
                self.runner.run(program, &args, command)
            }
            Shell::Bash => self.runner.run(&self.shell, &["-c", command], command),
        }
    }

    fn log_limit(&self) -> usize {
        self.log_limit
    }
}
