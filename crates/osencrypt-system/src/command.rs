//! Spawns host commands with a deadline and drains their output on helper
//! threads so a chatty child never blocks on a full pipe.

use osencrypt_core::error::{OsEncryptError, OsEncryptResult};
use osencrypt_core::exec::CommandOutput;
use std::io::{ErrorKind, Read};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Exit status reported when the program could not be found, as a shell would.
pub const NOT_FOUND_STATUS: i32 = 127;

#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `program` with `args`. `display` names the command in errors.
    pub fn run(&self, program: &str, args: &[&str], display: &str) -> OsEncryptResult<CommandOutput> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(CommandOutput {
                    status: NOT_FOUND_STATUS,
                    stdout: String::new(),
                    stderr: format!("{program}: command not found"),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, stdout_pipe, stderr_pipe, display)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
        display: &str,
    ) -> OsEncryptResult<CommandOutput> {
        let start = Instant::now();
        let stdout_handle = Self::spawn_output_reader(stdout_pipe);
        let stderr_handle = Self::spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }

        let Some(exit_status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(OsEncryptError::CommandTimedOut {
                command: display.to_string(),
                timeout: self.timeout,
            });
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| OsEncryptError::Provider("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| OsEncryptError::Provider("stderr reader thread panicked".into()))??;

        Ok(CommandOutput {
            status: exit_status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<OsEncryptResult<String>>
    where
        R: Read + Send + 'static,
    {
        thread::spawn(move || -> OsEncryptResult<String> {
            let mut buf = Vec::new();
            if let Some(mut reader) = pipe {
                reader.read_to_end(&mut buf)?;
            }
            Ok(String::from_utf8_lossy(&buf).into_owned())
        })
    }
}
