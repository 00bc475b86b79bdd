//! Scoped root pivot. While a [`PivotSession`] is alive the staged volume is
//! `/` and the in-memory root sits under the memroot directory; ending the
//! session, by any path, pivots back.

use crate::config::OsEncryptConfig;
use crate::error::{OsEncryptError, OsEncryptResult};
use crate::exec::{CommandExecutor, Invocation};
use log::{info, warn};

const MOVED_MOUNTS: &str = "dev proc sys boot";

#[must_use = "dropping the session pivots straight back"]
pub struct PivotSession<'a> {
    config: &'a OsEncryptConfig,
    executor: &'a dyn CommandExecutor,
    finished: bool,
}

impl<'a> PivotSession<'a> {
    /// Pivot into the staging root. The pseudo-filesystems and `/boot` are
    /// moved across as the last step; if that fails the session is already
    /// armed and the pivot is undone before the error is returned.
    pub fn begin(
        config: &'a OsEncryptConfig,
        executor: &'a dyn CommandExecutor,
    ) -> OsEncryptResult<Self> {
        let staging = config.staged("/");
        let memroot = config.memroot();
        let parked = config.staged(&memroot);

        executor.run_checked("mount --make-rprivate /")?;
        executor.run_checked(&format!("mkdir {parked}"))?;
        executor.run_checked(&format!("pivot_root {staging} {parked}"))?;
        info!("pivoted into {staging}, in-memory root parked at {memroot}");

        let session = Self {
            config,
            executor,
            finished: false,
        };
        executor.bash_checked(&format!(
            "for i in {MOVED_MOUNTS}; do mount --move {memroot}/$i /$i; done"
        ))?;
        Ok(session)
    }

    /// Keep the work done inside the session and return to the in-memory
    /// root.
    pub fn commit(mut self) -> OsEncryptResult<()> {
        self.finished = true;
        self.pivot_back()
    }

    /// Abandon the session and return to the in-memory root.
    pub fn rollback(mut self) -> OsEncryptResult<()> {
        self.finished = true;
        warn!("rolling back root pivot");
        self.pivot_back()
    }

    /// Best effort: every step runs even when an earlier one exits non-zero.
    /// Only a failure to run a command at all is returned.
    fn pivot_back(&self) -> OsEncryptResult<()> {
        let staging = self.config.staged("/");
        let memroot = self.config.memroot();
        let steps = [
            Invocation::plain("mount --make-rprivate /"),
            Invocation::plain(format!("pivot_root {memroot} {memroot}{staging}")),
            Invocation::plain(format!("rmdir {}", self.config.staged(&memroot))),
            Invocation::bash(format!(
                "for i in {MOVED_MOUNTS}; do mount --move {staging}/$i /$i; done"
            )),
        ];

        let mut first_error: Option<OsEncryptError> = None;
        let mut clean = true;
        for step in &steps {
            match self.executor.execute(step) {
                Ok(out) if out.success() => {}
                Ok(out) => {
                    clean = false;
                    warn!("`{}` exited with {} during pivot back", step.command, out.status);
                }
                Err(err) => {
                    clean = false;
                    warn!("`{}` could not run during pivot back: {err}", step.command);
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        if clean {
            info!("returned to in-memory root");
        }
        Ok(())
    }
}

impl Drop for PivotSession<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        warn!("pivot session dropped without commit; rolling back");
        if let Err(err) = self.pivot_back() {
            warn!("rollback after dropped pivot session failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeExecutor;

    const MOVE_IN: &str = "for i in dev proc sys boot; do mount --move /memroot/$i /$i; done";
    const MOVE_OUT: &str = "for i in dev proc sys boot; do mount --move /oldroot/$i /$i; done";

    fn pivot_back() -> Vec<String> {
        vec![
            "mount --make-rprivate /".to_string(),
            "pivot_root /memroot /memroot/oldroot".to_string(),
            "rmdir /oldroot/memroot".to_string(),
            MOVE_OUT.to_string(),
        ]
    }

    #[test]
    fn commit_runs_pivot_in_then_back() {
        let cfg = OsEncryptConfig::for_device("/dev/sda2");
        let exec = FakeExecutor::new();

        let session = PivotSession::begin(&cfg, &exec).unwrap();
        session.commit().unwrap();

        let mut expected = vec![
            "mount --make-rprivate /".to_string(),
            "mkdir /oldroot/memroot".to_string(),
            "pivot_root /oldroot /oldroot/memroot".to_string(),
            MOVE_IN.to_string(),
        ];
        expected.extend(pivot_back());
        assert_eq!(exec.commands(), expected);
    }

    #[test]
    fn dropping_the_session_pivots_back() {
        let cfg = OsEncryptConfig::for_device("/dev/sda2");
        let exec = FakeExecutor::new();

        {
            let _session = PivotSession::begin(&cfg, &exec).unwrap();
        }

        let commands = exec.commands();
        assert_eq!(commands[4..].to_vec(), pivot_back());
    }

    #[test]
    fn failed_mount_move_is_rolled_back() {
        let cfg = OsEncryptConfig::for_device("/dev/sda2");
        let exec = FakeExecutor::new();
        exec.fail_on("for i in dev proc sys boot; do mount --move /memroot");

        let err = PivotSession::begin(&cfg, &exec).err().unwrap();
        assert!(matches!(err, OsEncryptError::CommandFailed { .. }));
        assert_eq!(exec.commands()[4..].to_vec(), pivot_back());
    }

    #[test]
    fn failed_pivot_root_leaves_nothing_to_undo() {
        let cfg = OsEncryptConfig::for_device("/dev/sda2");
        let exec = FakeExecutor::new();
        exec.fail_on("pivot_root");

        assert!(PivotSession::begin(&cfg, &exec).is_err());
        assert_eq!(exec.commands().len(), 3);
    }

    #[test]
    fn pivot_back_attempts_every_step() {
        let cfg = OsEncryptConfig::for_device("/dev/sda2");
        let exec = FakeExecutor::new();
        let session = PivotSession::begin(&cfg, &exec).unwrap();
        exec.fail_on("rmdir");

        session.rollback().unwrap();
        assert_eq!(exec.commands()[4..].to_vec(), pivot_back());
    }
}
