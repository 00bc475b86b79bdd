//! Frees busy mount points on a live system: stops the services that keep
//! writing under them, kills whoever still holds them open, and unmounts.

use crate::config::OsEncryptConfig;
use crate::context::EncryptionContext;
use crate::error::{OsEncryptError, OsEncryptResult};
use crate::exec::{CommandExecutor, CommandOutput, Invocation};
use crate::parse::parse_fuser_pids;
use log::{debug, info, warn};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::thread::sleep;
use std::time::{Duration, Instant};

const VAR: &str = "/var";
const INIT_PID: u32 = 1;

/// Unmounts volumes that running processes are holding on to.
pub struct MountReclaimer<'a> {
    config: &'a OsEncryptConfig,
    executor: &'a dyn CommandExecutor,
    self_pid: u32,
}

impl<'a> MountReclaimer<'a> {
    pub fn new(ctx: &EncryptionContext<'a>) -> Self {
        Self {
            config: ctx.config,
            executor: ctx.executor,
            self_pid: std::process::id(),
        }
    }

    /// Treat `pid` as this process when it shows up among the blockers.
    pub fn with_self_pid(mut self, pid: u32) -> Self {
        self.self_pid = pid;
        self
    }

    pub fn is_mounted(&self, mountpoint: &str) -> OsEncryptResult<bool> {
        let out = self.executor.run(&format!("mountpoint {mountpoint}"))?;
        Ok(out.success())
    }

    /// Reclaim and unmount `mountpoint`. `/var` is always cleared first.
    pub fn unmount(&self, mountpoint: &str) -> OsEncryptResult<()> {
        if !self.is_mounted(mountpoint)? {
            debug!("{mountpoint} is not mounted");
            return Ok(());
        }

        if mountpoint == VAR {
            return self.unmount_var();
        }

        self.unmount_var()?;
        self.reclaim_once(mountpoint, true)?;
        Ok(())
    }

    /// Keep reclaiming `/var` until it no longer reports as a mount point.
    ///
    /// Services under `/var` restart themselves, so a failed unmount here is
    /// retried rather than raised. Without `reclaim.var_unmount_timeout_secs`
    /// the loop never gives up.
    pub fn unmount_var(&self) -> OsEncryptResult<()> {
        let started = Instant::now();
        let limit = self.config.var_unmount_timeout();

        while self.is_mounted(VAR)? {
            if let Some(limit) = limit {
                let waited = started.elapsed();
                if waited >= limit {
                    return Err(OsEncryptError::MountBusy {
                        mountpoint: PathBuf::from(VAR),
                        waited,
                    });
                }
            }

            let out = self.reclaim_once(VAR, false)?;
            if !out.success() {
                warn!("{VAR} still busy (umount exited {}); retrying", out.status);
            }
            self.settle();
        }
        Ok(())
    }

    /// Swap off, then clear every hierarchy mount under both the staging root
    /// and the live root.
    pub fn unmount_hierarchy(&self) -> OsEncryptResult<()> {
        self.executor.run_checked("swapoff -a")?;
        self.executor.run("umount -a")?;

        for mountpoint in &self.config.reclaim.hierarchy {
            self.unmount(&self.config.staged(mountpoint))?;
            self.unmount(mountpoint)?;
        }

        self.unmount_var()
    }

    fn reclaim_once(&self, mountpoint: &str, check: bool) -> OsEncryptResult<CommandOutput> {
        self.stop_services()?;

        let pids = self.blocking_pids(mountpoint)?;
        self.kill_blockers(&pids)?;

        self.executor.run_checked("telinit u")?;
        self.settle();

        let mut umount = Invocation::plain(format!("umount {mountpoint}"));
        if check {
            umount = umount.checked();
        }
        self.executor.execute(&umount)
    }

    fn stop_services(&self) -> OsEncryptResult<()> {
        for service in &self.config.reclaim.services {
            self.executor.run(&format!("systemctl stop {service}"))?;
        }
        Ok(())
    }

    /// PIDs holding `mountpoint` open, highest first.
    fn blocking_pids(&self, mountpoint: &str) -> OsEncryptResult<Vec<u32>> {
        let command = format!("fuser -vm {mountpoint}");
        let out = self.executor.run(&command)?;
        let pids = parse_fuser_pids(&out.stdout);

        // fuser exits 1 when nothing has the mount open.
        if !out.success() && !(out.status == 1 && pids.is_empty()) {
            return Err(OsEncryptError::CommandFailed {
                command,
                status: out.status,
                stderr: out.stderr.trim().to_string(),
            });
        }

        info!("Processes using {mountpoint}: {pids:?}");
        Ok(pids)
    }

    fn kill_blockers(&self, pids: &[u32]) -> OsEncryptResult<()> {
        for &pid in pids {
            if pid == self.self_pid {
                self.schedule_self_restart()?;
                continue;
            }

            if pid == INIT_PID {
                info!("Skipping init");
                continue;
            }

            self.executor.run(&format!("kill -9 {pid}"))?;
        }
        Ok(())
    }

    /// This process is one of the blockers. Instead of killing it, queue jobs
    /// that drop the daemon lock and bring the agent back once it is gone.
    fn schedule_self_restart(&self) -> OsEncryptResult<()> {
        let reclaim = &self.config.reclaim;
        info!(
            "Restarting {} before this process ({}) is reclaimed",
            self.config.agent.service, self.self_pid
        );
        if let Ok(exe) = env::current_exe() {
            info!("Current executable path: {}", exe.display());
        }
        info!(
            "Current executable arguments: {}",
            env::args().collect::<Vec<_>>().join(" ")
        );

        // atd has to be running or the deferred jobs never fire.
        self.executor.run("systemctl restart atd")?;

        // at jobs start in the submitting directory, which may be on the
        // mount being torn down.
        env::set_current_dir("/")?;
        fs::write(
            &reclaim.delete_lock_script,
            format!("rm -f {}\n", self.config.paths.daemon_lock_file),
        )?;
        fs::write(
            &reclaim.restart_agent_script,
            format!("systemctl restart {}\n", self.config.agent.service),
        )?;

        self.executor.run_checked(&format!(
            "at -f {} now + {} minutes",
            reclaim.delete_lock_script, reclaim.lock_removal_delay_mins
        ))?;
        self.executor.run_checked(&format!(
            "at -f {} now + {} minutes",
            reclaim.restart_agent_script, reclaim.agent_restart_delay_mins
        ))?;
        self.executor
            .bash(&format!("pkill -f '{}'", self.config.agent.daemon_pattern))?;
        Ok(())
    }

    fn settle(&self) {
        let delay = self.config.settle_delay();
        if delay > Duration::ZERO {
            sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ok, sandbox_config, status, FakeExecutor, MemoryCryptStore, StaticBek};

    fn reclaimer<'a>(
        cfg: &'a OsEncryptConfig,
        exec: &'a FakeExecutor,
        store: &'a MemoryCryptStore,
        bek: &'a StaticBek,
    ) -> MountReclaimer<'a> {
        let ctx = EncryptionContext::new(cfg, exec, bek, store);
        MountReclaimer::new(&ctx).with_self_pid(2000)
    }

    fn fixtures() -> (MemoryCryptStore, StaticBek) {
        (
            MemoryCryptStore::default(),
            StaticBek(PathBuf::from("/mnt/bek/key")),
        )
    }

    #[test]
    fn unmounted_target_runs_no_kill_or_umount() {
        let (cfg, _tmp) = sandbox_config();
        let exec = FakeExecutor::new();
        let (store, bek) = fixtures();

        for target in ["/var", "/home", "/oldroot/usr"] {
            reclaimer(&cfg, &exec, &store, &bek).unmount(target).unwrap();
        }

        assert!(exec.commands().iter().all(|c| c.starts_with("mountpoint ")));
    }

    #[test]
    fn var_is_unmounted_before_other_targets() {
        let (cfg, _tmp) = sandbox_config();
        let exec = FakeExecutor::with_mounted(&["/var", "/home"]);
        let (store, bek) = fixtures();

        reclaimer(&cfg, &exec, &store, &bek).unmount("/home").unwrap();

        let var = exec.position("umount /var").unwrap();
        let home = exec.position("umount /home").unwrap();
        assert!(var < home);
        assert!(exec.ran("systemctl stop NetworkManager"));
        assert!(exec.ran("systemctl stop postfix"));
        assert!(exec.ran("telinit u"));
    }

    #[test]
    fn kill_order_skips_init_and_self() {
        let (cfg, _tmp) = sandbox_config();
        let exec = FakeExecutor::with_mounted(&["/home"]);
        exec.respond_stdout("fuser -vm /home", " 1 50 3000 2000\n");
        let (store, bek) = fixtures();

        reclaimer(&cfg, &exec, &store, &bek).unmount("/home").unwrap();

        let kills: Vec<String> = exec
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("kill -9"))
            .collect();
        assert_eq!(kills, vec!["kill -9 3000".to_string(), "kill -9 50".to_string()]);

        let delete_lock = format!("at -f {} now + 1 minutes", cfg.reclaim.delete_lock_script);
        let restart = format!("at -f {} now + 2 minutes", cfg.reclaim.restart_agent_script);
        assert!(exec.ran("systemctl restart atd"));
        assert!(exec.ran(&delete_lock));
        assert!(exec.ran(&restart));
        assert!(exec.ran("pkill -f '.*osencrypt-daemon.*'"));

        // self sits between 3000 and 50 in descending order
        let self_branch = exec.position("systemctl restart atd").unwrap();
        assert!(exec.position("kill -9 3000").unwrap() < self_branch);
        assert!(self_branch < exec.position("kill -9 50").unwrap());

        let script = fs::read_to_string(&cfg.reclaim.delete_lock_script).unwrap();
        assert_eq!(script, format!("rm -f {}\n", cfg.paths.daemon_lock_file));
        let script = fs::read_to_string(&cfg.reclaim.restart_agent_script).unwrap();
        assert_eq!(script, "systemctl restart waagent\n");
    }

    #[test]
    fn failed_umount_is_fatal_outside_var() {
        let (cfg, _tmp) = sandbox_config();
        let exec = FakeExecutor::with_mounted(&["/opt"]);
        exec.respond("umount /opt", vec![status(32)]);
        let (store, bek) = fixtures();

        let err = reclaimer(&cfg, &exec, &store, &bek)
            .unmount("/opt")
            .unwrap_err();
        assert!(matches!(err, OsEncryptError::CommandFailed { ref command, .. } if command == "umount /opt"));
    }

    #[test]
    fn var_loop_retries_until_unmounted() {
        let (cfg, _tmp) = sandbox_config();
        let exec = FakeExecutor::new();
        exec.respond("mountpoint /var", vec![ok(""), ok(""), status(1)]);
        exec.respond("umount /var", vec![status(32), ok("")]);
        let (store, bek) = fixtures();

        reclaimer(&cfg, &exec, &store, &bek).unmount_var().unwrap();

        let attempts = exec
            .commands()
            .iter()
            .filter(|c| c.as_str() == "umount /var")
            .count();
        assert_eq!(attempts, 2);
    }

    #[test]
    fn var_loop_honours_operator_timeout() {
        let (mut cfg, _tmp) = sandbox_config();
        cfg.reclaim.var_unmount_timeout_secs = Some(0);
        let exec = FakeExecutor::new();
        exec.respond("mountpoint /var", vec![ok("")]);
        let (store, bek) = fixtures();

        let err = reclaimer(&cfg, &exec, &store, &bek)
            .unmount_var()
            .unwrap_err();
        assert!(matches!(err, OsEncryptError::MountBusy { .. }));
        assert!(!exec.ran_prefix("umount"));
    }

    #[test]
    fn unexpected_fuser_failure_is_raised() {
        let (cfg, _tmp) = sandbox_config();
        let exec = FakeExecutor::with_mounted(&["/tmp"]);
        exec.respond("fuser -vm /tmp", vec![status(2)]);
        let (store, bek) = fixtures();

        let err = reclaimer(&cfg, &exec, &store, &bek)
            .unmount("/tmp")
            .unwrap_err();
        assert!(matches!(err, OsEncryptError::CommandFailed { status: 2, .. }));
        assert!(!exec.ran("umount /tmp"));
    }

    #[test]
    fn hierarchy_covers_staging_and_live_mounts() {
        let (cfg, _tmp) = sandbox_config();
        let exec = FakeExecutor::with_mounted(&["/oldroot/home", "/usr"]);
        let (store, bek) = fixtures();

        reclaimer(&cfg, &exec, &store, &bek)
            .unmount_hierarchy()
            .unwrap();

        let cmds = exec.commands();
        assert_eq!(cmds[0], "swapoff -a");
        assert_eq!(cmds[1], "umount -a");
        assert!(exec.ran("umount /oldroot/home"));
        assert!(exec.ran("umount /usr"));
        assert!(!exec.ran("umount /home"));
    }
}
