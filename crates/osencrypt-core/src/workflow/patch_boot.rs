//! The state that pivots into the freshly encrypted root, patches its boot
//! configuration, and pivots back.

use super::boot::BootConfigPatcher;
use super::pivot::PivotSession;
use super::reclaim::MountReclaimer;
use crate::context::EncryptionContext;
use crate::error::OsEncryptResult;
use crate::exec::{CommandExecutor, Invocation};
use crate::machine::{EncryptionState, StateLifecycle};
use crate::parse::first_value;
use log::{info, warn};

pub const PATCH_BOOT_SYSTEM_STATE: &str = "PatchBootSystemState";

pub struct PatchBootSystemState<'a> {
    ctx: EncryptionContext<'a>,
    lifecycle: StateLifecycle,
    root_partuuid: Option<String>,
    self_pid: Option<u32>,
}

impl<'a> PatchBootSystemState<'a> {
    /// Build the state, probing the root partition UUID with `blkid`. An
    /// empty answer selects the attribute-probe boot patch.
    pub fn new(ctx: EncryptionContext<'a>) -> OsEncryptResult<Self> {
        let out = ctx.executor.run(&format!(
            "blkid -s PARTUUID -o value {}",
            ctx.rootfs_block_device()
        ))?;
        let partuuid = if out.success() {
            first_value(&out.stdout)
        } else {
            None
        };
        match &partuuid {
            Some(uuid) => info!("root partition UUID is {uuid}"),
            None => info!("root partition has no PARTUUID"),
        }
        Ok(Self::with_root_partuuid(ctx, partuuid))
    }

    pub fn with_root_partuuid(ctx: EncryptionContext<'a>, root_partuuid: Option<String>) -> Self {
        Self {
            lifecycle: StateLifecycle::new(ctx.config, PATCH_BOOT_SYSTEM_STATE),
            ctx,
            root_partuuid,
            self_pid: None,
        }
    }

    /// Treat `pid` as this process during mount reclaim.
    pub fn with_self_pid(mut self, pid: u32) -> Self {
        self.self_pid = Some(pid);
        self
    }

    pub fn root_partuuid(&self) -> Option<&str> {
        self.root_partuuid.as_deref()
    }

    fn reclaimer(&self) -> MountReclaimer<'a> {
        let reclaimer = MountReclaimer::new(&self.ctx);
        match self.self_pid {
            Some(pid) => reclaimer.with_self_pid(pid),
            None => reclaimer,
        }
    }

    /// Reopen the encrypted root with its detached header and mount every
    /// logical volume under the staging root.
    fn stage_encrypted_root(&self) -> OsEncryptResult<()> {
        let cfg = self.ctx.config;
        let exec = self.ctx.executor;
        let vg = &cfg.volumes.volume_group;

        exec.run("systemctl restart lvm2-lvmetad")?;
        exec.run_checked("pvscan")?;
        exec.run_checked(&format!("vgcfgrestore -f {} {vg}", cfg.volumes.snapshot_file))?;
        exec.run_checked(&format!("cryptsetup luksClose {}", cfg.paths.mapper_name))?;

        let bek = self.ctx.bek.passphrase_file(&cfg.bek)?;
        exec.run("mount /boot")?;
        exec.run_checked(&format!(
            "cryptsetup luksOpen --header {} {} {} -d {}",
            cfg.paths.luks_header,
            self.ctx.rootfs_block_device(),
            cfg.paths.mapper_name,
            bek.display()
        ))?;

        self.reclaimer().unmount_hierarchy()?;

        // Some distributions leave the volume group inactive after luksOpen.
        exec.run(&format!("vgchange -a y {vg}"))?;
        for lv in &cfg.volumes.logical_volumes {
            exec.run_checked(&format!("mount /dev/{vg}/{} {}", lv.name, cfg.staged(&lv.target)))?;
        }
        exec.run("mount /boot")?;
        exec.run("mount /boot/efi")?;
        Ok(())
    }

    /// Work done while the staged volume is `/`.
    fn patch_pivoted_root(&self) -> OsEncryptResult<()> {
        self.ctx.executor.bash_checked(&format!(
            "[ -e \"{}\" ]",
            self.ctx.config.paths.boot_luks_dir
        ))?;
        BootConfigPatcher::new(self.ctx, self.root_partuuid.as_deref()).patch()
    }

    /// Copy extension logs, rejected settings and status files, the agent
    /// log and the encryption markers onto the encrypted root.
    fn preserve_artifacts(&self) -> OsEncryptResult<()> {
        let cfg = self.ctx.config;
        let exec = self.ctx.executor;
        let agent = &cfg.agent;

        let builds = [
            (agent.extension_full_name(), agent.extension_versioned_name(), false),
            (
                agent.test_extension_full_name(),
                agent.test_extension_versioned_name(),
                true,
            ),
        ];
        for (full_name, versioned, quiet) in &builds {
            let log_dir = &agent.extension_log_dir;
            let lib_dir = &agent.agent_lib_dir;
            let copies = [
                Invocation::plain(format!(
                    "/bin/cp -ax {log_dir}/{full_name} {}/{full_name}.Stripdown",
                    cfg.staged(log_dir)
                )),
                Invocation::bash(format!(
                    "/bin/cp -ax {lib_dir}/{versioned}/config/*.settings.rejected {}/{versioned}/config",
                    cfg.staged(lib_dir)
                )),
                Invocation::bash(format!(
                    "/bin/cp -ax {lib_dir}/{versioned}/status/*.status.rejected {}/{versioned}/status",
                    cfg.staged(lib_dir)
                )),
            ];
            for copy in copies {
                let copy = if *quiet { copy.quiet() } else { copy };
                exec.execute(&copy)?;
            }
        }

        exec.run(&format!(
            "/bin/cp -ax {} {}.pivotroot",
            agent.log_file,
            cfg.staged(&agent.log_file)
        ))?;

        let markers = &cfg.paths.markers_dir;
        let staged_markers = cfg.staged(markers);
        exec.bash_checked(&format!("/bin/cp -ax {markers}/* {staged_markers}/"))?;
        exec.run_checked(&format!("touch {staged_markers}/{PATCH_BOOT_SYSTEM_STATE}"))?;
        Ok(())
    }
}

impl EncryptionState for PatchBootSystemState<'_> {
    fn name(&self) -> &'static str {
        PATCH_BOOT_SYSTEM_STATE
    }

    fn should_enter(&self) -> OsEncryptResult<bool> {
        if !self.lifecycle.should_enter() {
            return Ok(false);
        }
        let mapper = self.ctx.config.mapper_device();
        if !mapper.exists() {
            info!("{} does not exist yet", mapper.display());
            return Ok(false);
        }
        Ok(true)
    }

    fn enter(&mut self) -> OsEncryptResult<()> {
        if !self.should_enter()? {
            info!("{PATCH_BOOT_SYSTEM_STATE} has nothing to do");
            return Ok(());
        }
        info!("entering {PATCH_BOOT_SYSTEM_STATE}");

        self.stage_encrypted_root()?;

        let session = PivotSession::begin(self.ctx.config, self.ctx.executor)?;
        if let Err(err) = self.patch_pivoted_root() {
            warn!("boot patch failed on the encrypted root: {err}");
            if let Err(rollback_err) = session.rollback() {
                warn!("rollback failed: {rollback_err}");
            }
            return Err(err);
        }
        session.commit()?;

        let exec = self.ctx.executor;
        self.preserve_artifacts()?;
        exec.run("umount /boot")?;
        exec.run(&format!("umount {}", self.ctx.config.staged("/")))?;
        exec.run(&format!("systemctl restart {}", self.ctx.config.agent.service))?;
        info!("Pivoted back into memroot successfully");

        self.reclaimer().unmount_hierarchy()
    }

    fn should_exit(&self) -> OsEncryptResult<bool> {
        self.lifecycle.should_exit()
    }
}
