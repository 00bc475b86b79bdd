//! Boot configuration for the encrypted root: dracut modules and config,
//! kernel parameters, and the crypt item the initramfs unlocks.

use super::kernel::KernelCmdline;
use crate::context::EncryptionContext;
use crate::error::{OsEncryptError, OsEncryptResult};
use crate::parse::{first_value, kernel_version, parse_partition_attr};
use crate::provider::CryptItem;
use log::info;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

const PARTITION_PLACEHOLDER: &str = "ENCRYPTED_DISK_PARTITION";

/// How the initramfs finds the encrypted root at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchStrategy {
    /// Root partition UUID is known: kernel parameters plus a crypt item.
    PartUuid(String),
    /// No UUID: a udev rule keyed on the partition number.
    AttributeProbe,
}

impl PatchStrategy {
    pub fn for_partuuid(root_partuuid: Option<&str>) -> Self {
        match root_partuuid.map(str::trim) {
            Some(uuid) if !uuid.is_empty() => PatchStrategy::PartUuid(uuid.to_string()),
            _ => PatchStrategy::AttributeProbe,
        }
    }
}

/// Makes the currently mounted root able to decrypt itself at next boot.
/// Configuration files are only ever appended to.
pub struct BootConfigPatcher<'a> {
    ctx: EncryptionContext<'a>,
    strategy: PatchStrategy,
}

impl<'a> BootConfigPatcher<'a> {
    pub fn new(ctx: EncryptionContext<'a>, root_partuuid: Option<&str>) -> Self {
        Self {
            ctx,
            strategy: PatchStrategy::for_partuuid(root_partuuid),
        }
    }

    pub fn strategy(&self) -> &PatchStrategy {
        &self.strategy
    }

    pub fn patch(&self) -> OsEncryptResult<()> {
        match &self.strategy {
            PatchStrategy::PartUuid(root_partuuid) => {
                let boot_uuid = self.boot_uuid()?;
                self.patch_with_partuuid(root_partuuid, &boot_uuid)
            }
            PatchStrategy::AttributeProbe => self.patch_with_attribute_probe(),
        }
    }

    fn patch_with_partuuid(&self, root_partuuid: &str, boot_uuid: &str) -> OsEncryptResult<()> {
        let boot = &self.ctx.config.boot;
        let paths = &self.ctx.config.paths;
        self.install_module(&boot.online_module)?;

        let ade_conf = &boot.ade_dracut_conf;
        self.append_config(ade_conf, r#"add_drivers+=" dm_crypt ""#)?;
        self.append_config(
            ade_conf,
            &format!(
                r#"add_fstab+=" {}/{}/ade_fstab_line ""#,
                boot.dracut_modules_dir, boot.online_module
            ),
        )?;

        let params = vec![
            format!("rd.luks.ade.partuuid={root_partuuid}"),
            format!("rd.luks.ade.bootuuid={boot_uuid}"),
            "rd.debug".to_string(),
        ];
        KernelCmdline::new(self.ctx.config, self.ctx.executor).add_kernel_opts(&params)?;

        let item = CryptItem {
            dev_path: format!("/dev/disk/by-partuuid/{root_partuuid}"),
            mapper_name: paths.mapper_name.clone(),
            luks_header_path: Some(paths.luks_header.clone()),
        };
        self.register_crypt_item(&item)?;

        self.append_config(ade_conf, r#"add_dracutmodules+=" crypt lvm""#)?;
        self.rebuild_initramfs()
    }

    fn patch_with_attribute_probe(&self) -> OsEncryptResult<()> {
        let boot = &self.ctx.config.boot;
        let exec = self.ctx.executor;
        self.install_module(&boot.legacy_module)?;

        let walk = exec.run_checked(&format!(
            "udevadm info --attribute-walk --name={}",
            self.ctx.rootfs_block_device()
        ))?;
        let partition = parse_partition_attr(&walk.stdout).ok_or_else(|| {
            OsEncryptError::parse(
                "ATTR{partition}",
                format!("not reported by udevadm for {}", self.ctx.rootfs_block_device()),
            )
        })?;
        info!("root filesystem is partition {partition}");

        let rule = format!(
            "{}/{}/{}",
            boot.dracut_modules_dir, boot.legacy_module, boot.legacy_udev_rule
        );
        exec.run_checked(&format!(
            "sed -i.bak s/{PARTITION_PLACEHOLDER}/{partition}/ {rule}"
        ))?;

        let dracut_conf = &boot.dracut_conf;
        self.append_config(dracut_conf, r#"add_drivers+=" fuse vfat nls_cp437 nls_iso8859-1""#)?;
        self.append_config(dracut_conf, r#"add_dracutmodules+=" crypt""#)?;

        self.rebuild_initramfs()?;
        KernelCmdline::new(self.ctx.config, self.ctx.executor)
            .add_kernel_opts(&["rd.debug".to_string()])?;
        Ok(())
    }

    /// Add `item` unless an identical record is already there, as after a
    /// rolled-back earlier attempt. A different record under the same
    /// mapper name is still rejected by the store.
    fn register_crypt_item(&self, item: &CryptItem) -> OsEncryptResult<()> {
        let store = self.ctx.crypt_items;
        if store.crypt_items()?.iter().any(|existing| existing == item) {
            info!("crypt item {item} already registered");
            return Ok(());
        }
        store.add_crypt_item(item)?;
        info!("registered crypt item {item}");
        Ok(())
    }

    /// UUID of the filesystem mounted at `/boot`.
    pub fn boot_uuid(&self) -> OsEncryptResult<String> {
        let out = self.ctx.executor.run_checked("findmnt -n -o UUID /boot")?;
        first_value(&out.stdout)
            .ok_or_else(|| OsEncryptError::parse("boot UUID", "findmnt printed nothing for /boot"))
    }

    fn install_module(&self, module: &str) -> OsEncryptResult<()> {
        let boot = &self.ctx.config.boot;
        let source = Path::new(&boot.module_source_dir).join(module);
        self.ctx.executor.run_checked(&format!(
            "cp -r {} {}/",
            source.display(),
            boot.dracut_modules_dir
        ))?;
        Ok(())
    }

    /// Rebuild the initramfs of the default boot kernel.
    fn rebuild_initramfs(&self) -> OsEncryptResult<()> {
        let exec = self.ctx.executor;
        let out = exec.run_checked("grubby --default-kernel")?;
        let kver = kernel_version(&out.stdout).ok_or_else(|| {
            OsEncryptError::parse("default kernel", "grubby --default-kernel printed nothing")
        })?;
        exec.run_checked(&format!(
            "{} -f -v --kver {kver}",
            self.ctx.config.boot.dracut_binary
        ))?;
        Ok(())
    }

    fn append_config(&self, file: &str, line: &str) -> OsEncryptResult<()> {
        let path = self.ctx.config.sysroot_path(file);
        if append_line_once(&path, line)? {
            info!("appended `{line}` to {file}");
        }
        Ok(())
    }
}

/// Append `line` to `path` unless an identical line is already there.
/// Returns whether the file changed.
pub(crate) fn append_line_once(path: &Path, line: &str) -> OsEncryptResult<bool> {
    let existing = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err.into()),
    };
    if existing.lines().any(|l| l.trim() == line.trim()) {
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    writeln!(file, "{line}")?;
    Ok(true)
}
