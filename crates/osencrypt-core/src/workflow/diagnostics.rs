//! Read-only view of how far the OS volume transition has progressed.

use super::kernel::KernelCmdline;
use super::{event, WorkflowEvent, WorkflowLevel, WorkflowReport};
use crate::context::EncryptionContext;
use crate::error::OsEncryptResult;
use std::fs;
use std::io::ErrorKind;

const KERNEL_PARAM_PREFIXES: &[&str] = &["rd.luks.ade.partuuid=", "rd.luks.ade.bootuuid=", "rd.debug"];

/// Inspect the host without changing it. Never runs a command.
pub fn inspect(ctx: &EncryptionContext<'_>) -> OsEncryptResult<WorkflowReport> {
    let cfg = ctx.config;
    let mut events = Vec::new();

    let mapper = cfg.mapper_device();
    events.push(if mapper.exists() {
        event(WorkflowLevel::Success, format!("{} present", mapper.display()))
    } else {
        event(WorkflowLevel::Info, format!("{} not present yet", mapper.display()))
    });

    let boot_marker = cfg.sysroot_path(&cfg.paths.boot_luks_dir);
    events.push(if boot_marker.exists() {
        event(WorkflowLevel::Success, format!("{} present", cfg.paths.boot_luks_dir))
    } else {
        event(WorkflowLevel::Warn, format!("{} missing", cfg.paths.boot_luks_dir))
    });

    events.extend(state_marker_events(ctx)?);

    let items = ctx.crypt_items.crypt_items()?;
    if items.is_empty() {
        events.push(event(WorkflowLevel::Info, "No crypt items registered"));
    }
    for item in items {
        events.push(event(WorkflowLevel::Info, format!("Crypt item: {item}")));
    }

    let cmdline = KernelCmdline::new(cfg, ctx.executor).current()?;
    for prefix in KERNEL_PARAM_PREFIXES {
        match cmdline.iter().find(|p| p.starts_with(prefix)) {
            Some(param) => events.push(event(
                WorkflowLevel::Success,
                format!("Kernel parameter {param} configured"),
            )),
            None => events.push(event(
                WorkflowLevel::Info,
                format!("Kernel parameter {} not configured", prefix.trim_end_matches('=')),
            )),
        }
    }

    events.push(match fs::read_to_string(&cfg.paths.daemon_lock_file) {
        Ok(pid) => event(
            WorkflowLevel::Warn,
            format!("Daemon lock held by pid {}", pid.trim()),
        ),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            event(WorkflowLevel::Info, "Daemon lock is free")
        }
        Err(err) => return Err(err.into()),
    });

    Ok(WorkflowReport {
        title: format!("OS encryption status for {}", ctx.rootfs_block_device()),
        events,
    })
}

fn state_marker_events(ctx: &EncryptionContext<'_>) -> OsEncryptResult<Vec<WorkflowEvent>> {
    let dir = ctx.config.markers_dir();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Ok(vec![event(
                WorkflowLevel::Info,
                format!("No state markers under {}", dir.display()),
            )])
        }
        Err(err) => return Err(err.into()),
    };

    let mut names = Vec::new();
    for entry in entries {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();

    if names.is_empty() {
        return Ok(vec![event(WorkflowLevel::Info, "No states completed yet")]);
    }
    Ok(names
        .into_iter()
        .map(|name| event(WorkflowLevel::Success, format!("State {name} completed")))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CryptItem, CryptItemStore};
    use crate::testing::{sandbox_config, FakeExecutor, MemoryCryptStore, StaticBek};
    use std::path::PathBuf;

    fn messages(report: &WorkflowReport) -> Vec<String> {
        report.events.iter().map(|e| e.message.clone()).collect()
    }

    #[test]
    fn fresh_host_reports_nothing_done() {
        let (cfg, _tmp) = sandbox_config();
        let exec = FakeExecutor::new();
        let store = MemoryCryptStore::default();
        let bek = StaticBek(PathBuf::from("/mnt/bek/key"));
        let ctx = EncryptionContext::new(&cfg, &exec, &bek, &store);

        let report = inspect(&ctx).unwrap();
        let msgs = messages(&report);
        assert!(msgs.contains(&"No states completed yet".to_string()));
        assert!(msgs.contains(&"No crypt items registered".to_string()));
        assert!(msgs.contains(&"Daemon lock is free".to_string()));
        assert_eq!(report.worst(), WorkflowLevel::Warn);
        assert!(exec.commands().is_empty());
    }

    #[test]
    fn finished_host_reports_markers_items_and_params() {
        let (cfg, _tmp) = sandbox_config();
        fs::write(cfg.mapper_device(), "").unwrap();
        fs::create_dir_all(cfg.sysroot_path("/boot/luks")).unwrap();
        fs::write(cfg.state_marker("PatchBootSystemState"), "").unwrap();
        fs::write(cfg.state_marker("PrereqState"), "").unwrap();
        let grub = cfg.sysroot_path(&cfg.boot.grub_defaults);
        fs::create_dir_all(grub.parent().unwrap()).unwrap();
        fs::write(
            &grub,
            "GRUB_CMDLINE_LINUX=\"rd.luks.ade.partuuid=abc-123 rd.luks.ade.bootuuid=def-456 rd.debug\"\n",
        )
        .unwrap();
        fs::write(&cfg.paths.daemon_lock_file, "4242\n").unwrap();

        let exec = FakeExecutor::new();
        let store = MemoryCryptStore::default();
        store
            .add_crypt_item(&CryptItem {
                dev_path: "/dev/disk/by-partuuid/abc-123".into(),
                mapper_name: "osencrypt".into(),
                luks_header_path: Some("/boot/luks/osluksheader".into()),
            })
            .unwrap();
        let bek = StaticBek(PathBuf::from("/mnt/bek/key"));
        let ctx = EncryptionContext::new(&cfg, &exec, &bek, &store);

        let msgs = messages(&inspect(&ctx).unwrap());
        assert!(msgs.contains(&"State PatchBootSystemState completed".to_string()));
        assert!(msgs.contains(&"State PrereqState completed".to_string()));
        assert!(msgs.contains(&"Kernel parameter rd.luks.ade.partuuid=abc-123 configured".to_string()));
        assert!(msgs.contains(&"Kernel parameter rd.debug configured".to_string()));
        assert!(msgs.contains(&"Daemon lock held by pid 4242".to_string()));
        assert!(msgs
            .iter()
            .any(|m| m.starts_with("Crypt item: /dev/disk/by-partuuid/abc-123")));
    }
}
