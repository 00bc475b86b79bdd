//! In-process fakes shared by the unit tests.

use crate::config::{BekCfg, OsEncryptConfig};
use crate::error::{OsEncryptError, OsEncryptResult};
use crate::exec::{CommandExecutor, CommandOutput, Shell};
use crate::provider::{BekLocator, CryptItem, CryptItemStore};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Records every command and simulates `mountpoint`/`umount` against an
/// in-memory mount table. Scripted responses win over the simulation.
#[derive(Default)]
pub(crate) struct FakeExecutor {
    log: RefCell<Vec<String>>,
    mounted: RefCell<HashSet<String>>,
    scripted: RefCell<HashMap<String, VecDeque<CommandOutput>>>,
    failing_prefixes: RefCell<Vec<String>>,
}

impl FakeExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_mounted(mounts: &[&str]) -> Self {
        let fake = Self::new();
        fake.mounted
            .borrow_mut()
            .extend(mounts.iter().map(|m| m.to_string()));
        fake
    }

    /// Queue responses for an exact command line; the last one repeats.
    pub(crate) fn respond(&self, command: &str, outputs: Vec<CommandOutput>) {
        self.scripted
            .borrow_mut()
            .insert(command.to_string(), outputs.into());
    }

    pub(crate) fn respond_stdout(&self, command: &str, stdout: &str) {
        self.respond(command, vec![ok(stdout)]);
    }

    /// Every command starting with `prefix` exits 1.
    pub(crate) fn fail_on(&self, prefix: &str) {
        self.failing_prefixes.borrow_mut().push(prefix.to_string());
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    pub(crate) fn position(&self, command: &str) -> Option<usize> {
        self.log.borrow().iter().position(|c| c == command)
    }

    pub(crate) fn ran(&self, command: &str) -> bool {
        self.position(command).is_some()
    }

    pub(crate) fn ran_prefix(&self, prefix: &str) -> bool {
        self.log.borrow().iter().any(|c| c.starts_with(prefix))
    }

    fn simulate(&self, command: &str) -> CommandOutput {
        if let Some(target) = command.strip_prefix("mountpoint ") {
            return if self.mounted.borrow().contains(target) {
                ok("")
            } else {
                status(1)
            };
        }
        if let Some(target) = command.strip_prefix("umount ") {
            self.mounted.borrow_mut().remove(target);
            return ok("");
        }
        ok("")
    }
}

impl CommandExecutor for FakeExecutor {
    fn invoke(&self, command: &str, _shell: Shell) -> OsEncryptResult<CommandOutput> {
        self.log.borrow_mut().push(command.to_string());

        if self
            .failing_prefixes
            .borrow()
            .iter()
            .any(|prefix| command.starts_with(prefix.as_str()))
        {
            return Ok(CommandOutput {
                status: 1,
                stdout: String::new(),
                stderr: "injected failure".to_string(),
            });
        }

        let mut scripted = self.scripted.borrow_mut();
        if let Some(queue) = scripted.get_mut(command) {
            let next = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            if let Some(output) = next {
                return Ok(output);
            }
        }
        drop(scripted);
        Ok(self.simulate(command))
    }
}

pub(crate) fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        status: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub(crate) fn status(code: i32) -> CommandOutput {
    CommandOutput {
        status: code,
        stdout: String::new(),
        stderr: String::new(),
    }
}

#[derive(Default)]
pub(crate) struct MemoryCryptStore {
    items: RefCell<Vec<CryptItem>>,
}

impl MemoryCryptStore {
    pub(crate) fn items(&self) -> Vec<CryptItem> {
        self.items.borrow().clone()
    }
}

impl CryptItemStore for MemoryCryptStore {
    fn add_crypt_item(&self, item: &CryptItem) -> OsEncryptResult<()> {
        let mut items = self.items.borrow_mut();
        if items.iter().any(|i| i.mapper_name == item.mapper_name) {
            return Err(OsEncryptError::DuplicateMapper(item.mapper_name.clone()));
        }
        items.push(item.clone());
        Ok(())
    }

    fn crypt_items(&self) -> OsEncryptResult<Vec<CryptItem>> {
        Ok(self.items.borrow().clone())
    }
}

pub(crate) struct StaticBek(pub(crate) PathBuf);

impl BekLocator for StaticBek {
    fn passphrase_file(&self, _config: &BekCfg) -> OsEncryptResult<PathBuf> {
        Ok(self.0.clone())
    }
}

/// Config whose host paths (sysroot, markers, mapper node, scripts) live in a
/// scratch directory. Command strings still use the production layout.
pub(crate) fn sandbox_config() -> (OsEncryptConfig, TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    let mut cfg = OsEncryptConfig::for_device("/dev/sda2");

    let sysroot = root.join("sysroot");
    fs::create_dir_all(&sysroot).expect("sysroot");
    cfg.boot.sysroot = sysroot.to_string_lossy().into_owned();

    let markers = root.join("markers");
    fs::create_dir_all(&markers).expect("markers");
    cfg.paths.markers_dir = markers.to_string_lossy().into_owned();

    let mapper_dir = root.join("mapper");
    fs::create_dir_all(&mapper_dir).expect("mapper dir");
    cfg.paths.device_mapper_dir = mapper_dir.to_string_lossy().into_owned();

    cfg.paths.daemon_lock_file = root.join("daemon.lck").to_string_lossy().into_owned();
    cfg.reclaim.delete_lock_script = root.join("delete-lock.sh").to_string_lossy().into_owned();
    cfg.reclaim.restart_agent_script = root.join("restart-agent.sh").to_string_lossy().into_owned();
    cfg.reclaim.settle_secs = 0;
    (cfg, tmp)
}
