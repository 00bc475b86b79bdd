//! Dependency bag shared by every encryption state.

use crate::config::OsEncryptConfig;
use crate::exec::CommandExecutor;
use crate::provider::{BekLocator, CryptItemStore};

/// Everything a state needs to act on the host. Built once per run and
/// handed out by reference; nothing in it is mutated by the states.
#[derive(Clone, Copy)]
pub struct EncryptionContext<'a> {
    pub config: &'a OsEncryptConfig,
    pub executor: &'a dyn CommandExecutor,
    pub bek: &'a dyn BekLocator,
    pub crypt_items: &'a dyn CryptItemStore,
}

impl<'a> EncryptionContext<'a> {
    pub fn new(
        config: &'a OsEncryptConfig,
        executor: &'a dyn CommandExecutor,
        bek: &'a dyn BekLocator,
        crypt_items: &'a dyn CryptItemStore,
    ) -> Self {
        Self {
            config,
            executor,
            bek,
            crypt_items,
        }
    }

    pub fn rootfs_block_device(&self) -> &'a str {
        self.config.rootfs_block_device()
    }
}
