use crate::config::BekCfg;
use crate::error::OsEncryptResult;
use std::fmt;
use std::path::PathBuf;

/// One encrypted volume managed by osencrypt.
///
/// Records are appended once when a volume comes under management and never
/// edited afterwards; the mapper name is unique within the persisted set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptItem {
    pub dev_path: String,
    pub mapper_name: String,
    pub luks_header_path: Option<String>,
}

impl fmt::Display for CryptItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> /dev/mapper/{}", self.dev_path, self.mapper_name)?;
        if let Some(header) = &self.luks_header_path {
            write!(f, " (header {header})")?;
        }
        Ok(())
    }
}

/// Persistent store of crypt items. The storage format belongs to the
/// implementation.
pub trait CryptItemStore {
    /// Append `item`. Implementations reject a mapper name that is already
    /// registered.
    fn add_crypt_item(&self, item: &CryptItem) -> OsEncryptResult<()>;

    /// Every registered item, in insertion order.
    fn crypt_items(&self) -> OsEncryptResult<Vec<CryptItem>>;
}

/// Locates the boot encryption key (BEK) passphrase file.
pub trait BekLocator {
    fn passphrase_file(&self, config: &BekCfg) -> OsEncryptResult<PathBuf>;
}
