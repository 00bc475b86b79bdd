//! Line-oriented crypt item store, one volume per line:
//!
//! ```text
//! # mapper_name dev_path [luks_header_path]
//! osencrypt /dev/disk/by-partuuid/abc-123 /boot/luks/osluksheader
//! ```

use log::info;
use osencrypt_core::config::OsEncryptConfig;
use osencrypt_core::error::{OsEncryptError, OsEncryptResult};
use osencrypt_core::provider::{CryptItem, CryptItemStore};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct CryptMountFile {
    path: PathBuf,
}

impl CryptMountFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_config(config: &OsEncryptConfig) -> Self {
        Self::new(&config.paths.crypt_mount_config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> OsEncryptResult<String> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err.into()),
        }
    }
}

impl CryptItemStore for CryptMountFile {
    fn add_crypt_item(&self, item: &CryptItem) -> OsEncryptResult<()> {
        if item.mapper_name.split_whitespace().count() != 1
            || item.dev_path.split_whitespace().count() != 1
        {
            return Err(OsEncryptError::InvalidConfig(format!(
                "crypt item fields must be single words: {item}"
            )));
        }

        let existing = self.read()?;
        if parse_items(&self.path, &existing)?
            .iter()
            .any(|i| i.mapper_name == item.mapper_name)
        {
            return Err(OsEncryptError::DuplicateMapper(item.mapper_name.clone()));
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        writeln!(file, "{}", format_item(item))?;
        info!("added crypt item {item} to {}", self.path.display());
        Ok(())
    }

    fn crypt_items(&self) -> OsEncryptResult<Vec<CryptItem>> {
        let contents = self.read()?;
        parse_items(&self.path, &contents)
    }
}

fn format_item(item: &CryptItem) -> String {
    match &item.luks_header_path {
        Some(header) => format!("{} {} {header}", item.mapper_name, item.dev_path),
        None => format!("{} {}", item.mapper_name, item.dev_path),
    }
}

fn parse_items(origin: &Path, contents: &str) -> OsEncryptResult<Vec<CryptItem>> {
    let mut items = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let item = match fields.as_slice() {
            [mapper, dev] => CryptItem {
                mapper_name: mapper.to_string(),
                dev_path: dev.to_string(),
                luks_header_path: None,
            },
            [mapper, dev, header] => CryptItem {
                mapper_name: mapper.to_string(),
                dev_path: dev.to_string(),
                luks_header_path: Some(header.to_string()),
            },
            _ => {
                return Err(OsEncryptError::parse(
                    format!("{} line {}", origin.display(), idx + 1),
                    format!("expected `mapper_name dev_path [luks_header_path]`, got `{line}`"),
                ))
            }
        };
        items.push(item);
    }
    Ok(items)
}
