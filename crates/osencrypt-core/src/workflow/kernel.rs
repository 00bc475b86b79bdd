//! Append-only edits to the kernel command line kept in the grub defaults
//! file.

use crate::config::OsEncryptConfig;
use crate::error::{OsEncryptError, OsEncryptResult};
use crate::exec::CommandExecutor;
use log::info;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;

const CMDLINE_KEY: &str = "GRUB_CMDLINE_LINUX";

pub struct KernelCmdline<'a> {
    config: &'a OsEncryptConfig,
    executor: &'a dyn CommandExecutor,
}

impl<'a> KernelCmdline<'a> {
    pub fn new(config: &'a OsEncryptConfig, executor: &'a dyn CommandExecutor) -> Self {
        Self { config, executor }
    }

    /// Parameters currently configured in the grub defaults file.
    pub fn current(&self) -> OsEncryptResult<Vec<String>> {
        let contents = self.read_defaults()?;
        Ok(find_cmdline(&contents)?
            .map(|(_, line)| line.params())
            .unwrap_or_default())
    }

    /// Add every parameter of `params` that is not configured yet and
    /// regenerate the grub configs when anything changed. Returns what was
    /// added.
    pub fn add_kernel_opts(&self, params: &[String]) -> OsEncryptResult<Vec<String>> {
        let path = self.config.sysroot_path(&self.config.boot.grub_defaults);
        let contents = self.read_defaults()?;
        let (updated, added) = merge_cmdline(&contents, params)?;

        if added.is_empty() {
            info!("kernel parameters already present: {}", params.join(" "));
            return Ok(added);
        }

        replace_file(&path, &updated)?;
        info!("added kernel parameters: {}", added.join(" "));

        for cfg in &self.config.boot.grub_configs {
            if self.config.sysroot_path(cfg).exists() {
                self.executor
                    .run_checked(&format!("grub2-mkconfig -o {cfg}"))?;
            }
        }
        Ok(added)
    }

    fn read_defaults(&self) -> OsEncryptResult<String> {
        let path = self.config.sysroot_path(&self.config.boot.grub_defaults);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(contents),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err.into()),
        }
    }
}

/// A `GRUB_CMDLINE_LINUX=` assignment split around its value. Whatever
/// follows the closing quote, such as a comment, is kept as `trailing`.
#[derive(Debug, PartialEq, Eq)]
struct CmdlineLine<'a> {
    indent: &'a str,
    quote: Option<char>,
    value: &'a str,
    trailing: &'a str,
}

impl CmdlineLine<'_> {
    fn parse(line: &str) -> OsEncryptResult<Option<CmdlineLine<'_>>> {
        let body = line.trim_start();
        let indent = &line[..line.len() - body.len()];
        let Some(rest) = body
            .strip_prefix(CMDLINE_KEY)
            .and_then(|r| r.strip_prefix('='))
        else {
            return Ok(None);
        };

        let parsed = match rest.chars().next() {
            Some(quote @ ('"' | '\'')) => {
                let inner = &rest[1..];
                let end = inner.find(quote).ok_or_else(|| {
                    OsEncryptError::parse(
                        CMDLINE_KEY,
                        format!("unterminated {quote} in `{line}`"),
                    )
                })?;
                CmdlineLine {
                    indent,
                    quote: Some(quote),
                    value: &inner[..end],
                    trailing: &inner[end + 1..],
                }
            }
            _ => {
                let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                CmdlineLine {
                    indent,
                    quote: None,
                    value: &rest[..end],
                    trailing: &rest[end..],
                }
            }
        };
        Ok(Some(parsed))
    }

    fn params(&self) -> Vec<String> {
        self.value.split_whitespace().map(str::to_string).collect()
    }

    fn render(&self, merged: &str) -> String {
        let quote = self.quote.unwrap_or('"');
        format!(
            "{}{CMDLINE_KEY}={quote}{merged}{quote}{}",
            self.indent, self.trailing
        )
    }
}

/// The assignment that takes effect: the last one in the file.
fn find_cmdline(contents: &str) -> OsEncryptResult<Option<(usize, CmdlineLine<'_>)>> {
    let mut found = None;
    for (idx, line) in contents.lines().enumerate() {
        if let Some(parsed) = CmdlineLine::parse(line)? {
            found = Some((idx, parsed));
        }
    }
    Ok(found)
}

/// Rewrite the `GRUB_CMDLINE_LINUX` line of `contents` with the missing
/// `params` appended. Every other line is kept byte for byte.
pub(crate) fn merge_cmdline(
    contents: &str,
    params: &[String],
) -> OsEncryptResult<(String, Vec<String>)> {
    let target = find_cmdline(contents)?;
    let existing = target
        .as_ref()
        .map(|(_, line)| line.params())
        .unwrap_or_default();

    let mut added: Vec<String> = Vec::new();
    for param in params {
        let param = param.trim();
        if param.is_empty() || existing.iter().any(|p| p == param) || added.iter().any(|p| p == param)
        {
            continue;
        }
        added.push(param.to_string());
    }
    if added.is_empty() {
        return Ok((contents.to_string(), added));
    }

    let merged = existing
        .iter()
        .chain(added.iter())
        .cloned()
        .collect::<Vec<_>>()
        .join(" ");

    let mut lines: Vec<String> = contents.lines().map(str::to_string).collect();
    match &target {
        Some((idx, line)) => lines[*idx] = line.render(&merged),
        None => lines.push(format!("{CMDLINE_KEY}=\"{merged}\"")),
    }

    let mut updated = lines.join("\n");
    updated.push('\n');
    Ok((updated, added))
}

/// Replace `path` through a temporary file in the same directory so a crash
/// leaves either the old or the new contents. The old mode is kept.
fn replace_file(path: &Path, contents: &str) -> OsEncryptResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let permissions = fs::metadata(path).ok().map(|meta| meta.permissions());

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(contents.as_bytes())?;
    temp.as_file_mut().flush()?;
    if let Some(permissions) = permissions {
        fs::set_permissions(temp.path(), permissions)?;
    }
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| OsEncryptError::Io(err.error))?;
    Ok(())
}
