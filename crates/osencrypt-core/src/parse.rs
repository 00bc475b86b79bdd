//! Helpers for turning command output into values the workflows can act on.

use regex::Regex;
use std::sync::OnceLock;

/// PIDs listed by `fuser -vm`, highest first, without duplicates.
///
/// `fuser` prints the bare PIDs on stdout and the verbose table on stderr, so
/// every all-digit token on stdout is a candidate.
pub(crate) fn parse_fuser_pids(stdout: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = stdout
        .split(|c: char| c.is_whitespace() || c == ':')
        .filter(|token| !token.is_empty() && token.chars().all(|c| c.is_ascii_digit()))
        .filter_map(|token| token.parse().ok())
        .collect();
    pids.sort_unstable_by(|a, b| b.cmp(a));
    pids.dedup();
    pids
}

/// First `ATTR{partition}=="N"` value in `udevadm info --attribute-walk` output.
pub(crate) fn parse_partition_attr(walk: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r#"ATTR\{partition\}=="(.*)""#).expect("static regex compiles")
    });
    pattern
        .captures(walk)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Kernel version from `grubby --default-kernel` output.
pub(crate) fn kernel_version(default_kernel: &str) -> Option<String> {
    let line = default_kernel.lines().map(str::trim).find(|l| !l.is_empty())?;
    let version = line.replace("/boot/vmlinuz-", "");
    let version = version.trim();
    if version.is_empty() {
        None
    } else {
        Some(version.to_string())
    }
}

/// First non-empty line of a probe command, trimmed.
pub(crate) fn first_value(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fuser_pids_sorted_descending() {
        let out = " 50  3000 1  50\n";
        assert_eq!(parse_fuser_pids(out), vec![3000, 50, 1]);
    }

    #[test]
    fn fuser_pids_ignore_access_flags() {
        let out = "/var:                 812c  1204m kernel";
        assert_eq!(parse_fuser_pids(out), Vec::<u32>::new());
        assert_eq!(parse_fuser_pids("/var: 812 1204"), vec![1204, 812]);
    }

    #[test]
    fn partition_attr_found_in_walk() {
        let walk = r#"
  looking at device '/devices/pci0000:00/host0/block/sda/sda2':
    KERNEL=="sda2"
    SUBSYSTEM=="block"
    ATTR{partition}=="2"
    ATTR{size}=="62912512"
"#;
        assert_eq!(parse_partition_attr(walk), Some("2".to_string()));
    }

    #[test]
    fn partition_attr_missing() {
        assert_eq!(parse_partition_attr("KERNEL==\"sda\"\n"), None);
    }

    #[test]
    fn kernel_version_strips_prefix() {
        assert_eq!(
            kernel_version("/boot/vmlinuz-3.10.0-1160.el7.x86_64\n"),
            Some("3.10.0-1160.el7.x86_64".to_string())
        );
        assert_eq!(kernel_version("\n"), None);
    }
}
