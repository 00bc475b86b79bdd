use crate::error::{OsEncryptError, OsEncryptResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the binaries look for their config unless told otherwise.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/osencrypt.toml";

/// Block device that currently backs the root filesystem.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeviceCfg {
    pub rootfs_block_device: String,
}

/// One logical volume of the root volume group and where it lands under the
/// staging root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LogicalVolume {
    pub name: String,
    pub target: String,
}

impl LogicalVolume {
    fn new(name: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct VolumeCfg {
    pub volume_group: String,
    pub snapshot_file: String,
    /// Mounted in order, so parents must come before children.
    pub logical_volumes: Vec<LogicalVolume>,
}

impl Default for VolumeCfg {
    fn default() -> Self {
        Self {
            volume_group: "rootvg".to_string(),
            snapshot_file: "/volumes.lvm".to_string(),
            logical_volumes: vec![
                LogicalVolume::new("rootlv", "/"),
                LogicalVolume::new("varlv", "/var"),
                LogicalVolume::new("usrlv", "/usr"),
                LogicalVolume::new("tmplv", "/tmp"),
                LogicalVolume::new("homelv", "/home"),
                LogicalVolume::new("optlv", "/opt"),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PathsCfg {
    pub mapper_name: String,
    pub device_mapper_dir: String,
    pub boot_luks_dir: String,
    pub luks_header: String,
    pub staging_root: String,
    pub memroot_name: String,
    pub markers_dir: String,
    pub daemon_lock_file: String,
    pub crypt_mount_config: String,
}

impl Default for PathsCfg {
    fn default() -> Self {
        Self {
            mapper_name: "osencrypt".to_string(),
            device_mapper_dir: "/dev/mapper".to_string(),
            boot_luks_dir: "/boot/luks".to_string(),
            luks_header: "/boot/luks/osluksheader".to_string(),
            staging_root: "/oldroot".to_string(),
            memroot_name: "memroot".to_string(),
            markers_dir: "/var/lib/azure_disk_encryption_config/os_encryption_markers".to_string(),
            daemon_lock_file: "/var/lib/azure_disk_encryption_config/daemon_lock_file.lck"
                .to_string(),
            crypt_mount_config: "/var/lib/azure_disk_encryption_config/azure_crypt_mount"
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ReclaimCfg {
    pub settle_secs: u64,

    /// Upper bound for the `/var` unmount loop. Unset means retry forever.
    pub var_unmount_timeout_secs: Option<u64>,

    pub services: Vec<String>,
    pub hierarchy: Vec<String>,
    pub delete_lock_script: String,
    pub restart_agent_script: String,
    pub lock_removal_delay_mins: u32,
    pub agent_restart_delay_mins: u32,
}

impl Default for ReclaimCfg {
    fn default() -> Self {
        Self {
            settle_secs: 3,
            var_unmount_timeout_secs: None,
            services: [
                "NetworkManager",
                "rsyslog",
                "systemd-udevd",
                "systemd-journald",
                "systemd-hostnamed",
                "atd",
                "postfix",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            hierarchy: ["/var", "/opt", "/tmp", "/home", "/usr"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            delete_lock_script: "/delete-lock.sh".to_string(),
            restart_agent_script: "/restart-wala.sh".to_string(),
            lock_removal_delay_mins: 1,
            agent_restart_delay_mins: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BootCfg {
    /// Prefix applied to every configuration file the patcher edits directly.
    pub sysroot: String,
    pub module_source_dir: String,
    pub dracut_modules_dir: String,
    pub online_module: String,
    pub legacy_module: String,
    pub legacy_udev_rule: String,
    pub dracut_conf: String,
    pub ade_dracut_conf: String,
    pub dracut_binary: String,
    pub grub_defaults: String,
    pub grub_configs: Vec<String>,
}

impl Default for BootCfg {
    fn default() -> Self {
        Self {
            sysroot: "/".to_string(),
            module_source_dir: "/usr/share/osencrypt/dracut".to_string(),
            dracut_modules_dir: "/lib/dracut/modules.d".to_string(),
            online_module: "91adeOnline".to_string(),
            legacy_module: "91ade".to_string(),
            legacy_udev_rule: "50-udev-ade.rules".to_string(),
            dracut_conf: "/etc/dracut.conf".to_string(),
            ade_dracut_conf: "/etc/dracut.conf.d/ade.conf".to_string(),
            dracut_binary: "/usr/sbin/dracut".to_string(),
            grub_defaults: "/etc/default/grub".to_string(),
            grub_configs: vec![
                "/boot/grub2/grub.cfg".to_string(),
                "/boot/efi/EFI/redhat/grub.cfg".to_string(),
            ],
        }
    }
}

/// Supervising agent and the extension whose artifacts are preserved across
/// the pivot.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AgentCfg {
    pub service: String,
    pub log_file: String,
    pub daemon_pattern: String,
    pub extension_publisher: String,
    pub extension_name: String,
    pub extension_version: String,
    pub test_extension_publisher: String,
    pub test_extension_name: String,
    pub extension_log_dir: String,
    pub agent_lib_dir: String,
}

impl Default for AgentCfg {
    fn default() -> Self {
        Self {
            service: "waagent".to_string(),
            log_file: "/var/log/waagent.log".to_string(),
            daemon_pattern: ".*osencrypt-daemon.*".to_string(),
            extension_publisher: "Microsoft.Azure.Security".to_string(),
            extension_name: "AzureDiskEncryptionForLinux".to_string(),
            extension_version: "1.1.0.0".to_string(),
            test_extension_publisher: "Microsoft.Azure.Security.Edp.".to_string(),
            test_extension_name: "AzureDiskEncryptionForLinuxTest".to_string(),
            extension_log_dir: "/var/log/azure".to_string(),
            agent_lib_dir: "/var/lib/waagent".to_string(),
        }
    }
}

impl AgentCfg {
    pub fn extension_full_name(&self) -> String {
        format!("{}.{}", self.extension_publisher, self.extension_name)
    }

    pub fn extension_versioned_name(&self) -> String {
        format!("{}-{}", self.extension_full_name(), self.extension_version)
    }

    pub fn test_extension_full_name(&self) -> String {
        format!("{}{}", self.test_extension_publisher, self.test_extension_name)
    }

    pub fn test_extension_versioned_name(&self) -> String {
        format!(
            "{}-{}",
            self.test_extension_full_name(),
            self.extension_version
        )
    }
}

/// Where the boot encryption key (BEK) passphrase file may live.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BekCfg {
    pub candidates: Vec<String>,
    pub expected_sha256: Option<String>,
}

impl Default for BekCfg {
    fn default() -> Self {
        Self {
            candidates: vec![
                "/mnt/azure_bek_disk/LinuxPassPhraseFileName".to_string(),
                "/mnt/azure_bek_disk/LinuxPassPhraseFileName_1_0".to_string(),
            ],
            expected_sha256: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecutorCfg {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_shell")]
    pub shell: String,

    #[serde(default = "default_output_log_limit")]
    pub output_log_limit: usize,
}

fn default_timeout_secs() -> u64 {
    1800
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

fn default_output_log_limit() -> usize {
    4096
}

impl ExecutorCfg {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ExecutorCfg {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            shell: default_shell(),
            output_log_limit: default_output_log_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OsEncryptConfig {
    pub device: DeviceCfg,

    #[serde(default)]
    pub volumes: VolumeCfg,

    #[serde(default)]
    pub paths: PathsCfg,

    #[serde(default)]
    pub reclaim: ReclaimCfg,

    #[serde(default)]
    pub boot: BootCfg,

    #[serde(default)]
    pub agent: AgentCfg,

    #[serde(default)]
    pub bek: BekCfg,

    #[serde(default)]
    pub executor: ExecutorCfg,

    #[serde(skip)]
    pub path: PathBuf,
}

impl OsEncryptConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> OsEncryptResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut cfg = if matches!(path.extension().and_then(|ext| ext.to_str()), Some(ext) if ext.eq_ignore_ascii_case("toml"))
        {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build a config with defaults for everything but the root device.
    pub fn for_device(rootfs_block_device: impl Into<String>) -> Self {
        Self {
            device: DeviceCfg {
                rootfs_block_device: rootfs_block_device.into(),
            },
            volumes: VolumeCfg::default(),
            paths: PathsCfg::default(),
            reclaim: ReclaimCfg::default(),
            boot: BootCfg::default(),
            agent: AgentCfg::default(),
            bek: BekCfg::default(),
            executor: ExecutorCfg::default(),
            path: PathBuf::new(),
        }
    }

    pub fn validate(&self) -> OsEncryptResult<()> {
        if self.device.rootfs_block_device.trim().is_empty() {
            return Err(OsEncryptError::InvalidConfig(
                "device.rootfs_block_device must name a block device".to_string(),
            ));
        }
        if self.paths.mapper_name.trim().is_empty() {
            return Err(OsEncryptError::InvalidConfig(
                "paths.mapper_name must not be empty".to_string(),
            ));
        }
        if !self.paths.staging_root.starts_with('/') || self.paths.staging_root == "/" {
            return Err(OsEncryptError::InvalidConfig(format!(
                "paths.staging_root must be an absolute, non-root directory (got {})",
                self.paths.staging_root
            )));
        }
        if self.volumes.logical_volumes.first().map(|lv| lv.target.as_str()) != Some("/") {
            return Err(OsEncryptError::InvalidConfig(
                "volumes.logical_volumes must start with the volume mounted at /".to_string(),
            ));
        }
        Ok(())
    }

    pub fn rootfs_block_device(&self) -> &str {
        &self.device.rootfs_block_device
    }

    pub fn mapper_device(&self) -> PathBuf {
        Path::new(&self.paths.device_mapper_dir).join(&self.paths.mapper_name)
    }

    pub fn markers_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.markers_dir)
    }

    pub fn state_marker(&self, state: &str) -> PathBuf {
        self.markers_dir().join(state)
    }

    /// `path` as seen from the staging root, e.g. `/var` -> `/oldroot/var`.
    pub fn staged(&self, path: &str) -> String {
        let staging = self.paths.staging_root.trim_end_matches('/');
        match path.trim_start_matches('/') {
            "" => staging.to_string(),
            rest => format!("{staging}/{rest}"),
        }
    }

    /// Directory under the staging root that receives the in-memory root.
    pub fn memroot(&self) -> String {
        format!("/{}", self.paths.memroot_name.trim_matches('/'))
    }

    /// Resolve an absolute configuration path under the boot sysroot.
    pub fn sysroot_path(&self, path: &str) -> PathBuf {
        Path::new(&self.boot.sysroot).join(path.trim_start_matches('/'))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.reclaim.settle_secs)
    }

    pub fn var_unmount_timeout(&self) -> Option<Duration> {
        self.reclaim.var_unmount_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_toml_applies_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("osencrypt.toml");
        fs::write(
            &path,
            r#"
[device]
rootfs_block_device = "/dev/sda2"

[reclaim]
var_unmount_timeout_secs = 600
"#,
        )
        .unwrap();

        let cfg = OsEncryptConfig::load(&path).unwrap();
        assert_eq!(cfg.rootfs_block_device(), "/dev/sda2");
        assert_eq!(cfg.mapper_device(), PathBuf::from("/dev/mapper/osencrypt"));
        assert_eq!(cfg.reclaim.settle_secs, 3);
        assert_eq!(cfg.var_unmount_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(cfg.volumes.logical_volumes.len(), 6);
        assert_eq!(cfg.path, path);
    }

    #[test]
    fn load_yaml_by_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("osencrypt.yaml");
        fs::write(
            &path,
            "device:\n  rootfs_block_device: /dev/sdb1\nagent:\n  service: walinuxagent\n",
        )
        .unwrap();

        let cfg = OsEncryptConfig::load(&path).unwrap();
        assert_eq!(cfg.rootfs_block_device(), "/dev/sdb1");
        assert_eq!(cfg.agent.service, "walinuxagent");
        assert_eq!(cfg.agent.log_file, "/var/log/waagent.log");
    }

    #[test]
    fn load_rejects_blank_root_device() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("osencrypt.toml");
        fs::write(&path, "[device]\nrootfs_block_device = \" \"\n").unwrap();

        let err = OsEncryptConfig::load(&path).unwrap_err();
        assert!(matches!(err, OsEncryptError::InvalidConfig(_)));
    }

    #[test]
    fn staged_paths_hang_off_staging_root() {
        let cfg = OsEncryptConfig::for_device("/dev/sda2");
        assert_eq!(cfg.staged("/"), "/oldroot");
        assert_eq!(cfg.staged("/var"), "/oldroot/var");
        assert_eq!(cfg.memroot(), "/memroot");
        assert_eq!(
            cfg.sysroot_path("/etc/dracut.conf"),
            PathBuf::from("/etc/dracut.conf")
        );
    }

    #[test]
    fn extension_names_follow_agent_layout() {
        let agent = AgentCfg::default();
        assert_eq!(
            agent.extension_versioned_name(),
            "Microsoft.Azure.Security.AzureDiskEncryptionForLinux-1.1.0.0"
        );
        assert_eq!(
            agent.test_extension_full_name(),
            "Microsoft.Azure.Security.Edp.AzureDiskEncryptionForLinuxTest"
        );
    }
}
