use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result alias for core operations.
pub type OsEncryptResult<T> = Result<T, OsEncryptError>;

#[derive(Error, Debug)]
pub enum OsEncryptError {
    #[error("[OE1000] io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[OE1001] toml config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("[OE1002] yaml config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("[OE1100] configuration error: {0}")]
    InvalidConfig(String),

    #[error("[OE1200] command `{command}` exited with code {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("[OE1201] command `{command}` timed out after {timeout:?}")]
    CommandTimedOut { command: String, timeout: Duration },

    #[error("[OE1300] could not parse {what}: {detail}")]
    ParseFailed { what: String, detail: String },

    #[error("[OE1400] {mountpoint} still busy after {waited:?}")]
    MountBusy { mountpoint: PathBuf, waited: Duration },

    #[error("[OE1500] no usable key file: {0}")]
    MissingKeySource(String),

    #[error("[OE1600] mapper name `{0}` is already registered")]
    DuplicateMapper(String),

    #[error("[OE1700] state {0} did not reach its exit condition")]
    StateIncomplete(String),

    #[error("[OE1800] lock {path} is held by pid {holder}")]
    LockHeld { path: PathBuf, holder: String },

    #[error("[OE2000] provider error: {0}")]
    Provider(String),
}

impl OsEncryptError {
    pub fn code(&self) -> &'static str {
        match self {
            OsEncryptError::Io(_) => "OE1000",
            OsEncryptError::Toml(_) => "OE1001",
            OsEncryptError::Yaml(_) => "OE1002",
            OsEncryptError::InvalidConfig(_) => "OE1100",
            OsEncryptError::CommandFailed { .. } => "OE1200",
            OsEncryptError::CommandTimedOut { .. } => "OE1201",
            OsEncryptError::ParseFailed { .. } => "OE1300",
            OsEncryptError::MountBusy { .. } => "OE1400",
            OsEncryptError::MissingKeySource(_) => "OE1500",
            OsEncryptError::DuplicateMapper(_) => "OE1600",
            OsEncryptError::StateIncomplete(_) => "OE1700",
            OsEncryptError::LockHeld { .. } => "OE1800",
            OsEncryptError::Provider(_) => "OE2000",
        }
    }

    /// Shorthand for the parse failure variant.
    pub fn parse(what: impl Into<String>, detail: impl Into<String>) -> Self {
        OsEncryptError::ParseFailed {
            what: what.into(),
            detail: detail.into(),
        }
    }
}
