pub mod config;
pub mod context;
pub mod error;
pub mod exec;
pub mod logging;
pub mod machine;
pub mod provider;
pub mod workflow;

mod parse;
#[cfg(test)]
mod testing;

pub use config::{OsEncryptConfig, DEFAULT_CONFIG_PATH};
pub use context::EncryptionContext;
pub use error::{OsEncryptError, OsEncryptResult};
pub use exec::{CommandExecutor, CommandOutput, Invocation, Shell};
pub use machine::{EncryptionState, StateLifecycle, StateMachine};
pub use provider::{BekLocator, CryptItem, CryptItemStore};
