//! Host-backed collaborators for the osencrypt core: the command executor
//! that actually spawns processes, the BEK file locator, the crypt mount
//! config file and the daemon lock.

mod bek;
mod command;
mod crypt_mount;
mod lock;
mod system;

pub use bek::FileBekLocator;
pub use command::{CommandRunner, NOT_FOUND_STATUS};
pub use crypt_mount::CryptMountFile;
pub use lock::DaemonLock;
pub use system::SystemExecutor;
