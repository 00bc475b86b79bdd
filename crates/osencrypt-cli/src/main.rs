//! osencrypt command-line interface: drive the OS volume transition by hand
//! and inspect how far it got.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use osencrypt_core::{
    logging,
    workflow::{self, PatchBootSystemState, WorkflowLevel, WorkflowReport},
    CryptItemStore, EncryptionContext, OsEncryptConfig, StateMachine, DEFAULT_CONFIG_PATH,
};
use osencrypt_system::{CryptMountFile, DaemonLock, FileBekLocator, SystemExecutor};
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

#[derive(Parser, Debug)]
#[command(
    name = "osencrypt",
    version,
    about = "Live OS-disk encryption transition tooling."
)]
struct Cli {
    /// Path to the osencrypt configuration file (TOML or YAML).
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every pending encryption state in the foreground.
    Run {
        /// Use this root partition UUID instead of asking blkid. Pass an empty
        /// string to force the udev attribute patch.
        #[arg(long)]
        root_partuuid: Option<String>,
    },

    /// Report progress without touching the host.
    Status,

    /// List the registered crypt items.
    CryptItems,

    /// Print the JSON schema of the configuration file.
    Schema,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();

    match cli.command {
        Commands::Schema => {
            let schema = schema_for!(OsEncryptConfig);
            println!("{}", to_string_pretty(&schema)?);
        }
        Commands::Status => {
            let config = load_config(&cli.config)?;
            let executor = SystemExecutor::from_config(&config);
            let store = CryptMountFile::from_config(&config);
            let bek = FileBekLocator::new();
            let ctx = EncryptionContext::new(&config, &executor, &bek, &store);
            let report = workflow::inspect(&ctx)?;
            let worst = report.worst();
            print_report(report);
            if worst == WorkflowLevel::Error {
                std::process::exit(2);
            }
        }
        Commands::CryptItems => {
            let config = load_config(&cli.config)?;
            let store = CryptMountFile::from_config(&config);
            let items = store
                .crypt_items()
                .with_context(|| format!("read {}", store.path().display()))?;
            println!("{:<16} {:<48} {}", "MAPPER", "DEVICE", "LUKS HEADER");
            for item in items {
                println!(
                    "{:<16} {:<48} {}",
                    item.mapper_name,
                    item.dev_path,
                    item.luks_header_path.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Run { root_partuuid } => {
            let config = load_config(&cli.config)?;
            let _lock = DaemonLock::acquire(&config.paths.daemon_lock_file)
                .context("another osencrypt run is in progress")?;
            let executor = SystemExecutor::from_config(&config);
            let store = CryptMountFile::from_config(&config);
            let bek = FileBekLocator::new();
            let ctx = EncryptionContext::new(&config, &executor, &bek, &store);

            let state = match root_partuuid {
                Some(uuid) => PatchBootSystemState::with_root_partuuid(
                    ctx,
                    Some(uuid).filter(|u| !u.trim().is_empty()),
                ),
                None => PatchBootSystemState::new(ctx)?,
            };
            let mut machine = StateMachine::new().with_state(state);
            let entered = machine.run(&AtomicBool::new(false))?;
            if entered.is_empty() {
                println!("Nothing to do: every state is complete or not yet eligible.");
            }
            for name in entered {
                println!("  [OK] {name}");
            }
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<OsEncryptConfig> {
    OsEncryptConfig::load(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn print_report(report: WorkflowReport) {
    println!("{}", report.title);
    for event in report.events {
        println!("  [{}] {}", level_tag(event.level), event.message);
    }
}

fn level_tag(level: WorkflowLevel) -> &'static str {
    match level {
        WorkflowLevel::Info => "INFO",
        WorkflowLevel::Success => "OK",
        WorkflowLevel::Warn => "WARN",
        WorkflowLevel::Error => "ERR",
    }
}
