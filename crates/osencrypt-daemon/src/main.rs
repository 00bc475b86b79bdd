use anyhow::{Context, Result};
use log::{error, info, warn};
use osencrypt_core::{
    config::OsEncryptConfig, logging, workflow::PatchBootSystemState, EncryptionContext,
    StateMachine, DEFAULT_CONFIG_PATH,
};
use osencrypt_system::{CryptMountFile, DaemonLock, FileBekLocator, SystemExecutor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::{select, signal, task};

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        error!("daemon exit: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    logging::init("info");
    let config_path =
        std::env::var("OSENCRYPT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = OsEncryptConfig::load(&config_path)
        .with_context(|| format!("load config {config_path}"))?;

    info!(
        "osencrypt daemon booting (config: {config_path}, root: {})",
        config.rootfs_block_device()
    );

    let lock = DaemonLock::acquire(&config.paths.daemon_lock_file)
        .context("acquire daemon lock")?;

    let stop = Arc::new(AtomicBool::new(false));
    let mut worker = task::spawn_blocking({
        let stop = stop.clone();
        move || run_states(&config, &stop)
    });

    let entered = select! {
        res = &mut worker => res.context("state machine thread panicked")??,
        signal = shutdown_signal() => {
            request_stop(signal, &stop);
            worker.await.context("state machine thread panicked")??
        }
    };

    info!("state machine finished: {entered:?}");
    drop(lock);
    Ok(())
}

/// Blocking half of the daemon. Signals only take effect between states.
fn run_states(config: &OsEncryptConfig, stop: &AtomicBool) -> Result<Vec<&'static str>> {
    let executor = SystemExecutor::from_config(config);
    let store = CryptMountFile::from_config(config);
    let bek = FileBekLocator::new();
    let ctx = EncryptionContext::new(config, &executor, &bek, &store);

    let state = PatchBootSystemState::new(ctx).context("probe root partition")?;
    let mut machine = StateMachine::new().with_state(state);
    let entered = machine.run(stop)?;
    if entered.is_empty() {
        warn!("no encryption state was eligible to run");
    }
    Ok(entered)
}

/// Raise the stop flag for a delivered signal. A listener that failed to
/// install leaves the state machine running to completion.
fn request_stop(signal: Result<()>, stop: &AtomicBool) {
    match signal {
        Ok(()) => {
            info!("received shutdown signal; finishing the current state");
            stop.store(true, Ordering::SeqCst);
        }
        Err(err) => warn!("signal listener failed, running to completion: {err:#}"),
    }
}

async fn shutdown_signal() -> Result<()> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("install SIGTERM handler")?;
    select! {
        res = signal::ctrl_c() => res.context("listen for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
