//! Encryption state machine. States run in a fixed priority order, each at
//! most once per run, and record completion as a marker file so a rerun
//! after reboot skips them.

use crate::config::OsEncryptConfig;
use crate::error::{OsEncryptError, OsEncryptResult};
use log::{debug, info, warn};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// One step of the OS volume transition.
pub trait EncryptionState {
    /// Also the name of the marker file written on completion.
    fn name(&self) -> &'static str;

    fn should_enter(&self) -> OsEncryptResult<bool>;

    fn enter(&mut self) -> OsEncryptResult<()>;

    fn should_exit(&self) -> OsEncryptResult<bool>;
}

/// Marker bookkeeping shared by every state.
#[derive(Debug, Clone)]
pub struct StateLifecycle {
    marker: PathBuf,
}

impl StateLifecycle {
    pub fn new(config: &OsEncryptConfig, state: &str) -> Self {
        Self {
            marker: config.state_marker(state),
        }
    }

    pub fn marker(&self) -> &PathBuf {
        &self.marker
    }

    pub fn is_complete(&self) -> bool {
        self.marker.exists()
    }

    /// A state is eligible until its marker exists.
    pub fn should_enter(&self) -> bool {
        !self.is_complete()
    }

    /// Write the marker if it is missing. Always reports the state as done.
    pub fn should_exit(&self) -> OsEncryptResult<bool> {
        if let Some(parent) = self.marker.parent() {
            fs::create_dir_all(parent)?;
        }
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.marker)
        {
            Ok(_) => info!("wrote state marker {}", self.marker.display()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                debug!("state marker {} already present", self.marker.display())
            }
            Err(err) => return Err(err.into()),
        }
        Ok(true)
    }
}

pub struct StateMachine<'a> {
    states: Vec<Box<dyn EncryptionState + 'a>>,
}

impl<'a> StateMachine<'a> {
    pub fn new() -> Self {
        Self { states: Vec::new() }
    }

    /// Add a state after every state already registered.
    pub fn with_state(mut self, state: impl EncryptionState + 'a) -> Self {
        self.states.push(Box::new(state));
        self
    }

    pub fn state_names(&self) -> Vec<&'static str> {
        self.states.iter().map(|s| s.name()).collect()
    }

    /// Repeatedly enter the first eligible state that has not run yet until
    /// none is left or `stop` is raised. Returns the states entered, in
    /// order.
    pub fn run(&mut self, stop: &AtomicBool) -> OsEncryptResult<Vec<&'static str>> {
        let mut done = vec![false; self.states.len()];
        let mut entered = Vec::new();

        loop {
            if stop.load(Ordering::SeqCst) {
                warn!("stop requested; leaving state machine after {entered:?}");
                break;
            }

            let mut next = None;
            for (idx, state) in self.states.iter().enumerate() {
                if !done[idx] && state.should_enter()? {
                    next = Some(idx);
                    break;
                }
            }
            let Some(idx) = next else {
                break;
            };
            done[idx] = true;

            let state = &mut self.states[idx];
            let name = state.name();
            info!("entering state {name}");
            state.enter()?;
            if !state.should_exit()? {
                return Err(OsEncryptError::StateIncomplete(name.to_string()));
            }
            info!("state {name} complete");
            entered.push(name);
        }

        Ok(entered)
    }
}

impl Default for StateMachine<'_> {
    fn default() -> Self {
        Self::new()
    }
}
