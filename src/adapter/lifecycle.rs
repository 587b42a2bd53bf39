use std::sync::{Mutex, PoisonError};

use tracing::info;

use super::AdapterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Idle,
    Running,
    Stopped,
}

/// Process-lifetime start/stop bookkeeping shared by all adapters.
///
/// A runtime starts at most once and stops at most once. Stopping a runtime
/// that never started does nothing, and a stopped runtime is not restarted:
/// most embedded interpreters cannot be re-initialized in-process.
#[derive(Debug, Default)]
pub struct Lifecycle {
    phase: Mutex<Phase>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `start` on the first call only.
    ///
    /// # Errors
    ///
    /// Whatever `start` returns (the runtime stays idle and a later call may
    /// retry), or [`AdapterError::NotRunning`] after [`stop`](Self::stop).
    pub fn start(
        &self,
        adapter: &'static str,
        start: impl FnOnce() -> Result<(), AdapterError>,
    ) -> Result<(), AdapterError> {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        match *phase {
            Phase::Running => Ok(()),
            Phase::Stopped => Err(AdapterError::NotRunning { adapter }),
            Phase::Idle => {
                start()?;
                *phase = Phase::Running;
                info!(adapter, "guest runtime started");
                Ok(())
            }
        }
    }

    /// Runs `stop` if and only if the runtime is currently running.
    pub fn stop(&self, adapter: &'static str, stop: impl FnOnce()) {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase == Phase::Running {
            stop();
            *phase = Phase::Stopped;
            info!(adapter, "guest runtime stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) == Phase::Running
    }
}
