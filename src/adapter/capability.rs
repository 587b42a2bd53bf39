use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::servlet::{Invocation, Servlet, ServletError};

/// The servlet handle as guest code sees it.
///
/// A capability can only be created by [`run_servlet`](super::run_servlet),
/// which retires it when the guest's entry point returns. Guests may copy
/// it freely; once retired every copy fails with
/// [`ServletError::AdapterFault`].
///
/// The accessor methods return owned strings: nothing handed to a guest
/// aliases request memory.
#[derive(Clone)]
pub struct Capability {
    slot: Arc<Mutex<Option<Invocation>>>,
}

impl Capability {
    pub(crate) fn lend(invocation: Invocation) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(invocation))),
        }
    }

    /// Takes the invocation back. Every copy is dead afterwards.
    pub(crate) fn retire(&self) -> Option<Invocation> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// `true` until the invocation this capability belongs to has returned.
    pub fn is_live(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Runs `op` against the live servlet handle.
    pub fn with<R>(
        &self,
        op: impl FnOnce(&mut Servlet<'_>) -> Result<R, ServletError>,
    ) -> Result<R, ServletError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let invocation = slot.as_mut().ok_or_else(|| {
            ServletError::fault("servlet handle used after its invocation returned")
        })?;
        op(&mut invocation.servlet())
    }

    pub fn argument(&self, name: &str) -> Result<Option<String>, ServletError> {
        self.with(|s| Ok(s.get_argument(name).map(str::to_owned)))
    }

    pub fn method(&self) -> Result<String, ServletError> {
        self.with(|s| Ok(s.get_method().to_owned()))
    }

    pub fn header(&self, name: &str) -> Result<Option<String>, ServletError> {
        self.with(|s| Ok(s.get_header(name).map(str::to_owned)))
    }

    /// Accepts the guest's native integer type and range-checks it.
    pub fn set_status(&self, code: i64) -> Result<(), ServletError> {
        let code = u16::try_from(code)
            .map_err(|_| ServletError::fault(format!("invalid status code {code}")))?;
        self.with(|s| s.set_status(code))
    }

    pub fn set_header(&self, key: &str, value: &str) -> Result<(), ServletError> {
        self.with(|s| s.set_header(key, value))
    }

    pub fn write(&self, bytes: &[u8]) -> Result<usize, ServletError> {
        self.with(|s| s.write(bytes))
    }

    /// Formatted write of text the guest already rendered.
    pub fn write_formatted(&self, text: &str) -> Result<usize, ServletError> {
        self.with(|s| s.write_formatted(format_args!("{text}")))
    }

    pub fn flush(&self) -> Result<(), ServletError> {
        self.with(|s| s.flush())
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("live", &self.is_live())
            .finish()
    }
}
