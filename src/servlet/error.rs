use std::io;

use thiserror::Error;

/// Errors reported by the servlet response protocol.
///
/// None of these are fatal to the host process. A [`WriteFailure`] ends the
/// invocation early; the other two leave the response untouched and the
/// servlet may carry on.
///
/// [`WriteFailure`]: ServletError::WriteFailure
#[derive(Debug, Error)]
pub enum ServletError {
    /// Status or header mutation attempted after the head went out.
    /// The mutation is discarded.
    #[error("cannot {operation} after the response headers were sent")]
    OrderingViolation { operation: &'static str },

    /// The underlying connection rejected bytes (peer gone, broken pipe).
    #[error("response write failed: {0}")]
    WriteFailure(#[from] io::Error),

    /// Guest-side misuse: bad argument values, wrong types, or a retired handle.
    #[error("{0}")]
    AdapterFault(String),
}

impl ServletError {
    pub(crate) fn fault(message: impl Into<String>) -> Self {
        Self::AdapterFault(message.into())
    }

    /// Returns `true` if this error came from the connection rather than
    /// from the servlet's own use of the API.
    pub fn is_write_failure(&self) -> bool {
        matches!(self, Self::WriteFailure(_))
    }
}
