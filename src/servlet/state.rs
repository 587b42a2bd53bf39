//! Response state machine.

use std::io;

use crate::http::StatusCode;

use super::ServletError;

/// Whether the status line and headers have gone out.
///
/// Moves once, `Unsent → HeadersSent`, on the first body write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseState {
    #[default]
    Unsent,
    HeadersSent,
}

/// How body bytes are delimited on the wire. Fixed when the head is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    /// A `Content-Length` header was set; bytes go out unframed.
    ContentLength,
    /// No length was declared; every write becomes one chunk.
    Chunked,
}

/// Per-invocation protocol bookkeeping.
///
/// Never shared between invocations: a fresh machine is created for every
/// [`Invocation`](super::Invocation).
#[derive(Debug, Default)]
pub struct ResponseMachine {
    state: ResponseState,
    framing: Option<FramingMode>,
    status: StatusCode,
    length_declared: bool,
    failed: bool,
}

impl ResponseMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ResponseState {
        self.state
    }

    /// `None` until the head has been emitted.
    pub fn framing(&self) -> Option<FramingMode> {
        self.framing
    }

    /// The status the servlet asked for (200 unless changed).
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// `true` once any write against the connection has failed.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Rejects head mutation once the head is out, whether this machine
    /// emitted it or the host reports it as sent.
    pub(crate) fn check_unsent(
        &self,
        host_sent: bool,
        operation: &'static str,
    ) -> Result<(), ServletError> {
        if self.state == ResponseState::HeadersSent || host_sent {
            return Err(ServletError::OrderingViolation { operation });
        }
        Ok(())
    }

    pub(crate) fn check_healthy(&self) -> Result<(), ServletError> {
        if self.failed {
            return Err(ServletError::WriteFailure(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "response stream failed earlier in this invocation",
            )));
        }
        Ok(())
    }

    pub(crate) fn record_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub(crate) fn record_header(&mut self, name: &str) {
        if name.eq_ignore_ascii_case("content-length") {
            self.length_declared = true;
        }
    }

    pub(crate) fn forget_headers(&mut self) {
        self.length_declared = false;
    }

    /// Framing the head would use if it were emitted now.
    pub(crate) fn pending_framing(&self) -> FramingMode {
        if self.length_declared {
            FramingMode::ContentLength
        } else {
            FramingMode::Chunked
        }
    }

    pub(crate) fn mark_sent(&mut self, framing: FramingMode) {
        self.state = ResponseState::HeadersSent;
        self.framing = Some(framing);
    }

    pub(crate) fn poison(&mut self) {
        self.failed = true;
    }
}
