use tracing::{debug, error, warn};

use crate::http::StatusCode;
use crate::servlet::{Exchange, FramingMode, Invocation, ResponseState, Servlet, ServletError};

use super::{Capability, GuestError, GuestServlet};

const INTERNAL_ERROR_BODY: &str = "Internal Server Error\n";

/// What happened during one servlet invocation, for the host's bookkeeping.
#[derive(Debug)]
pub struct InvocationReport {
    pub state: ResponseState,
    pub framing: Option<FramingMode>,
    pub status: StatusCode,
    /// The connection rejected bytes at some point.
    pub write_failed: bool,
    /// The host terminated the response cleanly.
    pub completed: bool,
    /// The guest failed before sending anything and a 500 went out instead.
    pub recovered: bool,
    pub guest_error: Option<GuestError>,
}

impl InvocationReport {
    /// `true` if the response on the wire is well-formed and the next
    /// request may reuse the connection.
    pub fn connection_reusable(&self) -> bool {
        self.completed && !self.write_failed && (self.guest_error.is_none() || self.recovered)
    }
}

/// Runs `servlet` once against `exchange`.
///
/// Lends a fresh [`Capability`] to the guest, retires it when the guest
/// returns, answers `500` if the guest failed before the head went out, and
/// completes the response (implicit flush plus host termination). Guest and
/// connection failures end up in the report; none of them escape.
pub fn run_servlet(servlet: &dyn GuestServlet, exchange: Box<dyn Exchange>) -> InvocationReport {
    let capability = Capability::lend(Invocation::new(exchange));
    let outcome = servlet.invoke(&capability);

    let Some(mut invocation) = capability.retire() else {
        error!("servlet invocation lost its exchange");
        return InvocationReport {
            state: ResponseState::Unsent,
            framing: None,
            status: StatusCode::INTERNAL_SERVER_ERROR,
            write_failed: false,
            completed: false,
            recovered: false,
            guest_error: outcome.err(),
        };
    };

    let mut recovered = false;
    if let Err(err) = &outcome {
        warn!(error = %err, "servlet failed");
        let machine = invocation.machine();
        if machine.state() == ResponseState::Unsent && !machine.has_failed() {
            recovered = answer_internal_error(&mut invocation.servlet()).is_ok();
        }
    }

    let machine = invocation.machine();
    let state = machine.state();
    let framing = machine.framing();
    let status = machine.status();
    let mut write_failed = machine.has_failed();

    let completed = match invocation.complete() {
        Ok(()) => true,
        Err(err) => {
            debug!(error = %err, "response could not be completed");
            write_failed |= err.is_write_failure();
            false
        }
    };

    InvocationReport {
        state,
        framing,
        status,
        write_failed,
        completed,
        recovered,
        guest_error: outcome.err(),
    }
}

fn answer_internal_error(servlet: &mut Servlet<'_>) -> Result<(), ServletError> {
    servlet.clear_headers()?;
    servlet.set_status(StatusCode::INTERNAL_SERVER_ERROR.as_u16())?;
    servlet.set_header("Content-Type", "text/plain; charset=utf-8")?;
    servlet.set_header("Content-Length", &INTERNAL_ERROR_BODY.len().to_string())?;
    if !servlet.is_head() {
        servlet.write(INTERNAL_ERROR_BODY.as_bytes())?;
    }
    Ok(())
}
