use super::{Exchange, ResponseMachine, Servlet, ServletError};

/// One servlet invocation: an exchange plus the protocol state for it.
///
/// The invocation owns the exchange for its whole run. Servlet handles
/// borrow from it and cannot outlive it; [`complete`](Self::complete)
/// consumes it and hands the response back to the host for termination.
pub struct Invocation {
    exchange: Box<dyn Exchange>,
    machine: ResponseMachine,
}

impl Invocation {
    pub fn new(exchange: Box<dyn Exchange>) -> Self {
        Self {
            exchange,
            machine: ResponseMachine::new(),
        }
    }

    /// Borrows the servlet handle for this invocation.
    pub fn servlet(&mut self) -> Servlet<'_> {
        Servlet::new(self.exchange.as_mut(), &mut self.machine)
    }

    pub fn machine(&self) -> &ResponseMachine {
        &self.machine
    }

    /// Ends the invocation: flushes pending output, then lets the host emit
    /// any missing head and the end-of-body marker.
    ///
    /// # Errors
    ///
    /// [`ServletError::WriteFailure`] if the connection failed at any point,
    /// including earlier in the invocation.
    pub fn complete(mut self) -> Result<(), ServletError> {
        self.servlet().flush()?;
        let framing = self.machine.framing();
        self.exchange.finish(framing)?;
        Ok(())
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("method", &self.exchange.resolve_method())
            .field("machine", &self.machine)
            .finish()
    }
}
