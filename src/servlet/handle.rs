use std::fmt;
use std::io;

use tracing::{debug, trace, warn};

use crate::http::StatusCode;

use super::{Exchange, FramingMode, ResponseMachine, ResponseState, ServletError};

/// The handle a servlet uses to read its request and write its response.
///
/// A `Servlet` borrows its exchange, so it and every string it hands out
/// are confined to the invocation that created it. Only
/// [`Invocation::servlet`](super::Invocation::servlet) constructs one.
///
/// Status and headers are buffered until the first write. That write decides
/// the framing: `Content-Length` when the servlet declared a length,
/// chunked transfer encoding otherwise.
pub struct Servlet<'x> {
    exchange: &'x mut dyn Exchange,
    machine: &'x mut ResponseMachine,
}

impl<'x> Servlet<'x> {
    pub(crate) fn new(exchange: &'x mut dyn Exchange, machine: &'x mut ResponseMachine) -> Self {
        Self { exchange, machine }
    }

    /// Returns the decoded query-string value for `name`, or `None` when the
    /// key is absent. Keys match exactly.
    pub fn get_argument(&self, name: &str) -> Option<&str> {
        self.exchange.resolve_argument(name)
    }

    /// Returns the request method, e.g. `"GET"`.
    pub fn get_method(&self) -> &str {
        self.exchange.resolve_method()
    }

    /// Returns the request header `name` (case-insensitive), or `None`.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.exchange.resolve_header(name)
    }

    /// `true` for `HEAD` requests.
    pub fn is_head(&self) -> bool {
        self.get_method() == "HEAD"
    }

    pub fn state(&self) -> ResponseState {
        self.machine.state()
    }

    pub fn framing(&self) -> Option<FramingMode> {
        self.machine.framing()
    }

    /// Sets the response status. The reason phrase follows from the code.
    ///
    /// # Errors
    ///
    /// - [`ServletError::OrderingViolation`] once the head was sent; the
    ///   status already on the wire is kept.
    /// - [`ServletError::AdapterFault`] for codes outside 100..=999.
    pub fn set_status(&mut self, code: u16) -> Result<(), ServletError> {
        self.machine
            .check_unsent(self.exchange.headers_already_sent(), "set status")?;
        let status = StatusCode::from_u16(code)
            .ok_or_else(|| ServletError::fault(format!("invalid status code {code}")))?;
        self.machine.record_status(status);
        self.exchange.status_sink(status);
        Ok(())
    }

    /// Sets a response header, replacing an earlier header of the same name.
    ///
    /// Setting `Content-Length` (any case) before the first write selects
    /// length-delimited framing. The servlet then owes exactly that many
    /// body bytes; the running total is not checked here.
    ///
    /// # Errors
    ///
    /// - [`ServletError::OrderingViolation`] once the head was sent.
    /// - [`ServletError::AdapterFault`] for an empty name or a name/value
    ///   containing CR or LF.
    pub fn set_header(&mut self, key: &str, value: &str) -> Result<(), ServletError> {
        self.machine
            .check_unsent(self.exchange.headers_already_sent(), "set header")?;
        if key.is_empty() {
            return Err(ServletError::fault("header name must not be empty"));
        }
        if key.contains(['\r', '\n', ':']) || value.contains(['\r', '\n']) {
            return Err(ServletError::fault(format!(
                "header {key:?} contains a forbidden character"
            )));
        }
        self.machine.record_header(key);
        self.exchange.header_sink(key, value);
        Ok(())
    }

    /// Discards every header set so far, including a declared
    /// `Content-Length`. The status is left alone.
    pub(crate) fn clear_headers(&mut self) -> Result<(), ServletError> {
        self.machine
            .check_unsent(self.exchange.headers_already_sent(), "clear headers")?;
        self.machine.forget_headers();
        self.exchange.clear_headers();
        Ok(())
    }

    /// Writes raw body bytes and returns how many were accepted.
    ///
    /// The first write emits the head. In chunked mode each call becomes one
    /// chunk; an empty slice emits the head but no chunk, since a zero-length
    /// chunk would end the body.
    ///
    /// Unlike [`write_formatted`](Self::write_formatted), this path is *not*
    /// suppressed for `HEAD` requests: bytes go out as given. Servlets that
    /// answer `HEAD` through `write` must skip the body themselves.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize, ServletError> {
        self.machine.check_healthy()?;
        let framing = self.ensure_head()?;
        if bytes.is_empty() {
            return Ok(0);
        }
        self.emit(framing, bytes)?;
        Ok(bytes.len())
    }

    /// Renders `args` and writes the result as one unit.
    ///
    /// The text is rendered into a temporary buffer first so the chunk size
    /// is known before anything is emitted. Empty output is a no-op that
    /// reports zero. For `HEAD` requests the rendered length is reported but
    /// neither the head nor any body byte is emitted.
    ///
    /// ```rust,ignore
    /// let written = servlet.write_formatted(format_args!("The number is {}\n", 42))?;
    /// ```
    pub fn write_formatted(&mut self, args: fmt::Arguments<'_>) -> Result<usize, ServletError> {
        self.machine.check_healthy()?;
        let rendered = fmt::format(args);
        if rendered.is_empty() {
            return Ok(0);
        }
        if self.is_head() {
            trace!(len = rendered.len(), "HEAD request, formatted body suppressed");
            return Ok(rendered.len());
        }
        let framing = self.ensure_head()?;
        self.emit(framing, rendered.as_bytes())?;
        Ok(rendered.len())
    }

    /// Pushes buffered output to the connection. Does not emit the head.
    pub fn flush(&mut self) -> Result<(), ServletError> {
        self.machine.check_healthy()?;
        self.exchange.flush_sink().map_err(|e| self.fail(e))
    }

    fn ensure_head(&mut self) -> Result<FramingMode, ServletError> {
        if let Some(framing) = self.machine.framing() {
            return Ok(framing);
        }
        let framing = self.machine.pending_framing();
        self.exchange.head_sink(framing).map_err(|e| self.fail(e))?;
        self.machine.mark_sent(framing);
        debug!(status = self.machine.status().as_u16(), ?framing, "response head emitted");
        Ok(framing)
    }

    fn emit(&mut self, framing: FramingMode, data: &[u8]) -> Result<(), ServletError> {
        let result = match framing {
            FramingMode::ContentLength => self.exchange.raw_byte_sink(data),
            FramingMode::Chunked => self.exchange.raw_byte_sink(&chunk(data)),
        };
        result.map_err(|e| self.fail(e))
    }

    fn fail(&mut self, err: io::Error) -> ServletError {
        warn!(error = %err, "response write failed");
        self.machine.poison();
        ServletError::WriteFailure(err)
    }
}

impl fmt::Debug for Servlet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Servlet")
            .field("method", &self.get_method())
            .field("machine", &self.machine)
            .finish()
    }
}

/// Frames `data` as one HTTP/1.1 chunk: `<HEX-LEN>\r\n<data>\r\n`.
fn chunk(data: &[u8]) -> Vec<u8> {
    let size = format!("{:X}\r\n", data.len());
    let mut frame = Vec::with_capacity(size.len() + data.len() + 2);
    frame.extend_from_slice(size.as_bytes());
    frame.extend_from_slice(data);
    frame.extend_from_slice(b"\r\n");
    frame
}
