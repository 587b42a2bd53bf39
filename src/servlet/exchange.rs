use std::io;

use crate::http::StatusCode;

use super::FramingMode;

/// The host side of one request/response exchange.
///
/// The host runtime implements this once (see
/// [`ConnectionExchange`](crate::server::ConnectionExchange)); the protocol in
/// [`Servlet`](super::Servlet) drives it. Nothing here enforces ordering:
/// that is the protocol's job.
pub trait Exchange: Send {
    /// Decoded query-string value for `key` (exact match).
    fn resolve_argument(&self, key: &str) -> Option<&str>;

    fn resolve_method(&self) -> &str;

    /// Request header value for `key` (case-insensitive).
    fn resolve_header(&self, key: &str) -> Option<&str>;

    fn status_sink(&mut self, status: StatusCode);

    /// Records a response header, replacing any earlier value of the same name.
    fn header_sink(&mut self, key: &str, value: &str);

    /// Drops every pending response header. Only called before the head is sent.
    fn clear_headers(&mut self);

    /// Serializes the status line and headers for the given framing.
    ///
    /// On error nothing of the head may remain queued and
    /// [`headers_already_sent`](Self::headers_already_sent) must stay `false`.
    fn head_sink(&mut self, framing: FramingMode) -> io::Result<()>;

    /// Queues body bytes exactly as given (framing is already applied).
    fn raw_byte_sink(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn flush_sink(&mut self) -> io::Result<()>;

    fn headers_already_sent(&self) -> bool;

    /// Ends the response once the invocation is over: emits a head if none
    /// went out, terminates chunked bodies, and flushes.
    fn finish(&mut self, framing: Option<FramingMode>) -> io::Result<()>;
}
