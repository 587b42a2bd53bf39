//! HTTP/1.1 response head serialization and host-generated responses.
//!
//! Servlet output is streamed, so the status line and header block are
//! serialized separately from the body by [`write_head`]. [`Response`] is the
//! complete, length-delimited form the host uses when no servlet runs
//! (bad requests, unknown paths, oversized payloads).

use bytes::{BufMut, BytesMut};

use super::{Headers, StatusCode};

/// Appends an HTTP/1.1 status line, every header in `headers`, and the blank
/// separator line to `buf`.
///
/// # Examples
///
/// ```
/// use bytes::BytesMut;
/// use rservlet::http::{Headers, StatusCode, response::write_head};
///
/// let mut headers = Headers::new();
/// headers.insert("Transfer-Encoding", "chunked");
/// let mut buf = BytesMut::new();
/// write_head(&mut buf, StatusCode::NOT_FOUND, &headers);
/// assert_eq!(&buf[..], b"HTTP/1.1 404 Not Found\r\nTransfer-Encoding: chunked\r\n\r\n");
/// ```
pub fn write_head(buf: &mut BytesMut, status: StatusCode, headers: &Headers) {
    buf.reserve(32 + headers.len() * 48);
    buf.put(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason()
        )
        .as_bytes(),
    );
    for (name, value) in headers.iter() {
        buf.put(format!("{name}: {value}\r\n").as_bytes());
    }
    buf.put(&b"\r\n"[..]);
}

/// A complete HTTP/1.1 response generated by the host itself.
///
/// # Examples
///
/// ```
/// use rservlet::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::NOT_FOUND).body("no servlet mounted at /x");
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
/// assert!(text.contains("Content-Length: 24\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Vec<u8>,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
            keep_alive: true,
        }
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into().into_bytes();
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Serializes the response using HTTP/1.1 wire format.
    ///
    /// Adds `Content-Type: text/plain; charset=utf-8` for non-empty bodies,
    /// the `Connection` header, and a `Content-Length` that always matches the body.
    pub fn into_bytes(mut self) -> BytesMut {
        if !self.body.is_empty() {
            self.headers
                .set("Content-Type", "text/plain; charset=utf-8");
        }
        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.set("Connection", connection);
        self.headers
            .set("Content-Length", self.body.len().to_string());

        let mut buf = BytesMut::with_capacity(128 + self.body.len());
        write_head(&mut buf, self.status, &self.headers);
        buf.put(self.body.as_slice());
        buf
    }
}
