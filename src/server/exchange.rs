use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::trace;

use crate::http::response::write_head;
use crate::http::{Headers, Method, Request, StatusCode};
use crate::servlet::{Exchange, FramingMode};

/// The host side of one servlet invocation on a TCP connection.
///
/// Output is buffered and handed to the connection's writer task whenever
/// the buffer reaches the flush threshold or the servlet flushes. Handoff
/// blocks while the writer's queue is full, so this type must be driven from
/// a blocking thread (`spawn_blocking`), never from an async task.
pub struct ConnectionExchange {
    request: Request,
    status: StatusCode,
    headers: Headers,
    length_declared: bool,
    head_sent: bool,
    keep_alive: bool,
    close: Arc<AtomicBool>,
    buffer: BytesMut,
    flush_threshold: usize,
    output: mpsc::Sender<Bytes>,
}

impl ConnectionExchange {
    pub fn new(
        request: Request,
        output: mpsc::Sender<Bytes>,
        flush_threshold: usize,
        keep_alive: bool,
    ) -> Self {
        Self {
            request,
            status: StatusCode::OK,
            headers: Headers::new(),
            length_declared: false,
            head_sent: false,
            keep_alive,
            close: Arc::new(AtomicBool::new(!keep_alive)),
            buffer: BytesMut::with_capacity(flush_threshold.min(16 * 1024)),
            flush_threshold: flush_threshold.max(1),
            output,
        }
    }

    /// Set once the response announced `Connection: close`, by the host or
    /// by the servlet itself.
    pub fn close_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.close)
    }

    fn send(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let bytes = self.buffer.split().freeze();
        trace!(len = bytes.len(), "handing output to connection writer");
        self.output.blocking_send(bytes).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "connection writer has shut down")
        })
    }

    fn send_if_full(&mut self) -> io::Result<()> {
        if self.buffer.len() >= self.flush_threshold {
            self.send()?;
        }
        Ok(())
    }
}

impl Exchange for ConnectionExchange {
    fn resolve_argument(&self, key: &str) -> Option<&str> {
        self.request.query_param(key)
    }

    fn resolve_method(&self) -> &str {
        self.request.method().as_str()
    }

    fn resolve_header(&self, key: &str) -> Option<&str> {
        self.request.headers().get(key)
    }

    fn status_sink(&mut self, status: StatusCode) {
        self.status = status;
    }

    fn header_sink(&mut self, key: &str, value: &str) {
        if key.eq_ignore_ascii_case("content-length") {
            self.length_declared = true;
        }
        self.headers.set(key, value);
    }

    fn clear_headers(&mut self) {
        self.headers.clear();
        self.length_declared = false;
    }

    fn head_sink(&mut self, framing: FramingMode) -> io::Result<()> {
        let mut headers = self.headers.clone();
        if framing == FramingMode::Chunked {
            headers.set("Transfer-Encoding", "chunked");
        }
        match headers.get("connection") {
            Some(value) if value.eq_ignore_ascii_case("close") => {
                self.close.store(true, Ordering::Relaxed);
            }
            Some(_) => {}
            None => {
                let value = if self.keep_alive { "keep-alive" } else { "close" };
                headers.set("Connection", value);
            }
        }

        write_head(&mut self.buffer, self.status, &headers);
        self.send_if_full()?;
        self.head_sent = true;
        Ok(())
    }

    fn raw_byte_sink(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.buffer.extend_from_slice(bytes);
        self.send_if_full()
    }

    fn flush_sink(&mut self) -> io::Result<()> {
        self.send()
    }

    fn headers_already_sent(&self) -> bool {
        self.head_sent
    }

    fn finish(&mut self, framing: Option<FramingMode>) -> io::Result<()> {
        if !self.head_sent {
            if !self.length_declared && *self.request.method() != Method::Head {
                self.headers.set("Content-Length", "0");
            }
            self.head_sink(FramingMode::ContentLength)?;
        }
        if framing == Some(FramingMode::Chunked) {
            self.buffer.extend_from_slice(b"0\r\n\r\n");
        }
        self.send()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(raw: &str, threshold: usize) -> (ConnectionExchange, mpsc::Receiver<Bytes>) {
        let (request, _) = Request::parse(raw.as_bytes()).unwrap();
        let keep_alive = request.is_keep_alive();
        let (tx, rx) = mpsc::channel(16);
        (ConnectionExchange::new(request, tx, threshold, keep_alive), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Bytes>) -> String {
        let mut out = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            out.extend_from_slice(&bytes);
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn resolves_request_data() {
        let (ex, _rx) = exchange("GET /x?a=1&b=%20 HTTP/1.1\r\nX-Test: yes\r\n\r\n", 1024);
        assert_eq!(ex.resolve_method(), "GET");
        assert_eq!(ex.resolve_argument("a"), Some("1"));
        assert_eq!(ex.resolve_argument("b"), Some(" "));
        assert_eq!(ex.resolve_argument("c"), None);
        assert_eq!(ex.resolve_header("x-test"), Some("yes"));
    }

    #[test]
    fn output_is_buffered_until_flush() {
        let (mut ex, mut rx) = exchange("GET / HTTP/1.1\r\n\r\n", 1024);
        ex.head_sink(FramingMode::Chunked).unwrap();
        ex.raw_byte_sink(b"2\r\nhi\r\n").unwrap();
        assert_eq!(drain(&mut rx), "");

        ex.flush_sink().unwrap();
        let wire = drain(&mut rx);
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.contains("Transfer-Encoding: chunked\r\n"));
        assert!(wire.contains("Connection: keep-alive\r\n"));
        assert!(wire.ends_with("\r\n\r\n2\r\nhi\r\n"));
    }

    #[test]
    fn threshold_triggers_handoff() {
        let (mut ex, mut rx) = exchange("GET / HTTP/1.1\r\n\r\n", 8);
        ex.head_sink(FramingMode::ContentLength).unwrap();
        assert!(!drain(&mut rx).is_empty());
        ex.raw_byte_sink(b"1234").unwrap();
        assert_eq!(drain(&mut rx), "");
        ex.raw_byte_sink(b"5678").unwrap();
        assert_eq!(drain(&mut rx), "12345678");
    }

    #[test]
    fn finish_without_output_sends_empty_response() {
        let (mut ex, mut rx) = exchange("GET / HTTP/1.1\r\n\r\n", 1024);
        ex.status_sink(StatusCode::NO_CONTENT);
        ex.finish(None).unwrap();
        let wire = drain(&mut rx);
        assert!(wire.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(wire.contains("Content-Length: 0\r\n"));
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[test]
    fn finish_keeps_declared_length_and_skips_head_requests() {
        let (mut ex, mut rx) = exchange("HEAD / HTTP/1.1\r\n\r\n", 1024);
        ex.finish(None).unwrap();
        assert!(!drain(&mut rx).contains("Content-Length"));

        let (mut ex, mut rx) = exchange("GET / HTTP/1.1\r\n\r\n", 1024);
        ex.header_sink("content-length", "12");
        ex.finish(None).unwrap();
        let wire = drain(&mut rx);
        assert!(wire.contains("content-length: 12\r\n"));
        assert!(!wire.contains("Content-Length: 0"));
    }

    #[test]
    fn cleared_headers_forget_the_declared_length() {
        let (mut ex, mut rx) = exchange("GET / HTTP/1.1\r\n\r\n", 1024);
        ex.header_sink("Content-Length", "12");
        ex.header_sink("X-Partial", "1");
        ex.clear_headers();
        ex.finish(None).unwrap();
        let wire = drain(&mut rx);
        assert!(wire.contains("Content-Length: 0\r\n"));
        assert!(!wire.contains("X-Partial"));
    }

    #[test]
    fn finish_terminates_chunked_body() {
        let (mut ex, mut rx) = exchange("GET / HTTP/1.1\r\n\r\n", 1024);
        ex.head_sink(FramingMode::Chunked).unwrap();
        ex.finish(Some(FramingMode::Chunked)).unwrap();
        assert!(drain(&mut rx).ends_with("\r\n\r\n0\r\n\r\n"));
    }

    #[test]
    fn servlet_connection_close_is_honoured() {
        let (mut ex, mut rx) = exchange("GET / HTTP/1.1\r\n\r\n", 1024);
        let close = ex.close_signal();
        ex.header_sink("Connection", "close");
        ex.head_sink(FramingMode::Chunked).unwrap();
        ex.flush_sink().unwrap();
        assert!(close.load(Ordering::Relaxed));
        let wire = drain(&mut rx);
        assert!(wire.contains("Connection: close\r\n"));
        assert!(!wire.contains("keep-alive"));
    }

    #[test]
    fn http10_defaults_to_close() {
        let (mut ex, mut rx) = exchange("GET / HTTP/1.0\r\n\r\n", 1024);
        assert!(ex.close_signal().load(Ordering::Relaxed));
        ex.finish(None).unwrap();
        assert!(drain(&mut rx).contains("Connection: close\r\n"));
    }

    #[test]
    fn dead_writer_is_a_broken_pipe() {
        let (mut ex, rx) = exchange("GET / HTTP/1.1\r\n\r\n", 1024);
        drop(rx);
        ex.raw_byte_sink(b"data").unwrap();
        let err = ex.flush_sink().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn failed_head_is_not_marked_sent() {
        let (mut ex, rx) = exchange("GET / HTTP/1.1\r\n\r\n", 1);
        drop(rx);
        assert!(ex.head_sink(FramingMode::Chunked).is_err());
        assert!(!ex.headers_already_sent());
    }
}
