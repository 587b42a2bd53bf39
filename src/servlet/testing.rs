//! In-memory [`Exchange`] for unit tests.

use std::io;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;

use crate::http::response::write_head;
use crate::http::{Headers, Request, StatusCode};

use super::{Exchange, FramingMode};

#[derive(Debug, Default)]
struct Recorded {
    wire: Vec<u8>,
    flushes: usize,
    broken: bool,
}

/// Test-side view of what a [`RecordingExchange`] put on the "wire".
#[derive(Debug, Clone, Default)]
pub(crate) struct Record(Arc<Mutex<Recorded>>);

impl Record {
    pub(crate) fn wire(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().wire.clone()).unwrap()
    }

    pub(crate) fn flushes(&self) -> usize {
        self.0.lock().unwrap().flushes
    }

    /// Makes every later write or flush fail with a broken pipe.
    pub(crate) fn break_connection(&self) {
        self.0.lock().unwrap().broken = true;
    }
}

pub(crate) struct RecordingExchange {
    request: Request,
    status: StatusCode,
    headers: Headers,
    head_sent: bool,
    record: Record,
}

impl RecordingExchange {
    pub(crate) fn new(method: &str, target: &str) -> Self {
        let raw = format!("{method} {target} HTTP/1.1\r\nContent-Type: text/plain\r\n\r\n");
        let (request, _) = Request::parse(raw.as_bytes()).unwrap();
        Self {
            request,
            status: StatusCode::OK,
            headers: Headers::new(),
            head_sent: false,
            record: Record::default(),
        }
    }

    pub(crate) fn get(target: &str) -> (Self, Record) {
        Self::new("GET", target).split()
    }

    /// Re-parses the request with an extra request header.
    pub(crate) fn header(self, name: &str, value: &str) -> Self {
        let mut raw = format!(
            "{} {}",
            self.request.method(),
            self.request.path()
        );
        if let Some(query) = self.request.query_string() {
            raw.push('?');
            raw.push_str(query);
        }
        raw.push_str(" HTTP/1.1\r\n");
        for (k, v) in self.request.headers().iter() {
            raw.push_str(&format!("{k}: {v}\r\n"));
        }
        raw.push_str(&format!("{name}: {value}\r\n\r\n"));
        let (request, _) = Request::parse(raw.as_bytes()).unwrap();
        Self { request, ..self }
    }

    pub(crate) fn split(self) -> (Self, Record) {
        let record = self.record.clone();
        (self, record)
    }

    fn push(&self, bytes: &[u8]) -> io::Result<()> {
        let mut recorded = self.record.0.lock().unwrap();
        if recorded.broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"));
        }
        recorded.wire.extend_from_slice(bytes);
        Ok(())
    }
}

impl Exchange for RecordingExchange {
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
        self.headers.set(key, value);
    }

    fn clear_headers(&mut self) {
        self.headers.clear();
    }

    fn head_sink(&mut self, framing: FramingMode) -> io::Result<()> {
        let mut headers = self.headers.clone();
        if framing == FramingMode::Chunked {
            headers.set("Transfer-Encoding", "chunked");
        }
        let mut buf = BytesMut::new();
        write_head(&mut buf, self.status, &headers);
        self.push(&buf)?;
        self.head_sent = true;
        Ok(())
    }

    fn raw_byte_sink(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.push(bytes)
    }

    fn flush_sink(&mut self) -> io::Result<()> {
        let mut recorded = self.record.0.lock().unwrap();
        if recorded.broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"));
        }
        recorded.flushes += 1;
        Ok(())
    }

    fn headers_already_sent(&self) -> bool {
        self.head_sent
    }

    fn finish(&mut self, framing: Option<FramingMode>) -> io::Result<()> {
        if !self.head_sent {
            self.head_sink(FramingMode::ContentLength)?;
        }
        if framing == Some(FramingMode::Chunked) {
            self.push(b"0\r\n\r\n")?;
        }
        self.flush_sink()
    }
}
