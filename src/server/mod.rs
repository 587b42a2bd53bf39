//! Async TCP host for mounted servlets.
//!
//! One Tokio task per connection reads and parses HTTP/1.1 requests
//! (persistent connections and pipelining included) and dispatches each one
//! to the servlet mounted at its path. Servlets are synchronous guest code,
//! so every invocation runs on the blocking pool. Output reaches the socket
//! through a bounded queue drained by a per-connection writer task; a full
//! queue blocks the servlet, which is the only point where an invocation
//! waits on the peer.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::adapter::run_servlet;
use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::router::MountTable;

mod exchange;

pub use exchange::ConnectionExchange;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Output chunks that may wait for the socket before a servlet blocks.
const OUTPUT_QUEUE_DEPTH: usize = 16;

/// Tunables for connection handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Largest request (head plus body) buffered before answering 413.
    pub max_request_bytes: usize,
    /// Servlet output is handed to the socket once this much is buffered.
    pub output_buffer_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_request_bytes: 8 * 1024 * 1024,
            output_buffer_bytes: 64 * 1024,
        }
    }
}

/// The servlet host.
///
/// # Examples
///
/// ```rust,no_run
/// use rservlet::adapter::native::native;
/// use rservlet::router::MountTable;
/// use rservlet::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut mounts = MountTable::new();
///     mounts.mount_servlet("/hello", native(|s| {
///         s.write(b"Hello!")?;
///         Ok(())
///     }))?;
///
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(mounts).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    settings: ServerSettings,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            settings: ServerSettings::default(),
        })
    }

    #[must_use]
    pub fn with_settings(mut self, settings: ServerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves `mounts` until the process is terminated.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run(self, mounts: MountTable) -> Result<(), ServerError> {
        self.run_until(mounts, std::future::pending()).await
    }

    /// Serves `mounts` until `shutdown` resolves.
    ///
    /// Shutdown stops accepting new connections. Connections already open
    /// finish the invocation in progress and are then dropped with the
    /// runtime.
    pub async fn run_until(
        self,
        mounts: MountTable,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        let mounts = Arc::new(mounts);
        let settings = self.settings;
        info!(address = %self.local_addr, mounts = mounts.len(), "rservlet listening");

        tokio::pin!(shutdown);
        loop {
            let accepted = tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown requested, no longer accepting connections");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let mounts = Arc::clone(&mounts);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, mounts, settings).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Handles a single TCP connection over its lifetime.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    mounts: Arc<MountTable>,
    settings: ServerSettings,
) -> io::Result<()> {
    let (mut reader, writer) = stream.into_split();
    let (output, queue) = mpsc::channel(OUTPUT_QUEUE_DEPTH);
    let writer = tokio::spawn(write_loop(writer, queue));

    let served = serve_requests(&mut reader, peer_addr, &mounts, settings, &output).await;

    // Closing the queue lets the writer drain what is left and shut down.
    drop(output);
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(peer = %peer_addr, error = %e, "connection writer failed"),
        Err(e) => error!(peer = %peer_addr, error = %e, "connection writer panicked"),
    }
    served
}

/// Copies queued output to the socket until the queue closes.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Bytes>,
) -> io::Result<()> {
    while let Some(bytes) = queue.recv().await {
        writer.write_all(&bytes).await?;
    }
    writer.flush().await?;
    writer.shutdown().await
}

/// Reads and answers requests until the connection should close.
///
/// HTTP/1.1 connections are persistent by default: we loop, one request per
/// iteration, until the peer goes away, either side asks for
/// `Connection: close`, or a response could not be completed cleanly.
async fn serve_requests(
    reader: &mut OwnedReadHalf,
    peer_addr: SocketAddr,
    mounts: &MountTable,
    settings: ServerSettings,
    output: &mpsc::Sender<Bytes>,
) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let next = match Request::parse(&buf) {
            Ok((request, body_offset)) => {
                let body_len = request.content_length().unwrap_or(0);
                let Some(total_needed) = body_offset
                    .checked_add(body_len)
                    .filter(|total| *total <= settings.max_request_bytes)
                else {
                    return reject_oversized(peer_addr, output).await;
                };
                (buf.len() >= total_needed).then_some((request, body_len, total_needed))
            }
            Err(RequestError::Incomplete) => {
                if buf.len() > settings.max_request_bytes {
                    return reject_oversized(peer_addr, output).await;
                }
                None
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response = Response::new(StatusCode::BAD_REQUEST)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false);
                return send_response(output, response).await;
            }
        };

        let Some((mut request, body_len, total_needed)) = next else {
            if reader.read_buf(&mut buf).await? == 0 {
                debug!(peer = %peer_addr, "connection closed by peer");
                return Ok(());
            }
            continue;
        };

        // Drop the consumed request bytes from the buffer.
        let _ = buf.split_to(total_needed);
        request.limit_body(body_len);

        if !dispatch(request, peer_addr, mounts, settings, output).await? {
            debug!(peer = %peer_addr, "closing connection after response");
            return Ok(());
        }
    }
}

/// Answers one request. Returns whether the connection may be reused.
async fn dispatch(
    request: Request,
    peer_addr: SocketAddr,
    mounts: &MountTable,
    settings: ServerSettings,
    output: &mpsc::Sender<Bytes>,
) -> io::Result<bool> {
    let keep_alive = request.is_keep_alive();
    let method = request.method().clone();
    let path = request.path().to_owned();

    let Some(servlet) = mounts.resolve(&path).cloned() else {
        debug!(peer = %peer_addr, %method, %path, "no servlet mounted, sending 404");
        let response = Response::new(StatusCode::NOT_FOUND)
            .body(format!("No servlet mounted at {path}\n"))
            .keep_alive(keep_alive);
        send_response(output, response).await?;
        return Ok(keep_alive);
    };

    debug!(peer = %peer_addr, %method, %path, "dispatching request");
    let exchange =
        ConnectionExchange::new(request, output.clone(), settings.output_buffer_bytes, keep_alive);
    let close = exchange.close_signal();

    let report =
        match task::spawn_blocking(move || run_servlet(servlet.as_ref(), Box::new(exchange))).await
        {
            Ok(report) => report,
            Err(e) => {
                error!(peer = %peer_addr, %method, %path, error = %e, "servlet panicked");
                return Ok(false);
            }
        };

    info!(
        peer = %peer_addr,
        %method,
        %path,
        status = report.status.as_u16(),
        framing = ?report.framing,
        "request served"
    );

    Ok(report.connection_reusable() && !close.load(Ordering::Relaxed))
}

async fn reject_oversized(peer_addr: SocketAddr, output: &mpsc::Sender<Bytes>) -> io::Result<()> {
    warn!(peer = %peer_addr, "request too large, sending 413");
    let response = Response::new(StatusCode::PAYLOAD_TOO_LARGE)
        .body("Request entity too large")
        .keep_alive(false);
    send_response(output, response).await
}

async fn send_response(output: &mpsc::Sender<Bytes>, response: Response) -> io::Result<()> {
    output
        .send(response.into_bytes().freeze())
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection writer has shut down"))
}
