//! # rservlet
//!
//! A host for HTTP servlets written in embedded guest languages.
//!
//! A servlet reads its request and streams its response through a small
//! protocol: query arguments, method and headers on the way in; status,
//! headers and body writes on the way out. The first body write sends the
//! head and picks the framing (`Content-Length` if the servlet declared
//! one, chunked otherwise); after that the head is frozen.
//!
//! - [`servlet`] implements that protocol against the [`servlet::Exchange`]
//!   host boundary.
//! - [`adapter`] exposes it to guest runtimes: Rust closures, Rhai scripts,
//!   Scheme through Steel and, behind the `python` and `ruby` features,
//!   CPython and CRuby.
//! - [`router`], [`server`] and [`config`] make up the HTTP/1.1 host.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rservlet::adapter::native::native;
//! use rservlet::router::MountTable;
//! use rservlet::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut mounts = MountTable::new();
//!     mounts.mount_servlet("/hello", native(|s| {
//!         s.set_header("Content-Type", "text/plain; charset=UTF-8")?;
//!         let name = s.get_argument("name").unwrap_or("world").to_owned();
//!         s.write_formatted(format_args!("Hello, {name}!\n"))?;
//!         Ok(())
//!     }))?;
//!
//!     Server::bind("127.0.0.1:8080").await?.run(mounts).await?;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod config;
pub mod http;
pub mod router;
pub mod server;
pub mod servlet;

pub use adapter::{AdapterRegistry, GuestAdapter, GuestServlet, run_servlet};
pub use config::Config;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::MountTable;
pub use server::{Server, ServerError, ServerSettings};
pub use servlet::{Exchange, FramingMode, ResponseState, Servlet, ServletError};
