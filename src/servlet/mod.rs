//! The servlet response protocol.
//!
//! A servlet reads its request and writes its response through a
//! [`Servlet`] handle. The handle enforces the ordering rules every guest
//! adapter relies on:
//!
//! - status and headers may change only until the first body write;
//! - the first write emits the head exactly once and fixes the
//!   [`FramingMode`]: length-delimited if `Content-Length` was set,
//!   chunked otherwise;
//! - formatted writes are rendered before emission and suppressed for
//!   `HEAD` requests; raw writes are not;
//! - connection failures surface as [`ServletError::WriteFailure`] and
//!   poison the handle for the rest of the invocation.
//!
//! The host side is the [`Exchange`] trait. An [`Invocation`] ties one
//! exchange to one [`ResponseMachine`] for a single run of a servlet.

mod error;
mod exchange;
mod handle;
mod invocation;
mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use error::ServletError;
pub use exchange::Exchange;
pub use handle::Servlet;
pub use invocation::Invocation;
pub use state::{FramingMode, ResponseMachine, ResponseState};
