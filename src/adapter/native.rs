//! Servlets written in Rust.
//!
//! The handler receives `&mut Servlet<'_>` directly, so the borrow checker
//! rejects any attempt to keep the handle or a request string past the
//! invocation. No copying happens at the boundary.

use std::sync::Arc;

use crate::servlet::{Servlet, ServletError};

use super::{Capability, GuestError, GuestServlet};

/// A servlet backed by a Rust closure.
pub struct NativeServlet<F> {
    handler: F,
}

impl<F> GuestServlet for NativeServlet<F>
where
    F: Fn(&mut Servlet<'_>) -> Result<(), ServletError> + Send + Sync + 'static,
{
    fn invoke(&self, capability: &Capability) -> Result<(), GuestError> {
        capability.with(|servlet| (self.handler)(servlet))?;
        Ok(())
    }
}

/// Wraps a closure as a mountable servlet.
///
/// ```rust,no_run
/// use rservlet::adapter::native::native;
///
/// let hello = native(|s| {
///     s.set_header("Content-Type", "text/plain; charset=UTF-8")?;
///     let name = s.get_argument("name").unwrap_or("world").to_owned();
///     s.write_formatted(format_args!("hello, {name}\n"))?;
///     Ok(())
/// });
/// ```
pub fn native<F>(handler: F) -> Arc<dyn GuestServlet>
where
    F: Fn(&mut Servlet<'_>) -> Result<(), ServletError> + Send + Sync + 'static,
{
    Arc::new(NativeServlet { handler })
}
