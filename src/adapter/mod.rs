//! Guest adapters: expose the servlet protocol to embedded runtimes.
//!
//! Every adapter presents the same operations to its guest language
//! (`get_arg`, `get_method`, `get_header`, `set_status`, `set_header`,
//! `rwrite`, `rprintf`, `rflush`) and follows the same rules:
//!
//! - guest code never sees a raw handle, only a [`Capability`] the adapter
//!   lends for one invocation and retires when the guest returns;
//! - strings crossing into the guest are owned copies;
//! - protocol and connection errors become the guest's native errors,
//!   never a host fault;
//! - native callables are registered once per runtime, in `module_init`.
//!
//! [`run_servlet`] drives one invocation end to end and is the only
//! place a [`Capability`] is created.
//!
//! ## Adapters
//!
//! | Adapter | Guest values | Parallelism |
//! |---------|--------------|-------------|
//! | [`native`] | Rust borrows, checked at compile time | fully parallel |
//! | [`rhai`] | reference-counted `Dynamic` | fully parallel (`sync` engine) |
//! | [`scheme`] | Steel `SteelVal`, owned by the engine thread | one invocation at a time |
//! | `python` (feature) | reference-counted `PyObject` | one invocation at a time (GIL) |
//! | `ruby` (feature) | CRuby `VALUE`, owned by the interpreter thread | one invocation at a time |

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::servlet::ServletError;

mod capability;
mod driver;
mod lifecycle;
pub mod native;
mod pinned;
#[cfg(feature = "python")]
pub mod python;
mod registry;
pub mod rhai;
#[cfg(feature = "ruby")]
pub mod ruby;
pub mod scheme;

pub use capability::Capability;
pub use driver::{InvocationReport, run_servlet};
pub use lifecycle::Lifecycle;
pub use registry::AdapterRegistry;

/// A loaded servlet, ready to be invoked any number of times.
pub trait GuestServlet: Send + Sync {
    /// Runs the servlet's entry point against the lent capability.
    fn invoke(&self, capability: &Capability) -> Result<(), GuestError>;
}

/// One embedded guest runtime.
pub trait GuestAdapter: Send + Sync {
    /// Short identifier used in configuration (`"rhai"`, `"python"`).
    fn name(&self) -> &'static str;

    /// Servlet file extensions this adapter claims, without the dot.
    fn extensions(&self) -> &'static [&'static str];

    /// Starts the runtime and registers native callables.
    ///
    /// Runs at most once per process; later calls are no-ops.
    fn module_init(&self) -> Result<(), AdapterError>;

    /// Shuts the runtime down. A no-op if it never started or already stopped.
    fn module_cleanup(&self);

    /// Loads the servlet at `path` into its own namespace.
    fn load_servlet(&self, path: &Path) -> Result<Arc<dyn GuestServlet>, AdapterError>;
}

/// Why a guest invocation did not return normally.
#[derive(Debug, Error)]
pub enum GuestError {
    #[error(transparent)]
    Servlet(#[from] ServletError),

    /// The guest raised an error of its own (exception, script error).
    #[error("servlet raised: {0}")]
    Raised(String),
}

/// Errors from starting a runtime or loading a servlet.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{adapter} runtime failed to start: {reason}")]
    Init { adapter: &'static str, reason: String },

    #[error("{adapter} runtime is not running")]
    NotRunning { adapter: &'static str },

    #[error("failed to read servlet {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to load servlet {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("servlet {path} does not define a `run` entry point")]
    MissingEntryPoint { path: PathBuf },

    #[error("no guest adapter for {path}")]
    NoAdapter { path: PathBuf },

    #[error("unknown guest adapter `{name}`")]
    UnknownAdapter { name: String },
}
