//! Servlets written in Python, through an embedded CPython interpreter.
//!
//! Enabled by the `python` cargo feature. A servlet is a module defining
//! `run(s)`; the protocol functions live in the `rservlet` module:
//!
//! ```python
//! from rservlet import get_arg, set_header, rprintf
//!
//! def run(s):
//!     set_header(s, "Content-Type", "text/plain; charset=UTF-8")
//!     rprintf(s, "hello, %s\n", get_arg(s, "name") or "world")
//! ```
//!
//! `rprintf` formats with the `%` operator. Absent arguments and headers are
//! `None`. Ordering violations raise `RuntimeError`, connection failures
//! `OSError`, and misuse of the handle `ValueError`.
//!
//! CPython has one interpreter lock, so Python invocations run one at a
//! time. The lock is released while a write waits on the connection.
//! The interpreter cannot be finalized and re-initialized in-process;
//! `module_cleanup` retires the adapter but leaves the interpreter alive.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pyo3::exceptions::{PyIOError, PyRuntimeError, PyTypeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyString, PyTuple};
use tracing::{debug, info};

use crate::servlet::ServletError;

use super::{AdapterError, Capability, GuestAdapter, GuestError, GuestServlet, Lifecycle};

const NAME: &str = "python";

static NEXT_MODULE: AtomicUsize = AtomicUsize::new(0);

/// The servlet handle as Python code sees it. Opaque to the guest.
#[pyclass(name = "Servlet", module = "rservlet", frozen)]
struct PyServlet {
    capability: Capability,
}

#[pymethods]
impl PyServlet {
    fn __repr__(&self) -> &'static str {
        if self.capability.is_live() {
            "<rservlet.Servlet>"
        } else {
            "<rservlet.Servlet (retired)>"
        }
    }
}

fn raise(err: ServletError) -> PyErr {
    match err {
        ServletError::OrderingViolation { .. } => PyRuntimeError::new_err(err.to_string()),
        ServletError::WriteFailure(_) => PyIOError::new_err(err.to_string()),
        ServletError::AdapterFault(_) => PyValueError::new_err(err.to_string()),
    }
}

#[pyfunction]
fn get_arg(s: &Bound<'_, PyServlet>, name: &str) -> PyResult<Option<String>> {
    s.get().capability.argument(name).map_err(raise)
}

#[pyfunction]
fn get_method(s: &Bound<'_, PyServlet>) -> PyResult<String> {
    s.get().capability.method().map_err(raise)
}

#[pyfunction]
fn get_header(s: &Bound<'_, PyServlet>, name: &str) -> PyResult<Option<String>> {
    s.get().capability.header(name).map_err(raise)
}

#[pyfunction]
fn set_status(s: &Bound<'_, PyServlet>, code: i64) -> PyResult<()> {
    s.get().capability.set_status(code).map_err(raise)
}

#[pyfunction]
fn set_header(s: &Bound<'_, PyServlet>, key: &str, value: &str) -> PyResult<()> {
    s.get().capability.set_header(key, value).map_err(raise)
}

/// Writes `str` (as UTF-8) or `bytes` unchanged.
#[pyfunction]
fn rwrite(py: Python<'_>, s: &Bound<'_, PyServlet>, data: &Bound<'_, PyAny>) -> PyResult<usize> {
    let capability = &s.get().capability;
    if let Ok(bytes) = data.downcast::<PyBytes>() {
        let bytes = bytes.as_bytes();
        return py.allow_threads(|| capability.write(bytes)).map_err(raise);
    }
    if let Ok(text) = data.downcast::<PyString>() {
        let text = text.to_cow()?;
        return py
            .allow_threads(|| capability.write(text.as_bytes()))
            .map_err(raise);
    }
    Err(PyTypeError::new_err("rwrite expects str or bytes"))
}

#[pyfunction]
#[pyo3(signature = (s, format, *args))]
fn rprintf(
    py: Python<'_>,
    s: &Bound<'_, PyServlet>,
    format: &Bound<'_, PyString>,
    args: &Bound<'_, PyTuple>,
) -> PyResult<usize> {
    let rendered: String = if args.is_empty() {
        format.to_cow()?.into_owned()
    } else {
        format.rem(args)?.extract()?
    };
    let capability = &s.get().capability;
    py.allow_threads(|| capability.write_formatted(&rendered))
        .map_err(raise)
}

#[pyfunction]
fn rflush(py: Python<'_>, s: &Bound<'_, PyServlet>) -> PyResult<()> {
    let capability = &s.get().capability;
    py.allow_threads(|| capability.flush()).map_err(raise)
}

fn populate(module: &Bound<'_, PyModule>) -> PyResult<()> {
    module.add_class::<PyServlet>()?;
    module.add_function(wrap_pyfunction!(get_arg, module)?)?;
    module.add_function(wrap_pyfunction!(get_method, module)?)?;
    module.add_function(wrap_pyfunction!(get_header, module)?)?;
    module.add_function(wrap_pyfunction!(set_status, module)?)?;
    module.add_function(wrap_pyfunction!(set_header, module)?)?;
    module.add_function(wrap_pyfunction!(rwrite, module)?)?;
    module.add_function(wrap_pyfunction!(rprintf, module)?)?;
    module.add_function(wrap_pyfunction!(rflush, module)?)?;
    Ok(())
}

/// The CPython guest runtime.
#[derive(Default)]
pub struct PythonAdapter {
    lifecycle: Lifecycle,
}

impl PythonAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a servlet from source text into a fresh module.
    pub fn load_source(
        &self,
        origin: &Path,
        source: &str,
    ) -> Result<Arc<dyn GuestServlet>, AdapterError> {
        if !self.lifecycle.is_running() {
            return Err(AdapterError::NotRunning { adapter: NAME });
        }
        let load_error = |e: PyErr| AdapterError::Load {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        };
        let module_name = format!(
            "rservlet_servlet_{}",
            NEXT_MODULE.fetch_add(1, Ordering::Relaxed)
        );
        let file_name = origin.display().to_string();

        Python::with_gil(|py| -> Result<Arc<dyn GuestServlet>, AdapterError> {
            let module = PyModule::from_code_bound(py, source, &file_name, &module_name)
                .map_err(load_error)?;
            let run = match module.getattr("run") {
                Ok(run) if run.is_callable() => run,
                _ => {
                    return Err(AdapterError::MissingEntryPoint {
                        path: origin.to_path_buf(),
                    });
                }
            };
            debug!(path = %file_name, module = %module_name, "python servlet loaded");
            Ok(Arc::new(PythonServlet { run: run.unbind() }))
        })
    }
}

impl GuestAdapter for PythonAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["py"]
    }

    fn module_init(&self) -> Result<(), AdapterError> {
        self.lifecycle.start(NAME, || {
            pyo3::prepare_freethreaded_python();
            Python::with_gil(|py| -> PyResult<()> {
                let module = PyModule::new_bound(py, "rservlet")?;
                populate(&module)?;
                py.import_bound("sys")?
                    .getattr("modules")?
                    .set_item("rservlet", module)?;
                Ok(())
            })
            .map_err(|e| AdapterError::Init {
                adapter: NAME,
                reason: e.to_string(),
            })
        })
    }

    fn module_cleanup(&self) {
        self.lifecycle.stop(NAME, || {
            info!("python interpreter stays resident until process exit");
        });
    }

    fn load_servlet(&self, path: &Path) -> Result<Arc<dyn GuestServlet>, AdapterError> {
        let source = fs::read_to_string(path).map_err(|source| AdapterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.load_source(path, &source)
    }
}

struct PythonServlet {
    run: Py<PyAny>,
}

impl GuestServlet for PythonServlet {
    fn invoke(&self, capability: &Capability) -> Result<(), GuestError> {
        Python::with_gil(|py| -> PyResult<()> {
            let handle = Bound::new(
                py,
                PyServlet {
                    capability: capability.clone(),
                },
            )?;
            self.run.call1(py, (handle,))?;
            Ok(())
        })
        .map_err(|e| GuestError::Raised(e.to_string()))
    }
}
