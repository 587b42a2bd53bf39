//! Servlets written in Ruby, through an embedded CRuby interpreter.
//!
//! Enabled by the `ruby` cargo feature. A servlet is a file defining
//! `run(s)`; the protocol functions are global:
//!
//! ```ruby
//! def run(s)
//!   set_header(s, "Content-Type", "text/plain; charset=UTF-8")
//!   rprintf(s, "hello, %s\n", get_arg(s, "name") || "world")
//! end
//! ```
//!
//! `rprintf` formats with `String#%`. Absent arguments and headers are
//! `nil`. Ordering violations raise `RuntimeError`, connection failures
//! `IOError`, and misuse of the handle `ArgumentError`.
//!
//! Each servlet is evaluated into an anonymous module, so its methods and
//! instance variables stay private to it. CRuby must be driven from the
//! thread that started it: the interpreter runs on a thread of its own and
//! invocations take turns on it. Like CPython, it cannot be torn down and
//! started again in-process, so it is started once per process and
//! `module_cleanup` only retires the adapter.

use std::fs;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use magnus::embed::Cleanup;
use magnus::prelude::*;
use magnus::{Error, Ruby, Value, function};
use tracing::debug;

use crate::servlet::ServletError;

use super::pinned::PinnedRuntime;
use super::{AdapterError, Capability, GuestAdapter, GuestError, GuestServlet, Lifecycle};

const NAME: &str = "ruby";

/// Loader and dispatcher for servlet modules, plus the variadic `rprintf`.
const PRELUDE: &str = r#"
$__rservlet_servlets = []

def __rservlet_load(source, file)
  servlet = Module.new
  servlet.extend(servlet)
  servlet.module_eval(source, file)
  return -1 unless servlet.method_defined?(:run)
  $__rservlet_servlets << servlet
  $__rservlet_servlets.size - 1
end

def __rservlet_invoke(index, s)
  $__rservlet_servlets.fetch(index).run(s)
  nil
end

def rprintf(s, format, *args)
  __rservlet_write_formatted(s, args.empty? ? format : format % args)
end
"#;

static INTERPRETER: OnceLock<Result<Arc<PinnedRuntime<Cleanup>>, String>> = OnceLock::new();

/// The servlet handle as Ruby code sees it. Opaque to the guest.
#[magnus::wrap(class = "RServlet::Servlet", free_immediately)]
struct RbServlet {
    capability: Capability,
}

impl RbServlet {
    fn inspect(&self) -> &'static str {
        if self.capability.is_live() {
            "#<RServlet::Servlet>"
        } else {
            "#<RServlet::Servlet (retired)>"
        }
    }
}

fn raise(ruby: &Ruby, err: ServletError) -> Error {
    let class = match err {
        ServletError::OrderingViolation { .. } => ruby.exception_runtime_error(),
        ServletError::WriteFailure(_) => ruby.exception_io_error(),
        ServletError::AdapterFault(_) => ruby.exception_arg_error(),
    };
    Error::new(class, err.to_string())
}

fn get_arg(ruby: &Ruby, s: &RbServlet, name: String) -> Result<Option<String>, Error> {
    s.capability.argument(&name).map_err(|e| raise(ruby, e))
}

fn get_method(ruby: &Ruby, s: &RbServlet) -> Result<String, Error> {
    s.capability.method().map_err(|e| raise(ruby, e))
}

fn get_header(ruby: &Ruby, s: &RbServlet, name: String) -> Result<Option<String>, Error> {
    s.capability.header(&name).map_err(|e| raise(ruby, e))
}

fn set_status(ruby: &Ruby, s: &RbServlet, code: i64) -> Result<(), Error> {
    s.capability.set_status(code).map_err(|e| raise(ruby, e))
}

fn set_header(ruby: &Ruby, s: &RbServlet, key: String, value: String) -> Result<(), Error> {
    s.capability
        .set_header(&key, &value)
        .map_err(|e| raise(ruby, e))
}

fn rwrite(ruby: &Ruby, s: &RbServlet, data: String) -> Result<usize, Error> {
    s.capability
        .write(data.as_bytes())
        .map_err(|e| raise(ruby, e))
}

fn write_formatted(ruby: &Ruby, s: &RbServlet, text: String) -> Result<usize, Error> {
    s.capability
        .write_formatted(&text)
        .map_err(|e| raise(ruby, e))
}

fn rflush(ruby: &Ruby, s: &RbServlet) -> Result<(), Error> {
    s.capability.flush().map_err(|e| raise(ruby, e))
}

fn register_api(ruby: &Ruby) -> Result<(), Error> {
    let module = ruby.define_module("RServlet")?;
    let class = module.define_class("Servlet", ruby.class_object())?;
    class.define_method("inspect", magnus::method!(RbServlet::inspect, 0))?;

    ruby.define_global_function("get_arg", function!(get_arg, 2));
    ruby.define_global_function("get_method", function!(get_method, 1));
    ruby.define_global_function("get_header", function!(get_header, 2));
    ruby.define_global_function("set_status", function!(set_status, 2));
    ruby.define_global_function("set_header", function!(set_header, 3));
    ruby.define_global_function("rwrite", function!(rwrite, 2));
    ruby.define_global_function("__rservlet_write_formatted", function!(write_formatted, 2));
    ruby.define_global_function("rflush", function!(rflush, 1));
    ruby.eval::<Value>(PRELUDE)?;
    Ok(())
}

/// Starts CRuby on its own thread, once per process.
fn interpreter() -> Result<Arc<PinnedRuntime<Cleanup>>, AdapterError> {
    INTERPRETER
        .get_or_init(|| {
            PinnedRuntime::spawn(NAME, || {
                // SAFETY: this is the only place the interpreter is started,
                // and every later Ruby call runs on this same thread.
                let cleanup = unsafe { magnus::embed::init() };
                let ruby = Ruby::get().map_err(|e| e.to_string())?;
                register_api(&ruby).map_err(|e| e.to_string())?;
                Ok(cleanup)
            })
            .map(Arc::new)
            .map_err(|e| e.to_string())
        })
        .clone()
        .map_err(|reason| AdapterError::Init {
            adapter: NAME,
            reason,
        })
}

/// The CRuby guest runtime.
#[derive(Default)]
pub struct RubyAdapter {
    lifecycle: Lifecycle,
}

impl RubyAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluates a servlet from source text. `origin` names it in errors.
    pub fn load_source(
        &self,
        origin: &Path,
        source: &str,
    ) -> Result<Arc<dyn GuestServlet>, AdapterError> {
        if !self.lifecycle.is_running() {
            return Err(AdapterError::NotRunning { adapter: NAME });
        }
        let runtime = interpreter()?;
        let source = source.to_owned();
        let file = origin.display().to_string();

        let loaded = runtime
            .run(move |_: &mut Cleanup| -> Result<i64, String> {
                let ruby = Ruby::get().map_err(|e| e.to_string())?;
                ruby.module_kernel()
                    .funcall("__rservlet_load", (source, file))
                    .map_err(|e| e.to_string())
            })
            .ok_or(AdapterError::NotRunning { adapter: NAME })?
            .map_err(|reason| AdapterError::Load {
                path: origin.to_path_buf(),
                reason,
            })?;

        let Ok(index) = usize::try_from(loaded) else {
            return Err(AdapterError::MissingEntryPoint {
                path: origin.to_path_buf(),
            });
        };
        debug!(path = %origin.display(), index, "ruby servlet loaded");
        Ok(Arc::new(RubyServlet { runtime, index }))
    }
}

impl GuestAdapter for RubyAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["rb"]
    }

    fn module_init(&self) -> Result<(), AdapterError> {
        self.lifecycle.start(NAME, || interpreter().map(|_| ()))
    }

    fn module_cleanup(&self) {
        self.lifecycle.stop(NAME, || {});
    }

    fn load_servlet(&self, path: &Path) -> Result<Arc<dyn GuestServlet>, AdapterError> {
        let source = fs::read_to_string(path).map_err(|source| AdapterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.load_source(path, &source)
    }
}

struct RubyServlet {
    runtime: Arc<PinnedRuntime<Cleanup>>,
    /// Position of the servlet's module in the interpreter's servlet list.
    index: usize,
}

impl GuestServlet for RubyServlet {
    fn invoke(&self, capability: &Capability) -> Result<(), GuestError> {
        let handle = RbServlet {
            capability: capability.clone(),
        };
        let index = self.index;
        self.runtime
            .run(move |_: &mut Cleanup| -> Result<(), String> {
                let ruby = Ruby::get().map_err(|e| e.to_string())?;
                ruby.module_kernel()
                    .funcall::<_, _, Value>("__rservlet_invoke", (index, handle))
                    .map_err(|e| e.to_string())?;
                Ok(())
            })
            .ok_or_else(|| GuestError::Raised(format!("{NAME} runtime is not running")))?
            .map_err(GuestError::Raised)
    }
}
