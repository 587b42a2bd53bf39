//! Servlets written in Scheme, run by the [Steel](https://github.com/mattwparas/steel)
//! interpreter.
//!
//! A servlet is a file defining `(run s)`. The protocol functions take the
//! handle as their first argument and use the same names as every other
//! adapter:
//!
//! ```scheme
//! (define (run s)
//!   (set_header s "Content-Type" "text/plain; charset=UTF-8")
//!   (let ((name (get_arg s "name")))
//!     (rprintf s (string-append "hello, " (if name name "world") "\n"))))
//! ```
//!
//! Absent arguments and headers come back as `#f`. `rprintf` takes text the
//! servlet already rendered (`string-append`, `to-string`). Protocol errors
//! are raised as Steel errors.
//!
//! The engine is built once, with every native function registered, on a
//! thread of its own: Steel values are not `Send`. Each servlet is evaluated
//! inside its own `let` so its definitions stay private, and invocations run
//! one at a time on that thread.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use steel::rerrs::{ErrorKind, SteelErr};
use steel::rvals::{Custom, IntoSteelVal};
use steel::steel_vm::engine::Engine;
use steel::steel_vm::register_fn::RegisterFn;
use tracing::debug;

use crate::servlet::ServletError;

use super::pinned::PinnedRuntime;
use super::{AdapterError, Capability, GuestAdapter, GuestError, GuestServlet, Lifecycle};

const NAME: &str = "scheme";

type SteelResult<T> = Result<T, SteelErr>;

impl Custom for Capability {}

/// The Steel guest runtime.
#[derive(Default)]
pub struct SchemeAdapter {
    lifecycle: Lifecycle,
    runtime: RwLock<Option<Arc<PinnedRuntime<Engine>>>>,
    next_servlet: AtomicUsize,
}

impl SchemeAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn runtime(&self) -> Result<Arc<PinnedRuntime<Engine>>, AdapterError> {
        self.runtime
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(AdapterError::NotRunning { adapter: NAME })
    }

    /// Evaluates a servlet from source text. `origin` names it in errors.
    pub fn load_source(
        &self,
        origin: &Path,
        source: &str,
    ) -> Result<Arc<dyn GuestServlet>, AdapterError> {
        let runtime = self.runtime()?;
        let name = format!(
            "rservlet-servlet-{}",
            self.next_servlet.fetch_add(1, Ordering::Relaxed)
        );
        // The newline before `run` keeps a trailing comment from swallowing it.
        let program = format!(
            "(define {name} (let ()\n{source}\nrun))\n(define {name}-ok (procedure? {name}))"
        );
        let check = format!("{name}-ok");

        let loaded = runtime
            .run(move |engine| -> Result<bool, String> {
                engine.run(program).map_err(|e| e.to_string())?;
                engine.extract::<bool>(&check).map_err(|e| e.to_string())
            })
            .ok_or(AdapterError::NotRunning { adapter: NAME })?;

        match loaded {
            Ok(true) => {
                debug!(path = %origin.display(), servlet = %name, "scheme servlet loaded");
                Ok(Arc::new(SchemeServlet { runtime, name }))
            }
            Ok(false) => Err(AdapterError::MissingEntryPoint {
                path: origin.to_path_buf(),
            }),
            Err(reason) => Err(AdapterError::Load {
                path: origin.to_path_buf(),
                reason,
            }),
        }
    }
}

impl GuestAdapter for SchemeAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["scm"]
    }

    fn module_init(&self) -> Result<(), AdapterError> {
        self.lifecycle.start(NAME, || {
            let runtime = PinnedRuntime::spawn(NAME, || {
                let mut engine = Engine::new();
                register_api(&mut engine);
                Ok(engine)
            })?;
            *self.runtime.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(runtime));
            Ok(())
        })
    }

    fn module_cleanup(&self) {
        self.lifecycle.stop(NAME, || {
            let runtime = self
                .runtime
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(runtime) = runtime {
                runtime.stop();
            }
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

struct SchemeServlet {
    runtime: Arc<PinnedRuntime<Engine>>,
    /// Global the servlet's `run` procedure is bound to.
    name: String,
}

impl GuestServlet for SchemeServlet {
    fn invoke(&self, capability: &Capability) -> Result<(), GuestError> {
        let capability = capability.clone();
        let name = self.name.clone();
        self.runtime
            .run(move |engine| -> Result<(), String> {
                let handle = capability.into_steelval().map_err(|e| e.to_string())?;
                engine
                    .call_function_by_name_with_args(&name, vec![handle])
                    .map_err(|e| e.to_string())?;
                Ok(())
            })
            .ok_or_else(|| GuestError::Raised(format!("{NAME} runtime is not running")))?
            .map_err(GuestError::Raised)
    }
}

fn register_api(engine: &mut Engine) {
    engine.register_fn("get_arg", |s: Capability, name: String| -> SteelResult<Option<String>> {
        s.argument(&name).map_err(raise)
    });
    engine.register_fn("get_method", |s: Capability| -> SteelResult<String> {
        s.method().map_err(raise)
    });
    engine.register_fn("get_header", |s: Capability, name: String| -> SteelResult<Option<String>> {
        s.header(&name).map_err(raise)
    });
    engine.register_fn("set_status", |s: Capability, code: isize| -> SteelResult<()> {
        let code = i64::try_from(code).unwrap_or(i64::MAX);
        s.set_status(code).map_err(raise)
    });
    engine.register_fn(
        "set_header",
        |s: Capability, key: String, value: String| -> SteelResult<()> {
            s.set_header(&key, &value).map_err(raise)
        },
    );
    engine.register_fn("rwrite", |s: Capability, data: String| -> SteelResult<usize> {
        s.write(data.as_bytes()).map_err(raise)
    });
    engine.register_fn("rprintf", |s: Capability, text: String| -> SteelResult<usize> {
        s.write_formatted(&text).map_err(raise)
    });
    engine.register_fn("rflush", |s: Capability| -> SteelResult<()> {
        s.flush().map_err(raise)
    });
}

fn raise(err: ServletError) -> SteelErr {
    SteelErr::new(ErrorKind::Generic, err.to_string())
}
