//! Servlets written in [Rhai](https://rhai.rs).
//!
//! A servlet is a script defining `fn run(s)`. The handle `s` is a
//! [`Capability`] registered under the type name `Servlet`; the protocol
//! functions accept it as their first argument, so both `rwrite(s, "hi")`
//! and `s.rwrite("hi")` work:
//!
//! ```rhai
//! fn run(s) {
//!     set_header(s, "Content-Type", "text/plain; charset=UTF-8");
//!     let name = get_arg(s, "name");
//!     if name == () { name = "world"; }
//!     rprintf(s, `hello, ${name}` + "\n");
//! }
//! ```
//!
//! Backtick strings are raw apart from `${...}`, so a trailing newline has
//! to be appended as a normal string. `rprintf` also takes a format and an
//! array of arguments, filling each `{}` in turn (`{{` and `}}` are literal
//! braces):
//!
//! ```rhai
//! rprintf(s, "{} of {}\n", [done, total]);
//! ```
//!
//! Absent arguments and headers come back as `()`. Protocol errors are
//! raised as Rhai runtime errors and can be caught with `try`/`catch`; that
//! includes write failures once the client has gone away.
//!
//! The engine is built once, when the runtime starts, with every native
//! function registered; each servlet compiles into its own `AST` against
//! that engine. Rhai is built with the `sync` feature, so invocations on
//! different connections run in parallel.

use std::fs;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use rhai::{AST, Array, Blob, Dynamic, Engine, EvalAltResult, INT, Position, Scope};
use tracing::debug;

use crate::servlet::ServletError;

use super::{AdapterError, Capability, GuestAdapter, GuestError, GuestServlet, Lifecycle};

const NAME: &str = "rhai";

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

/// The Rhai guest runtime.
#[derive(Default)]
pub struct RhaiAdapter {
    lifecycle: Lifecycle,
    engine: RwLock<Option<Arc<Engine>>>,
    max_operations: u64,
}

impl RhaiAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the operations a single invocation may run; `0` means unlimited.
    #[must_use]
    pub fn with_max_operations(mut self, limit: u64) -> Self {
        self.max_operations = limit;
        self
    }

    fn engine(&self) -> Result<Arc<Engine>, AdapterError> {
        self.engine
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(AdapterError::NotRunning { adapter: NAME })
    }

    /// Compiles a servlet from source text. `origin` names it in errors.
    pub fn load_source(
        &self,
        origin: &Path,
        source: &str,
    ) -> Result<Arc<dyn GuestServlet>, AdapterError> {
        let engine = self.engine()?;
        let ast = engine.compile(source).map_err(|e| AdapterError::Load {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !ast
            .iter_functions()
            .any(|f| f.name == "run" && f.params.len() == 1)
        {
            return Err(AdapterError::MissingEntryPoint {
                path: origin.to_path_buf(),
            });
        }
        debug!(path = %origin.display(), "rhai servlet compiled");
        Ok(Arc::new(RhaiServlet { engine, ast }))
    }
}

impl GuestAdapter for RhaiAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["rhai"]
    }

    fn module_init(&self) -> Result<(), AdapterError> {
        self.lifecycle.start(NAME, || {
            let mut engine = Engine::new();
            if self.max_operations > 0 {
                engine.set_max_operations(self.max_operations);
            }
            register_api(&mut engine);
            *self.engine.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(engine));
            Ok(())
        })
    }

    fn module_cleanup(&self) {
        self.lifecycle.stop(NAME, || {
            self.engine
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
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

struct RhaiServlet {
    engine: Arc<Engine>,
    ast: AST,
}

impl GuestServlet for RhaiServlet {
    fn invoke(&self, capability: &Capability) -> Result<(), GuestError> {
        self.engine
            .call_fn::<Dynamic>(&mut Scope::new(), &self.ast, "run", (capability.clone(),))
            .map_err(|e| GuestError::Raised(e.to_string()))?;
        Ok(())
    }
}

fn register_api(engine: &mut Engine) {
    engine
        .register_type_with_name::<Capability>("Servlet")
        .register_fn("get_arg", |s: &mut Capability, name: &str| {
            optional(s.argument(name))
        })
        .register_fn("get_method", |s: &mut Capability| -> RhaiResult<String> {
            s.method().map_err(raise)
        })
        .register_fn("get_header", |s: &mut Capability, name: &str| {
            optional(s.header(name))
        })
        .register_fn("set_status", |s: &mut Capability, code: INT| -> RhaiResult<()> {
            s.set_status(code).map_err(raise)
        })
        .register_fn(
            "set_header",
            |s: &mut Capability, key: &str, value: &str| -> RhaiResult<()> {
                s.set_header(key, value).map_err(raise)
            },
        )
        .register_fn("rwrite", |s: &mut Capability, data: &str| {
            written(s.write(data.as_bytes()))
        })
        .register_fn("rwrite", |s: &mut Capability, data: Blob| {
            written(s.write(&data))
        })
        .register_fn("rprintf", |s: &mut Capability, text: &str| {
            written(s.write_formatted(text))
        })
        .register_fn(
            "rprintf",
            |s: &mut Capability, format: &str, args: Array| -> RhaiResult<INT> {
                let text = render(format, &args)?;
                written(s.write_formatted(&text))
            },
        )
        .register_fn("rflush", |s: &mut Capability| -> RhaiResult<()> {
            s.flush().map_err(raise)
        });
}

fn raise(err: ServletError) -> Box<EvalAltResult> {
    runtime_error(err.to_string())
}

fn runtime_error(message: String) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(message.into(), Position::NONE))
}

fn optional(value: Result<Option<String>, ServletError>) -> RhaiResult<Dynamic> {
    value
        .map(|v| v.map_or(Dynamic::UNIT, Dynamic::from))
        .map_err(raise)
}

/// Fills the `{}` placeholders in `format` with `args`, in order.
fn render(format: &str, args: &[Dynamic]) -> RhaiResult<String> {
    let mut out = String::with_capacity(format.len());
    let mut args = args.iter();
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        let next = chars.peek().copied();
        match (c, next) {
            ('{', Some('{')) | ('}', Some('}')) => {
                chars.next();
                out.push(c);
            }
            ('{', Some('}')) => {
                chars.next();
                let arg = args.next().ok_or_else(|| {
                    runtime_error(format!("rprintf: {format:?} has more placeholders than arguments"))
                })?;
                out.push_str(&arg.to_string());
            }
            _ => out.push(c),
        }
    }
    if args.next().is_some() {
        return Err(runtime_error(format!(
            "rprintf: {format:?} has fewer placeholders than arguments"
        )));
    }
    Ok(out)
}

fn written(count: Result<usize, ServletError>) -> RhaiResult<INT> {
    let count = count.map_err(raise)?;
    Ok(INT::try_from(count).unwrap_or(INT::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::run_servlet;
    use crate::servlet::testing::RecordingExchange;

    fn load(source: &str) -> Arc<dyn GuestServlet> {
        let adapter = RhaiAdapter::new();
        adapter.module_init().unwrap();
        adapter.load_source(Path::new("test.rhai"), source).unwrap()
    }

    fn body(wire: &str) -> &str {
        &wire[wire.find("\r\n\r\n").unwrap() + 4..]
    }

    #[test]
    fn mirrors_request_data() {
        let servlet = load(
            r#"
            fn run(s) {
                set_status(s, 200);
                set_header(s, "Content-Type", "text/plain; charset=UTF-8");
                let arg = get_arg(s, "arg");
                if arg != () { rwrite(s, arg + "\n"); }
                s.rwrite(get_method(s) + "\n");
                let missing = get_header(s, "X-Missing");
                if missing == () { rwrite(s, "none\n"); }
                rflush(s);
            }
            "#,
        );
        let (exchange, record) = RecordingExchange::get("/?arg=hello");
        let report = run_servlet(servlet.as_ref(), Box::new(exchange));
        assert!(report.connection_reusable(), "{:?}", report.guest_error);

        let wire = record.wire();
        assert!(wire.contains("Content-Type: text/plain; charset=UTF-8\r\n"));
        assert_eq!(body(&wire), "6\r\nhello\n\r\n4\r\nGET\n\r\n5\r\nnone\n\r\n0\r\n\r\n");
    }

    #[test]
    fn content_length_script() {
        let servlet = load(
            r#"
            fn run(s) {
                let reply = "Testing setting the Content-Length header";
                set_header(s, "Content-Length", `${reply.len()}`);
                rprintf(s, reply);
            }
            "#,
        );
        let (exchange, record) = RecordingExchange::get("/");
        run_servlet(servlet.as_ref(), Box::new(exchange));
        let wire = record.wire();
        assert!(wire.contains("Content-Length: 41\r\n"));
        assert_eq!(body(&wire), "Testing setting the Content-Length header");
    }

    #[test]
    fn ordering_violation_is_catchable() {
        let servlet = load(
            r#"
            fn run(s) {
                rwrite(s, "a");
                try {
                    set_status(s, 404);
                } catch (err) {
                    rwrite(s, "b");
                }
            }
            "#,
        );
        let (exchange, record) = RecordingExchange::get("/");
        let report = run_servlet(servlet.as_ref(), Box::new(exchange));
        assert!(report.guest_error.is_none());
        let wire = record.wire();
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body(&wire), "1\r\na\r\n1\r\nb\r\n0\r\n\r\n");
    }

    #[test]
    fn write_failure_reaches_the_script() {
        let servlet = load(
            r#"
            fn run(s) {
                try {
                    rwrite(s, "x");
                } catch (err) {
                    throw "caught: " + err;
                }
            }
            "#,
        );
        let (exchange, record) = RecordingExchange::get("/");
        record.break_connection();
        let report = run_servlet(servlet.as_ref(), Box::new(exchange));
        assert!(report.write_failed);
        assert!(!report.recovered);
        match report.guest_error {
            Some(GuestError::Raised(message)) => {
                assert!(message.contains("caught: response write failed"), "{message}");
            }
            other => panic!("expected the rethrown error, got {other:?}"),
        }
    }

    #[test]
    fn rprintf_fills_placeholders() {
        let servlet = load(
            r#"
            fn run(s) {
                let n = rprintf(s, "{} of {} {{ok}}\n", [3, "five"]);
                rprintf(s, `${n}` + "\n");
            }
            "#,
        );
        let (exchange, record) = RecordingExchange::get("/");
        let report = run_servlet(servlet.as_ref(), Box::new(exchange));
        assert!(report.guest_error.is_none(), "{:?}", report.guest_error);
        assert_eq!(body(&record.wire()), "F\r\n3 of five {ok}\n\r\n3\r\n15\n\r\n0\r\n\r\n");
    }

    #[test]
    fn rprintf_rejects_mismatched_arguments() {
        for source in [
            r#"fn run(s) { rprintf(s, "{} {}", [1]); }"#,
            r#"fn run(s) { rprintf(s, "{}", [1, 2]); }"#,
        ] {
            let servlet = load(source);
            let (exchange, record) = RecordingExchange::get("/");
            let report = run_servlet(servlet.as_ref(), Box::new(exchange));
            assert!(matches!(report.guest_error, Some(GuestError::Raised(_))), "{source}");
            assert!(record.wire().starts_with("HTTP/1.1 500 "), "{source}");
        }
    }

    #[test]
    fn demo_servlet_ends_lines_with_newlines() {
        let adapter = RhaiAdapter::new();
        adapter.module_init().unwrap();
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/servlets/hello.rhai");
        let servlet = adapter.load_servlet(&path).unwrap();
        let (exchange, record) = RecordingExchange::get("/?name=rhai");
        run_servlet(servlet.as_ref(), Box::new(exchange));
        assert_eq!(body(&record.wire()), "C\r\nhello, rhai\n\r\n0\r\n\r\n");
    }

    #[test]
    fn head_request_counts_without_writing() {
        let servlet = load(
            r#"
            fn run(s) {
                let n = rprintf(s, "twelve bytes");
                set_header(s, "X-Would-Write", `${n}`);
            }
            "#,
        );
        let (exchange, record) = RecordingExchange::new("HEAD", "/").split();
        let report = run_servlet(servlet.as_ref(), Box::new(exchange));
        assert!(report.guest_error.is_none());
        let wire = record.wire();
        assert!(wire.contains("X-Would-Write: 12\r\n"));
        assert_eq!(body(&wire), "");
    }

    #[test]
    fn script_error_before_output_becomes_500() {
        let servlet = load(r#"fn run(s) { throw "nope"; }"#);
        let (exchange, record) = RecordingExchange::get("/");
        let report = run_servlet(servlet.as_ref(), Box::new(exchange));
        assert!(matches!(report.guest_error, Some(GuestError::Raised(_))));
        assert!(report.recovered);
        assert!(record.wire().starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    }

    #[test]
    fn wrong_argument_type_is_a_script_error() {
        let servlet = load(r#"fn run(s) { set_status(s, "teapot"); }"#);
        let (exchange, _record) = RecordingExchange::get("/");
        let report = run_servlet(servlet.as_ref(), Box::new(exchange));
        assert!(matches!(report.guest_error, Some(GuestError::Raised(_))));
    }

    #[test]
    fn blobs_are_written_verbatim() {
        let servlet = load(
            r#"
            fn run(s) {
                let data = blob(3, 0x41);
                rwrite(s, data);
            }
            "#,
        );
        let (exchange, record) = RecordingExchange::get("/");
        run_servlet(servlet.as_ref(), Box::new(exchange));
        assert_eq!(body(&record.wire()), "3\r\nAAA\r\n0\r\n\r\n");
    }

    #[test]
    fn missing_entry_point_is_rejected() {
        let adapter = RhaiAdapter::new();
        adapter.module_init().unwrap();
        let err = adapter
            .load_source(Path::new("x.rhai"), "fn serve(s) {}")
            .err()
            .unwrap();
        assert!(matches!(err, AdapterError::MissingEntryPoint { .. }));
    }

    #[test]
    fn loading_requires_a_running_runtime() {
        let adapter = RhaiAdapter::new();
        let err = adapter
            .load_source(Path::new("x.rhai"), "fn run(s) {}")
            .err()
            .unwrap();
        assert!(matches!(err, AdapterError::NotRunning { .. }));

        adapter.module_init().unwrap();
        adapter.module_cleanup();
        adapter.module_cleanup();
        assert!(adapter.module_init().is_err());
    }

    #[test]
    fn operation_limit_stops_runaway_scripts() {
        let adapter = RhaiAdapter::new().with_max_operations(1_000);
        adapter.module_init().unwrap();
        let servlet = adapter
            .load_source(Path::new("loop.rhai"), "fn run(s) { loop { } }")
            .unwrap();
        let (exchange, _record) = RecordingExchange::get("/");
        let report = run_servlet(servlet.as_ref(), Box::new(exchange));
        assert!(report.recovered);
    }
}
