//! A guest runtime that lives on one thread.
//!
//! Some interpreters (Steel, CRuby) keep thread-affine state and cannot be
//! shared with the blocking pool. Their adapters build the runtime inside a
//! dedicated thread and send it jobs; callers block until the job's result
//! comes back, so invocations against such a runtime run one at a time.

use std::sync::{Mutex, PoisonError, mpsc};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use super::AdapterError;

type Job<R> = Box<dyn FnOnce(&mut R) + Send>;

pub(crate) struct PinnedRuntime<R> {
    adapter: &'static str,
    jobs: Mutex<Option<mpsc::Sender<Job<R>>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<R: 'static> PinnedRuntime<R> {
    /// Spawns the runtime thread and waits for `build` to finish on it.
    pub(crate) fn spawn<B>(adapter: &'static str, build: B) -> Result<Self, AdapterError>
    where
        B: FnOnce() -> Result<R, String> + Send + 'static,
    {
        let (jobs, queue) = mpsc::channel::<Job<R>>();
        let (ready, started) = mpsc::channel::<Result<(), String>>();

        let thread = thread::Builder::new()
            .name(format!("rservlet-{adapter}"))
            .spawn(move || {
                let mut runtime = match build() {
                    Ok(runtime) => {
                        let _ = ready.send(Ok(()));
                        runtime
                    }
                    Err(reason) => {
                        let _ = ready.send(Err(reason));
                        return;
                    }
                };
                while let Ok(job) = queue.recv() {
                    job(&mut runtime);
                }
                debug!(adapter, "runtime thread exiting");
            })
            .map_err(|e| AdapterError::Init {
                adapter,
                reason: e.to_string(),
            })?;

        let failure = match started.recv() {
            Ok(Ok(())) => {
                return Ok(Self {
                    adapter,
                    jobs: Mutex::new(Some(jobs)),
                    thread: Mutex::new(Some(thread)),
                });
            }
            Ok(Err(reason)) => reason,
            Err(_) => "runtime thread died while starting".to_string(),
        };
        let _ = thread.join();
        Err(AdapterError::Init {
            adapter,
            reason: failure,
        })
    }

    /// Runs `job` on the runtime thread and waits for its result.
    ///
    /// `None` once the runtime has been stopped, or if the job panicked.
    pub(crate) fn run<T, F>(&self, job: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut R) -> T + Send + 'static,
    {
        let (reply, result) = mpsc::channel();
        {
            let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            jobs.as_ref()?
                .send(Box::new(move |runtime: &mut R| {
                    let _ = reply.send(job(runtime));
                }))
                .ok()?;
        }
        result.recv().ok()
    }

    /// Closes the job queue and joins the thread. Queued jobs still run.
    pub(crate) fn stop(&self) {
        drop(self.jobs.lock().unwrap_or_else(PoisonError::into_inner).take());
        let thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                warn!(adapter = self.adapter, "runtime thread panicked");
            }
        }
    }
}

impl<R> Drop for PinnedRuntime<R> {
    fn drop(&mut self) {
        // Closing the queue is enough for the thread to exit on its own.
        self.jobs.get_mut().unwrap_or_else(PoisonError::into_inner).take();
    }
}
