use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use super::{AdapterError, GuestAdapter, GuestServlet};

/// The guest adapters available to this process.
///
/// Runtimes start lazily, the first time a servlet needs them, and stop in
/// reverse registration order on [`shutdown`](Self::shutdown).
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn GuestAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn GuestAdapter>) {
        debug!(adapter = adapter.name(), "guest adapter registered");
        self.adapters.push(adapter);
    }

    /// Looks an adapter up by its configuration name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn GuestAdapter>> {
        self.adapters.iter().find(|a| a.name() == name)
    }

    /// Picks the adapter that claims the file extension of `path`.
    pub fn for_path(&self, path: &Path) -> Option<&Arc<dyn GuestAdapter>> {
        let ext = path.extension()?.to_str()?;
        self.adapters
            .iter()
            .find(|a| a.extensions().iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.adapters.iter().map(|a| a.name())
    }

    /// Loads a servlet, starting its runtime if needed.
    ///
    /// `adapter` names the runtime explicitly; otherwise the file extension decides.
    pub fn load(
        &self,
        path: &Path,
        adapter: Option<&str>,
    ) -> Result<Arc<dyn GuestServlet>, AdapterError> {
        let runtime = match adapter {
            Some(name) => self.get(name).ok_or_else(|| AdapterError::UnknownAdapter {
                name: name.to_owned(),
            })?,
            None => self.for_path(path).ok_or_else(|| AdapterError::NoAdapter {
                path: path.to_path_buf(),
            })?,
        };
        runtime.module_init()?;
        let servlet = runtime.load_servlet(path)?;
        info!(adapter = runtime.name(), path = %path.display(), "servlet loaded");
        Ok(servlet)
    }

    /// Stops every runtime that was started.
    pub fn shutdown(&self) {
        for adapter in self.adapters.iter().rev() {
            adapter.module_cleanup();
        }
    }
}
