//! Mount table: maps request paths to loaded servlets.
//!
//! Two pattern styles are supported:
//!
//! | Mount       | Example match            |
//! |-------------|--------------------------|
//! | `/hello`    | `/hello`                 |
//! | `/files/*`  | `/files`, `/files/a/b`   |
//!
//! Trailing slashes are normalized on both mounts and incoming paths, so
//! `/hello/` and `/hello` are equivalent. An exact mount always beats a
//! wildcard; among wildcards the longest prefix wins.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::adapter::{AdapterError, AdapterRegistry, GuestServlet};

#[derive(Debug, Error)]
pub enum MountError {
    #[error("mount point {0:?} must start with '/'")]
    NotAbsolute(String),

    #[error("mount point {0:?} is already taken")]
    Duplicate(String),

    #[error(transparent)]
    Load(#[from] AdapterError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    Exact(String),
    Wildcard(String),
}

impl Pattern {
    fn parse(pattern: &str) -> Self {
        if let Some(prefix) = pattern.strip_suffix("/*") {
            return Pattern::Wildcard(normalize(prefix).to_string());
        }
        Pattern::Exact(normalize(pattern).to_string())
    }

    fn matches(&self, path: &str) -> bool {
        let path = normalize(path);
        match self {
            Pattern::Exact(p) => p == path,
            Pattern::Wildcard(prefix) if prefix.is_empty() => true,
            Pattern::Wildcard(prefix) => {
                path.strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
            }
        }
    }

    // Exact mounts outrank every wildcard.
    fn specificity(&self) -> usize {
        match self {
            Pattern::Exact(_) => usize::MAX,
            Pattern::Wildcard(prefix) => prefix.len(),
        }
    }
}

fn normalize(path: &str) -> &str {
    if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    }
}

struct Mount {
    point: String,
    pattern: Pattern,
    servlet: Arc<dyn GuestServlet>,
}

/// The servlets this host serves, keyed by mount point.
#[derive(Default)]
pub struct MountTable {
    mounts: Vec<Mount>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounts an already loaded servlet.
    pub fn mount_servlet(
        &mut self,
        point: &str,
        servlet: Arc<dyn GuestServlet>,
    ) -> Result<(), MountError> {
        if !point.starts_with('/') {
            return Err(MountError::NotAbsolute(point.to_string()));
        }
        let pattern = Pattern::parse(point);
        if self.mounts.iter().any(|m| m.pattern == pattern) {
            return Err(MountError::Duplicate(point.to_string()));
        }
        self.mounts.push(Mount {
            point: point.to_string(),
            pattern,
            servlet,
        });
        Ok(())
    }

    /// Loads the servlet at `source` through `registry` and mounts it.
    pub fn mount(
        &mut self,
        registry: &AdapterRegistry,
        point: &str,
        source: &Path,
        adapter: Option<&str>,
    ) -> Result<(), MountError> {
        let servlet = registry.load(source, adapter)?;
        self.mount_servlet(point, servlet)?;
        info!(mount = point, source = %source.display(), "servlet mounted");
        Ok(())
    }

    /// Finds the servlet serving `path`.
    pub fn resolve(&self, path: &str) -> Option<&Arc<dyn GuestServlet>> {
        self.mounts
            .iter()
            .filter(|m| m.pattern.matches(path))
            .max_by_key(|m| m.pattern.specificity())
            .map(|m| &m.servlet)
    }

    pub fn points(&self) -> impl Iterator<Item = &str> + '_ {
        self.mounts.iter().map(|m| m.point.as_str())
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}
