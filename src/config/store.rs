//! Shared handle to the configuration document.
//!
//! One mutex guards the document and is held across the flush, so
//! concurrent writers (parallel add-on groups) are serialized and a
//! mutation is on disk before `update` returns.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{Config, StatusEntry, STATUS_ACTIVE, STATUS_DELETED_OR_NOT_EXIST};
use crate::Result;

/// Read/write handle shared by every component
#[derive(Clone, Debug)]
pub struct Store {
    inner: Arc<Mutex<Config>>,
}

impl Store {
    /// Wrap an already validated document
    pub fn new(cfg: Config) -> Self {
        Self {
            inner: Arc::new(Mutex::new(cfg)),
        }
    }

    /// Load, apply environment overrides, validate, then flush the result.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Config::load(path)?;
        cfg.apply_env_overrides()?;
        cfg.validate_and_set_defaults()?;
        cfg.sync()?;
        Ok(Self::new(cfg))
    }

    /// Run `f` against the current document
    pub fn read<R>(&self, f: impl FnOnce(&Config) -> R) -> R {
        f(&self.inner.lock())
    }

    /// Copy of the current document
    pub fn snapshot(&self) -> Config {
        self.inner.lock().clone()
    }

    /// Mutate the document and flush it before releasing the lock.
    ///
    /// A failed flush is logged and otherwise ignored; the next successful
    /// flush supersedes it.
    pub fn update<R>(&self, f: impl FnOnce(&mut Config) -> R) -> R {
        let mut guard = self.inner.lock();
        let out = f(&mut guard);
        if let Err(e) = guard.sync() {
            warn!(path = %guard.config_path, error = %e, "failed to sync config");
        }
        out
    }

    /// Flush without mutating, surfacing the error
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().sync()
    }

    /// Push a cluster status onto the trail (newest first) and flip
    /// `status.up` on `ACTIVE` / `DELETED/NOT-EXIST`.
    pub fn record_status(&self, status: &str) {
        self.update(|cfg| {
            cfg.status.cluster_status_current = status.to_string();
            match status {
                STATUS_ACTIVE => cfg.status.up = true,
                STATUS_DELETED_OR_NOT_EXIST => cfg.status.up = false,
                _ => {}
            }
            cfg.status.cluster_status.insert(
                0,
                StatusEntry {
                    time: Utc::now(),
                    status: status.to_string(),
                },
            );
        });
        debug!(status = %status, "recorded cluster status");
    }
}
