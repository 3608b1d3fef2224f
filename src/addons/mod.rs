//! Add-ons: the contract every add-on implements, the registry that runs
//! them, and the plugin shapes that implement them.
//!
//! An add-on only does its own work. The crash-safety bookkeeping
//! (`created` set and flushed before any work, cleared only after a
//! successful delete, the phase state machine) lives in [`registry`], so no
//! plugin can get it wrong.

pub mod cni;
pub mod irsa;
pub mod job;
pub mod lb_app;
pub mod load;
pub mod manifest_app;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;

use crate::abort::StopSignal;
use crate::cluster::ClusterAccess;
use crate::config::{AddOnKind, Store};
use crate::provider::Providers;
use crate::reaper::Reaper;
use crate::stack::StackDriver;
use crate::Result;

pub use registry::Registry;

/// The add-on contract
#[async_trait]
pub trait AddOn: Send + Sync {
    /// Which add-on this is
    fn kind(&self) -> AddOnKind;

    /// Stable name for logs and artifact keys
    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Install. Must be safe to re-run over a partial install.
    async fn create(&self, stop: &StopSignal) -> Result<()>;

    /// Uninstall. Must be safe to re-run over a partial uninstall.
    async fn delete(&self) -> Result<()>;

    /// Post-run collection, after every add-on is up
    async fn aggregate_results(&self) -> Result<()> {
        Ok(())
    }
}

/// Everything a plugin may touch
#[derive(Clone)]
pub struct AddOnContext {
    /// Configuration store
    pub store: Store,
    /// Provider facade
    pub providers: Providers,
    /// Kubernetes access
    pub access: Arc<ClusterAccess>,
    /// Stack driver for add-ons that own stacks
    pub stacks: StackDriver,
    /// Load balancer reaper
    pub reaper: Reaper,
}

impl AddOnContext {
    /// Context for the cluster behind `access`
    pub fn new(store: Store, providers: Providers, access: Arc<ClusterAccess>) -> Self {
        let stacks = StackDriver::new(store.clone(), providers.stacks.clone());
        let reaper = Reaper::new(providers.elb.clone());
        Self {
            store,
            providers,
            access,
            stacks,
            reaper,
        }
    }

    /// Kubernetes client
    pub fn client(&self) -> &kube::Client {
        &self.access.client
    }

    /// Namespace configured for `kind`
    pub fn namespace(&self, kind: AddOnKind) -> String {
        self.store.read(|c| kind.common(c).namespace.clone())
    }
}
