//! Add-on registry: declaration order, parallel groups, lifecycle bookkeeping.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use super::cni::CniVpc;
use super::irsa::Irsa;
use super::job::BatchJob;
use super::lb_app::LbApp;
use super::load::LoadGenerator;
use super::manifest_app::ManifestApp;
use super::{AddOn, AddOnContext};
use crate::abort::StopSignal;
use crate::config::{AddOnKind, AddOnPhase, Store};
use crate::{Error, Result};

/// Sequential add-ons, in install order
pub const TESTER_ORDER: [AddOnKind; 11] = [
    AddOnKind::CniVpc,
    AddOnKind::KubernetesDashboard,
    AddOnKind::NlbHelloWorld,
    AddOnKind::Alb2048,
    AddOnKind::JobsPi,
    AddOnKind::JobsEcho,
    AddOnKind::CronJobs,
    AddOnKind::ConfigMaps,
    AddOnKind::Secrets,
    AddOnKind::Stresser,
    AddOnKind::Irsa,
];

/// Add-ons installed concurrently after the sequential ones
pub const PARALLEL_GROUPS: [&[AddOnKind]; 1] = [&[
    AddOnKind::ClusterAutoscaler,
    AddOnKind::MetricsServer,
    AddOnKind::Overprovisioning,
]];

/// Runs add-ons and keeps their `created` flag and phase honest
pub struct Registry {
    store: Store,
    testers: Vec<Arc<dyn AddOn>>,
    groups: Vec<Vec<Arc<dyn AddOn>>>,
}

fn plugin(ctx: &AddOnContext, kind: AddOnKind) -> Arc<dyn AddOn> {
    let ctx = ctx.clone();
    match kind {
        AddOnKind::CniVpc => Arc::new(CniVpc::new(ctx)),
        AddOnKind::NlbHelloWorld => Arc::new(LbApp::nlb(ctx)),
        AddOnKind::Alb2048 => Arc::new(LbApp::alb(ctx)),
        AddOnKind::JobsPi | AddOnKind::JobsEcho | AddOnKind::CronJobs => Arc::new(BatchJob::new(ctx, kind)),
        AddOnKind::ConfigMaps | AddOnKind::Secrets | AddOnKind::Stresser => {
            Arc::new(LoadGenerator::new(ctx, kind))
        }
        AddOnKind::Irsa => Arc::new(Irsa::new(ctx)),
        AddOnKind::KubernetesDashboard
        | AddOnKind::ClusterAutoscaler
        | AddOnKind::MetricsServer
        | AddOnKind::Overprovisioning => Arc::new(ManifestApp::new(ctx, kind)),
    }
}

impl Registry {
    /// Registry over explicit add-ons
    pub fn new(store: Store, testers: Vec<Arc<dyn AddOn>>, groups: Vec<Vec<Arc<dyn AddOn>>>) -> Self {
        Self {
            store,
            testers,
            groups,
        }
    }

    /// Every known add-on in its declared place
    pub fn standard(ctx: &AddOnContext) -> Self {
        let testers = TESTER_ORDER.iter().map(|k| plugin(ctx, *k)).collect();
        let groups = PARALLEL_GROUPS
            .iter()
            .map(|g| g.iter().map(|k| plugin(ctx, *k)).collect())
            .collect();
        Self::new(ctx.store.clone(), testers, groups)
    }

    /// Sequential add-ons in install order
    pub fn testers(&self) -> &[Arc<dyn AddOn>] {
        &self.testers
    }

    /// Parallel groups in install order
    pub fn groups(&self) -> &[Vec<Arc<dyn AddOn>>] {
        &self.groups
    }

    /// Create one add-on through its lifecycle. Disabled add-ons and ones
    /// already created by an earlier run are skipped.
    pub async fn create(&self, addon: &dyn AddOn, stop: &StopSignal) -> Result<()> {
        let kind = addon.kind();
        let common = self.store.read(|c| kind.common(c).clone());
        if !common.enable {
            debug!(addon = %kind, "disabled, skipping");
            return Ok(());
        }
        if common.created && common.phase == AddOnPhase::Created {
            info!(addon = %kind, "already created, skipping");
            return Ok(());
        }

        // flushed before any work so Down can always find it
        self.store.update(|c| kind.common_mut(c).begin_create());
        info!(addon = %kind, "creating add-on");
        let res = addon.create(stop).await;
        self.store.update(|c| kind.common_mut(c).finish_create(res.is_ok()));

        match res {
            Ok(()) => {
                info!(addon = %kind, "add-on created");
                Ok(())
            }
            Err(e) if e.is_aborted() => Err(e),
            Err(e) => {
                error!(addon = %kind, error = %e, "add-on create failed");
                Err(Error::add_on(addon.name(), e.to_string()))
            }
        }
    }

    /// Create every member of a group concurrently. Every member runs to
    /// completion; the first failure in member order is returned.
    pub async fn create_group(&self, group: &[Arc<dyn AddOn>], stop: &StopSignal) -> Result<()> {
        let results = join_all(group.iter().map(|a| self.create(a.as_ref(), stop))).await;
        let mut first = None;
        for (addon, res) in group.iter().zip(results) {
            if let Err(e) = res {
                if first.is_none() {
                    first = Some(e);
                } else {
                    warn!(addon = %addon.kind(), error = %e, "additional group failure");
                }
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Delete one add-on if an earlier create marked it created
    pub async fn delete(&self, addon: &dyn AddOn) -> Result<()> {
        let kind = addon.kind();
        if !self.store.read(|c| kind.common(c).created) {
            debug!(addon = %kind, "not created, skipping delete");
            return Ok(());
        }
        self.store.update(|c| kind.common_mut(c).begin_delete());
        info!(addon = %kind, "deleting add-on");
        let res = addon.delete().await;
        self.store.update(|c| kind.common_mut(c).finish_delete(res.is_ok()));
        match res {
            Ok(()) => {
                info!(addon = %kind, "add-on deleted");
                Ok(())
            }
            Err(e) => {
                error!(addon = %kind, error = %e, "add-on delete failed");
                Err(Error::add_on(addon.name(), e.to_string()))
            }
        }
    }

    /// Delete groups in reverse (members concurrently), then sequential
    /// add-ons in reverse. Every failure is collected; nothing short-circuits.
    pub async fn delete_all(&self) -> Result<()> {
        let mut errs = Vec::new();
        for group in self.groups.iter().rev() {
            let results = join_all(group.iter().map(|a| self.delete(a.as_ref()))).await;
            errs.extend(results.into_iter().filter_map(|r| r.err()).map(|e| e.to_string()));
        }
        for addon in self.testers.iter().rev() {
            if let Err(e) = self.delete(addon.as_ref()).await {
                errs.push(e.to_string());
            }
        }
        if errs.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(errs))
        }
    }

    /// Run `aggregate_results` of every created add-on. Failures are logged.
    pub async fn aggregate_all(&self) {
        let all = self.testers.iter().chain(self.groups.iter().flatten());
        for addon in all {
            let kind = addon.kind();
            if !self.store.read(|c| kind.common(c).created) {
                continue;
            }
            if let Err(e) = addon.aggregate_results().await {
                warn!(addon = %kind, error = %e, "failed to aggregate results");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct Fake {
        kind: AddOnKind,
        fail_create: bool,
        fail_delete: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Fake {
        fn new(kind: AddOnKind, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                kind,
                fail_create: false,
                fail_delete: false,
                log: log.clone(),
            }
        }
    }

    #[async_trait]
    impl AddOn for Fake {
        fn kind(&self) -> AddOnKind {
            self.kind
        }

        async fn create(&self, _stop: &StopSignal) -> Result<()> {
            self.log.lock().push(format!("create {}", self.kind));
            // members of a group interleave here
            tokio::task::yield_now().await;
            if self.fail_create {
                return Err(Error::cluster("deployment never became available"));
            }
            Ok(())
        }

        async fn delete(&self) -> Result<()> {
            self.log.lock().push(format!("delete {}", self.kind));
            if self.fail_delete {
                return Err(Error::cluster("namespace stuck terminating"));
            }
            Ok(())
        }
    }

    fn store(enabled: &[AddOnKind]) -> Store {
        let mut cfg = Config::default();
        for kind in enabled {
            kind.common_mut(&mut cfg).enable = true;
            kind.common_mut(&mut cfg).reset_phase();
        }
        Store::new(cfg)
    }

    fn common(store: &Store, kind: AddOnKind) -> crate::config::AddOnCommon {
        store.read(|c| kind.common(c).clone())
    }

    // =========================================================================
    // Story: parallel group with one failing member
    // =========================================================================

    /// Story: metrics-server fails, the other two still finish created, and
    /// the group reports the metrics-server error
    #[tokio::test]
    async fn story_group_failure_does_not_stop_siblings() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let kinds = [
            AddOnKind::ClusterAutoscaler,
            AddOnKind::MetricsServer,
            AddOnKind::Overprovisioning,
        ];
        let store = store(&kinds);
        let group: Vec<Arc<dyn AddOn>> = kinds
            .iter()
            .map(|k| {
                let mut f = Fake::new(*k, &log);
                f.fail_create = *k == AddOnKind::MetricsServer;
                Arc::new(f) as Arc<dyn AddOn>
            })
            .collect();
        let registry = Registry::new(store.clone(), vec![], vec![group.clone()]);

        let err = registry.create_group(&group, &StopSignal::new()).await.unwrap_err();
        assert!(matches!(&err, Error::AddOn { name, .. } if name == "metrics-server"));

        for kind in [AddOnKind::ClusterAutoscaler, AddOnKind::Overprovisioning] {
            let c = common(&store, kind);
            assert!(c.created);
            assert_eq!(c.phase, AddOnPhase::Created);
        }
        let failed = common(&store, AddOnKind::MetricsServer);
        assert!(failed.created, "failed member must still be cleaned up");
        assert_eq!(failed.phase, AddOnPhase::Failed);
        assert_eq!(log.lock().len(), 3);
    }

    // =========================================================================
    // Story: disabled add-ons are invisible to Up and Down
    // =========================================================================

    /// Story: a disabled add-on is never created and never deleted
    #[tokio::test]
    async fn story_disabled_add_on_is_skipped_both_ways() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = store(&[AddOnKind::JobsPi]);
        let testers: Vec<Arc<dyn AddOn>> = vec![
            Arc::new(Fake::new(AddOnKind::Alb2048, &log)),
            Arc::new(Fake::new(AddOnKind::JobsPi, &log)),
        ];
        let registry = Registry::new(store.clone(), testers.clone(), vec![]);

        for t in &testers {
            registry.create(t.as_ref(), &StopSignal::new()).await.unwrap();
        }
        assert!(!common(&store, AddOnKind::Alb2048).created);
        assert_eq!(common(&store, AddOnKind::Alb2048).phase, AddOnPhase::Disabled);

        registry.delete_all().await.unwrap();
        assert_eq!(*log.lock(), vec!["create jobs-pi", "delete jobs-pi"]);
    }

    // =========================================================================
    // Story: idempotent Up and Down
    // =========================================================================

    /// Story: re-running Up skips created add-ons; re-running Down does nothing
    #[tokio::test]
    async fn story_create_and_delete_are_idempotent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = store(&[AddOnKind::JobsEcho]);
        let addon: Arc<dyn AddOn> = Arc::new(Fake::new(AddOnKind::JobsEcho, &log));
        let registry = Registry::new(store.clone(), vec![addon.clone()], vec![]);

        registry.create(addon.as_ref(), &StopSignal::new()).await.unwrap();
        registry.create(addon.as_ref(), &StopSignal::new()).await.unwrap();
        registry.delete_all().await.unwrap();
        registry.delete_all().await.unwrap();

        assert_eq!(*log.lock(), vec!["create jobs-echo", "delete jobs-echo"]);
        assert_eq!(common(&store, AddOnKind::JobsEcho).phase, AddOnPhase::Deleted);
    }

    /// Story: teardown runs groups first, then testers newest first, and
    /// keeps going past a failure
    #[tokio::test]
    async fn story_delete_order_is_reverse_and_collects_errors() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = store(&[
            AddOnKind::NlbHelloWorld,
            AddOnKind::JobsPi,
            AddOnKind::MetricsServer,
        ]);
        store.update(|c| {
            for k in [AddOnKind::NlbHelloWorld, AddOnKind::JobsPi, AddOnKind::MetricsServer] {
                k.common_mut(c).created = true;
            }
        });
        let mut failing = Fake::new(AddOnKind::JobsPi, &log);
        failing.fail_delete = true;
        let registry = Registry::new(
            store.clone(),
            vec![
                Arc::new(Fake::new(AddOnKind::NlbHelloWorld, &log)),
                Arc::new(failing),
            ],
            vec![vec![Arc::new(Fake::new(AddOnKind::MetricsServer, &log))]],
        );

        let err = registry.delete_all().await.unwrap_err();
        assert!(matches!(&err, Error::Teardown(errs) if errs.len() == 1));
        assert_eq!(
            *log.lock(),
            vec!["delete metrics-server", "delete jobs-pi", "delete nlb-hello-world"]
        );
        assert!(common(&store, AddOnKind::JobsPi).created);
        assert!(!common(&store, AddOnKind::NlbHelloWorld).created);
    }

    #[test]
    fn standard_order_covers_every_kind_once() {
        let mut all: Vec<AddOnKind> = TESTER_ORDER.to_vec();
        for g in PARALLEL_GROUPS {
            all.extend_from_slice(g);
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), AddOnKind::ALL.len());
    }
}
