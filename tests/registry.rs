//! Add-on registry scheduling with scripted add-ons.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use eks_harness::abort::StopSignal;
use eks_harness::addons::{AddOn, Registry};
use eks_harness::config::{AddOnKind, AddOnPhase, Config, Store};
use eks_harness::{Error, Result};

type Log = Arc<Mutex<Vec<String>>>;

struct Scripted {
    kind: AddOnKind,
    fail_create: bool,
    log: Log,
}

#[async_trait]
impl AddOn for Scripted {
    fn kind(&self) -> AddOnKind {
        self.kind
    }

    async fn create(&self, _stop: &StopSignal) -> Result<()> {
        self.log.lock().push(format!("create {}", self.kind));
        tokio::task::yield_now().await;
        if self.fail_create {
            return Err(Error::health("metrics API never became available"));
        }
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.log.lock().push(format!("delete {}", self.kind));
        Ok(())
    }
}

fn scripted(kind: AddOnKind, fail_create: bool, log: &Log) -> Arc<dyn AddOn> {
    Arc::new(Scripted {
        kind,
        fail_create,
        log: log.clone(),
    })
}

fn store(dir: &std::path::Path, enabled: &[AddOnKind]) -> Store {
    let mut cfg = Config {
        name: "test-001".into(),
        config_path: dir.join("test-001.yaml").display().to_string(),
        ..Default::default()
    };
    for kind in enabled {
        let common = kind.common_mut(&mut cfg);
        common.enable = true;
        common.reset_phase();
    }
    Store::new(cfg)
}

const GROUP: [AddOnKind; 3] = [
    AddOnKind::ClusterAutoscaler,
    AddOnKind::MetricsServer,
    AddOnKind::Overprovisioning,
];

// =============================================================================
// Story: parallel group
// =============================================================================

/// Story: all three group members install together
#[tokio::test]
async fn story_group_members_all_installed() {
    let dir = tempfile::tempdir().unwrap();
    let log = Log::default();
    let store = store(dir.path(), &GROUP);
    let group: Vec<_> = GROUP.iter().map(|k| scripted(*k, false, &log)).collect();
    let registry = Registry::new(store.clone(), vec![], vec![group.clone()]);

    registry.create_group(&group, &StopSignal::new()).await.unwrap();

    let cfg = Config::load(dir.path().join("test-001.yaml")).unwrap();
    for kind in GROUP {
        assert!(kind.common(&cfg).created, "{kind} not installed");
        assert_eq!(kind.common(&cfg).phase, AddOnPhase::Created);
    }
}

/// Story: metrics-server fails; its siblings still finish installed and
/// the group reports the metrics-server error. Down later removes all
/// three, including the failed one.
#[tokio::test]
async fn story_group_failure_is_the_failing_members_error() {
    let dir = tempfile::tempdir().unwrap();
    let log = Log::default();
    let store = store(dir.path(), &GROUP);
    let group: Vec<_> = GROUP
        .iter()
        .map(|k| scripted(*k, *k == AddOnKind::MetricsServer, &log))
        .collect();
    let registry = Registry::new(store.clone(), vec![], vec![group.clone()]);

    let err = registry
        .create_group(&group, &StopSignal::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("metrics-server"), "{err}");

    let cfg = store.snapshot();
    assert_eq!(AddOnKind::ClusterAutoscaler.common(&cfg).phase, AddOnPhase::Created);
    assert_eq!(AddOnKind::Overprovisioning.common(&cfg).phase, AddOnPhase::Created);
    assert_eq!(AddOnKind::MetricsServer.common(&cfg).phase, AddOnPhase::Failed);

    registry.delete_all().await.unwrap();
    let deletes = log.lock().iter().filter(|l| l.starts_with("delete")).count();
    assert_eq!(deletes, 3);
    let cfg = store.snapshot();
    assert!(GROUP.iter().all(|k| !k.common(&cfg).created));
}

// =============================================================================
// Story: disabled cascade
// =============================================================================

/// Story: a disabled tester is skipped entirely on the way up and on the
/// way down, while its enabled neighbours run in order
#[tokio::test]
async fn story_disabled_tester_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let log = Log::default();
    let store = store(dir.path(), &[AddOnKind::NlbHelloWorld, AddOnKind::JobsPi]);
    let testers = vec![
        scripted(AddOnKind::NlbHelloWorld, false, &log),
        scripted(AddOnKind::Alb2048, false, &log),
        scripted(AddOnKind::JobsPi, false, &log),
    ];
    let registry = Registry::new(store.clone(), testers.clone(), vec![]);

    for t in &testers {
        registry.create(t.as_ref(), &StopSignal::new()).await.unwrap();
    }
    assert!(!store.read(|c| AddOnKind::Alb2048.common(c).created));

    registry.delete_all().await.unwrap();
    assert_eq!(
        *log.lock(),
        vec![
            "create nlb-hello-world",
            "create jobs-pi",
            "delete jobs-pi",
            "delete nlb-hello-world",
        ]
    );
}
