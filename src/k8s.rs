//! Kubernetes helpers built on kube-rs.
//!
//! Every object, whether it comes from an embedded manifest or is built in
//! Rust, is applied the same way: server-side apply of a `DynamicObject`
//! with the [`FIELD_MANAGER`] field manager. Waits take the stop signal so
//! an interrupt never leaves a poll loop behind.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use serde::Deserialize;
use tracing::{debug, info, trace};

use crate::abort::{abortable_sleep, abortable_wait, StopSignal};
use crate::{Error, Result, FIELD_MANAGER};

/// Connect timeout for the cluster client
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Read timeout for the cluster client
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Interval between readiness checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const STATUS_TRUE: &str = "True";
const CONDITION_READY: &str = "Ready";
const CONDITION_AVAILABLE: &str = "Available";

/// Build a client from the kubeconfig written by the cluster driver
pub async fn create_client(kubeconfig: &Path) -> Result<Client> {
    let raw = Kubeconfig::read_from(kubeconfig).map_err(|e| {
        Error::cluster(format!("failed to read kubeconfig {}: {e}", kubeconfig.display()))
    })?;
    let mut config = Config::from_custom_kubeconfig(raw, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::cluster(format!("failed to load kubeconfig: {e}")))?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Ok(Client::try_from(config)?)
}

/// True for a 404 from the API server
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

// =============================================================================
// Manifests
// =============================================================================

/// One parsed manifest document
#[derive(Clone, Debug)]
pub struct ManifestObject {
    /// The full document
    pub value: serde_json::Value,
    /// `metadata.name`
    pub name: String,
    /// `metadata.namespace`, absent for cluster-scoped objects
    pub namespace: Option<String>,
    /// Resource type derived from apiVersion and kind
    pub api_resource: ApiResource,
}

impl ManifestObject {
    /// Parse an object already in JSON form
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let field = |ptr: &str| value.pointer(ptr).and_then(|v| v.as_str()).map(str::to_string);

        let api_version = field("/apiVersion")
            .ok_or_else(|| Error::serialization("manifest missing apiVersion"))?;
        let kind = field("/kind").ok_or_else(|| Error::serialization("manifest missing kind"))?;
        let name = field("/metadata/name")
            .ok_or_else(|| Error::serialization(format!("{kind} manifest missing metadata.name")))?;
        let namespace = field("/metadata/namespace");

        Ok(Self {
            api_resource: build_api_resource(&api_version, &kind),
            value,
            name,
            namespace,
        })
    }

    /// `Kind/name` for logs
    pub fn describe(&self) -> String {
        format!("{}/{}", self.api_resource.kind, self.name)
    }

    fn api(&self, client: &Client) -> Api<DynamicObject> {
        match &self.namespace {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &self.api_resource),
            None => Api::all_with(client.clone(), &self.api_resource),
        }
    }
}

/// Split a multi-document YAML stream, skipping empty documents, and
/// order the result by [`kind_priority`].
pub fn parse_manifests(yaml: &str) -> Result<Vec<ManifestObject>> {
    let mut objects = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(yaml) {
        let value = serde_json::Value::deserialize(doc)?;
        if value.is_null() {
            continue;
        }
        objects.push(ManifestObject::from_value(value)?);
    }
    objects.sort_by_key(|o| kind_priority(&o.api_resource.kind));
    Ok(objects)
}

/// Parse apiVersion into (group, version)
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Resource type for a known apiVersion and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

const KIND_PLURALS: &[(&str, &str)] = &[
    ("ingress", "ingresses"),
    ("ingressclass", "ingressclasses"),
    ("priorityclass", "priorityclasses"),
    ("apiservice", "apiservices"),
    ("endpoints", "endpoints"),
];

/// Pluralize a Kubernetes kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(s, _)| *s == lower) {
        return (*plural).to_string();
    }
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{lower}es")
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{lower}s")
    }
}

/// Apply order. Namespaces and RBAC before the workloads that use them.
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "PriorityClass" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "Service" => 6,
        "Deployment" | "DaemonSet" | "StatefulSet" => 7,
        "Job" | "CronJob" => 8,
        "Ingress" | "APIService" => 9,
        _ => 10,
    }
}

/// Server-side apply one object
pub async fn apply_object(client: &Client, obj: &ManifestObject) -> Result<()> {
    let params = PatchParams::apply(FIELD_MANAGER).force();
    obj.api(client)
        .patch(&obj.name, &params, &Patch::Apply(&obj.value))
        .await
        .map_err(|e| Error::cluster(format!("failed to apply {}: {e}", obj.describe())))?;
    debug!(object = %obj.describe(), "applied");
    Ok(())
}

/// Server-side apply an object built in code
pub async fn apply_value(client: &Client, value: serde_json::Value) -> Result<()> {
    apply_object(client, &ManifestObject::from_value(value)?).await
}

/// Apply every document of a rendered manifest, in priority order
pub async fn apply_manifests(client: &Client, yaml: &str) -> Result<Vec<ManifestObject>> {
    let objects = parse_manifests(yaml)?;
    for obj in &objects {
        apply_object(client, obj).await?;
    }
    info!(count = objects.len(), "applied manifests");
    Ok(objects)
}

/// Delete every document of a rendered manifest in reverse apply order.
/// Objects that are already gone are skipped.
pub async fn delete_manifests(client: &Client, yaml: &str) -> Result<()> {
    let objects = parse_manifests(yaml)?;
    for obj in objects.iter().rev() {
        delete_object(client, obj).await?;
    }
    Ok(())
}

/// Delete one object, tolerating 404
pub async fn delete_object(client: &Client, obj: &ManifestObject) -> Result<()> {
    match obj.api(client).delete(&obj.name, &DeleteParams::background()).await {
        Ok(_) => {
            debug!(object = %obj.describe(), "deleted");
            Ok(())
        }
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(Error::cluster(format!("failed to delete {}: {e}", obj.describe()))),
    }
}

// =============================================================================
// Namespaces
// =============================================================================

/// Ensure a namespace exists (idempotent)
pub async fn ensure_namespace(client: &Client, name: &str) -> Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    let ns = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": name }
    });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&ns))
        .await?;
    Ok(())
}

/// Delete a namespace and wait until the API server no longer has it
pub async fn delete_namespace(
    client: &Client,
    stop: &StopSignal,
    name: &str,
    timeout: Duration,
) -> Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    match api.delete(name, &DeleteParams::foreground()).await {
        Ok(_) => {}
        Err(e) if is_not_found(&e) => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    info!(namespace = %name, "waiting for namespace deletion");
    poll_until(
        stop,
        timeout,
        DEFAULT_POLL_INTERVAL,
        format!("namespace {name} deletion"),
        || {
            let api = api.clone();
            let name = name.to_string();
            async move {
                match api.get(&name).await {
                    Ok(_) => Ok(false),
                    Err(e) if is_not_found(&e) => Ok(true),
                    Err(e) => Err(e.into()),
                }
            }
        },
    )
    .await
}

// =============================================================================
// Waits
// =============================================================================

/// Poll until `check_fn` returns `Ok(true)`, the deadline passes, or the
/// stop signal fires. Check errors are logged and retried.
pub async fn poll_until<F, Fut>(
    stop: &StopSignal,
    timeout: Duration,
    poll_interval: Duration,
    what: impl Into<String>,
    mut check_fn: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let what = what.into();
    let start = tokio::time::Instant::now();

    loop {
        match abortable_wait(stop, &what, check_fn()).await? {
            Ok(true) => return Ok(()),
            Ok(false) => trace!(what = %what, "condition not yet met"),
            Err(e) => trace!(what = %what, error = %e, "check failed, retrying"),
        }
        if start.elapsed() >= timeout {
            return Err(Error::timeout(format!("{what} after {}s", timeout.as_secs())));
        }
        abortable_sleep(stop, poll_interval, &what).await?;
    }
}

/// Types carrying condition `type` and `status`
pub trait HasConditionFields {
    /// Condition type
    fn type_field(&self) -> &str;
    /// Condition status
    fn status_field(&self) -> &str;
}

impl HasConditionFields for k8s_openapi::api::core::v1::NodeCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

impl HasConditionFields for k8s_openapi::api::apps::v1::DeploymentCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

impl HasConditionFields for k8s_openapi::api::core::v1::PodCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// True when a condition of `condition_type` has status `True`
pub fn has_condition<T: HasConditionFields>(conditions: Option<&[T]>, condition_type: &str) -> bool {
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_field() == condition_type && c.status_field() == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Ready pod check
pub fn pod_is_ready(pod: &Pod) -> bool {
    let conditions = pod.status.as_ref().and_then(|s| s.conditions.as_deref());
    has_condition(conditions, CONDITION_READY)
}

/// Wait until a deployment reports `Available` with every replica ready
pub async fn wait_for_deployment(
    client: &Client,
    stop: &StopSignal,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> Result<()> {
    let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    info!(namespace = %namespace, deployment = %name, "waiting for deployment");
    poll_until(
        stop,
        timeout,
        DEFAULT_POLL_INTERVAL,
        format!("deployment {namespace}/{name} available"),
        || {
            let api = api.clone();
            let name = name.to_string();
            async move {
                match api.get(&name).await {
                    Ok(d) => Ok(deployment_is_available(&d)),
                    Err(e) if is_not_found(&e) => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
        },
    )
    .await
}

fn deployment_is_available(d: &Deployment) -> bool {
    let want = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let Some(status) = d.status.as_ref() else {
        return false;
    };
    has_condition(status.conditions.as_deref(), CONDITION_AVAILABLE)
        && status.ready_replicas.unwrap_or(0) >= want
}

/// Wait until every scheduled daemon pod is ready
pub async fn wait_for_daemonset(
    client: &Client,
    stop: &StopSignal,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> Result<()> {
    let api: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
    info!(namespace = %namespace, daemonset = %name, "waiting for daemonset");
    poll_until(
        stop,
        timeout,
        DEFAULT_POLL_INTERVAL,
        format!("daemonset {namespace}/{name} ready"),
        || {
            let api = api.clone();
            let name = name.to_string();
            async move {
                match api.get(&name).await {
                    Ok(ds) => Ok(ds
                        .status
                        .map(|s| s.desired_number_scheduled > 0 && s.number_ready >= s.desired_number_scheduled)
                        .unwrap_or(false)),
                    Err(e) if is_not_found(&e) => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
        },
    )
    .await
}

/// Number of Ready nodes matching a label selector
pub async fn count_ready_nodes(client: &Client, selector: &str) -> Result<usize> {
    let api: Api<Node> = Api::all(client.clone());
    let nodes = api.list(&ListParams::default().labels(selector)).await?;
    Ok(nodes
        .items
        .iter()
        .filter(|n| {
            let conditions = n.status.as_ref().and_then(|s| s.conditions.as_deref());
            has_condition(conditions, CONDITION_READY)
        })
        .count())
}

/// Wait until at least `want` nodes matching `selector` are Ready
pub async fn wait_for_ready_nodes(
    client: &Client,
    stop: &StopSignal,
    selector: &str,
    want: usize,
    timeout: Duration,
) -> Result<()> {
    info!(selector = %selector, want, "waiting for ready nodes");
    poll_until(
        stop,
        timeout,
        Duration::from_secs(10),
        format!("{want} ready nodes with {selector}"),
        || async move {
            let ready = count_ready_nodes(client, selector).await?;
            debug!(selector = %selector, ready, want, "ready nodes");
            Ok(ready >= want)
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentSpec, DeploymentStatus};

    // =========================================================================
    // Story: rendered manifests become ordered apply lists
    // =========================================================================

    /// Story: a multi-document manifest is split, empty documents are
    /// dropped and the namespace sorts first
    #[test]
    fn story_multi_document_manifest_is_ordered() {
        let yaml = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: hello-world-deployment
  namespace: demo
---
---
apiVersion: v1
kind: Service
metadata:
  name: hello-world-service
  namespace: demo
---
apiVersion: v1
kind: Namespace
metadata:
  name: demo
"#;
        let objects = parse_manifests(yaml).unwrap();
        let kinds: Vec<_> = objects.iter().map(|o| o.api_resource.kind.as_str()).collect();
        assert_eq!(kinds, vec!["Namespace", "Service", "Deployment"]);
        assert_eq!(objects[0].namespace, None);
        assert_eq!(objects[2].namespace.as_deref(), Some("demo"));
        assert_eq!(objects[2].api_resource.group, "apps");
        assert_eq!(objects[2].api_resource.plural, "deployments");
    }

    #[test]
    fn missing_name_is_rejected() {
        let err = parse_manifests("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n").unwrap_err();
        assert!(err.to_string().contains("metadata.name"));
    }

    #[test]
    fn plurals() {
        assert_eq!(pluralize_kind("Ingress"), "ingresses");
        assert_eq!(pluralize_kind("PriorityClass"), "priorityclasses");
        assert_eq!(pluralize_kind("ClusterRoleBinding"), "clusterrolebindings");
        assert_eq!(pluralize_kind("Policy"), "policies");
        assert_eq!(pluralize_kind("Gateway"), "gateways");
        assert_eq!(pluralize_kind("CronJob"), "cronjobs");
    }

    #[test]
    fn core_group_is_empty() {
        assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
        assert_eq!(
            parse_api_version("networking.k8s.io/v1"),
            ("networking.k8s.io".to_string(), "v1".to_string())
        );
    }

    // =========================================================================
    // Story: readiness predicates
    // =========================================================================

    fn deployment(replicas: i32, ready: i32, available: &str) -> Deployment {
        Deployment {
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                ready_replicas: Some(ready),
                conditions: Some(vec![DeploymentCondition {
                    type_: "Available".into(),
                    status: available.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Story: a deployment is only available once every replica is ready
    #[test]
    fn story_deployment_availability_needs_all_replicas() {
        assert!(deployment_is_available(&deployment(3, 3, "True")));
        assert!(!deployment_is_available(&deployment(3, 2, "True")));
        assert!(!deployment_is_available(&deployment(1, 1, "False")));
        assert!(!deployment_is_available(&Deployment::default()));
    }

    /// Story: poll_until gives up at the deadline
    #[tokio::test(start_paused = true)]
    async fn story_poll_until_times_out() {
        let stop = StopSignal::new();
        let err = poll_until(&stop, Duration::from_secs(20), Duration::from_secs(5), "never", || async {
            Ok(false)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    /// Story: poll_until returns aborted as soon as the operator stops
    #[tokio::test(start_paused = true)]
    async fn story_poll_until_honors_stop() {
        let stop = StopSignal::new();
        let s = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            s.stop("test");
        });
        let err = poll_until(&stop, Duration::from_secs(600), Duration::from_secs(5), "forever", || async {
            Ok(false)
        })
        .await
        .unwrap_err();
        assert!(err.is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_retries_check_errors() {
        let stop = StopSignal::new();
        let mut calls = 0;
        poll_until(&stop, Duration::from_secs(60), Duration::from_secs(1), "flaky", || {
            calls += 1;
            let n = calls;
            async move {
                if n < 3 {
                    Err(Error::http("connection refused"))
                } else {
                    Ok(true)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(calls, 3);
    }
}
