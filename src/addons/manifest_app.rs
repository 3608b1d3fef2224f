//! Manifest-only applications: render, apply, wait for the main Deployment.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use super::{AddOn, AddOnContext};
use crate::abort::StopSignal;
use crate::config::{AddOnKind, AddOnManifestApp, Config};
use crate::template::{self, manifests};
use crate::{k8s, Error, Result};

const READY_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const NAMESPACE_DELETE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Namespaces this engine never deletes
const SHARED_NAMESPACES: &[&str] = &["kube-system", "default"];

/// Dashboard, cluster autoscaler, metrics server, overprovisioning
pub struct ManifestApp {
    ctx: AddOnContext,
    kind: AddOnKind,
}

fn block(cfg: &Config, kind: AddOnKind) -> Result<&AddOnManifestApp> {
    match kind {
        AddOnKind::KubernetesDashboard => Ok(&cfg.add_on_kubernetes_dashboard),
        AddOnKind::ClusterAutoscaler => Ok(&cfg.add_on_cluster_autoscaler),
        AddOnKind::MetricsServer => Ok(&cfg.add_on_metrics_server),
        AddOnKind::Overprovisioning => Ok(&cfg.add_on_overprovisioning),
        other => Err(Error::add_on(other.name(), "not a manifest application")),
    }
}

/// Template and Deployment name of a manifest application
fn shape(kind: AddOnKind) -> Result<(&'static str, &'static str)> {
    match kind {
        AddOnKind::KubernetesDashboard => Ok((manifests::KUBERNETES_DASHBOARD, "kubernetes-dashboard")),
        AddOnKind::ClusterAutoscaler => Ok((manifests::CLUSTER_AUTOSCALER, "cluster-autoscaler")),
        AddOnKind::MetricsServer => Ok((manifests::METRICS_SERVER, "metrics-server")),
        AddOnKind::Overprovisioning => Ok((manifests::OVERPROVISIONING, "overprovisioning")),
        other => Err(Error::add_on(other.name(), "not a manifest application")),
    }
}

/// Rendered manifest for `kind`
pub fn render(cfg: &Config, kind: AddOnKind) -> Result<String> {
    let app = block(cfg, kind)?;
    let (template_name, _) = shape(kind)?;
    template::render(
        template_name,
        json!({
            "namespace": app.common.namespace,
            "replicas": app.replicas.max(1),
            "cluster_name": cfg.name,
            "region": cfg.region,
            "version": cfg.parameters.version,
        }),
    )
}

fn dashboard_url(namespace: &str) -> String {
    format!("http://localhost:8001/api/v1/namespaces/{namespace}/services/https:kubernetes-dashboard:/proxy/")
}

impl ManifestApp {
    /// Plugin for `kind`
    pub fn new(ctx: AddOnContext, kind: AddOnKind) -> Self {
        Self { ctx, kind }
    }

    fn owns_namespace(namespace: &str) -> bool {
        !SHARED_NAMESPACES.contains(&namespace)
    }
}

#[async_trait]
impl AddOn for ManifestApp {
    fn kind(&self) -> AddOnKind {
        self.kind
    }

    async fn create(&self, stop: &StopSignal) -> Result<()> {
        let cfg = self.ctx.store.snapshot();
        let namespace = self.ctx.namespace(self.kind);
        let body = render(&cfg, self.kind)?;
        let (_, deployment) = shape(self.kind)?;
        let client = self.ctx.client();

        if Self::owns_namespace(&namespace) {
            k8s::ensure_namespace(client, &namespace).await?;
        }
        k8s::apply_manifests(client, &body).await?;
        k8s::wait_for_deployment(client, stop, &namespace, deployment, READY_TIMEOUT).await?;

        if self.kind == AddOnKind::KubernetesDashboard {
            let url = dashboard_url(&namespace);
            info!(url = %url, "dashboard available through kubectl proxy");
            self.ctx
                .store
                .update(|c| c.add_on_kubernetes_dashboard.url = url);
        }
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let cfg = self.ctx.store.snapshot();
        let namespace = self.ctx.namespace(self.kind);
        let client = self.ctx.client();
        k8s::delete_manifests(client, &render(&cfg, self.kind)?).await?;
        if Self::owns_namespace(&namespace) {
            k8s::delete_namespace(client, &StopSignal::never(), &namespace, NAMESPACE_DELETE_TIMEOUT).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        let mut cfg = Config {
            name: "test-001".into(),
            region: "us-west-2".into(),
            ..Default::default()
        };
        cfg.parameters.version = "1.30".into();
        for kind in [
            AddOnKind::KubernetesDashboard,
            AddOnKind::ClusterAutoscaler,
            AddOnKind::MetricsServer,
            AddOnKind::Overprovisioning,
        ] {
            kind.common_mut(&mut cfg).namespace = kind.default_namespace("test-001");
        }
        cfg
    }

    #[test]
    fn every_manifest_app_renders_its_deployment() {
        let cfg = cfg();
        for kind in [
            AddOnKind::KubernetesDashboard,
            AddOnKind::ClusterAutoscaler,
            AddOnKind::MetricsServer,
            AddOnKind::Overprovisioning,
        ] {
            let body = render(&cfg, kind).unwrap();
            let (_, deployment) = shape(kind).unwrap();
            let objs = k8s::parse_manifests(&body).unwrap();
            assert!(
                objs.iter().any(|o| o.name == deployment
                    && o.value["kind"] == "Deployment"
                    && o.namespace.as_deref() == Some(kind.common(&cfg).namespace.as_str())),
                "{kind}"
            );
        }
    }

    #[test]
    fn autoscaler_targets_the_cluster_version() {
        let body = render(&cfg(), AddOnKind::ClusterAutoscaler).unwrap();
        assert!(body.contains("cluster-autoscaler:v1.30.0"));
        assert!(body.contains("test-001"));
    }

    #[test]
    fn kube_system_is_never_deleted() {
        assert!(!ManifestApp::owns_namespace("kube-system"));
        assert!(ManifestApp::owns_namespace("test-001-overprovisioning"));
    }

    #[test]
    fn other_kinds_are_rejected() {
        assert!(render(&cfg(), AddOnKind::JobsPi).is_err());
    }
}
