//! IAM roles for service accounts.
//!
//! The add-on proves the whole federation chain works: it registers the
//! cluster's OIDC issuer with IAM, creates a role trusted for one service
//! account, runs a deployment under that account which keeps asking STS
//! who it is, and reads the container log on the node until the assumed
//! role shows up.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{info, warn};

use super::{AddOn, AddOnContext};
use crate::abort::StopSignal;
use crate::config::validate::default_tags;
use crate::config::{AddOnKind, Config};
use crate::nodegroup::logs::ssh_target_for_node;
use crate::stack::StackSpec;
use crate::template::{self, cfn, manifests};
use crate::{k8s, Error, Result};

const STS_CLIENT_ID: &str = "sts.amazonaws.com";
const ROLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const READY_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const RESULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const RESULT_INTERVAL: Duration = Duration::from_secs(10);
const SSH_TIMEOUT: Duration = Duration::from_secs(30);
const NAMESPACE_DELETE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// IRSA round trip
pub struct Irsa {
    ctx: AddOnContext,
}

/// Rendered service account and deployment
pub fn render(cfg: &Config) -> Result<String> {
    let irsa = &cfg.add_on_irsa;
    template::render(
        manifests::IRSA,
        json!({
            "namespace": irsa.common.namespace,
            "service_account": irsa.service_account_name,
            "role_arn": irsa.role_arn,
            "deployment_name": irsa.deployment_name,
            "replicas": irsa.deployment_replicas.max(1),
            "region": cfg.region,
        }),
    )
}

/// Shell command printing the deployment's container logs on its node
fn container_log_command(pod: &str, namespace: &str, container: &str) -> String {
    format!("sudo sh -c 'cat /var/log/containers/{pod}_{namespace}_{container}-*.log'")
}

/// True once STS reports the pod running as the add-on's role
fn assumed_role(log: &str, role_name: &str) -> bool {
    log.contains(&format!("assumed-role/{role_name}/"))
}

impl Irsa {
    /// IRSA plugin
    pub fn new(ctx: AddOnContext) -> Self {
        Self { ctx }
    }

    /// Register the issuer with IAM unless it already is
    async fn ensure_oidc_provider(&self) -> Result<()> {
        let (arn, url, thumbprint) = self.ctx.store.read(|c| {
            (
                c.status.cluster_oidc_issuer_arn.clone(),
                c.status.cluster_oidc_issuer_url.clone(),
                c.status.cluster_oidc_issuer_ca_thumbprint.clone(),
            )
        });
        if arn.is_empty() || url.is_empty() {
            return Err(Error::add_on(self.name(), "cluster has no OIDC issuer"));
        }
        let iam = &self.ctx.providers.iam;
        match iam.get_oidc_provider(&arn).await {
            Ok(p) => {
                info!(oidc_provider_arn = %p.arn, "OIDC provider already registered");
                return Ok(());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        if thumbprint.is_empty() {
            return Err(Error::add_on(self.name(), "no CA thumbprint recorded for the OIDC issuer"));
        }
        let created = match iam
            .create_oidc_provider(&url, &[STS_CLIENT_ID.to_string()], &[thumbprint])
            .await
        {
            Ok(created) => created,
            Err(e) if e.is_already_exists() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        info!(oidc_provider_arn = %created, "registered OIDC provider");
        self.ctx.store.update(|c| c.add_on_irsa.oidc_provider_arn = created);
        Ok(())
    }

    async fn ensure_role(&self, stop: &StopSignal) -> Result<()> {
        let cfg = self.ctx.store.snapshot();
        let irsa = &cfg.add_on_irsa;
        if !irsa.role_arn.is_empty() {
            return Ok(());
        }
        let spec = StackSpec::new(
            &irsa.role_name,
            cfn::IRSA_ROLE,
            json!({
                "issuer_host_path": cfg.status.cluster_oidc_issuer_host_path,
                "namespace": irsa.common.namespace,
                "oidc_provider_arn": cfg.status.cluster_oidc_issuer_arn,
                "service_account": irsa.service_account_name,
            }),
        )?
        .param("RoleName", &irsa.role_name)
        .list_param("RoleManagedPolicyARNs", &irsa.role_managed_policy_arns)
        .tags(default_tags(&cfg))
        .timing(Duration::from_secs(10), Duration::from_secs(10), ROLE_TIMEOUT);
        let outputs = self
            .ctx
            .stacks
            .create(stop, spec, |c, id| c.add_on_irsa.role_cfn_stack_id = id.to_string())
            .await?;
        let role_arn = outputs.get("RoleARN")?;
        info!(role_arn = %role_arn, "created service account role");
        self.ctx.store.update(|c| c.add_on_irsa.role_arn = role_arn);
        Ok(())
    }

    /// SSH to the node of the first scheduled pod and wait for the role in
    /// its container log. The matching log is written to the result path.
    async fn verify(&self, stop: &StopSignal) -> Result<()> {
        let cfg = self.ctx.store.snapshot();
        let irsa = &cfg.add_on_irsa;
        let namespace = &irsa.common.namespace;

        let pods: Api<Pod> = Api::namespaced(self.ctx.client().clone(), namespace);
        let selector = format!("app.kubernetes.io/name={}", irsa.deployment_name);
        let list = pods.list(&ListParams::default().labels(&selector)).await?;
        let (pod, node) = list
            .items
            .iter()
            .find_map(|p| {
                let node = p.spec.as_ref()?.node_name.clone()?;
                Some((p.metadata.name.clone()?, node))
            })
            .ok_or_else(|| Error::add_on(self.name(), "no scheduled pod to verify"))?;
        let ssh = ssh_target_for_node(&cfg, &node)
            .ok_or_else(|| Error::add_on(self.name(), format!("node {node} has no reachable instance")))?;
        info!(pod = %pod, node = %node, host = %ssh.host, "checking pod log for the assumed role");

        let cmd = container_log_command(&pod, namespace, &irsa.deployment_name);
        let found = Mutex::new(String::new());
        k8s::poll_until(stop, RESULT_TIMEOUT, RESULT_INTERVAL, format!("role {} in pod log", irsa.role_name), || {
            let ssh = &ssh;
            let cmd = &cmd;
            let found = &found;
            async move {
                let log = ssh.exec(stop, cmd, SSH_TIMEOUT).await?;
                if assumed_role(&log, &irsa.role_name) {
                    *found.lock() = log;
                    return Ok(true);
                }
                Ok(false)
            }
        })
        .await?;

        let path = Path::new(&irsa.deployment_result_path);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, found.into_inner())?;
        info!(path = %path.display(), "service account assumed its role");
        Ok(())
    }
}

#[async_trait]
impl AddOn for Irsa {
    fn kind(&self) -> AddOnKind {
        AddOnKind::Irsa
    }

    async fn create(&self, stop: &StopSignal) -> Result<()> {
        self.ensure_oidc_provider().await?;
        self.ensure_role(stop).await?;

        let cfg = self.ctx.store.snapshot();
        let client = self.ctx.client();
        let namespace = &cfg.add_on_irsa.common.namespace;
        k8s::ensure_namespace(client, namespace).await?;
        k8s::apply_manifests(client, &render(&cfg)?).await?;
        k8s::wait_for_deployment(client, stop, namespace, &cfg.add_on_irsa.deployment_name, READY_TIMEOUT).await?;
        self.verify(stop).await
    }

    async fn delete(&self) -> Result<()> {
        let cfg = self.ctx.store.snapshot();
        let irsa = &cfg.add_on_irsa;
        let client = self.ctx.client();
        let mut errs = Vec::new();

        match render(&cfg) {
            Ok(body) => {
                if let Err(e) = k8s::delete_manifests(client, &body).await {
                    errs.push(e.to_string());
                }
            }
            Err(e) => errs.push(e.to_string()),
        }
        if let Err(e) =
            k8s::delete_namespace(client, &StopSignal::never(), &irsa.common.namespace, NAMESPACE_DELETE_TIMEOUT).await
        {
            errs.push(e.to_string());
        }

        match self
            .ctx
            .stacks
            .delete("IRSA role", &irsa.role_cfn_stack_id, ROLE_TIMEOUT)
            .await
        {
            Ok(()) => self.ctx.store.update(|c| {
                c.add_on_irsa.role_cfn_stack_id.clear();
                c.add_on_irsa.role_arn.clear();
            }),
            Err(e) => errs.push(e.to_string()),
        }

        if !irsa.oidc_provider_arn.is_empty() {
            match self.ctx.providers.iam.delete_oidc_provider(&irsa.oidc_provider_arn).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(oidc_provider_arn = %irsa.oidc_provider_arn, error = %e, "failed to delete OIDC provider");
                    errs.push(e.to_string());
                }
            }
            if errs.is_empty() {
                self.ctx.store.update(|c| c.add_on_irsa.oidc_provider_arn.clear());
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(errs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_binds_the_role_to_the_service_account() {
        let mut cfg = Config {
            name: "test-001".into(),
            region: "us-west-2".into(),
            ..Default::default()
        };
        let irsa = &mut cfg.add_on_irsa;
        irsa.common.namespace = "test-001-irsa".into();
        irsa.service_account_name = "test-001-irsa-service-account".into();
        irsa.deployment_name = "test-001-irsa-deployment".into();
        irsa.role_arn = "arn:aws:iam::123456789012:role/test-001-irsa-role".into();

        let objs = k8s::parse_manifests(&render(&cfg).unwrap()).unwrap();
        let sa = objs.iter().find(|o| o.value["kind"] == "ServiceAccount").unwrap();
        assert_eq!(
            sa.value["metadata"]["annotations"]["eks.amazonaws.com/role-arn"],
            "arn:aws:iam::123456789012:role/test-001-irsa-role"
        );
        let deploy = objs.iter().find(|o| o.value["kind"] == "Deployment").unwrap();
        assert_eq!(
            deploy.value["spec"]["template"]["spec"]["serviceAccountName"],
            "test-001-irsa-service-account"
        );
        assert_eq!(deploy.value["spec"]["replicas"], 1);
    }

    #[test]
    fn role_must_appear_as_assumed_role() {
        let log = "2024-01-01T00:00:00Z stdout F 123456789012\tarn:aws:sts::123456789012:assumed-role/test-001-irsa-role/botocore-session-1\tAROA";
        assert!(assumed_role(log, "test-001-irsa-role"));
        assert!(!assumed_role(log, "test-001-irsa"));
        assert!(!assumed_role("arn:aws:sts::1:assumed-role/other/x", "test-001-irsa-role"));
    }

    #[test]
    fn log_command_globs_the_container_file() {
        assert_eq!(
            container_log_command("p-1", "ns", "c"),
            "sudo sh -c 'cat /var/log/containers/p-1_ns_c-*.log'"
        );
    }
}
