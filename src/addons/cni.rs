//! VPC CNI tuning on the `aws-node` DaemonSet.
//!
//! The DaemonSet belongs to the cluster; this add-on only owns the fields it
//! applies. Delete re-applies an empty object under the same field manager,
//! which drops exactly those fields.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::{AddOn, AddOnContext};
use crate::abort::StopSignal;
use crate::config::{AddOnCniVpc, AddOnKind};
use crate::{k8s, Result};

const NAMESPACE: &str = "kube-system";
const DAEMONSET: &str = "aws-node";
const CONTAINER: &str = "aws-node";
const ROLLOUT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// CNI plugin tuning
pub struct CniVpc {
    ctx: AddOnContext,
}

fn skeleton() -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "DaemonSet",
        "metadata": { "name": DAEMONSET, "namespace": NAMESPACE },
    })
}

/// Apply configuration for `cni`; `None` when nothing is tuned
pub fn tuning(cni: &AddOnCniVpc) -> Option<Value> {
    let env: Vec<Value> = [
        ("MINIMUM_IP_TARGET", cni.minimum_ip_target),
        ("WARM_IP_TARGET", cni.warm_ip_target),
    ]
    .into_iter()
    .filter(|(_, v)| *v > 0)
    .map(|(name, v)| json!({ "name": name, "value": v.to_string() }))
    .collect();
    if env.is_empty() && cni.node_selector.is_empty() {
        return None;
    }

    let mut pod_spec = json!({ "containers": [{ "name": CONTAINER, "env": env }] });
    if !cni.node_selector.is_empty() {
        pod_spec["nodeSelector"] = json!(cni.node_selector);
    }
    let mut obj = skeleton();
    obj["spec"] = json!({ "template": { "spec": pod_spec } });
    Some(obj)
}

impl CniVpc {
    /// CNI plugin
    pub fn new(ctx: AddOnContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl AddOn for CniVpc {
    fn kind(&self) -> AddOnKind {
        AddOnKind::CniVpc
    }

    async fn create(&self, stop: &StopSignal) -> Result<()> {
        let cni = self.ctx.store.read(|c| c.add_on_cni_vpc.clone());
        let Some(obj) = tuning(&cni) else {
            info!("no CNI tuning configured");
            return Ok(());
        };
        let client = self.ctx.client();
        k8s::apply_value(client, obj).await?;
        info!(
            minimum_ip_target = cni.minimum_ip_target,
            warm_ip_target = cni.warm_ip_target,
            "applied CNI tuning"
        );
        k8s::wait_for_daemonset(client, stop, NAMESPACE, DAEMONSET, ROLLOUT_TIMEOUT).await
    }

    async fn delete(&self) -> Result<()> {
        k8s::apply_value(self.ctx.client(), skeleton()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn nothing_to_apply_when_untuned() {
        assert!(tuning(&AddOnCniVpc::default()).is_none());
    }

    #[test]
    fn only_set_targets_are_applied() {
        let cni = AddOnCniVpc {
            minimum_ip_target: 30,
            ..Default::default()
        };
        let obj = tuning(&cni).unwrap();
        let container = &obj["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["name"], "aws-node");
        assert_eq!(container["env"], json!([{ "name": "MINIMUM_IP_TARGET", "value": "30" }]));
        assert!(obj["spec"]["template"]["spec"].get("nodeSelector").is_none());
    }

    #[test]
    fn node_selector_is_applied_alone() {
        let cni = AddOnCniVpc {
            node_selector: BTreeMap::from([("role".to_string(), "cni".to_string())]),
            ..Default::default()
        };
        let obj = tuning(&cni).unwrap();
        assert_eq!(obj["spec"]["template"]["spec"]["nodeSelector"]["role"], "cni");
        assert_eq!(obj["metadata"]["namespace"], "kube-system");
    }
}
