//! NVIDIA device plugin for GPU node pools.

use std::time::Duration;

use tracing::info;

use super::NodeGroupDriver;
use crate::abort::StopSignal;
use crate::cluster::ClusterAccess;
use crate::config::nodegroups::{any_gpu, GPU_AMI_SUFFIX};
use crate::config::Config;
use crate::template::{self, manifests};
use crate::{k8s, Result};

const DAEMONSET_NAMESPACE: &str = "kube-system";
const DAEMONSET_NAME: &str = "nvidia-device-plugin-daemonset";
const READY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

fn gpu_ami_type(cfg: &Config) -> Option<String> {
    let asgs = cfg
        .add_on_node_groups
        .asgs
        .values()
        .filter(|_| cfg.add_on_node_groups.enable)
        .map(|a| &a.ami_type);
    let mngs = cfg
        .add_on_managed_node_groups
        .mngs
        .values()
        .filter(|_| cfg.add_on_managed_node_groups.enable)
        .map(|m| &m.ami_type);
    asgs.chain(mngs).find(|t| t.ends_with(GPU_AMI_SUFFIX)).cloned()
}

impl NodeGroupDriver {
    /// Install the device plugin when any pool runs a GPU AMI
    pub async fn install_gpu_plugin(&self, stop: &StopSignal, access: &ClusterAccess) -> Result<()> {
        let cfg = self.store.snapshot();
        if !any_gpu(&cfg.add_on_node_groups, &cfg.add_on_managed_node_groups) {
            return Ok(());
        }
        let Some(ami_type) = gpu_ami_type(&cfg) else {
            return Ok(());
        };

        info!(ami_type = %ami_type, "installing nvidia device plugin");
        let body = template::render(
            manifests::NVIDIA_DEVICE_PLUGIN,
            serde_json::json!({ "ami_type": ami_type }),
        )?;
        k8s::apply_manifests(&access.client, &body).await?;
        k8s::wait_for_daemonset(&access.client, stop, DAEMONSET_NAMESPACE, DAEMONSET_NAME, READY_TIMEOUT).await
    }
}
