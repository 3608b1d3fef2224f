//! Worker pools.
//!
//! Two variants share this driver: self-managed auto scaling groups built
//! from template stacks ([`asg`]) and provider-managed node groups created
//! through the cluster API ([`mng`]). Both use a node role stack, wait for
//! their instances to run and for the matching Kubernetes nodes to be
//! Ready, and can collect node logs over SSH ([`logs`]).

pub mod asg;
pub mod gpu;
pub mod logs;
pub mod mng;

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::abort::StopSignal;
use crate::config::validate::default_tags;
use crate::config::{Config, NodeRole, Store};
use crate::k8s;
use crate::provider::{Instance, Providers};
use crate::stack::{StackDriver, StackSpec};
use crate::template::cfn;
use crate::Result;

const ROLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const INSTANCE_STATE_RUNNING: &str = "running";

/// Which worker pool variant
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Variant {
    /// `addOnNodeGroups`
    SelfManaged,
    /// `addOnManagedNodeGroups`
    Managed,
}

impl Variant {
    fn role(self, cfg: &Config) -> &NodeRole {
        match self {
            Variant::SelfManaged => &cfg.add_on_node_groups.role,
            Variant::Managed => &cfg.add_on_managed_node_groups.role,
        }
    }

    fn role_mut(self, cfg: &mut Config) -> &mut NodeRole {
        match self {
            Variant::SelfManaged => &mut cfg.add_on_node_groups.role,
            Variant::Managed => &mut cfg.add_on_managed_node_groups.role,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Variant::SelfManaged => "node group",
            Variant::Managed => "managed node group",
        }
    }
}

/// Creates, scales, upgrades and deletes worker pools
#[derive(Clone)]
pub struct NodeGroupDriver {
    store: Store,
    providers: Providers,
    stacks: StackDriver,
}

impl NodeGroupDriver {
    /// Driver writing through `store`
    pub fn new(store: Store, providers: Providers) -> Self {
        let stacks = StackDriver::new(store.clone(), providers.stacks.clone());
        Self {
            store,
            providers,
            stacks,
        }
    }

    /// Create the node role stack unless a role ARN is given or recorded
    async fn ensure_role(&self, stop: &StopSignal, variant: Variant) -> Result<String> {
        let cfg = self.store.snapshot();
        let role = variant.role(&cfg);
        if !role.role_arn.is_empty() {
            return Ok(role.role_arn.clone());
        }

        let spec = StackSpec::new(
            &role.role_name,
            cfn::ROLE,
            serde_json::json!({ "description": format!("{} {} role", cfg.name, variant.label()) }),
        )?
        .param("RoleName", &role.role_name)
        .list_param("RoleServicePrincipals", &role.role_service_principals)
        .list_param("RoleManagedPolicyARNs", &role.role_managed_policy_arns)
        .tags(default_tags(&cfg))
        .timing(Duration::from_secs(10), Duration::from_secs(10), ROLE_TIMEOUT);
        let outputs = self
            .stacks
            .create(stop, spec, |c, id| variant.role_mut(c).role_cfn_stack_id = id.to_string())
            .await?;
        let arn = outputs.get("RoleARN")?;
        info!(variant = variant.label(), role_arn = %arn, "node role ready");
        self.store.update(|c| variant.role_mut(c).role_arn = arn.clone());
        Ok(arn)
    }

    async fn delete_role(&self, variant: Variant) -> Result<()> {
        let (create, stack_id) = self.store.read(|c| {
            let role = variant.role(c);
            (role.role_create, role.role_cfn_stack_id.clone())
        });
        if !create || stack_id.is_empty() {
            return Ok(());
        }
        self.stacks
            .delete(&format!("{} role", variant.label()), &stack_id, ROLE_TIMEOUT)
            .await?;
        self.store.update(|c| {
            let role = variant.role_mut(c);
            role.role_cfn_stack_id.clear();
            role.role_arn.clear();
        });
        Ok(())
    }

    /// Wait until `want` instances of an auto scaling group are running
    async fn wait_instances(
        &self,
        stop: &StopSignal,
        asg_name: &str,
        want: u32,
        timeout: Duration,
    ) -> Result<BTreeMap<String, Instance>> {
        let ec2 = self.providers.ec2.clone();
        let found = Mutex::new(BTreeMap::new());
        k8s::poll_until(
            stop,
            timeout,
            Duration::from_secs(10),
            format!("{want} running instances in {asg_name}"),
            || {
                let ec2 = ec2.clone();
                let found = &found;
                async move {
                    let running: BTreeMap<String, Instance> = ec2
                        .describe_instances_by_asg(asg_name)
                        .await?
                        .into_iter()
                        .filter(|i| i.state == INSTANCE_STATE_RUNNING)
                        .map(|i| (i.instance_id.clone(), i))
                        .collect();
                    let enough = running.len() >= want as usize;
                    *found.lock() = running;
                    Ok(enough)
                }
            },
        )
        .await?;
        let found = found.into_inner();
        info!(asg = %asg_name, running = found.len(), "instances running");
        Ok(found)
    }
}

#[derive(Serialize)]
struct MapRole<'a> {
    rolearn: &'a str,
    username: &'static str,
    groups: [&'static str; 2],
}

/// The `aws-auth` ConfigMap letting nodes with these roles join
pub fn aws_auth_config_map(role_arns: &[String]) -> Result<serde_json::Value> {
    let roles: Vec<MapRole<'_>> = role_arns
        .iter()
        .filter(|arn| !arn.is_empty())
        .map(|arn| MapRole {
            rolearn: arn,
            username: "system:node:{{EC2PrivateDNSName}}",
            groups: ["system:bootstrappers", "system:nodes"],
        })
        .collect();
    Ok(serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": "aws-auth", "namespace": "kube-system" },
        "data": { "mapRoles": serde_yaml::to_string(&roles)? },
    }))
}

/// Apply `aws-auth` for every node role in use
pub async fn apply_aws_auth(store: &Store, client: &kube::Client) -> Result<()> {
    let arns: Vec<String> = store.read(|c| {
        let mut arns = Vec::new();
        if c.add_on_node_groups.enable {
            arns.push(c.add_on_node_groups.role.role_arn.clone());
        }
        if c.add_on_managed_node_groups.enable {
            arns.push(c.add_on_managed_node_groups.role.role_arn.clone());
        }
        arns
    });
    k8s::apply_value(client, aws_auth_config_map(&arns)?).await?;
    info!(roles = arns.len(), "applied aws-auth");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aws_auth_maps_each_role_to_node_groups() {
        let cm = aws_auth_config_map(&[
            "arn:aws:iam::123:role/test-001-role-ng".to_string(),
            String::new(),
        ])
        .unwrap();
        let map_roles = cm["data"]["mapRoles"].as_str().unwrap();
        let parsed: Vec<serde_json::Value> = serde_yaml::from_str(map_roles).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0]["rolearn"], "arn:aws:iam::123:role/test-001-role-ng");
        assert_eq!(parsed[0]["username"], "system:node:{{EC2PrivateDNSName}}");
        assert_eq!(parsed[0]["groups"][1], "system:nodes");
        assert_eq!(cm["metadata"]["namespace"], "kube-system");
    }
}
