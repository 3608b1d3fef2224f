//! Worker pool configuration: self-managed ASGs and provider-managed node groups.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::TimeFrame;
use crate::provider::Instance;

/// AMI type suffix that marks a GPU image
pub const GPU_AMI_SUFFIX: &str = "_GPU";

/// Default AMI type for x86 workers
pub const DEFAULT_AMI_TYPE: &str = "AL2_x86_64";

/// SSH user of the default AMI
pub const DEFAULT_REMOTE_ACCESS_USER: &str = "ec2-user";

/// Settings shared by both worker pool variants: the node role
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRole {
    /// Create the role stack; otherwise `roleArn` must be given
    #[serde(default)]
    pub role_create: bool,
    /// Role name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role_name: String,
    /// Existing or created role ARN
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role_arn: String,
    /// Service principals trusted by the role
    #[serde(default)]
    pub role_service_principals: Vec<String>,
    /// Managed policies attached to the role
    #[serde(default)]
    pub role_managed_policy_arns: Vec<String>,
    /// Role stack ID (output)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role_cfn_stack_id: String,
}

/// Self-managed worker pools
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOnNodeGroups {
    /// Create the pools during Up
    #[serde(default)]
    pub enable: bool,
    /// Set before the first stack is submitted
    #[serde(default)]
    pub created: bool,
    /// Node role
    #[serde(flatten)]
    pub role: NodeRole,
    /// Shared worker security group stack ID (output)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub security_group_cfn_stack_id: String,
    /// Shared worker security group ID (output)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub security_group_id: String,
    /// Collect node logs over SSH after creation
    #[serde(default)]
    pub fetch_logs: bool,
    /// Where node logs are downloaded
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub logs_dir: String,
    /// Pools keyed by ASG name
    #[serde(default)]
    pub asgs: BTreeMap<String, Asg>,
    /// Create time frame
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_frame_create: Option<TimeFrame>,
    /// Delete time frame
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_frame_delete: Option<TimeFrame>,
}

/// One self-managed auto scaling group
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asg {
    /// ASG name
    #[serde(default)]
    pub name: String,
    /// SSH user
    #[serde(default)]
    pub remote_access_user_name: String,
    /// AMI type, e.g. `AL2_x86_64` or `AL2_x86_64_GPU`
    #[serde(default)]
    pub ami_type: String,
    /// Explicit AMI; empty resolves the recommended image via SSM
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_id: String,
    /// SSM parameter holding the recommended AMI
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_id_ssm_parameter: String,
    /// EC2 instance types
    #[serde(default)]
    pub instance_types: Vec<String>,
    /// Root volume size (GiB)
    #[serde(default)]
    pub volume_size: u32,
    /// Minimum size
    #[serde(default)]
    pub asg_min_size: u32,
    /// Maximum size
    #[serde(default)]
    pub asg_max_size: u32,
    /// Desired capacity
    #[serde(default)]
    pub asg_desired_capacity: u32,
    /// Extra kubelet arguments
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubelet_extra_args: String,
    /// ASG stack ID (output)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub asg_cfn_stack_id: String,
    /// Instances by ID (output)
    #[serde(default)]
    pub instances: BTreeMap<String, Instance>,
    /// Downloaded log files by instance ID (output)
    #[serde(default)]
    pub logs: BTreeMap<String, Vec<String>>,
    /// Create time frame
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_frame_create: Option<TimeFrame>,
}

/// Provider-managed node groups
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOnManagedNodeGroups {
    /// Create the node groups during Up
    #[serde(default)]
    pub enable: bool,
    /// Set before the first node group is submitted
    #[serde(default)]
    pub created: bool,
    /// Node role
    #[serde(flatten)]
    pub role: NodeRole,
    /// Extra request header key for node-group API calls
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_header_key: String,
    /// Extra request header value
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_header_value: String,
    /// Custom API resolver URL
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resolver_url: String,
    /// Request signing name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signing_name: String,
    /// Collect node logs over SSH after creation
    #[serde(default)]
    pub fetch_logs: bool,
    /// Where node logs are downloaded
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub logs_dir: String,
    /// Node groups keyed by name
    #[serde(default)]
    pub mngs: BTreeMap<String, Mng>,
    /// Create time frame
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_frame_create: Option<TimeFrame>,
    /// Delete time frame
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_frame_delete: Option<TimeFrame>,
}

impl AddOnManagedNodeGroups {
    /// Endpoint overrides for node-group calls
    pub fn endpoint(&self) -> crate::provider::ApiEndpoint {
        crate::provider::ApiEndpoint {
            resolver_url: non_empty(&self.resolver_url),
            signing_name: non_empty(&self.signing_name),
            request_header: if self.request_header_key.is_empty() {
                None
            } else {
                Some((
                    self.request_header_key.clone(),
                    self.request_header_value.clone(),
                ))
            },
        }
    }
}

/// One provider-managed node group
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mng {
    /// Node group name
    #[serde(default)]
    pub name: String,
    /// SSH user
    #[serde(default)]
    pub remote_access_user_name: String,
    /// Tags
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// AMI release version; empty lets the provider choose
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub release_version: String,
    /// AMI type
    #[serde(default)]
    pub ami_type: String,
    /// EC2 instance types
    #[serde(default)]
    pub instance_types: Vec<String>,
    /// Root volume size (GiB)
    #[serde(default)]
    pub volume_size: u32,
    /// Minimum size
    #[serde(default)]
    pub asg_min_size: u32,
    /// Maximum size
    #[serde(default)]
    pub asg_max_size: u32,
    /// Desired capacity
    #[serde(default)]
    pub asg_desired_capacity: u32,
    /// In-place scale updates, applied in order after add-ons
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scale_updates: Vec<MngScaleUpdate>,
    /// In-place Kubernetes version upgrade
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_upgrade: Option<MngVersionUpgrade>,
    /// Set before the create call is submitted
    #[serde(default)]
    pub create_requested: bool,
    /// Provider node-group ARN (output)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub physical_id: String,
    /// Backing ASG name (output)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub asg_name: String,
    /// Remote access security group (output)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote_access_security_group_id: String,
    /// Last observed status (output)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    /// Instances by ID (output)
    #[serde(default)]
    pub instances: BTreeMap<String, Instance>,
    /// Downloaded log files by instance ID (output)
    #[serde(default)]
    pub logs: BTreeMap<String, Vec<String>>,
    /// Create time frame
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_frame_create: Option<TimeFrame>,
    /// Delete time frame
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_frame_delete: Option<TimeFrame>,
}

/// One scale update
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MngScaleUpdate {
    /// Apply this update
    #[serde(default)]
    pub enable: bool,
    /// Update ID assigned by the provider (output)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Set once the update has been applied
    #[serde(default)]
    pub created: bool,
    /// Wait before submitting
    #[serde(default)]
    pub initial_wait_seconds: u64,
    /// New minimum size
    #[serde(default)]
    pub asg_min_size: u32,
    /// New maximum size
    #[serde(default)]
    pub asg_max_size: u32,
    /// New desired capacity
    #[serde(default)]
    pub asg_desired_capacity: u32,
    /// Time frame of the update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_frame_update: Option<TimeFrame>,
}

/// One version upgrade
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MngVersionUpgrade {
    /// Apply the upgrade
    #[serde(default)]
    pub enable: bool,
    /// Set once the upgrade has been applied
    #[serde(default)]
    pub created: bool,
    /// Wait before submitting
    #[serde(default)]
    pub initial_wait_seconds: u64,
    /// Target Kubernetes version
    #[serde(default)]
    pub version: String,
    /// Time frame of the upgrade
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_frame_update: Option<TimeFrame>,
}

/// True when any ASG or MNG uses a GPU AMI
pub fn any_gpu(ngs: &AddOnNodeGroups, mngs: &AddOnManagedNodeGroups) -> bool {
    let asg = ngs.enable
        && ngs
            .asgs
            .values()
            .any(|a| a.ami_type.ends_with(GPU_AMI_SUFFIX));
    let mng = mngs.enable
        && mngs
            .mngs
            .values()
            .any(|m| m.ami_type.ends_with(GPU_AMI_SUFFIX));
    asg || mng
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_detection_needs_enabled_pool() {
        let mut ngs = AddOnNodeGroups::default();
        ngs.asgs.insert(
            "ng-gpu".into(),
            Asg {
                ami_type: "AL2_x86_64_GPU".into(),
                ..Default::default()
            },
        );
        let mngs = AddOnManagedNodeGroups::default();
        assert!(!any_gpu(&ngs, &mngs));
        ngs.enable = true;
        assert!(any_gpu(&ngs, &mngs));
    }

    #[test]
    fn mng_endpoint_carries_header_and_resolver() {
        let mngs = AddOnManagedNodeGroups {
            resolver_url: "https://api.beta.example".into(),
            request_header_key: "x-canary".into(),
            request_header_value: "1".into(),
            ..Default::default()
        };
        let ep = mngs.endpoint();
        assert_eq!(ep.resolver_url.as_deref(), Some("https://api.beta.example"));
        assert_eq!(ep.request_header, Some(("x-canary".into(), "1".into())));
        assert!(ep.signing_name.is_none());
    }
}
