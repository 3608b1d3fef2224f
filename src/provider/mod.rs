//! Cloud provider facade.
//!
//! The engine never talks to the provider SDK directly. Each service it needs
//! is a narrow async trait here, implemented once by [`aws_cli::AwsCli`] and
//! mocked in tests. [`Providers`] bundles one handle per trait.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

pub mod aws_cli;
pub mod eks_http;
pub mod error;

pub use error::{ProviderError, ProviderErrorKind, ProviderResult};

// =============================================================================
// Declarative template stacks
// =============================================================================

/// Request to create a template stack
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreateStackRequest {
    /// Stack name
    pub stack_name: String,
    /// Rendered template body
    pub template_body: String,
    /// Template parameters
    pub parameters: BTreeMap<String, String>,
    /// Stack tags
    pub tags: BTreeMap<String, String>,
}

/// Current view of a template stack
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StackDescription {
    /// Provider-assigned stack ID
    pub stack_id: String,
    /// Stack name
    pub stack_name: String,
    /// Stack status, e.g. `CREATE_COMPLETE`
    pub status: String,
    /// Reason reported with the status
    pub status_reason: Option<String>,
    /// Output key to value
    pub outputs: BTreeMap<String, String>,
}

/// Template stack operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StackApi: Send + Sync {
    /// Submit a stack; returns the stack ID. Partial stacks delete themselves.
    async fn create_stack(&self, req: &CreateStackRequest) -> ProviderResult<String>;
    /// Submit stack deletion
    async fn delete_stack(&self, stack_id: &str) -> ProviderResult<()>;
    /// Describe one stack
    async fn describe_stack(&self, stack_id: &str) -> ProviderResult<StackDescription>;
}

// =============================================================================
// Managed clusters and node groups
// =============================================================================

/// Non-default API endpoint settings for cluster and node-group calls
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    /// Custom resolver URL; empty for the production endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver_url: Option<String>,
    /// Request signing name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_name: Option<String>,
    /// Extra request header as (key, value)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_header: Option<(String, String)>,
}

impl ApiEndpoint {
    /// True when any override is set
    pub fn is_custom(&self) -> bool {
        self.resolver_url.is_some() || self.request_header.is_some()
    }
}

/// Direct-API cluster creation request
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreateClusterRequest {
    /// Cluster name
    pub name: String,
    /// Kubernetes version
    pub version: String,
    /// Control plane role ARN
    pub role_arn: String,
    /// Subnets for the control plane ENIs
    pub subnet_ids: Vec<String>,
    /// Control plane security groups
    pub security_group_ids: Vec<String>,
    /// Cluster tags
    pub tags: BTreeMap<String, String>,
    /// KMS key for secrets encryption
    pub encryption_key_arn: Option<String>,
    /// Endpoint overrides
    pub endpoint: ApiEndpoint,
}

/// Current view of a managed cluster
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterDescription {
    /// Cluster name
    pub name: String,
    /// Cluster ARN
    pub arn: String,
    /// Status, e.g. `ACTIVE`
    pub status: String,
    /// API server endpoint
    pub endpoint: Option<String>,
    /// Base64 CA bundle
    pub certificate_authority: Option<String>,
    /// OIDC issuer URL
    pub oidc_issuer: Option<String>,
    /// Kubernetes version
    pub version: Option<String>,
}

/// Node-group scaling bounds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingConfig {
    /// Minimum size
    pub min_size: u32,
    /// Maximum size
    pub max_size: u32,
    /// Desired size
    pub desired_size: u32,
}

/// Managed node-group creation request
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreateNodegroupRequest {
    /// Owning cluster
    pub cluster_name: String,
    /// Node group name
    pub name: String,
    /// Node role ARN
    pub role_arn: String,
    /// Worker subnets
    pub subnet_ids: Vec<String>,
    /// EC2 instance types
    pub instance_types: Vec<String>,
    /// AMI type, e.g. `AL2_x86_64`
    pub ami_type: String,
    /// Root volume size (GiB)
    pub disk_size: u32,
    /// Scaling bounds
    pub scaling: ScalingConfig,
    /// SSH key pair for remote access
    pub remote_access_key: Option<String>,
    /// AMI release version
    pub release_version: Option<String>,
    /// Kubernetes node labels
    pub labels: BTreeMap<String, String>,
    /// Tags
    pub tags: BTreeMap<String, String>,
    /// Endpoint overrides
    pub endpoint: ApiEndpoint,
}

/// Current view of a managed node group
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodegroupDescription {
    /// Node group name
    pub name: String,
    /// Node group ARN
    pub arn: String,
    /// Status, e.g. `ACTIVE`
    pub status: String,
    /// Backing auto scaling groups
    pub autoscaling_groups: Vec<String>,
    /// Security group created for remote access
    pub remote_access_security_group: Option<String>,
    /// Reported health issues
    pub health_issues: Vec<String>,
}

/// In-place update of a cluster or node group
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateDescription {
    /// Update ID
    pub id: String,
    /// `InProgress`, `Successful`, `Failed`, `Cancelled`
    pub status: String,
    /// Error messages reported with the update
    pub errors: Vec<String>,
}

/// Managed cluster and node-group operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create a cluster directly
    async fn create_cluster(&self, req: &CreateClusterRequest) -> ProviderResult<ClusterDescription>;
    /// Submit cluster deletion
    async fn delete_cluster(&self, endpoint: &ApiEndpoint, name: &str) -> ProviderResult<()>;
    /// Describe one cluster
    async fn describe_cluster(&self, endpoint: &ApiEndpoint, name: &str) -> ProviderResult<ClusterDescription>;
    /// Create a managed node group
    async fn create_nodegroup(&self, req: &CreateNodegroupRequest) -> ProviderResult<NodegroupDescription>;
    /// Submit node-group deletion
    async fn delete_nodegroup(&self, endpoint: &ApiEndpoint, cluster: &str, name: &str) -> ProviderResult<()>;
    /// Describe one node group
    async fn describe_nodegroup(
        &self,
        endpoint: &ApiEndpoint,
        cluster: &str,
        name: &str,
    ) -> ProviderResult<NodegroupDescription>;
    /// Change node-group scaling; returns the update ID
    async fn update_nodegroup_config(
        &self,
        endpoint: &ApiEndpoint,
        cluster: &str,
        name: &str,
        scaling: ScalingConfig,
    ) -> ProviderResult<String>;
    /// Upgrade node-group Kubernetes version; returns the update ID
    async fn update_nodegroup_version(
        &self,
        endpoint: &ApiEndpoint,
        cluster: &str,
        name: &str,
        version: &str,
    ) -> ProviderResult<String>;
    /// Describe an update of a node group
    async fn describe_update(
        &self,
        endpoint: &ApiEndpoint,
        cluster: &str,
        nodegroup: &str,
        update_id: &str,
    ) -> ProviderResult<UpdateDescription>;
}

// =============================================================================
// IAM, KMS
// =============================================================================

/// Registered OIDC identity provider
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OidcProvider {
    /// Provider ARN
    pub arn: String,
    /// Issuer URL without scheme
    pub url: String,
    /// Registered CA thumbprints
    pub thumbprints: Vec<String>,
}

/// IAM role summary
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoleDescription {
    /// Role name
    pub name: String,
    /// Role ARN
    pub arn: String,
}

/// IAM operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IamApi: Send + Sync {
    /// Look up an OIDC provider by ARN
    async fn get_oidc_provider(&self, arn: &str) -> ProviderResult<OidcProvider>;
    /// Register an OIDC provider; returns its ARN
    async fn create_oidc_provider(
        &self,
        url: &str,
        client_ids: &[String],
        thumbprints: &[String],
    ) -> ProviderResult<String>;
    /// Remove an OIDC provider
    async fn delete_oidc_provider(&self, arn: &str) -> ProviderResult<()>;
    /// Look up a role by name
    async fn get_role(&self, name: &str) -> ProviderResult<RoleDescription>;
    /// Create a managed policy; returns its ARN
    async fn create_policy(&self, name: &str, document: &str) -> ProviderResult<String>;
    /// Delete a managed policy
    async fn delete_policy(&self, arn: &str) -> ProviderResult<()>;
}

/// Created encryption key
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyDescription {
    /// Key ID
    pub id: String,
    /// Key ARN
    pub arn: String,
}

/// Key management operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KmsApi: Send + Sync {
    /// Create a symmetric key
    async fn create_key(&self, description: &str, tags: &BTreeMap<String, String>) -> ProviderResult<KeyDescription>;
    /// Schedule key deletion after `pending_days`
    async fn schedule_key_deletion(&self, key_id: &str, pending_days: u32) -> ProviderResult<()>;
}

// =============================================================================
// EC2
// =============================================================================

/// One compute instance
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Instance ID
    pub instance_id: String,
    /// Instance type
    #[serde(default)]
    pub instance_type: String,
    /// State name, e.g. `running`
    #[serde(default)]
    pub state: String,
    /// Private IP
    #[serde(default)]
    pub private_ip: String,
    /// Private DNS name (also the Kubernetes node name)
    #[serde(default)]
    pub private_dns: String,
    /// Public IP
    #[serde(default)]
    pub public_ip: String,
    /// Public DNS name
    #[serde(default)]
    pub public_dns: String,
}

/// Compute operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Ec2Api: Send + Sync {
    /// Create an SSH key pair; returns the private key material
    async fn create_key_pair(&self, name: &str) -> ProviderResult<String>;
    /// Delete an SSH key pair
    async fn delete_key_pair(&self, name: &str) -> ProviderResult<()>;
    /// Check that a key pair exists
    async fn describe_key_pair(&self, name: &str) -> ProviderResult<()>;
    /// Instances launched by an auto scaling group
    async fn describe_instances_by_asg(&self, asg_name: &str) -> ProviderResult<Vec<Instance>>;
    /// Enabled region names
    async fn describe_regions(&self) -> ProviderResult<Vec<String>>;
    /// Availability zones in the current region
    async fn describe_availability_zones(&self) -> ProviderResult<Vec<String>>;
}

// =============================================================================
// Object store
// =============================================================================

/// Upload of one local file
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PutObjectRequest {
    /// Bucket
    pub bucket: String,
    /// Object key
    pub key: String,
    /// Local file to upload
    pub path: PathBuf,
    /// Canned ACL, e.g. `private`
    pub acl: String,
    /// User metadata
    pub metadata: BTreeMap<String, String>,
}

/// Object store operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStoreApi: Send + Sync {
    /// Create a bucket in `region`
    async fn create_bucket(&self, bucket: &str, region: &str) -> ProviderResult<()>;
    /// Delete an empty bucket
    async fn delete_bucket(&self, bucket: &str) -> ProviderResult<()>;
    /// Upload one file
    async fn put_object(&self, req: &PutObjectRequest) -> ProviderResult<()>;
    /// Download one object
    async fn get_object(&self, bucket: &str, key: &str) -> ProviderResult<Vec<u8>>;
    /// Delete one object
    async fn delete_object(&self, bucket: &str, key: &str) -> ProviderResult<()>;
    /// Keys under `prefix`
    async fn list_objects(&self, bucket: &str, prefix: &str) -> ProviderResult<Vec<String>>;
}

// =============================================================================
// Load balancers
// =============================================================================

/// One load balancer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadBalancer {
    /// ARN
    pub arn: String,
    /// Name
    pub name: String,
    /// VPC the balancer lives in
    pub vpc_id: String,
    /// Public DNS name
    pub dns_name: String,
}

/// One page of [`LoadBalancerApi::describe_load_balancers`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadBalancerPage {
    /// Balancers on this page
    pub load_balancers: Vec<LoadBalancer>,
    /// Marker for the next page
    pub next_marker: Option<String>,
}

/// One listener rule
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListenerRule {
    /// Rule ARN
    pub arn: String,
    /// Default rules cannot be deleted
    pub is_default: bool,
}

/// Load balancer operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    /// One page of load balancers
    async fn describe_load_balancers(&self, marker: Option<String>) -> ProviderResult<LoadBalancerPage>;
    /// Tags per ARN
    async fn describe_tags(&self, arns: &[String]) -> ProviderResult<BTreeMap<String, BTreeMap<String, String>>>;
    /// Listener ARNs of a load balancer
    async fn describe_listeners(&self, lb_arn: &str) -> ProviderResult<Vec<String>>;
    /// Rules of a listener
    async fn describe_rules(&self, listener_arn: &str) -> ProviderResult<Vec<ListenerRule>>;
    /// Target group ARNs of a load balancer
    async fn describe_target_groups(&self, lb_arn: &str) -> ProviderResult<Vec<String>>;
    /// Delete a listener
    async fn delete_listener(&self, arn: &str) -> ProviderResult<()>;
    /// Delete a rule
    async fn delete_rule(&self, arn: &str) -> ProviderResult<()>;
    /// Delete a target group
    async fn delete_target_group(&self, arn: &str) -> ProviderResult<()>;
    /// Delete a load balancer
    async fn delete_load_balancer(&self, arn: &str) -> ProviderResult<()>;
}

// =============================================================================
// Caller identity
// =============================================================================

/// Identity of the calling session
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Account ID
    pub account: String,
    /// User ID
    pub user_id: String,
    /// Caller ARN
    pub arn: String,
}

impl CallerIdentity {
    /// Partition segment of the caller ARN (`aws`, `aws-cn`, ...)
    pub fn partition(&self) -> &str {
        self.arn.split(':').nth(1).filter(|p| !p.is_empty()).unwrap_or("aws")
    }
}

/// Identity operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// Who am I
    async fn get_caller_identity(&self) -> ProviderResult<CallerIdentity>;
    /// Pre-signed caller-identity URL bound to `cluster_name`, valid 60 s
    async fn presign_caller_identity(&self, cluster_name: &str) -> ProviderResult<String>;
}

// =============================================================================
// Bundle
// =============================================================================

/// One handle per provider service
#[derive(Clone)]
pub struct Providers {
    /// Template stacks
    pub stacks: Arc<dyn StackApi>,
    /// Clusters and node groups
    pub clusters: Arc<dyn ClusterApi>,
    /// IAM
    pub iam: Arc<dyn IamApi>,
    /// Key management
    pub kms: Arc<dyn KmsApi>,
    /// Compute
    pub ec2: Arc<dyn Ec2Api>,
    /// Object store
    pub s3: Arc<dyn ObjectStoreApi>,
    /// Load balancers
    pub elb: Arc<dyn LoadBalancerApi>,
    /// Caller identity
    pub identity: Arc<dyn IdentityApi>,
}

impl Providers {
    /// Use one implementation for every service
    pub fn from_shared<P>(provider: Arc<P>) -> Self
    where
        P: StackApi
            + ClusterApi
            + IamApi
            + KmsApi
            + Ec2Api
            + ObjectStoreApi
            + LoadBalancerApi
            + IdentityApi
            + 'static,
    {
        Self {
            stacks: provider.clone(),
            clusters: provider.clone(),
            iam: provider.clone(),
            kms: provider.clone(),
            ec2: provider.clone(),
            s3: provider.clone(),
            elb: provider.clone(),
            identity: provider,
        }
    }
}

impl std::fmt::Debug for Providers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Providers").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_comes_from_caller_arn() {
        let id = CallerIdentity {
            account: "123456789012".into(),
            user_id: "AIDA".into(),
            arn: "arn:aws-cn:iam::123456789012:user/ci".into(),
        };
        assert_eq!(id.partition(), "aws-cn");
        assert_eq!(CallerIdentity::default().partition(), "aws");
    }

    #[test]
    fn endpoint_is_custom_with_resolver_or_header() {
        assert!(!ApiEndpoint::default().is_custom());
        let ep = ApiEndpoint {
            resolver_url: Some("https://api.beta.eks.example".into()),
            ..Default::default()
        };
        assert!(ep.is_custom());
        let ep = ApiEndpoint {
            request_header: Some(("x-eks-canary".into(), "1".into())),
            ..Default::default()
        };
        assert!(ep.is_custom());
    }
}
