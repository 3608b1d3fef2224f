//! Provider facade backed by the provider CLI.
//!
//! Every call runs `aws <service> <operation> ... --output json` with a
//! per-call deadline (15 s for reads, 60 s for mutations) and parses the JSON
//! response. Failures are classified from the `An error occurred (<Code>)`
//! line the CLI prints on stderr.
//!
//! Create calls whose endpoint carries an extra request header bypass the
//! CLI and go through [`EksHttp`], signed with credentials the CLI exports.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, trace};

use super::eks_http::{Credentials, EksHttp, EksRequest};
use super::{
    ApiEndpoint, CallerIdentity, ClusterApi, ClusterDescription, CreateClusterRequest,
    CreateNodegroupRequest, CreateStackRequest, Ec2Api, IamApi, IdentityApi, Instance,
    KeyDescription, KmsApi, ListenerRule, LoadBalancer, LoadBalancerApi, LoadBalancerPage,
    NodegroupDescription, ObjectStoreApi, OidcProvider, ProviderError, ProviderErrorKind,
    ProviderResult, PutObjectRequest, RoleDescription, ScalingConfig, StackApi,
    StackDescription, UpdateDescription,
};
use crate::cluster::token::TOKEN_PREFIX;

/// Per-call deadline for describe/list calls
pub const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(15);
/// Per-call deadline for mutating calls
pub const MUTATE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CallKind {
    Read,
    Mutate,
}

/// Provider CLI driver
#[derive(Clone, Debug)]
pub struct AwsCli {
    binary: PathBuf,
    region: String,
    describe_timeout: Duration,
    mutate_timeout: Duration,
}

impl AwsCli {
    /// Driver for `binary` pinned to `region`
    pub fn new(binary: impl Into<PathBuf>, region: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            region: region.into(),
            describe_timeout: DESCRIBE_TIMEOUT,
            mutate_timeout: MUTATE_TIMEOUT,
        }
    }

    /// Override the per-call deadlines
    pub fn with_timeouts(mut self, describe: Duration, mutate: Duration) -> Self {
        self.describe_timeout = describe;
        self.mutate_timeout = mutate;
        self
    }

    async fn call(
        &self,
        service: &str,
        operation: &str,
        kind: CallKind,
        endpoint: Option<&ApiEndpoint>,
        args: Vec<String>,
    ) -> ProviderResult<serde_json::Value> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(service)
            .arg(cli_operation(operation))
            .args(&args)
            .args(["--region", &self.region, "--output", "json"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ep) = endpoint {
            if let Some(url) = &ep.resolver_url {
                cmd.args(["--endpoint-url", url]);
            }
            if let Some(name) = &ep.signing_name {
                trace!(service, operation, signing_name = %name, "signing name override");
            }
        }

        let deadline = match kind {
            CallKind::Read => self.describe_timeout,
            CallKind::Mutate => self.mutate_timeout,
        };
        debug!(service, operation, "provider call");

        let output = match tokio::time::timeout(deadline, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ProviderError::new(
                    service,
                    operation,
                    ProviderErrorKind::Other,
                    format!("failed to run {}: {}", self.binary.display(), e),
                ))
            }
            Err(_) => {
                return Err(ProviderError::new(
                    service,
                    operation,
                    ProviderErrorKind::Timeout,
                    format!("no response within {}s", deadline.as_secs()),
                ))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(parse_cli_error(service, operation, &stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&stdout).map_err(|e| {
            ProviderError::new(
                service,
                operation,
                ProviderErrorKind::Other,
                format!("invalid JSON response: {e}"),
            )
        })
    }

    async fn call_as<T: DeserializeOwned>(
        &self,
        service: &str,
        operation: &str,
        kind: CallKind,
        endpoint: Option<&ApiEndpoint>,
        args: Vec<String>,
    ) -> ProviderResult<T> {
        let value = self.call(service, operation, kind, endpoint, args).await?;
        decode(service, operation, value)
    }

    /// Credentials resolved by the CLI's own provider chain
    async fn export_credentials(&self) -> ProviderResult<Credentials> {
        self.call_as(
            "configure",
            "ExportCredentials",
            CallKind::Read,
            None,
            vec!["--format".into(), "process".into()],
        )
        .await
    }

    /// Run an EKS create call through the CLI, or through the signed
    /// transport when `endpoint` carries a request header
    async fn eks_create<T: DeserializeOwned>(
        &self,
        endpoint: &ApiEndpoint,
        args: Vec<String>,
        rest: EksRequest,
    ) -> ProviderResult<T> {
        if endpoint.request_header.is_none() {
            return self
                .call_as("eks", rest.operation, CallKind::Mutate, Some(endpoint), args)
                .await;
        }
        let credentials = self.export_credentials().await?;
        let http = EksHttp::new(endpoint, &self.region, credentials)?;
        let value = http.send(&rest, self.mutate_timeout).await?;
        decode("eks", rest.operation, value)
    }
}

fn decode<T: DeserializeOwned>(
    service: &str,
    operation: &str,
    value: serde_json::Value,
) -> ProviderResult<T> {
    serde_json::from_value(value).map_err(|e| {
        ProviderError::new(
            service,
            operation,
            ProviderErrorKind::Other,
            format!("unexpected response shape: {e}"),
        )
    })
}

/// `DescribeStacks` -> `describe-stacks`
fn cli_operation(operation: &str) -> String {
    let mut out = String::with_capacity(operation.len() + 4);
    let chars: Vec<char> = operation.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev_lower = i > 0 && chars[i - 1].is_ascii_lowercase();
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            let prev_upper = i > 0 && chars[i - 1].is_ascii_uppercase();
            if i > 0 && (prev_lower || (prev_upper && next_lower)) {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(*c);
        }
    }
    out
}

/// Parse `An error occurred (Code) when calling the Op operation: message`.
fn parse_cli_error(service: &str, operation: &str, stderr: &str) -> ProviderError {
    let line = stderr
        .lines()
        .find(|l| l.contains("An error occurred ("))
        .unwrap_or_else(|| stderr.trim());

    if let Some(start) = line.find("An error occurred (") {
        let rest = &line[start + "An error occurred (".len()..];
        if let Some(end) = rest.find(')') {
            let code = &rest[..end];
            let message = rest[end..]
                .split_once(": ")
                .map(|(_, m)| m.trim())
                .unwrap_or("")
                .to_string();
            return ProviderError::from_code(service, operation, code, message);
        }
    }

    // Connection-level failures from the CLI are worth retrying
    let kind = if line.contains("Could not connect") || line.contains("Read timeout") {
        ProviderErrorKind::Transient
    } else {
        ProviderErrorKind::Other
    };
    ProviderError::new(service, operation, kind, line.to_string())
}

fn tags_arg(tags: &BTreeMap<String, String>) -> Vec<String> {
    tags.iter()
        .map(|(k, v)| format!("Key={k},Value={v}"))
        .collect()
}

fn temp_file_with(
    service: &str,
    operation: &str,
    contents: &[u8],
) -> ProviderResult<tempfile::NamedTempFile> {
    let mut f = tempfile::NamedTempFile::new().map_err(|e| {
        ProviderError::new(service, operation, ProviderErrorKind::Other, e.to_string())
    })?;
    f.write_all(contents).map_err(|e| {
        ProviderError::new(service, operation, ProviderErrorKind::Other, e.to_string())
    })?;
    Ok(f)
}

fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

// =============================================================================
// Response shapes
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateStackOutput {
    stack_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeStacksOutput {
    #[serde(default)]
    stacks: Vec<StackJson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackJson {
    stack_id: String,
    stack_name: String,
    stack_status: String,
    #[serde(default)]
    stack_status_reason: Option<String>,
    #[serde(default)]
    outputs: Vec<StackOutputJson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackOutputJson {
    output_key: String,
    output_value: String,
}

#[derive(Deserialize)]
struct ClusterEnvelope {
    cluster: ClusterJson,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterJson {
    name: String,
    #[serde(default)]
    arn: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    certificate_authority: Option<CertificateAuthorityJson>,
    #[serde(default)]
    identity: Option<IdentityJson>,
}

#[derive(Deserialize)]
struct CertificateAuthorityJson {
    #[serde(default)]
    data: Option<String>,
}

#[derive(Deserialize)]
struct IdentityJson {
    #[serde(default)]
    oidc: Option<OidcJson>,
}

#[derive(Deserialize)]
struct OidcJson {
    #[serde(default)]
    issuer: Option<String>,
}

impl From<ClusterJson> for ClusterDescription {
    fn from(c: ClusterJson) -> Self {
        Self {
            name: c.name,
            arn: c.arn,
            status: c.status,
            endpoint: c.endpoint,
            certificate_authority: c.certificate_authority.and_then(|ca| ca.data),
            oidc_issuer: c.identity.and_then(|i| i.oidc).and_then(|o| o.issuer),
            version: c.version,
        }
    }
}

#[derive(Deserialize)]
struct NodegroupEnvelope {
    nodegroup: NodegroupJson,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodegroupJson {
    nodegroup_name: String,
    #[serde(default)]
    nodegroup_arn: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    resources: Option<NodegroupResourcesJson>,
    #[serde(default)]
    health: Option<NodegroupHealthJson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodegroupResourcesJson {
    #[serde(default)]
    auto_scaling_groups: Vec<NamedJson>,
    #[serde(default)]
    remote_access_security_group: Option<String>,
}

#[derive(Deserialize)]
struct NamedJson {
    name: String,
}

#[derive(Deserialize)]
struct NodegroupHealthJson {
    #[serde(default)]
    issues: Vec<IssueJson>,
}

#[derive(Deserialize)]
struct IssueJson {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl From<NodegroupJson> for NodegroupDescription {
    fn from(n: NodegroupJson) -> Self {
        let (asgs, sg) = match n.resources {
            Some(r) => (
                r.auto_scaling_groups.into_iter().map(|a| a.name).collect(),
                r.remote_access_security_group,
            ),
            None => (Vec::new(), None),
        };
        Self {
            name: n.nodegroup_name,
            arn: n.nodegroup_arn,
            status: n.status,
            autoscaling_groups: asgs,
            remote_access_security_group: sg,
            health_issues: n
                .health
                .map(|h| {
                    h.issues
                        .into_iter()
                        .map(|i| format!("{}: {}", i.code, i.message))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct UpdateEnvelope {
    update: UpdateJson,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateJson {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    errors: Vec<UpdateErrorJson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateErrorJson {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    error_message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesOutput {
    #[serde(default)]
    reservations: Vec<ReservationJson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReservationJson {
    #[serde(default)]
    instances: Vec<InstanceJson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceJson {
    instance_id: String,
    #[serde(default)]
    instance_type: String,
    #[serde(default)]
    state: Option<InstanceStateJson>,
    #[serde(default)]
    private_ip_address: Option<String>,
    #[serde(default)]
    private_dns_name: Option<String>,
    #[serde(default)]
    public_ip_address: Option<String>,
    #[serde(default)]
    public_dns_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceStateJson {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LoadBalancersOutput {
    #[serde(default)]
    load_balancers: Vec<LoadBalancerJson>,
    #[serde(default)]
    next_token: Option<String>,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LoadBalancerJson {
    load_balancer_arn: String,
    #[serde(default)]
    load_balancer_name: String,
    #[serde(default, rename = "VpcId")]
    vpc_id: String,
    #[serde(default, rename = "DNSName")]
    dns_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TagDescriptionsOutput {
    #[serde(default)]
    tag_descriptions: Vec<TagDescriptionJson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TagDescriptionJson {
    resource_arn: String,
    #[serde(default)]
    tags: Vec<TagJson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TagJson {
    key: String,
    #[serde(default)]
    value: String,
}

// =============================================================================
// StackApi
// =============================================================================

#[async_trait]
impl StackApi for AwsCli {
    async fn create_stack(&self, req: &CreateStackRequest) -> ProviderResult<String> {
        let body = temp_file_with("cloudformation", "CreateStack", req.template_body.as_bytes())?;
        let mut args = vec![
            "--stack-name".to_string(),
            req.stack_name.clone(),
            "--template-body".to_string(),
            file_uri(body.path()),
            "--on-failure".to_string(),
            "DELETE".to_string(),
            "--capabilities".to_string(),
            "CAPABILITY_IAM".to_string(),
            "CAPABILITY_NAMED_IAM".to_string(),
        ];
        if !req.parameters.is_empty() {
            args.push("--parameters".to_string());
            args.extend(
                req.parameters
                    .iter()
                    .map(|(k, v)| format!("ParameterKey={k},ParameterValue={v}")),
            );
        }
        if !req.tags.is_empty() {
            args.push("--tags".to_string());
            args.extend(tags_arg(&req.tags));
        }
        let out: CreateStackOutput = self
            .call_as("cloudformation", "CreateStack", CallKind::Mutate, None, args)
            .await?;
        Ok(out.stack_id)
    }

    async fn delete_stack(&self, stack_id: &str) -> ProviderResult<()> {
        self.call(
            "cloudformation",
            "DeleteStack",
            CallKind::Mutate,
            None,
            vec!["--stack-name".into(), stack_id.into()],
        )
        .await?;
        Ok(())
    }

    async fn describe_stack(&self, stack_id: &str) -> ProviderResult<StackDescription> {
        let out: DescribeStacksOutput = self
            .call_as(
                "cloudformation",
                "DescribeStacks",
                CallKind::Read,
                None,
                vec!["--stack-name".into(), stack_id.into()],
            )
            .await?;
        let stack = out.stacks.into_iter().next().ok_or_else(|| {
            ProviderError::new(
                "cloudformation",
                "DescribeStacks",
                ProviderErrorKind::NotFound,
                format!("stack {stack_id} not found"),
            )
        })?;
        Ok(StackDescription {
            stack_id: stack.stack_id,
            stack_name: stack.stack_name,
            status: stack.stack_status,
            status_reason: stack.stack_status_reason,
            outputs: stack
                .outputs
                .into_iter()
                .map(|o| (o.output_key, o.output_value))
                .collect(),
        })
    }
}

// =============================================================================
// ClusterApi
// =============================================================================

#[async_trait]
impl ClusterApi for AwsCli {
    async fn create_cluster(&self, req: &CreateClusterRequest) -> ProviderResult<ClusterDescription> {
        let mut vpc = format!("subnetIds={}", req.subnet_ids.join(","));
        if !req.security_group_ids.is_empty() {
            vpc.push_str(&format!(",securityGroupIds={}", req.security_group_ids.join(",")));
        }
        let mut args = vec![
            "--name".to_string(),
            req.name.clone(),
            "--kubernetes-version".to_string(),
            req.version.clone(),
            "--role-arn".to_string(),
            req.role_arn.clone(),
            "--resources-vpc-config".to_string(),
            vpc,
        ];
        if !req.tags.is_empty() {
            args.push("--tags".to_string());
            args.push(
                req.tags
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        let encryption = req.encryption_key_arn.as_ref().map(|key| {
            serde_json::json!([{ "resources": ["secrets"], "provider": { "keyArn": key } }])
        });
        if let Some(config) = &encryption {
            args.push("--encryption-config".to_string());
            args.push(config.to_string());
        }

        let mut body = serde_json::json!({
            "name": req.name,
            "version": req.version,
            "roleArn": req.role_arn,
            "resourcesVpcConfig": {
                "subnetIds": req.subnet_ids,
                "securityGroupIds": req.security_group_ids,
            },
        });
        if !req.tags.is_empty() {
            body["tags"] = serde_json::json!(req.tags);
        }
        if let Some(config) = encryption {
            body["encryptionConfig"] = config;
        }
        let rest = EksRequest::post("CreateCluster", &["clusters"], body);

        let out: ClusterEnvelope = self.eks_create(&req.endpoint, args, rest).await?;
        Ok(out.cluster.into())
    }

    async fn delete_cluster(&self, endpoint: &ApiEndpoint, name: &str) -> ProviderResult<()> {
        self.call(
            "eks",
            "DeleteCluster",
            CallKind::Mutate,
            Some(endpoint),
            vec!["--name".into(), name.into()],
        )
        .await?;
        Ok(())
    }

    async fn describe_cluster(&self, endpoint: &ApiEndpoint, name: &str) -> ProviderResult<ClusterDescription> {
        let out: ClusterEnvelope = self
            .call_as(
                "eks",
                "DescribeCluster",
                CallKind::Read,
                Some(endpoint),
                vec!["--name".into(), name.into()],
            )
            .await?;
        Ok(out.cluster.into())
    }

    async fn create_nodegroup(&self, req: &CreateNodegroupRequest) -> ProviderResult<NodegroupDescription> {
        let mut args = vec![
            "--cluster-name".to_string(),
            req.cluster_name.clone(),
            "--nodegroup-name".to_string(),
            req.name.clone(),
            "--node-role".to_string(),
            req.role_arn.clone(),
            "--subnets".to_string(),
        ];
        args.extend(req.subnet_ids.iter().cloned());
        args.push("--instance-types".to_string());
        args.extend(req.instance_types.iter().cloned());
        args.extend([
            "--ami-type".to_string(),
            req.ami_type.clone(),
            "--disk-size".to_string(),
            req.disk_size.to_string(),
            "--scaling-config".to_string(),
            format!(
                "minSize={},maxSize={},desiredSize={}",
                req.scaling.min_size, req.scaling.max_size, req.scaling.desired_size
            ),
        ]);
        if let Some(key) = &req.remote_access_key {
            args.push("--remote-access".to_string());
            args.push(format!("ec2SshKey={key}"));
        }
        if let Some(rv) = &req.release_version {
            args.push("--release-version".to_string());
            args.push(rv.clone());
        }
        if !req.labels.is_empty() {
            args.push("--labels".to_string());
            args.push(
                req.labels
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        if !req.tags.is_empty() {
            args.push("--tags".to_string());
            args.push(
                req.tags
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }

        let mut body = serde_json::json!({
            "nodegroupName": req.name,
            "nodeRole": req.role_arn,
            "subnets": req.subnet_ids,
            "instanceTypes": req.instance_types,
            "amiType": req.ami_type,
            "diskSize": req.disk_size,
            "scalingConfig": req.scaling,
        });
        if let Some(key) = &req.remote_access_key {
            body["remoteAccess"] = serde_json::json!({ "ec2SshKey": key });
        }
        if let Some(rv) = &req.release_version {
            body["releaseVersion"] = serde_json::json!(rv);
        }
        if !req.labels.is_empty() {
            body["labels"] = serde_json::json!(req.labels);
        }
        if !req.tags.is_empty() {
            body["tags"] = serde_json::json!(req.tags);
        }
        let rest = EksRequest::post(
            "CreateNodegroup",
            &["clusters", &req.cluster_name, "node-groups"],
            body,
        );

        let out: NodegroupEnvelope = self.eks_create(&req.endpoint, args, rest).await?;
        Ok(out.nodegroup.into())
    }

    async fn delete_nodegroup(&self, endpoint: &ApiEndpoint, cluster: &str, name: &str) -> ProviderResult<()> {
        self.call(
            "eks",
            "DeleteNodegroup",
            CallKind::Mutate,
            Some(endpoint),
            vec![
                "--cluster-name".into(),
                cluster.into(),
                "--nodegroup-name".into(),
                name.into(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn describe_nodegroup(
        &self,
        endpoint: &ApiEndpoint,
        cluster: &str,
        name: &str,
    ) -> ProviderResult<NodegroupDescription> {
        let out: NodegroupEnvelope = self
            .call_as(
                "eks",
                "DescribeNodegroup",
                CallKind::Read,
                Some(endpoint),
                vec![
                    "--cluster-name".into(),
                    cluster.into(),
                    "--nodegroup-name".into(),
                    name.into(),
                ],
            )
            .await?;
        Ok(out.nodegroup.into())
    }

    async fn update_nodegroup_config(
        &self,
        endpoint: &ApiEndpoint,
        cluster: &str,
        name: &str,
        scaling: ScalingConfig,
    ) -> ProviderResult<String> {
        let out: UpdateEnvelope = self
            .call_as(
                "eks",
                "UpdateNodegroupConfig",
                CallKind::Mutate,
                Some(endpoint),
                vec![
                    "--cluster-name".into(),
                    cluster.into(),
                    "--nodegroup-name".into(),
                    name.into(),
                    "--scaling-config".into(),
                    format!(
                        "minSize={},maxSize={},desiredSize={}",
                        scaling.min_size, scaling.max_size, scaling.desired_size
                    ),
                ],
            )
            .await?;
        Ok(out.update.id)
    }

    async fn update_nodegroup_version(
        &self,
        endpoint: &ApiEndpoint,
        cluster: &str,
        name: &str,
        version: &str,
    ) -> ProviderResult<String> {
        let out: UpdateEnvelope = self
            .call_as(
                "eks",
                "UpdateNodegroupVersion",
                CallKind::Mutate,
                Some(endpoint),
                vec![
                    "--cluster-name".into(),
                    cluster.into(),
                    "--nodegroup-name".into(),
                    name.into(),
                    "--kubernetes-version".into(),
                    version.into(),
                ],
            )
            .await?;
        Ok(out.update.id)
    }

    async fn describe_update(
        &self,
        endpoint: &ApiEndpoint,
        cluster: &str,
        nodegroup: &str,
        update_id: &str,
    ) -> ProviderResult<UpdateDescription> {
        let out: UpdateEnvelope = self
            .call_as(
                "eks",
                "DescribeUpdate",
                CallKind::Read,
                Some(endpoint),
                vec![
                    "--name".into(),
                    cluster.into(),
                    "--nodegroup-name".into(),
                    nodegroup.into(),
                    "--update-id".into(),
                    update_id.into(),
                ],
            )
            .await?;
        Ok(UpdateDescription {
            id: out.update.id,
            status: out.update.status,
            errors: out
                .update
                .errors
                .into_iter()
                .map(|e| format!("{}: {}", e.error_code, e.error_message))
                .collect(),
        })
    }
}

// =============================================================================
// IamApi
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetOidcProviderOutput {
    #[serde(default)]
    url: String,
    #[serde(default)]
    thumbprint_list: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateOidcProviderOutput {
    #[serde(rename = "OpenIDConnectProviderArn")]
    arn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PolicyEnvelope {
    policy: ArnJson,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ArnJson {
    arn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleEnvelope {
    role: RoleJson,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleJson {
    role_name: String,
    arn: String,
}

#[async_trait]
impl IamApi for AwsCli {
    async fn get_oidc_provider(&self, arn: &str) -> ProviderResult<OidcProvider> {
        let out: GetOidcProviderOutput = self
            .call_as(
                "iam",
                "GetOpenIDConnectProvider",
                CallKind::Read,
                None,
                vec!["--open-id-connect-provider-arn".into(), arn.into()],
            )
            .await?;
        Ok(OidcProvider {
            arn: arn.to_string(),
            url: out.url,
            thumbprints: out.thumbprint_list,
        })
    }

    async fn create_oidc_provider(
        &self,
        url: &str,
        client_ids: &[String],
        thumbprints: &[String],
    ) -> ProviderResult<String> {
        let mut args = vec!["--url".to_string(), url.to_string(), "--client-id-list".to_string()];
        args.extend(client_ids.iter().cloned());
        args.push("--thumbprint-list".to_string());
        args.extend(thumbprints.iter().cloned());
        let out: CreateOidcProviderOutput = self
            .call_as("iam", "CreateOpenIDConnectProvider", CallKind::Mutate, None, args)
            .await?;
        Ok(out.arn)
    }

    async fn delete_oidc_provider(&self, arn: &str) -> ProviderResult<()> {
        self.call(
            "iam",
            "DeleteOpenIDConnectProvider",
            CallKind::Mutate,
            None,
            vec!["--open-id-connect-provider-arn".into(), arn.into()],
        )
        .await?;
        Ok(())
    }

    async fn get_role(&self, name: &str) -> ProviderResult<RoleDescription> {
        let out: RoleEnvelope = self
            .call_as("iam", "GetRole", CallKind::Read, None, vec!["--role-name".into(), name.into()])
            .await?;
        Ok(RoleDescription {
            name: out.role.role_name,
            arn: out.role.arn,
        })
    }

    async fn create_policy(&self, name: &str, document: &str) -> ProviderResult<String> {
        let doc = temp_file_with("iam", "CreatePolicy", document.as_bytes())?;
        let out: PolicyEnvelope = self
            .call_as(
                "iam",
                "CreatePolicy",
                CallKind::Mutate,
                None,
                vec![
                    "--policy-name".into(),
                    name.into(),
                    "--policy-document".into(),
                    file_uri(doc.path()),
                ],
            )
            .await?;
        Ok(out.policy.arn)
    }

    async fn delete_policy(&self, arn: &str) -> ProviderResult<()> {
        self.call(
            "iam",
            "DeletePolicy",
            CallKind::Mutate,
            None,
            vec!["--policy-arn".into(), arn.into()],
        )
        .await?;
        Ok(())
    }
}

// =============================================================================
// KmsApi
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KeyEnvelope {
    key_metadata: KeyMetadataJson,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KeyMetadataJson {
    key_id: String,
    arn: String,
}

#[async_trait]
impl KmsApi for AwsCli {
    async fn create_key(&self, description: &str, tags: &BTreeMap<String, String>) -> ProviderResult<KeyDescription> {
        let mut args = vec!["--description".to_string(), description.to_string()];
        if !tags.is_empty() {
            args.push("--tags".to_string());
            args.extend(tags.iter().map(|(k, v)| format!("TagKey={k},TagValue={v}")));
        }
        let out: KeyEnvelope = self.call_as("kms", "CreateKey", CallKind::Mutate, None, args).await?;
        Ok(KeyDescription {
            id: out.key_metadata.key_id,
            arn: out.key_metadata.arn,
        })
    }

    async fn schedule_key_deletion(&self, key_id: &str, pending_days: u32) -> ProviderResult<()> {
        self.call(
            "kms",
            "ScheduleKeyDeletion",
            CallKind::Mutate,
            None,
            vec![
                "--key-id".into(),
                key_id.into(),
                "--pending-window-in-days".into(),
                pending_days.to_string(),
            ],
        )
        .await?;
        Ok(())
    }
}

// =============================================================================
// Ec2Api
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KeyPairOutput {
    key_material: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RegionsOutput {
    #[serde(default)]
    regions: Vec<RegionJson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RegionJson {
    region_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ZonesOutput {
    #[serde(default)]
    availability_zones: Vec<ZoneJson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ZoneJson {
    zone_name: String,
}

#[async_trait]
impl Ec2Api for AwsCli {
    async fn create_key_pair(&self, name: &str) -> ProviderResult<String> {
        let out: KeyPairOutput = self
            .call_as("ec2", "CreateKeyPair", CallKind::Mutate, None, vec!["--key-name".into(), name.into()])
            .await?;
        Ok(out.key_material)
    }

    async fn delete_key_pair(&self, name: &str) -> ProviderResult<()> {
        self.call("ec2", "DeleteKeyPair", CallKind::Mutate, None, vec!["--key-name".into(), name.into()])
            .await?;
        Ok(())
    }

    async fn describe_key_pair(&self, name: &str) -> ProviderResult<()> {
        self.call("ec2", "DescribeKeyPairs", CallKind::Read, None, vec!["--key-names".into(), name.into()])
            .await?;
        Ok(())
    }

    async fn describe_instances_by_asg(&self, asg_name: &str) -> ProviderResult<Vec<Instance>> {
        let out: DescribeInstancesOutput = self
            .call_as(
                "ec2",
                "DescribeInstances",
                CallKind::Read,
                None,
                vec![
                    "--filters".into(),
                    format!("Name=tag:aws:autoscaling:groupName,Values={asg_name}"),
                ],
            )
            .await?;
        Ok(out
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .map(|i| Instance {
                instance_id: i.instance_id,
                instance_type: i.instance_type,
                state: i.state.map(|s| s.name).unwrap_or_default(),
                private_ip: i.private_ip_address.unwrap_or_default(),
                private_dns: i.private_dns_name.unwrap_or_default(),
                public_ip: i.public_ip_address.unwrap_or_default(),
                public_dns: i.public_dns_name.unwrap_or_default(),
            })
            .collect())
    }

    async fn describe_regions(&self) -> ProviderResult<Vec<String>> {
        let out: RegionsOutput = self
            .call_as("ec2", "DescribeRegions", CallKind::Read, None, Vec::new())
            .await?;
        Ok(out.regions.into_iter().map(|r| r.region_name).collect())
    }

    async fn describe_availability_zones(&self) -> ProviderResult<Vec<String>> {
        let out: ZonesOutput = self
            .call_as("ec2", "DescribeAvailabilityZones", CallKind::Read, None, Vec::new())
            .await?;
        Ok(out.availability_zones.into_iter().map(|z| z.zone_name).collect())
    }
}

// =============================================================================
// ObjectStoreApi
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListObjectsOutput {
    #[serde(default)]
    contents: Vec<ObjectJson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ObjectJson {
    key: String,
}

#[async_trait]
impl ObjectStoreApi for AwsCli {
    async fn create_bucket(&self, bucket: &str, region: &str) -> ProviderResult<()> {
        let mut args = vec!["--bucket".to_string(), bucket.to_string()];
        // us-east-1 rejects an explicit location constraint
        if region != "us-east-1" {
            args.push("--create-bucket-configuration".to_string());
            args.push(format!("LocationConstraint={region}"));
        }
        self.call("s3api", "CreateBucket", CallKind::Mutate, None, args).await?;
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> ProviderResult<()> {
        self.call("s3api", "DeleteBucket", CallKind::Mutate, None, vec!["--bucket".into(), bucket.into()])
            .await?;
        Ok(())
    }

    async fn put_object(&self, req: &PutObjectRequest) -> ProviderResult<()> {
        let mut args = vec![
            "--bucket".to_string(),
            req.bucket.clone(),
            "--key".to_string(),
            req.key.clone(),
            "--body".to_string(),
            req.path.display().to_string(),
            "--acl".to_string(),
            req.acl.clone(),
        ];
        if !req.metadata.is_empty() {
            args.push("--metadata".to_string());
            args.push(
                req.metadata
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        self.call("s3api", "PutObject", CallKind::Mutate, None, args).await?;
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> ProviderResult<Vec<u8>> {
        let dest = tempfile::NamedTempFile::new().map_err(|e| {
            ProviderError::new("s3api", "GetObject", ProviderErrorKind::Other, e.to_string())
        })?;
        self.call(
            "s3api",
            "GetObject",
            CallKind::Mutate,
            None,
            vec![
                "--bucket".into(),
                bucket.into(),
                "--key".into(),
                key.into(),
                dest.path().display().to_string(),
            ],
        )
        .await?;
        tokio::fs::read(dest.path()).await.map_err(|e| {
            ProviderError::new("s3api", "GetObject", ProviderErrorKind::Other, e.to_string())
        })
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> ProviderResult<()> {
        self.call(
            "s3api",
            "DeleteObject",
            CallKind::Mutate,
            None,
            vec!["--bucket".into(), bucket.into(), "--key".into(), key.into()],
        )
        .await?;
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> ProviderResult<Vec<String>> {
        let out: Option<ListObjectsOutput> = self
            .call_as(
                "s3api",
                "ListObjectsV2",
                CallKind::Read,
                None,
                vec!["--bucket".into(), bucket.into(), "--prefix".into(), prefix.into()],
            )
            .await?;
        Ok(out
            .map(|o| o.contents.into_iter().map(|c| c.key).collect())
            .unwrap_or_default())
    }
}

// =============================================================================
// LoadBalancerApi
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListenersOutput {
    #[serde(default)]
    listeners: Vec<ListenerJson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListenerJson {
    listener_arn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RulesOutput {
    #[serde(default)]
    rules: Vec<RuleJson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RuleJson {
    rule_arn: String,
    #[serde(default)]
    is_default: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TargetGroupsOutput {
    #[serde(default)]
    target_groups: Vec<TargetGroupJson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TargetGroupJson {
    target_group_arn: String,
}

/// Page size for load balancer listing
const LB_PAGE_SIZE: u32 = 400;

#[async_trait]
impl LoadBalancerApi for AwsCli {
    async fn describe_load_balancers(&self, marker: Option<String>) -> ProviderResult<LoadBalancerPage> {
        let mut args = vec!["--max-items".to_string(), LB_PAGE_SIZE.to_string()];
        if let Some(m) = marker {
            args.push("--starting-token".to_string());
            args.push(m);
        }
        let out: LoadBalancersOutput = self
            .call_as("elbv2", "DescribeLoadBalancers", CallKind::Read, None, args)
            .await?;
        Ok(LoadBalancerPage {
            load_balancers: out
                .load_balancers
                .into_iter()
                .map(|lb| LoadBalancer {
                    arn: lb.load_balancer_arn,
                    name: lb.load_balancer_name,
                    vpc_id: lb.vpc_id,
                    dns_name: lb.dns_name,
                })
                .collect(),
            next_marker: out.next_token.or(out.next_marker),
        })
    }

    async fn describe_tags(&self, arns: &[String]) -> ProviderResult<BTreeMap<String, BTreeMap<String, String>>> {
        let mut tags = BTreeMap::new();
        // the API accepts at most 20 ARNs per call
        for chunk in arns.chunks(20) {
            let mut args = vec!["--resource-arns".to_string()];
            args.extend(chunk.iter().cloned());
            let out: TagDescriptionsOutput = self
                .call_as("elbv2", "DescribeTags", CallKind::Read, None, args)
                .await?;
            for desc in out.tag_descriptions {
                tags.insert(
                    desc.resource_arn,
                    desc.tags.into_iter().map(|t| (t.key, t.value)).collect(),
                );
            }
        }
        Ok(tags)
    }

    async fn describe_listeners(&self, lb_arn: &str) -> ProviderResult<Vec<String>> {
        let out: ListenersOutput = self
            .call_as(
                "elbv2",
                "DescribeListeners",
                CallKind::Read,
                None,
                vec!["--load-balancer-arn".into(), lb_arn.into()],
            )
            .await?;
        Ok(out.listeners.into_iter().map(|l| l.listener_arn).collect())
    }

    async fn describe_rules(&self, listener_arn: &str) -> ProviderResult<Vec<ListenerRule>> {
        let out: RulesOutput = self
            .call_as(
                "elbv2",
                "DescribeRules",
                CallKind::Read,
                None,
                vec!["--listener-arn".into(), listener_arn.into()],
            )
            .await?;
        Ok(out
            .rules
            .into_iter()
            .map(|r| ListenerRule {
                arn: r.rule_arn,
                is_default: r.is_default,
            })
            .collect())
    }

    async fn describe_target_groups(&self, lb_arn: &str) -> ProviderResult<Vec<String>> {
        let out: TargetGroupsOutput = self
            .call_as(
                "elbv2",
                "DescribeTargetGroups",
                CallKind::Read,
                None,
                vec!["--load-balancer-arn".into(), lb_arn.into()],
            )
            .await?;
        Ok(out.target_groups.into_iter().map(|t| t.target_group_arn).collect())
    }

    async fn delete_listener(&self, arn: &str) -> ProviderResult<()> {
        self.call("elbv2", "DeleteListener", CallKind::Mutate, None, vec!["--listener-arn".into(), arn.into()])
            .await?;
        Ok(())
    }

    async fn delete_rule(&self, arn: &str) -> ProviderResult<()> {
        self.call("elbv2", "DeleteRule", CallKind::Mutate, None, vec!["--rule-arn".into(), arn.into()])
            .await?;
        Ok(())
    }

    async fn delete_target_group(&self, arn: &str) -> ProviderResult<()> {
        self.call(
            "elbv2",
            "DeleteTargetGroup",
            CallKind::Mutate,
            None,
            vec!["--target-group-arn".into(), arn.into()],
        )
        .await?;
        Ok(())
    }

    async fn delete_load_balancer(&self, arn: &str) -> ProviderResult<()> {
        self.call(
            "elbv2",
            "DeleteLoadBalancer",
            CallKind::Mutate,
            None,
            vec!["--load-balancer-arn".into(), arn.into()],
        )
        .await?;
        Ok(())
    }
}

// =============================================================================
// IdentityApi
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallerIdentityOutput {
    account: String,
    user_id: String,
    arn: String,
}

#[derive(Deserialize)]
struct ExecCredentialOutput {
    status: ExecCredentialStatus,
}

#[derive(Deserialize)]
struct ExecCredentialStatus {
    token: String,
}

#[async_trait]
impl IdentityApi for AwsCli {
    async fn get_caller_identity(&self) -> ProviderResult<CallerIdentity> {
        let out: CallerIdentityOutput = self
            .call_as("sts", "GetCallerIdentity", CallKind::Read, None, Vec::new())
            .await?;
        Ok(CallerIdentity {
            account: out.account,
            user_id: out.user_id,
            arn: out.arn,
        })
    }

    async fn presign_caller_identity(&self, cluster_name: &str) -> ProviderResult<String> {
        // `eks get-token` signs GetCallerIdentity with the x-k8s-aws-id header
        // and a 60 s expiry; unwrap the URL so the token format stays ours.
        let out: ExecCredentialOutput = self
            .call_as(
                "eks",
                "GetToken",
                CallKind::Read,
                None,
                vec!["--cluster-name".into(), cluster_name.into()],
            )
            .await?;
        let encoded = out.status.token.strip_prefix(TOKEN_PREFIX).ok_or_else(|| {
            ProviderError::new(
                "eks",
                "GetToken",
                ProviderErrorKind::Other,
                "token without the expected prefix",
            )
        })?;
        let url = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|e| {
                ProviderError::new("eks", "GetToken", ProviderErrorKind::Other, e.to_string())
            })?;
        String::from_utf8(url).map_err(|e| {
            ProviderError::new("eks", "GetToken", ProviderErrorKind::Other, e.to_string())
        })
    }
}
