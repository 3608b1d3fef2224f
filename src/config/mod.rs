//! Configuration document: operator intent, engine status, per-add-on blocks.
//!
//! The document is YAML with camelCase keys. It is both the input to `Up`
//! and the durable record of everything `Up` created, so `Down` (possibly in
//! a later process) can find it again. All writes go through [`Store`].

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub mod addons;
pub mod env;
pub mod nodegroups;
pub mod store;
pub mod validate;

pub use addons::{
    AddOnAlb2048, AddOnCniVpc, AddOnCommon, AddOnCronJob, AddOnIrsa, AddOnJob, AddOnKind,
    AddOnLoad, AddOnManifestApp, AddOnNlbHelloWorld, AddOnPhase,
};
pub use nodegroups::{
    AddOnManagedNodeGroups, AddOnNodeGroups, Asg, Mng, MngScaleUpdate, MngVersionUpgrade,
    NodeRole,
};
pub use store::Store;

/// Synthetic status for a resource the provider no longer knows about
pub const STATUS_DELETED_OR_NOT_EXIST: &str = "DELETED/NOT-EXIST";

/// Provider status of a healthy cluster
pub const STATUS_ACTIVE: &str = "ACTIVE";

// =============================================================================
// Shared value types
// =============================================================================

/// Start/end of one phase
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeFrame {
    /// When the phase started
    pub start_utc: DateTime<Utc>,
    /// When it ended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_utc: Option<DateTime<Utc>>,
    /// Human-readable duration
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub took: String,
}

impl TimeFrame {
    /// Open a time frame at `now`
    pub fn start(now: DateTime<Utc>) -> Self {
        Self {
            start_utc: now,
            end_utc: None,
            took: String::new(),
        }
    }

    /// Close the time frame at `now`
    pub fn finish(&mut self, now: DateTime<Utc>) {
        self.end_utc = Some(now);
        let took = (now - self.start_utc).to_std().unwrap_or_default();
        self.took = format!("{:.1}s", took.as_secs_f64());
    }
}

/// One entry of the cluster status trail
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    /// When the status was observed
    pub time: DateTime<Utc>,
    /// Observed status
    pub status: String,
}

/// `/version` response of the API server
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerVersionInfo {
    /// Major version
    #[serde(default)]
    pub major: String,
    /// Minor version
    #[serde(default)]
    pub minor: String,
    /// Full version, e.g. `v1.30.4-eks-a737599`
    #[serde(default)]
    pub git_version: String,
    /// Build commit
    #[serde(default)]
    pub git_commit: String,
    /// Build date
    #[serde(default)]
    pub build_date: String,
    /// Go toolchain
    #[serde(default)]
    pub go_version: String,
    /// OS/arch
    #[serde(default)]
    pub platform: String,
}

/// Shell command run after a phase
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandHook {
    /// Command line, run with `sh -c`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    /// Where the command and its output are written
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_path: String,
    /// Deadline for the command
    #[serde(default)]
    pub timeout_seconds: u64,
}

impl CommandHook {
    /// True when a command is configured
    pub fn is_set(&self) -> bool {
        !self.command.trim().is_empty()
    }
}

/// Artifact bucket settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Bucket {
    /// Bucket name; empty disables artifact upload
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Create the bucket during Up
    #[serde(default)]
    pub create: bool,
    /// Keep the bucket on Down even when it was created by Up
    #[serde(default)]
    pub create_keep: bool,
    /// Days before uploaded objects expire (informational)
    #[serde(default)]
    pub lifecycle_expiration_days: u32,
}

// =============================================================================
// Parameters
// =============================================================================

/// Operator intent for the control plane and its network
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameters {
    /// Create the cluster role stack; otherwise `roleArn` must be given
    #[serde(default)]
    pub role_create: bool,
    /// Existing cluster role ARN
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role_arn: String,
    /// Role name when created
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role_name: String,
    /// Service principals trusted by the created role
    #[serde(default)]
    pub role_service_principals: Vec<String>,
    /// Managed policies attached to the created role
    #[serde(default)]
    pub role_managed_policy_arns: Vec<String>,
    /// Cluster tags
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Extra request header key for cluster API calls
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
    /// VPC CIDR when the VPC stack is created
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vpc_cidr: String,
    /// First public subnet CIDR
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_subnet_cidr_1: String,
    /// Second public subnet CIDR
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_subnet_cidr_2: String,
    /// First private subnet CIDR
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub private_subnet_cidr_1: String,
    /// Second private subnet CIDR
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub private_subnet_cidr_2: String,
    /// Existing VPC; requires subnets and control plane SG
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vpc_id: String,
    /// Existing public subnets
    #[serde(default)]
    pub public_subnet_ids: Vec<String>,
    /// Existing private subnets
    #[serde(default)]
    pub private_subnet_ids: Vec<String>,
    /// Existing control plane security group
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub control_plane_security_group_id: String,
    /// Kubernetes version
    #[serde(default)]
    pub version: String,
    /// Create a KMS key for secrets encryption
    #[serde(default)]
    pub encryption_cmk_create: bool,
    /// Existing KMS key for secrets encryption
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encryption_cmk_arn: String,
}

impl Parameters {
    /// Endpoint overrides for cluster calls
    pub fn endpoint(&self) -> crate::provider::ApiEndpoint {
        crate::provider::ApiEndpoint {
            resolver_url: (!self.resolver_url.is_empty()).then(|| self.resolver_url.clone()),
            signing_name: (!self.signing_name.is_empty()).then(|| self.signing_name.clone()),
            request_header: (!self.request_header_key.is_empty()).then(|| {
                (
                    self.request_header_key.clone(),
                    self.request_header_value.clone(),
                )
            }),
        }
    }

    /// True when the VPC is given rather than created
    pub fn vpc_given(&self) -> bool {
        !self.vpc_id.is_empty()
    }
}

// =============================================================================
// Status
// =============================================================================

/// Engine-maintained facts. Read-only for operators.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// True while the cluster is ACTIVE
    #[serde(default)]
    pub up: bool,
    /// Whole Up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_frame_create: Option<TimeFrame>,
    /// Whole Down
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_frame_delete: Option<TimeFrame>,
    /// API server `/version` as of the last health check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version_info: Option<ServerVersionInfo>,

    /// Caller account
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub aws_account_id: String,
    /// Caller user ID
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub aws_user_id: String,
    /// Caller ARN
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub aws_iam_role_arn: String,
    /// Partition derived from the caller ARN
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub aws_partition: String,

    /// Artifact bucket created by Up
    #[serde(default)]
    pub s3_bucket_created: bool,
    /// SSH key pair created by Up
    #[serde(default)]
    pub remote_access_key_created: bool,

    /// KMS key created by Up
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encryption_cmk_arn: String,
    /// KMS key ID created by Up
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encryption_cmk_id: String,

    /// Cluster role stack
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_role_cfn_stack_id: String,
    /// Cluster role ARN in use
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_role_arn: String,
    /// Cluster role name in use
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_role_name: String,

    /// VPC stack
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vpc_cfn_stack_id: String,
    /// VPC in use
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vpc_id: String,
    /// Public subnets in use
    #[serde(default)]
    pub public_subnet_ids: Vec<String>,
    /// Private subnets in use
    #[serde(default)]
    pub private_subnet_ids: Vec<String>,
    /// Control plane security group in use
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub control_plane_security_group_id: String,

    /// Cluster stack (template path)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_cfn_stack_id: String,
    /// Cluster ARN
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_arn: String,
    /// API server endpoint
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_api_server_endpoint: String,
    /// OIDC issuer URL as reported
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_oidc_issuer_url: String,
    /// OIDC issuer host and path
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_oidc_issuer_host_path: String,
    /// OIDC provider ARN
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_oidc_issuer_arn: String,
    /// SHA-1 thumbprint of the OIDC endpoint certificate
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_oidc_issuer_ca_thumbprint: String,
    /// Base64 cluster CA
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_ca: String,
    /// Decoded cluster CA (PEM)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_ca_decoded: String,
    /// Last observed cluster status
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_status_current: String,
    /// Status trail, newest first
    #[serde(default)]
    pub cluster_status: Vec<StatusEntry>,

    /// Rendered stack bodies by stack name
    #[serde(default)]
    pub stack_template_paths: BTreeMap<String, String>,
}

// =============================================================================
// Root document
// =============================================================================

/// The configuration document
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Where this document lives
    #[serde(default)]
    pub config_path: String,
    /// Cluster name; also the prefix of every created resource
    #[serde(default)]
    pub name: String,
    /// Region
    #[serde(default)]
    pub region: String,
    /// Log level
    #[serde(default)]
    pub log_level: String,
    /// `stderr`, `stdout` or file paths
    #[serde(default)]
    pub log_outputs: Vec<String>,

    /// Provider CLI binary
    #[serde(default)]
    pub aws_cli_path: String,
    /// Cluster CLI binary
    #[serde(default)]
    pub kubectl_path: String,
    /// Where to download the cluster CLI when missing
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubectl_download_url: String,
    /// kubeconfig written after the cluster is up
    #[serde(default)]
    pub kubeconfig_path: String,
    /// kubectl cheat-sheet written after Up
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubectl_commands_output_path: String,
    /// SSH cheat-sheet written after Up
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssh_commands_output_path: String,

    /// Run Down when Up fails
    #[serde(default)]
    pub on_failure_delete: bool,
    /// Pause before that Down
    #[serde(default)]
    pub on_failure_delete_wait_seconds: u64,
    /// Down only removes add-ons, leaving cluster and nodes
    #[serde(default)]
    pub skip_delete_cluster_and_nodes: bool,

    /// Run after the cluster is up
    #[serde(default)]
    pub command_after_create_cluster: CommandHook,
    /// Run after every add-on is up
    #[serde(default)]
    pub command_after_create_add_ons: CommandHook,

    /// Artifact bucket
    #[serde(default)]
    pub s3_bucket: S3Bucket,

    /// Create the SSH key pair
    #[serde(default)]
    pub remote_access_key_create: bool,
    /// SSH key pair name
    #[serde(default)]
    pub remote_access_key_name: String,
    /// Private key written here when created
    #[serde(default)]
    pub remote_access_private_key_path: String,

    /// Control plane parameters
    #[serde(default)]
    pub parameters: Parameters,

    /// Self-managed pools
    #[serde(default)]
    pub add_on_node_groups: AddOnNodeGroups,
    /// Provider-managed pools
    #[serde(default)]
    pub add_on_managed_node_groups: AddOnManagedNodeGroups,

    /// CNI tuning
    #[serde(default)]
    pub add_on_cni_vpc: AddOnCniVpc,
    /// Kubernetes dashboard
    #[serde(default)]
    pub add_on_kubernetes_dashboard: AddOnManifestApp,
    /// NLB hello world
    #[serde(default)]
    pub add_on_nlb_hello_world: AddOnNlbHelloWorld,
    /// ALB 2048
    #[serde(default)]
    pub add_on_alb2048: AddOnAlb2048,
    /// Perl pi job
    #[serde(default)]
    pub add_on_jobs_pi: AddOnJob,
    /// Echo job
    #[serde(default)]
    pub add_on_jobs_echo: AddOnJob,
    /// Echo cron job
    #[serde(default)]
    pub add_on_cron_jobs: AddOnCronJob,
    /// ConfigMap writer
    #[serde(default)]
    pub add_on_config_maps: AddOnLoad,
    /// Secret writer and reader
    #[serde(default)]
    pub add_on_secrets: AddOnLoad,
    /// API list/get stresser
    #[serde(default)]
    pub add_on_stresser: AddOnLoad,
    /// IAM roles for service accounts
    #[serde(default)]
    pub add_on_irsa: AddOnIrsa,
    /// Cluster autoscaler
    #[serde(default)]
    pub add_on_cluster_autoscaler: AddOnManifestApp,
    /// Metrics server
    #[serde(default)]
    pub add_on_metrics_server: AddOnManifestApp,
    /// Overprovisioning placeholder pods
    #[serde(default)]
    pub add_on_overprovisioning: AddOnManifestApp,

    /// Engine status
    #[serde(default)]
    pub status: Status,
}

impl Config {
    /// Read a document from disk. Defaults and validation are separate steps.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::validation(format!("failed to read config {}: {}", path.display(), e))
        })?;
        let mut cfg: Config = serde_yaml::from_str(&raw)?;
        cfg.config_path = absolute(path)?.display().to_string();
        Ok(cfg)
    }

    /// Write the document atomically: same-directory temp file, 0600, rename.
    pub fn sync(&self) -> Result<()> {
        if self.config_path.is_empty() {
            return Err(Error::validation("configPath is empty"));
        }
        let path = PathBuf::from(&self.config_path);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let body = serde_yaml::to_string(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(body.as_bytes())?;
        tmp.as_file().sync_all()?;
        set_private(tmp.path())?;
        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Directory holding the document; every derived path defaults under it
    pub fn config_dir(&self) -> PathBuf {
        Path::new(&self.config_path)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Either node pool variant is enabled
    pub fn any_node_groups_enabled(&self) -> bool {
        self.add_on_node_groups.enable || self.add_on_managed_node_groups.enable
    }

    /// Total desired node count across enabled pools
    pub fn total_desired_nodes(&self) -> u32 {
        let mut n = 0;
        if self.add_on_node_groups.enable {
            n += self
                .add_on_node_groups
                .asgs
                .values()
                .map(|a| a.asg_desired_capacity)
                .sum::<u32>();
        }
        if self.add_on_managed_node_groups.enable {
            n += self
                .add_on_managed_node_groups
                .mngs
                .values()
                .map(|m| m.asg_desired_capacity)
                .sum::<u32>();
        }
        n
    }

    /// Every file worth exporting, with its object key.
    pub fn artifacts(&self) -> Vec<ArtifactEntry> {
        let mut out = Vec::new();
        let mut push = |local: &str, logical: String, kind: ContentKind| {
            if local.is_empty() {
                return;
            }
            out.push(ArtifactEntry {
                local_path: PathBuf::from(local),
                remote_key: format!("{}/{}", self.name, logical),
                content_kind: kind,
            });
        };

        push(&self.config_path, file_name(&self.config_path), ContentKind::Config);
        for output in &self.log_outputs {
            if output.ends_with(".log") {
                push(output, file_name(output), ContentKind::Log);
            }
        }
        push(&self.kubeconfig_path, file_name(&self.kubeconfig_path), ContentKind::Kubeconfig);
        push(
            &self.kubectl_commands_output_path,
            file_name(&self.kubectl_commands_output_path),
            ContentKind::CommandOutput,
        );
        push(
            &self.ssh_commands_output_path,
            file_name(&self.ssh_commands_output_path),
            ContentKind::CommandOutput,
        );
        for path in self.status.stack_template_paths.values() {
            push(path, format!("cfn/{}", file_name(path)), ContentKind::StackTemplate);
        }
        for hook in [&self.command_after_create_cluster, &self.command_after_create_add_ons] {
            if hook.is_set() {
                push(&hook.output_path, file_name(&hook.output_path), ContentKind::CommandOutput);
            }
        }

        for (asg_name, asg) in &self.add_on_node_groups.asgs {
            for (instance_id, files) in &asg.logs {
                for f in files {
                    push(
                        f,
                        format!("node-logs/{asg_name}/{instance_id}/{}", file_name(f)),
                        ContentKind::NodeLog,
                    );
                }
            }
        }
        for (mng_name, mng) in &self.add_on_managed_node_groups.mngs {
            for (instance_id, files) in &mng.logs {
                for f in files {
                    push(
                        f,
                        format!("node-logs/{mng_name}/{instance_id}/{}", file_name(f)),
                        ContentKind::NodeLog,
                    );
                }
            }
        }

        for load in [&self.add_on_config_maps, &self.add_on_secrets, &self.add_on_stresser] {
            if load.common.created {
                push(
                    &load.summary_output_path,
                    file_name(&load.summary_output_path),
                    ContentKind::AddOnResult,
                );
            }
        }
        if self.add_on_irsa.common.created {
            push(
                &self.add_on_irsa.deployment_result_path,
                file_name(&self.add_on_irsa.deployment_result_path),
                ContentKind::AddOnResult,
            );
        }
        out
    }
}

/// What an artifact holds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentKind {
    /// The configuration document
    Config,
    /// A log file
    Log,
    /// kubeconfig
    Kubeconfig,
    /// Rendered stack template
    StackTemplate,
    /// Log collected from a node
    NodeLog,
    /// Add-on result file
    AddOnResult,
    /// Output of a command hook or cheat-sheet
    CommandOutput,
}

/// One file to export
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactEntry {
    /// Local file
    pub local_path: PathBuf,
    /// Object key, `<clusterName>/<logical-name>`
    pub remote_key: String,
    /// Content kind
    pub content_kind: ContentKind,
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(unix)]
fn set_private(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_private(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg_in(dir: &Path) -> Config {
        Config {
            config_path: dir.join("test-001.yaml").display().to_string(),
            name: "test-001".into(),
            region: "us-west-2".into(),
            ..Default::default()
        }
    }

    // =========================================================================
    // Story: the document survives a round trip through disk
    // =========================================================================

    /// Story: sync writes a private file that loads back identically
    #[test]
    fn story_sync_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = cfg_in(dir.path());
        cfg.add_on_jobs_pi.common.enable = true;
        cfg.add_on_jobs_pi.completes = 30;
        cfg.status.cluster_arn = "arn:aws:eks:us-west-2:123:cluster/test-001".into();
        cfg.sync().unwrap();

        let loaded = Config::load(&cfg.config_path).unwrap();
        assert_eq!(loaded, cfg);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&cfg.config_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    /// Story: keys are camelCase on disk
    #[test]
    fn story_document_uses_camel_case_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = cfg_in(dir.path());
        cfg.add_on_nlb_hello_world.common.enable = true;
        cfg.on_failure_delete = true;
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        assert!(yaml.contains("addOnNlbHelloWorld:"));
        assert!(yaml.contains("onFailureDelete: true"));
        assert!(yaml.contains("addOnAlb2048:"));
    }

    #[test]
    fn missing_file_is_a_validation_error() {
        let err = Config::load("/nonexistent/eks-harness.yaml").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn artifacts_use_cluster_name_prefix_and_skip_unset_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = cfg_in(dir.path());
        cfg.log_outputs = vec!["stderr".into(), "/tmp/test-001.log".into()];
        cfg.kubeconfig_path = "/tmp/test-001.kubeconfig.yaml".into();
        cfg.add_on_secrets.summary_output_path = "/tmp/secrets.json".into();

        let keys: Vec<String> = cfg.artifacts().into_iter().map(|a| a.remote_key).collect();
        assert!(keys.contains(&"test-001/test-001.yaml".to_string()));
        assert!(keys.contains(&"test-001/test-001.log".to_string()));
        assert!(keys.contains(&"test-001/test-001.kubeconfig.yaml".to_string()));
        // secrets never ran, so its summary is not exported
        assert!(!keys.iter().any(|k| k.ends_with("secrets.json")));
        assert!(keys.iter().all(|k| k.starts_with("test-001/")));
    }

    #[test]
    fn time_frame_records_duration() {
        let start = Utc::now();
        let mut tf = TimeFrame::start(start);
        tf.finish(start + chrono::Duration::seconds(90));
        assert_eq!(tf.took, "90.0s");
    }
}
