//! Per-add-on configuration blocks.
//!
//! Every block embeds [`AddOnCommon`] (flattened), which carries the enable
//! flag, the crash-safety `created` flag and the lifecycle phase. The rest of
//! each block is the add-on's own parameters and outputs.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::TimeFrame;

/// Lifecycle phase of one add-on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AddOnPhase {
    /// Not enabled
    #[default]
    Disabled,
    /// Enabled, not started
    Pending,
    /// Create in progress (`created` is already set)
    Creating,
    /// Create finished
    Created,
    /// Create or delete failed
    Failed,
    /// Delete in progress
    Deleting,
    /// Delete finished
    Deleted,
}

impl fmt::Display for AddOnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disabled => "DISABLED",
            Self::Pending => "PENDING",
            Self::Creating => "CREATING",
            Self::Created => "CREATED",
            Self::Failed => "FAILED",
            Self::Deleting => "DELETING",
            Self::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

/// Fields shared by every add-on block
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOnCommon {
    /// Install this add-on during Up
    #[serde(default)]
    pub enable: bool,
    /// Set before any resource is created, cleared only after a successful delete
    #[serde(default)]
    pub created: bool,
    /// Namespace the add-on installs into
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: AddOnPhase,
    /// Last create attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_frame_create: Option<TimeFrame>,
    /// Last delete attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_frame_delete: Option<TimeFrame>,
}

impl AddOnCommon {
    /// Enter `CREATING`: mark created before any work happens.
    pub fn begin_create(&mut self) {
        self.created = true;
        self.phase = AddOnPhase::Creating;
        self.time_frame_create = Some(TimeFrame::start(Utc::now()));
    }

    /// Leave `CREATING` with the outcome of the create.
    pub fn finish_create(&mut self, ok: bool) {
        self.phase = if ok {
            AddOnPhase::Created
        } else {
            AddOnPhase::Failed
        };
        if let Some(tf) = self.time_frame_create.as_mut() {
            tf.finish(Utc::now());
        }
    }

    /// Enter `DELETING`.
    pub fn begin_delete(&mut self) {
        self.phase = AddOnPhase::Deleting;
        self.time_frame_delete = Some(TimeFrame::start(Utc::now()));
    }

    /// Leave `DELETING`; `created` is only cleared when the delete succeeded.
    pub fn finish_delete(&mut self, ok: bool) {
        if ok {
            self.created = false;
            self.phase = AddOnPhase::Deleted;
        } else {
            self.phase = AddOnPhase::Failed;
        }
        if let Some(tf) = self.time_frame_delete.as_mut() {
            tf.finish(Utc::now());
        }
    }

    /// Phase a freshly validated block starts in
    pub fn reset_phase(&mut self) {
        if !self.enable && !self.created {
            self.phase = AddOnPhase::Disabled;
        } else if self.phase == AddOnPhase::Disabled {
            self.phase = AddOnPhase::Pending;
        }
    }
}

/// Every add-on the engine knows, in install order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddOnKind {
    /// `aws-node` tuning
    CniVpc,
    /// Kubernetes dashboard
    KubernetesDashboard,
    /// NLB hello world
    NlbHelloWorld,
    /// ALB 2048
    Alb2048,
    /// Perl pi job
    JobsPi,
    /// Echo job
    JobsEcho,
    /// Echo cron job
    CronJobs,
    /// ConfigMap writer
    ConfigMaps,
    /// Secret writer and reader
    Secrets,
    /// API list/get stresser
    Stresser,
    /// IAM roles for service accounts
    Irsa,
    /// Cluster autoscaler
    ClusterAutoscaler,
    /// Metrics server
    MetricsServer,
    /// Overprovisioning placeholder pods
    Overprovisioning,
}

impl AddOnKind {
    /// All kinds, in declaration order
    pub const ALL: [AddOnKind; 14] = [
        Self::CniVpc,
        Self::KubernetesDashboard,
        Self::NlbHelloWorld,
        Self::Alb2048,
        Self::JobsPi,
        Self::JobsEcho,
        Self::CronJobs,
        Self::ConfigMaps,
        Self::Secrets,
        Self::Stresser,
        Self::Irsa,
        Self::ClusterAutoscaler,
        Self::MetricsServer,
        Self::Overprovisioning,
    ];

    /// Stable name used in logs, namespaces and artifact keys
    pub fn name(self) -> &'static str {
        match self {
            Self::CniVpc => "cni-vpc",
            Self::KubernetesDashboard => "kubernetes-dashboard",
            Self::NlbHelloWorld => "nlb-hello-world",
            Self::Alb2048 => "alb-2048",
            Self::JobsPi => "jobs-pi",
            Self::JobsEcho => "jobs-echo",
            Self::CronJobs => "cron-jobs",
            Self::ConfigMaps => "config-maps",
            Self::Secrets => "secrets",
            Self::Stresser => "stresser",
            Self::Irsa => "irsa",
            Self::ClusterAutoscaler => "cluster-autoscaler",
            Self::MetricsServer => "metrics-server",
            Self::Overprovisioning => "overprovisioning",
        }
    }

    /// Shared fields of this add-on's block
    pub fn common(self, cfg: &super::Config) -> &AddOnCommon {
        match self {
            Self::CniVpc => &cfg.add_on_cni_vpc.common,
            Self::KubernetesDashboard => &cfg.add_on_kubernetes_dashboard.common,
            Self::NlbHelloWorld => &cfg.add_on_nlb_hello_world.common,
            Self::Alb2048 => &cfg.add_on_alb2048.common,
            Self::JobsPi => &cfg.add_on_jobs_pi.common,
            Self::JobsEcho => &cfg.add_on_jobs_echo.common,
            Self::CronJobs => &cfg.add_on_cron_jobs.common,
            Self::ConfigMaps => &cfg.add_on_config_maps.common,
            Self::Secrets => &cfg.add_on_secrets.common,
            Self::Stresser => &cfg.add_on_stresser.common,
            Self::Irsa => &cfg.add_on_irsa.common,
            Self::ClusterAutoscaler => &cfg.add_on_cluster_autoscaler.common,
            Self::MetricsServer => &cfg.add_on_metrics_server.common,
            Self::Overprovisioning => &cfg.add_on_overprovisioning.common,
        }
    }

    /// Mutable shared fields of this add-on's block
    pub fn common_mut(self, cfg: &mut super::Config) -> &mut AddOnCommon {
        match self {
            Self::CniVpc => &mut cfg.add_on_cni_vpc.common,
            Self::KubernetesDashboard => &mut cfg.add_on_kubernetes_dashboard.common,
            Self::NlbHelloWorld => &mut cfg.add_on_nlb_hello_world.common,
            Self::Alb2048 => &mut cfg.add_on_alb2048.common,
            Self::JobsPi => &mut cfg.add_on_jobs_pi.common,
            Self::JobsEcho => &mut cfg.add_on_jobs_echo.common,
            Self::CronJobs => &mut cfg.add_on_cron_jobs.common,
            Self::ConfigMaps => &mut cfg.add_on_config_maps.common,
            Self::Secrets => &mut cfg.add_on_secrets.common,
            Self::Stresser => &mut cfg.add_on_stresser.common,
            Self::Irsa => &mut cfg.add_on_irsa.common,
            Self::ClusterAutoscaler => &mut cfg.add_on_cluster_autoscaler.common,
            Self::MetricsServer => &mut cfg.add_on_metrics_server.common,
            Self::Overprovisioning => &mut cfg.add_on_overprovisioning.common,
        }
    }

    /// Namespace used when the block does not name one
    pub fn default_namespace(self, cluster_name: &str) -> String {
        match self {
            Self::CniVpc | Self::ClusterAutoscaler | Self::MetricsServer => {
                "kube-system".to_string()
            }
            Self::KubernetesDashboard => "kubernetes-dashboard".to_string(),
            other => format!("{cluster_name}-{}", other.name()),
        }
    }

    /// True when the add-on schedules pods and so needs worker nodes
    pub fn needs_nodes(self) -> bool {
        !matches!(self, Self::CniVpc)
    }
}

impl fmt::Display for AddOnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// CNI plugin tuning applied to the `aws-node` DaemonSet
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOnCniVpc {
    /// Shared fields
    #[serde(flatten)]
    pub common: AddOnCommon,
    /// `MINIMUM_IP_TARGET`; 0 leaves it unset
    #[serde(default)]
    pub minimum_ip_target: u32,
    /// `WARM_IP_TARGET`; 0 leaves it unset
    #[serde(default)]
    pub warm_ip_target: u32,
    /// Extra node selector for the DaemonSet
    #[serde(default)]
    pub node_selector: std::collections::BTreeMap<String, String>,
}

/// Manifest-only application (dashboard, metrics-server, autoscaler, overprovisioning)
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOnManifestApp {
    /// Shared fields
    #[serde(flatten)]
    pub common: AddOnCommon,
    /// Replica count for the main workload; 0 uses the manifest default
    #[serde(default)]
    pub replicas: u32,
    /// Access URL, when the app exposes one
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
}

/// NLB-backed hello-world app
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOnNlbHelloWorld {
    /// Shared fields
    #[serde(flatten)]
    pub common: AddOnCommon,
    /// Deployment replicas
    #[serde(default)]
    pub deployment_replicas: u32,
    /// Public URL (output)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Load balancer ARN derived from the hostname (output)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub load_balancer_arn: String,
    /// Load balancer name (output)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub load_balancer_name: String,
}

/// ALB-backed 2048 game with the ALB ingress controller
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOnAlb2048 {
    /// Shared fields
    #[serde(flatten)]
    pub common: AddOnCommon,
    /// Controller replicas
    #[serde(default)]
    pub deployment_replicas_alb: u32,
    /// 2048 replicas
    #[serde(default)]
    pub deployment_replicas_2048: u32,
    /// Controller IAM policy stack ID (output)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy_cfn_stack_id: String,
    /// Controller IAM policy name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy_name: String,
    /// Public URL (output)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Load balancer ARN (output)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub load_balancer_arn: String,
    /// Load balancer name (output)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub load_balancer_name: String,
}

/// Batch job (`jobs-pi`, `jobs-echo`)
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOnJob {
    /// Shared fields
    #[serde(flatten)]
    pub common: AddOnCommon,
    /// Required successful completions
    #[serde(default)]
    pub completes: u32,
    /// Pods running in parallel
    #[serde(default)]
    pub parallels: u32,
    /// Echo payload size in bytes (jobs-echo only)
    #[serde(default)]
    pub echo_size: u32,
}

/// Cron job running the echo workload on a schedule
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOnCronJob {
    /// Shared fields
    #[serde(flatten)]
    pub common: AddOnCommon,
    /// Cron schedule
    #[serde(default)]
    pub schedule: String,
    /// Required successful completions
    #[serde(default)]
    pub completes: u32,
    /// Pods running in parallel per job
    #[serde(default)]
    pub parallels: u32,
    /// Successful jobs to keep
    #[serde(default)]
    pub successful_jobs_history_limit: i32,
    /// Failed jobs to keep
    #[serde(default)]
    pub failed_jobs_history_limit: i32,
    /// Echo payload size in bytes
    #[serde(default)]
    pub echo_size: u32,
}

/// API load generator (config-maps, secrets, stresser)
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOnLoad {
    /// Shared fields
    #[serde(flatten)]
    pub common: AddOnCommon,
    /// Objects to write (config-maps, secrets)
    #[serde(default)]
    pub objects: u32,
    /// Bytes per object
    #[serde(default)]
    pub object_size: u32,
    /// Concurrent writers/readers
    #[serde(default)]
    pub concurrency: u32,
    /// How long to generate load (stresser)
    #[serde(default)]
    pub duration_seconds: u64,
    /// Where the latency summary is written
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary_output_path: String,
}

/// IAM roles for service accounts
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOnIrsa {
    /// Shared fields
    #[serde(flatten)]
    pub common: AddOnCommon,
    /// Role name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role_name: String,
    /// Managed policies attached to the role
    #[serde(default)]
    pub role_managed_policy_arns: Vec<String>,
    /// Role stack ID (output)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role_cfn_stack_id: String,
    /// Role ARN (output)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role_arn: String,
    /// OIDC provider created by this add-on (output)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub oidc_provider_arn: String,
    /// Service account name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_name: String,
    /// Deployment name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deployment_name: String,
    /// Deployment replicas
    #[serde(default)]
    pub deployment_replicas: u32,
    /// Where the collected pod log lines are written
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deployment_result_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a crash mid-create still leaves the add-on marked for cleanup
    #[test]
    fn story_created_is_set_before_work_and_survives_failure() {
        let mut c = AddOnCommon {
            enable: true,
            ..Default::default()
        };
        c.reset_phase();
        assert_eq!(c.phase, AddOnPhase::Pending);

        c.begin_create();
        assert!(c.created);
        assert_eq!(c.phase, AddOnPhase::Creating);

        c.finish_create(false);
        assert!(c.created, "failed create must still be deleted");
        assert_eq!(c.phase, AddOnPhase::Failed);
    }

    /// Story: delete only clears created when it succeeded
    #[test]
    fn story_failed_delete_keeps_created() {
        let mut c = AddOnCommon {
            enable: true,
            created: true,
            phase: AddOnPhase::Created,
            ..Default::default()
        };
        c.begin_delete();
        c.finish_delete(false);
        assert!(c.created);

        c.begin_delete();
        c.finish_delete(true);
        assert!(!c.created);
        assert_eq!(c.phase, AddOnPhase::Deleted);
        assert!(c.time_frame_delete.as_ref().unwrap().end_utc.is_some());
    }

    #[test]
    fn disabled_block_stays_disabled() {
        let mut c = AddOnCommon::default();
        c.reset_phase();
        assert_eq!(c.phase, AddOnPhase::Disabled);
    }

    #[test]
    fn common_fields_flatten_into_block() {
        let yaml = "enable: true\ncompletes: 30\nparallels: 10\n";
        let job: AddOnJob = serde_yaml::from_str(yaml).unwrap();
        assert!(job.common.enable);
        assert!(!job.common.created);
        assert_eq!(job.completes, 30);

        let out = serde_yaml::to_string(&job).unwrap();
        assert!(out.contains("enable: true"));
        assert!(out.contains("phase: DISABLED"));
    }
}
