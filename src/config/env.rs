//! `EKS_HARNESS_<FIELD>` environment overrides, applied before validation.

use tracing::info;

use super::Config;
use crate::{Error, Result};

/// Prefix of every override variable
pub const ENV_PREFIX: &str = "EKS_HARNESS_";

type Setter = fn(&mut Config, &str) -> Result<()>;

const OVERRIDES: &[(&str, Setter)] = &[
    ("REGION", |c, v| {
        c.region = v.to_string();
        Ok(())
    }),
    ("NAME", |c, v| {
        c.name = v.to_string();
        Ok(())
    }),
    ("LOG_LEVEL", |c, v| {
        c.log_level = v.to_string();
        Ok(())
    }),
    ("LOG_OUTPUTS", |c, v| {
        c.log_outputs = split_list(v);
        Ok(())
    }),
    ("AWS_CLI_PATH", |c, v| {
        c.aws_cli_path = v.to_string();
        Ok(())
    }),
    ("KUBECTL_PATH", |c, v| {
        c.kubectl_path = v.to_string();
        Ok(())
    }),
    ("KUBECTL_DOWNLOAD_URL", |c, v| {
        c.kubectl_download_url = v.to_string();
        Ok(())
    }),
    ("KUBECONFIG_PATH", |c, v| {
        c.kubeconfig_path = v.to_string();
        Ok(())
    }),
    ("ON_FAILURE_DELETE", |c, v| {
        c.on_failure_delete = parse_bool("ON_FAILURE_DELETE", v)?;
        Ok(())
    }),
    ("ON_FAILURE_DELETE_WAIT_SECONDS", |c, v| {
        c.on_failure_delete_wait_seconds = parse_num("ON_FAILURE_DELETE_WAIT_SECONDS", v)?;
        Ok(())
    }),
    ("S3_BUCKET_NAME", |c, v| {
        c.s3_bucket.name = v.to_string();
        Ok(())
    }),
    ("S3_BUCKET_CREATE", |c, v| {
        c.s3_bucket.create = parse_bool("S3_BUCKET_CREATE", v)?;
        Ok(())
    }),
    ("PARAMETERS_VERSION", |c, v| {
        c.parameters.version = v.to_string();
        Ok(())
    }),
    ("PARAMETERS_ROLE_ARN", |c, v| {
        c.parameters.role_arn = v.to_string();
        Ok(())
    }),
    ("PARAMETERS_RESOLVER_URL", |c, v| {
        c.parameters.resolver_url = v.to_string();
        Ok(())
    }),
    ("ADD_ON_NODE_GROUPS_ENABLE", |c, v| {
        c.add_on_node_groups.enable = parse_bool("ADD_ON_NODE_GROUPS_ENABLE", v)?;
        Ok(())
    }),
    ("ADD_ON_MANAGED_NODE_GROUPS_ENABLE", |c, v| {
        c.add_on_managed_node_groups.enable =
            parse_bool("ADD_ON_MANAGED_NODE_GROUPS_ENABLE", v)?;
        Ok(())
    }),
    ("ADD_ON_NLB_HELLO_WORLD_ENABLE", |c, v| {
        c.add_on_nlb_hello_world.common.enable = parse_bool("ADD_ON_NLB_HELLO_WORLD_ENABLE", v)?;
        Ok(())
    }),
    ("ADD_ON_ALB2048_ENABLE", |c, v| {
        c.add_on_alb2048.common.enable = parse_bool("ADD_ON_ALB2048_ENABLE", v)?;
        Ok(())
    }),
    ("ADD_ON_JOBS_PI_ENABLE", |c, v| {
        c.add_on_jobs_pi.common.enable = parse_bool("ADD_ON_JOBS_PI_ENABLE", v)?;
        Ok(())
    }),
    ("ADD_ON_JOBS_ECHO_ENABLE", |c, v| {
        c.add_on_jobs_echo.common.enable = parse_bool("ADD_ON_JOBS_ECHO_ENABLE", v)?;
        Ok(())
    }),
    ("ADD_ON_IRSA_ENABLE", |c, v| {
        c.add_on_irsa.common.enable = parse_bool("ADD_ON_IRSA_ENABLE", v)?;
        Ok(())
    }),
];

impl Config {
    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any lookup; the process environment in production.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        for (field, set) in OVERRIDES {
            let key = format!("{ENV_PREFIX}{field}");
            if let Some(value) = lookup(&key) {
                info!(key = %key, "applying environment override");
                set(self, value.trim())?;
            }
        }
        Ok(())
    }
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(field: &str, v: &str) -> Result<bool> {
    v.parse::<bool>()
        .map_err(|_| Error::validation(format!("{ENV_PREFIX}{field}: expected true/false, got {v:?}")))
}

fn parse_num(field: &str, v: &str) -> Result<u64> {
    v.parse::<u64>()
        .map_err(|_| Error::validation(format!("{ENV_PREFIX}{field}: expected a number, got {v:?}")))
}
