//! Defaults and cross-field validation.
//!
//! [`Config::validate_and_set_defaults`] runs once per invocation, before any
//! side effect. It fills every derived name and path so the rest of the
//! engine never has to guess, and rejects documents whose intent cannot be
//! satisfied.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::warn;

use super::nodegroups::{DEFAULT_AMI_TYPE, DEFAULT_REMOTE_ACCESS_USER, GPU_AMI_SUFFIX};
use super::{AddOnKind, Asg, Config, Mng, NodeRole, STATUS_ACTIVE};
use crate::{Error, Result, DEFAULT_REGION, DEFAULT_VERSION};

/// Default worker instance type
pub const DEFAULT_INSTANCE_TYPE: &str = "c5.xlarge";
/// Default worker root volume (GiB)
pub const DEFAULT_VOLUME_SIZE: u32 = 40;
/// Default node count per pool
pub const DEFAULT_NODES: u32 = 3;
/// Maximum self-managed pools per cluster
pub const MAX_NODE_GROUPS: usize = 10;
/// Maximum nodes per self-managed pool
pub const MAX_NODES_PER_ASG: u32 = 300;
/// Maximum managed node groups per cluster
pub const MAX_MANAGED_NODE_GROUPS: usize = 10;
/// Maximum nodes per managed node group
pub const MAX_NODES_PER_MNG: u32 = 100;
/// Upper bound on the echo payload (0.25 MB)
pub const MAX_ECHO_SIZE: u32 = 250_000;
/// Upper bound on a ConfigMap/Secret payload (0.9 MB)
pub const MAX_OBJECT_SIZE: u32 = 900_000;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Regions with the airport code used in generated cluster names.
const REGIONS: &[(&str, &str)] = &[
    ("us-east-1", "iad"),
    ("us-east-2", "cmh"),
    ("us-west-1", "sfo"),
    ("us-west-2", "pdx"),
    ("ca-central-1", "yul"),
    ("sa-east-1", "gru"),
    ("eu-west-1", "dub"),
    ("eu-west-2", "lhr"),
    ("eu-west-3", "cdg"),
    ("eu-central-1", "fra"),
    ("eu-north-1", "arn"),
    ("eu-south-1", "mxp"),
    ("me-south-1", "bah"),
    ("af-south-1", "cpt"),
    ("ap-east-1", "hkg"),
    ("ap-south-1", "bom"),
    ("ap-northeast-1", "nrt"),
    ("ap-northeast-2", "icn"),
    ("ap-northeast-3", "kix"),
    ("ap-southeast-1", "sin"),
    ("ap-southeast-2", "syd"),
    ("cn-north-1", "bjs"),
    ("cn-northwest-1", "zhy"),
    ("us-gov-west-1", "pdt"),
    ("us-gov-east-1", "osu"),
];

/// Airport code of a supported region
pub fn airport_code(region: &str) -> Option<&'static str> {
    REGIONS.iter().find(|(r, _)| *r == region).map(|(_, a)| *a)
}

/// ARN partition of a region
pub fn partition_for_region(region: &str) -> &'static str {
    if region.starts_with("cn-") {
        "aws-cn"
    } else if region.starts_with("us-gov-") {
        "aws-us-gov"
    } else {
        "aws"
    }
}

/// `eks-YYYYMMDDHH-<airport>-<region>-<rand5>`
pub fn generate_name(region: &str) -> String {
    let airport = airport_code(region).unwrap_or("xxx");
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!(
        "eks-{}-{}-{}-{}",
        Utc::now().format("%Y%m%d%H"),
        airport,
        region.replace('-', ""),
        suffix
    )
}

impl Config {
    /// Starting document written by `create config`: one CPU pool and the
    /// NLB hello-world app, every other add-on disabled.
    pub fn default_document(config_path: impl AsRef<Path>) -> Self {
        let mut cfg = Config {
            config_path: config_path.as_ref().display().to_string(),
            region: DEFAULT_REGION.to_string(),
            on_failure_delete: true,
            on_failure_delete_wait_seconds: 60,
            remote_access_key_create: true,
            ..Default::default()
        };
        cfg.s3_bucket.create = true;
        cfg.s3_bucket.lifecycle_expiration_days = 3;
        cfg.parameters.role_create = true;
        cfg.parameters.version = DEFAULT_VERSION.to_string();
        cfg.add_on_node_groups.enable = true;
        cfg.add_on_node_groups.role.role_create = true;
        cfg.add_on_nlb_hello_world.common.enable = true;
        cfg
    }

    /// Fill derived fields and reject inconsistent documents.
    pub fn validate_and_set_defaults(&mut self) -> Result<()> {
        self.validate_root()?;
        self.validate_parameters()?;
        self.validate_node_groups()?;
        self.validate_managed_node_groups()?;
        self.validate_add_ons()?;
        self.validate_status();
        Ok(())
    }

    fn validate_root(&mut self) -> Result<()> {
        if self.config_path.is_empty() {
            return Err(Error::validation("configPath is empty"));
        }
        if self.region.is_empty() {
            self.region = DEFAULT_REGION.to_string();
        }
        if airport_code(&self.region).is_none() {
            return Err(Error::validation(format!("region {:?} not found", self.region)));
        }
        if self.name.is_empty() {
            self.name = generate_name(&self.region);
        }
        if self.name != self.name.to_lowercase() {
            return Err(Error::validation(format!("name {:?} must be in lower-case", self.name)));
        }

        if self.log_level.is_empty() {
            self.log_level = "info".to_string();
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(Error::validation(format!("unknown logLevel {:?}", self.log_level)));
        }
        if self.log_outputs.is_empty() {
            let base = Path::new(&self.config_path).with_extension("log");
            self.log_outputs = vec!["stderr".to_string(), base.display().to_string()];
        }

        let dir = self.config_dir();
        let under_dir = |file: String| dir.join(file).display().to_string();

        if self.aws_cli_path.is_empty() {
            self.aws_cli_path = "aws".to_string();
        }
        if self.parameters.version.is_empty() {
            self.parameters.version = DEFAULT_VERSION.to_string();
        }
        if self.kubectl_path.is_empty() {
            self.kubectl_path = format!("/tmp/kubectl-test-v{}", self.parameters.version);
        }
        if self.kubectl_download_url.is_empty() {
            self.kubectl_download_url = format!(
                "https://dl.k8s.io/release/v{}.0/bin/linux/amd64/kubectl",
                self.parameters.version
            );
        }
        if self.kubeconfig_path.is_empty() {
            self.kubeconfig_path = under_dir(format!("{}.kubeconfig.yaml", self.name));
        }
        if self.kubectl_commands_output_path.is_empty() {
            self.kubectl_commands_output_path = under_dir(format!("{}.kubectl.sh", self.name));
        }
        if self.ssh_commands_output_path.is_empty() {
            self.ssh_commands_output_path = under_dir(format!("{}.ssh.sh", self.name));
        }

        for (hook, suffix) in [
            (&mut self.command_after_create_cluster, "after-create-cluster"),
            (&mut self.command_after_create_add_ons, "after-create-add-ons"),
        ] {
            if !hook.is_set() {
                continue;
            }
            if hook.output_path.is_empty() {
                hook.output_path = under_dir(format!("{}.{}.out.log", self.name, suffix));
            }
            if hook.timeout_seconds == 0 {
                hook.timeout_seconds = 60;
            }
        }

        if self.s3_bucket.create && self.s3_bucket.name.is_empty() {
            self.s3_bucket.name = format!("{}-s3-bucket", self.name);
        }
        if !self.s3_bucket.name.is_empty() && self.s3_bucket.lifecycle_expiration_days == 0 {
            self.s3_bucket.lifecycle_expiration_days = 3;
        }

        if self.remote_access_key_name.is_empty() {
            self.remote_access_key_name = format!("{}-ssh-key", self.name);
            self.remote_access_key_create = true;
        }
        if self.remote_access_private_key_path.is_empty() {
            if !self.remote_access_key_create {
                return Err(Error::validation(format!(
                    "remoteAccessKeyCreate false; expect non-empty remoteAccessPrivateKeyPath for key {:?}",
                    self.remote_access_key_name
                )));
            }
            self.remote_access_private_key_path = under_dir(format!("{}.ssh.pem", self.name));
        }
        Ok(())
    }

    fn validate_parameters(&mut self) -> Result<()> {
        let partition = partition_for_region(&self.region);
        let name = self.name.clone();
        let p = &mut self.parameters;

        parse_version(&p.version)?;

        if p.role_arn.is_empty() {
            p.role_create = true;
        }
        if p.role_create {
            if p.role_name.is_empty() {
                p.role_name = format!("{name}-role-cluster");
            }
            if p.role_service_principals.is_empty() {
                p.role_service_principals = vec!["eks.amazonaws.com".to_string()];
            }
            if p.role_managed_policy_arns.is_empty() {
                p.role_managed_policy_arns = vec![
                    format!("arn:{partition}:iam::aws:policy/AmazonEKSClusterPolicy"),
                    format!("arn:{partition}:iam::aws:policy/AmazonEKSServicePolicy"),
                ];
            }
        } else {
            if p.role_name.is_empty() {
                p.role_name = name_from_arn(&p.role_arn);
            }
            if !p.role_managed_policy_arns.is_empty() {
                return Err(Error::validation(format!(
                    "parameters.roleArn given; expect empty roleManagedPolicyArns but got {:?}",
                    p.role_managed_policy_arns
                )));
            }
            if !p.role_service_principals.is_empty() {
                return Err(Error::validation(format!(
                    "parameters.roleArn given; expect empty roleServicePrincipals but got {:?}",
                    p.role_service_principals
                )));
            }
        }

        if p.vpc_given() {
            if p.private_subnet_ids.is_empty() {
                return Err(Error::validation(format!(
                    "parameters.vpcId {:?} given without privateSubnetIds",
                    p.vpc_id
                )));
            }
            if p.control_plane_security_group_id.is_empty() {
                return Err(Error::validation(format!(
                    "parameters.vpcId {:?} given without controlPlaneSecurityGroupId",
                    p.vpc_id
                )));
            }
        } else {
            let subnets = [
                &p.public_subnet_cidr_1,
                &p.public_subnet_cidr_2,
                &p.private_subnet_cidr_1,
                &p.private_subnet_cidr_2,
            ];
            let given = subnets.iter().filter(|s| !s.is_empty()).count();
            if p.vpc_cidr.is_empty() {
                if given > 0 {
                    return Err(Error::validation(
                        "subnet CIDRs given while parameters.vpcCidr is empty",
                    ));
                }
                p.vpc_cidr = "192.168.0.0/16".to_string();
                p.public_subnet_cidr_1 = "192.168.0.0/19".to_string();
                p.public_subnet_cidr_2 = "192.168.32.0/19".to_string();
                p.private_subnet_cidr_1 = "192.168.64.0/19".to_string();
                p.private_subnet_cidr_2 = "192.168.96.0/19".to_string();
            } else if given != subnets.len() {
                return Err(Error::validation(format!(
                    "parameters.vpcCidr {:?} needs all four subnet CIDRs",
                    p.vpc_cidr
                )));
            }
        }

        if p.encryption_cmk_create && !p.encryption_cmk_arn.is_empty() {
            return Err(Error::validation(
                "encryptionCmkCreate and encryptionCmkArn are mutually exclusive",
            ));
        }
        Ok(())
    }

    fn validate_node_groups(&mut self) -> Result<()> {
        if !self.add_on_node_groups.enable {
            return Ok(());
        }
        let name = self.name.clone();
        let partition = partition_for_region(&self.region);
        let dir = self.config_dir();
        let ngs = &mut self.add_on_node_groups;

        default_node_role(&mut ngs.role, &name, "role-ng", partition)?;
        if ngs.logs_dir.is_empty() {
            ngs.logs_dir = dir.join(format!("{name}-logs-ngs")).display().to_string();
        }

        if ngs.asgs.is_empty() {
            let asg_name = format!("{name}-ng-asg-cpu");
            ngs.asgs.insert(
                asg_name.clone(),
                Asg {
                    name: asg_name,
                    ..Default::default()
                },
            );
        }
        if ngs.asgs.len() > MAX_NODE_GROUPS {
            return Err(Error::validation(format!(
                "addOnNodeGroups has {} ASGs, maximum is {MAX_NODE_GROUPS}",
                ngs.asgs.len()
            )));
        }

        for (key, asg) in ngs.asgs.iter_mut() {
            if asg.name.is_empty() {
                asg.name = key.clone();
            }
            if &asg.name != key {
                return Err(Error::validation(format!(
                    "addOnNodeGroups.asgs[{key:?}] has different name {:?}",
                    asg.name
                )));
            }
            if asg.ami_type.is_empty() {
                asg.ami_type = DEFAULT_AMI_TYPE.to_string();
            }
            if asg.remote_access_user_name.is_empty() {
                asg.remote_access_user_name = DEFAULT_REMOTE_ACCESS_USER.to_string();
            }
            if asg.image_id.is_empty() && asg.image_id_ssm_parameter.is_empty() {
                asg.image_id_ssm_parameter = recommended_image_parameter(&asg.ami_type, &self.parameters.version)?;
            }
            if asg.instance_types.is_empty() {
                asg.instance_types = vec![default_instance_type(&asg.ami_type).to_string()];
            }
            if asg.volume_size == 0 {
                asg.volume_size = DEFAULT_VOLUME_SIZE;
            }
            default_sizes(
                &mut asg.asg_min_size,
                &mut asg.asg_max_size,
                &mut asg.asg_desired_capacity,
            );
            check_sizes(
                &format!("addOnNodeGroups.asgs[{key:?}]"),
                asg.asg_min_size,
                asg.asg_max_size,
                asg.asg_desired_capacity,
                MAX_NODES_PER_ASG,
            )?;
        }
        Ok(())
    }

    fn validate_managed_node_groups(&mut self) -> Result<()> {
        if !self.add_on_managed_node_groups.enable {
            return Ok(());
        }
        let name = self.name.clone();
        let partition = partition_for_region(&self.region);
        let dir = self.config_dir();
        let asg_names: Vec<String> = if self.add_on_node_groups.enable {
            self.add_on_node_groups.asgs.keys().cloned().collect()
        } else {
            Vec::new()
        };
        let mngs = &mut self.add_on_managed_node_groups;

        default_node_role(&mut mngs.role, &name, "role-mng", partition)?;
        if mngs.logs_dir.is_empty() {
            mngs.logs_dir = dir.join(format!("{name}-logs-mngs")).display().to_string();
        }

        if mngs.mngs.is_empty() {
            let mng_name = format!("{name}-mng-cpu");
            mngs.mngs.insert(
                mng_name.clone(),
                Mng {
                    name: mng_name,
                    ..Default::default()
                },
            );
        }
        if mngs.mngs.len() > MAX_MANAGED_NODE_GROUPS {
            return Err(Error::validation(format!(
                "addOnManagedNodeGroups has {} MNGs, maximum is {MAX_MANAGED_NODE_GROUPS}",
                mngs.mngs.len()
            )));
        }

        for (key, mng) in mngs.mngs.iter_mut() {
            if mng.name.is_empty() {
                mng.name = key.clone();
            }
            if &mng.name != key {
                return Err(Error::validation(format!(
                    "addOnManagedNodeGroups.mngs[{key:?}] has different name {:?}",
                    mng.name
                )));
            }
            if asg_names.contains(key) {
                return Err(Error::validation(format!(
                    "managed node group {key:?} conflicts with a self-managed ASG name"
                )));
            }
            if mng.ami_type.is_empty() {
                mng.ami_type = DEFAULT_AMI_TYPE.to_string();
            }
            if mng.remote_access_user_name.is_empty() {
                mng.remote_access_user_name = DEFAULT_REMOTE_ACCESS_USER.to_string();
            }
            if mng.instance_types.is_empty() {
                mng.instance_types = vec![default_instance_type(&mng.ami_type).to_string()];
            }
            if mng.instance_types.len() > 4 {
                return Err(Error::validation(format!(
                    "too many instance types {:?} for {key:?}",
                    mng.instance_types
                )));
            }
            if mng.volume_size == 0 {
                mng.volume_size = DEFAULT_VOLUME_SIZE;
            }
            default_sizes(
                &mut mng.asg_min_size,
                &mut mng.asg_max_size,
                &mut mng.asg_desired_capacity,
            );
            let label = format!("addOnManagedNodeGroups.mngs[{key:?}]");
            check_sizes(
                &label,
                mng.asg_min_size,
                mng.asg_max_size,
                mng.asg_desired_capacity,
                MAX_NODES_PER_MNG,
            )?;
            for update in mng.scale_updates.iter().filter(|u| u.enable) {
                check_sizes(
                    &format!("{label}.scaleUpdates"),
                    update.asg_min_size,
                    update.asg_max_size,
                    update.asg_desired_capacity,
                    MAX_NODES_PER_MNG,
                )?;
            }
            if let Some(upgrade) = mng.version_upgrade.as_ref().filter(|u| u.enable) {
                let target = parse_version(&upgrade.version)?;
                if target <= parse_version(&self.parameters.version)? {
                    return Err(Error::validation(format!(
                        "{label}.versionUpgrade.version {:?} must be newer than {:?}",
                        upgrade.version, self.parameters.version
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_add_ons(&mut self) -> Result<()> {
        let has_nodes = self.any_node_groups_enabled();
        let name = self.name.clone();
        for kind in AddOnKind::ALL {
            let common = kind.common_mut(self);
            if common.enable && kind.needs_nodes() && !has_nodes {
                return Err(Error::validation(format!(
                    "{kind} enabled but no node group is enabled"
                )));
            }
            if common.namespace.is_empty() {
                common.namespace = kind.default_namespace(&name);
            }
            common.reset_phase();
        }

        let dir = self.config_dir();
        let summary = |addon: &str| {
            dir.join(format!("{name}-{addon}-summary.json"))
                .display()
                .to_string()
        };

        let nlb = &mut self.add_on_nlb_hello_world;
        if nlb.deployment_replicas == 0 {
            nlb.deployment_replicas = 3;
        }

        let alb = &mut self.add_on_alb2048;
        if alb.deployment_replicas_alb == 0 {
            alb.deployment_replicas_alb = 1;
        }
        if alb.deployment_replicas_2048 == 0 {
            alb.deployment_replicas_2048 = 3;
        }
        if alb.policy_name.is_empty() {
            alb.policy_name = format!("{name}-alb-ingress-controller-policy");
        }

        let pi = &mut self.add_on_jobs_pi;
        if pi.completes == 0 {
            pi.completes = 30;
        }
        if pi.parallels == 0 {
            pi.parallels = 10;
        }

        let echo = &mut self.add_on_jobs_echo;
        if echo.completes == 0 {
            echo.completes = 1000;
        }
        if echo.parallels == 0 {
            echo.parallels = 100;
        }
        if echo.echo_size == 0 {
            echo.echo_size = 100 * 1024;
        }
        if echo.echo_size > MAX_ECHO_SIZE {
            return Err(Error::validation(format!(
                "addOnJobsEcho.echoSize limit is {MAX_ECHO_SIZE}, got {}",
                echo.echo_size
            )));
        }

        let cron = &mut self.add_on_cron_jobs;
        if cron.schedule.is_empty() {
            cron.schedule = "*/10 * * * *".to_string();
        }
        if cron.completes == 0 {
            cron.completes = 10;
        }
        if cron.parallels == 0 {
            cron.parallels = 10;
        }
        if cron.successful_jobs_history_limit == 0 {
            cron.successful_jobs_history_limit = 3;
        }
        if cron.failed_jobs_history_limit == 0 {
            cron.failed_jobs_history_limit = 1;
        }
        if cron.echo_size == 0 {
            cron.echo_size = 100 * 1024;
        }
        if cron.echo_size > MAX_ECHO_SIZE {
            return Err(Error::validation(format!(
                "addOnCronJobs.echoSize limit is {MAX_ECHO_SIZE}, got {}",
                cron.echo_size
            )));
        }

        for (kind, load) in [
            (AddOnKind::ConfigMaps, &mut self.add_on_config_maps),
            (AddOnKind::Secrets, &mut self.add_on_secrets),
            (AddOnKind::Stresser, &mut self.add_on_stresser),
        ] {
            if load.objects == 0 {
                load.objects = 10;
            }
            if load.object_size == 0 {
                load.object_size = 10 * 1024;
            }
            if load.object_size > MAX_OBJECT_SIZE {
                return Err(Error::validation(format!(
                    "{kind} objectSize limit is {MAX_OBJECT_SIZE}, got {}",
                    load.object_size
                )));
            }
            if load.concurrency == 0 {
                load.concurrency = 10;
            }
            if load.duration_seconds == 0 {
                load.duration_seconds = 60;
            }
            if load.summary_output_path.is_empty() {
                load.summary_output_path = summary(kind.name());
            }
        }

        let irsa = &mut self.add_on_irsa;
        if irsa.role_name.is_empty() {
            irsa.role_name = format!("{name}-irsa-role");
        }
        if irsa.role_managed_policy_arns.is_empty() {
            irsa.role_managed_policy_arns = vec![format!(
                "arn:{}:iam::aws:policy/AmazonS3ReadOnlyAccess",
                partition_for_region(&self.region)
            )];
        }
        if irsa.service_account_name.is_empty() {
            irsa.service_account_name = format!("{name}-irsa-service-account");
        }
        if irsa.deployment_name.is_empty() {
            irsa.deployment_name = format!("{name}-irsa-deployment");
        }
        if irsa.deployment_replicas == 0 {
            irsa.deployment_replicas = 1;
        }
        if irsa.deployment_result_path.is_empty() {
            irsa.deployment_result_path = dir
                .join(format!("{name}-irsa-result.log"))
                .display()
                .to_string();
        }

        if self.add_on_overprovisioning.replicas == 0 {
            self.add_on_overprovisioning.replicas = 1;
        }
        Ok(())
    }

    fn validate_status(&mut self) {
        let s = &mut self.status;
        if s.up && s.cluster_arn.is_empty() {
            warn!("status.up set without a cluster ARN; clearing");
            s.up = false;
        }
        if s.cluster_status_current == STATUS_ACTIVE && s.cluster_arn.is_empty() {
            s.cluster_status_current.clear();
        }
        if !s.vpc_cfn_stack_id.is_empty() && s.vpc_id.is_empty() {
            warn!(stack_id = %s.vpc_cfn_stack_id, "VPC stack recorded without outputs");
        }
    }
}

fn default_node_role(role: &mut NodeRole, name: &str, suffix: &str, partition: &str) -> Result<()> {
    if role.role_arn.is_empty() {
        role.role_create = true;
    }
    if !role.role_create {
        if !role.role_managed_policy_arns.is_empty() || !role.role_service_principals.is_empty() {
            return Err(Error::validation(format!(
                "node roleArn {:?} given; expect empty roleManagedPolicyArns and roleServicePrincipals",
                role.role_arn
            )));
        }
        if role.role_name.is_empty() {
            role.role_name = name_from_arn(&role.role_arn);
        }
        return Ok(());
    }

    if role.role_name.is_empty() {
        role.role_name = format!("{name}-{suffix}");
    }
    if role.role_service_principals.is_empty() {
        role.role_service_principals =
            vec!["ec2.amazonaws.com".to_string(), "eks.amazonaws.com".to_string()];
    }
    if !role.role_service_principals.iter().any(|p| p == "ec2.amazonaws.com") {
        return Err(Error::validation(format!(
            "node roleServicePrincipals {:?} must include 'ec2.amazonaws.com'",
            role.role_service_principals
        )));
    }
    if role.role_managed_policy_arns.is_empty() {
        role.role_managed_policy_arns = [
            "AmazonEKSWorkerNodePolicy",
            "AmazonEKS_CNI_Policy",
            "AmazonEC2ContainerRegistryReadOnly",
            "AmazonSSMManagedInstanceCore",
        ]
        .iter()
        .map(|p| format!("arn:{partition}:iam::aws:policy/{p}"))
        .collect();
    }
    Ok(())
}

fn default_sizes(min: &mut u32, max: &mut u32, desired: &mut u32) {
    if *desired == 0 {
        *desired = if *max > 0 { (*max).min(DEFAULT_NODES) } else { DEFAULT_NODES };
    }
    if *min == 0 {
        *min = *desired;
    }
    if *max == 0 {
        *max = *desired;
    }
}

fn check_sizes(label: &str, min: u32, max: u32, desired: u32, limit: u32) -> Result<()> {
    if min > max {
        return Err(Error::validation(format!("{label} minSize {min} > maxSize {max}")));
    }
    if desired > max {
        return Err(Error::validation(format!(
            "{label} desiredCapacity {desired} > maxSize {max}"
        )));
    }
    if desired < min {
        return Err(Error::validation(format!(
            "{label} desiredCapacity {desired} < minSize {min}"
        )));
    }
    if max > limit {
        return Err(Error::validation(format!("{label} maxSize {max} > limit {limit}")));
    }
    Ok(())
}

fn default_instance_type(ami_type: &str) -> &'static str {
    if ami_type.ends_with(GPU_AMI_SUFFIX) {
        "p3.8xlarge"
    } else if ami_type.starts_with("AL2_ARM") {
        "m6g.xlarge"
    } else {
        DEFAULT_INSTANCE_TYPE
    }
}

fn recommended_image_parameter(ami_type: &str, version: &str) -> Result<String> {
    let family = match ami_type {
        "AL2_x86_64" => "amazon-linux-2",
        "AL2_x86_64_GPU" => "amazon-linux-2-gpu",
        "AL2_ARM_64" => "amazon-linux-2-arm64",
        other => {
            return Err(Error::validation(format!("unknown amiType {other:?}")));
        }
    };
    Ok(format!(
        "/aws/service/eks/optimized-ami/{version}/{family}/recommended/image_id"
    ))
}

/// `(major, minor)` of a `1.30`-style version
pub fn parse_version(v: &str) -> Result<(u32, u32)> {
    let mut parts = v.trim().trim_start_matches('v').split('.');
    let parse = |p: Option<&str>| p.and_then(|s| s.parse::<u32>().ok());
    match (parse(parts.next()), parse(parts.next())) {
        (Some(major), Some(minor)) => Ok((major, minor)),
        _ => Err(Error::validation(format!("cannot parse version {v:?}"))),
    }
}

fn name_from_arn(arn: &str) -> String {
    arn.rsplit('/').next().unwrap_or(arn).to_string()
}

/// Tags every created resource carries
pub fn default_tags(cfg: &Config) -> BTreeMap<String, String> {
    let mut tags = cfg.parameters.tags.clone();
    tags.insert("Kind".to_string(), crate::ARTIFACT_KIND.to_string());
    tags.insert("Name".to_string(), cfg.name.clone());
    tags
}
