//! Control plane driver.
//!
//! `create` walks encryption key, cluster role, VPC and control plane in
//! order. Each step is skipped when its ID is already in the status, so a
//! re-run after a crash picks up where the last one stopped. Once the
//! cluster is `ACTIVE` the driver derives everything add-ons need: OIDC
//! issuer facts, the decoded CA, a kubeconfig and a client.

pub mod kubeconfig;
pub mod oidc;
pub mod token;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::Client;
use tracing::{info, warn};

use crate::abort::{abortable_sleep, StopSignal};
use crate::config::validate::default_tags;
use crate::config::{Config, Status, Store, STATUS_ACTIVE, STATUS_DELETED_OR_NOT_EXIST};
use crate::poller::{poll, wait_for_with, PollSpec};
use crate::provider::{ClusterDescription, CreateClusterRequest, Providers};
use crate::stack::{StackDriver, StackSpec};
use crate::template::cfn;
use crate::{k8s, Error, Result};

use self::oidc::IssuerUrl;
use self::token::TokenProvider;

/// Phase deadline for control plane creation
pub const CREATE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Phase deadline for control plane deletion
pub const DELETE_TIMEOUT: Duration = Duration::from_secs(20 * 60);
const ROLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const VPC_TIMEOUT: Duration = Duration::from_secs(20 * 60);
const KEY_PENDING_DAYS: u32 = 7;

/// Everything needed to talk to the running cluster
#[derive(Clone)]
pub struct ClusterAccess {
    /// Kubernetes client built from the written kubeconfig
    pub client: Client,
    /// Bearer tokens for raw HTTP calls
    pub tokens: Arc<TokenProvider>,
    /// Where the kubeconfig was written
    pub kubeconfig_path: PathBuf,
}

impl std::fmt::Debug for ClusterAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterAccess")
            .field("kubeconfig_path", &self.kubeconfig_path)
            .finish_non_exhaustive()
    }
}

/// Creates and deletes the control plane and its prerequisites
#[derive(Clone)]
pub struct ClusterDriver {
    store: Store,
    providers: Providers,
    stacks: StackDriver,
}

impl ClusterDriver {
    /// Driver writing through `store`
    pub fn new(store: Store, providers: Providers) -> Self {
        let stacks = StackDriver::new(store.clone(), providers.stacks.clone());
        Self {
            store,
            providers,
            stacks,
        }
    }

    /// Bring the control plane up and connect to it
    pub async fn create(&self, stop: &StopSignal) -> Result<ClusterAccess> {
        self.create_encryption_key().await?;
        self.create_role(stop).await?;
        self.create_vpc(stop).await?;
        self.create_control_plane(stop).await?;
        self.record_oidc().await?;
        self.connect().await
    }

    async fn create_encryption_key(&self) -> Result<()> {
        let (create, given, existing, name, tags) = self.store.read(|c| {
            (
                c.parameters.encryption_cmk_create,
                c.parameters.encryption_cmk_arn.clone(),
                c.status.encryption_cmk_arn.clone(),
                c.name.clone(),
                default_tags(c),
            )
        });
        if !existing.is_empty() {
            return Ok(());
        }
        if !given.is_empty() {
            self.store.update(|c| c.status.encryption_cmk_arn = given);
            return Ok(());
        }
        if !create {
            return Ok(());
        }
        let key = self
            .providers
            .kms
            .create_key(&format!("{name} secrets encryption"), &tags)
            .await?;
        info!(key_arn = %key.arn, "created encryption key");
        self.store.update(|c| {
            c.status.encryption_cmk_arn = key.arn;
            c.status.encryption_cmk_id = key.id;
        });
        Ok(())
    }

    async fn create_role(&self, stop: &StopSignal) -> Result<()> {
        let cfg = self.store.snapshot();
        if !cfg.status.cluster_role_arn.is_empty() {
            return Ok(());
        }
        let p = &cfg.parameters;
        if !p.role_create {
            self.store.update(|c| {
                c.status.cluster_role_arn = p.role_arn.clone();
                c.status.cluster_role_name = p.role_name.clone();
            });
            return Ok(());
        }

        let spec = StackSpec::new(
            &p.role_name,
            cfn::ROLE,
            serde_json::json!({ "description": format!("{} cluster role", cfg.name) }),
        )?
        .param("RoleName", &p.role_name)
        .list_param("RoleServicePrincipals", &p.role_service_principals)
        .list_param("RoleManagedPolicyARNs", &p.role_managed_policy_arns)
        .tags(default_tags(&cfg))
        .timing(Duration::from_secs(10), Duration::from_secs(10), ROLE_TIMEOUT);
        let outputs = self
            .stacks
            .create(stop, spec, |c, id| c.status.cluster_role_cfn_stack_id = id.to_string())
            .await?;

        let arn = outputs.get("RoleARN")?;
        let name = outputs.get("RoleName").unwrap_or_else(|_| p.role_name.clone());
        info!(role_arn = %arn, "cluster role ready");
        self.store.update(|c| {
            c.status.cluster_role_arn = arn;
            c.status.cluster_role_name = name;
        });
        Ok(())
    }

    async fn create_vpc(&self, stop: &StopSignal) -> Result<()> {
        let cfg = self.store.snapshot();
        if !cfg.status.vpc_id.is_empty() {
            return Ok(());
        }
        let p = &cfg.parameters;
        if p.vpc_given() {
            self.store.update(|c| {
                c.status.vpc_id = p.vpc_id.clone();
                c.status.public_subnet_ids = p.public_subnet_ids.clone();
                c.status.private_subnet_ids = p.private_subnet_ids.clone();
                c.status.control_plane_security_group_id = p.control_plane_security_group_id.clone();
            });
            return Ok(());
        }

        let spec = StackSpec::new(
            format!("{}-vpc", cfg.name),
            cfn::VPC,
            serde_json::json!({ "cluster_name": cfg.name, "kind": crate::ARTIFACT_KIND }),
        )?
        .param("VpcCidr", &p.vpc_cidr)
        .param("PublicSubnetCidr1", &p.public_subnet_cidr_1)
        .param("PublicSubnetCidr2", &p.public_subnet_cidr_2)
        .param("PrivateSubnetCidr1", &p.private_subnet_cidr_1)
        .param("PrivateSubnetCidr2", &p.private_subnet_cidr_2)
        .tags(default_tags(&cfg))
        .timing(Duration::from_secs(30), Duration::from_secs(10), VPC_TIMEOUT);
        let outputs = self
            .stacks
            .create(stop, spec, |c, id| c.status.vpc_cfn_stack_id = id.to_string())
            .await?;

        let vpc_id = outputs.get("VpcId")?;
        let public = outputs.list("PublicSubnetIds")?;
        let private = outputs.list("PrivateSubnetIds")?;
        let sg = outputs.get("ControlPlaneSecurityGroupId")?;
        info!(vpc_id = %vpc_id, "vpc ready");
        self.store.update(|c| {
            c.status.vpc_id = vpc_id;
            c.status.public_subnet_ids = public;
            c.status.private_subnet_ids = private;
            c.status.control_plane_security_group_id = sg;
        });
        Ok(())
    }

    /// The direct API is needed whenever the template cannot express the
    /// request: custom endpoints, injected headers, or secrets encryption.
    fn use_direct_api(&self) -> bool {
        self.store.read(|c| {
            c.parameters.endpoint().is_custom() || !c.status.encryption_cmk_arn.is_empty()
        })
    }

    async fn create_control_plane(&self, stop: &StopSignal) -> Result<()> {
        let cfg = self.store.snapshot();
        if cfg.status.cluster_status_current == STATUS_ACTIVE && !cfg.status.cluster_ca.is_empty() {
            info!(cluster = %cfg.name, "cluster already active");
            return Ok(());
        }
        let subnets: Vec<String> = cfg
            .status
            .public_subnet_ids
            .iter()
            .chain(cfg.status.private_subnet_ids.iter())
            .cloned()
            .collect();

        let mut initial_wait = Duration::from_secs(60);
        if self.use_direct_api() {
            if cfg.status.cluster_arn.is_empty() {
                let req = CreateClusterRequest {
                    name: cfg.name.clone(),
                    version: cfg.parameters.version.clone(),
                    role_arn: cfg.status.cluster_role_arn.clone(),
                    subnet_ids: subnets,
                    security_group_ids: vec![cfg.status.control_plane_security_group_id.clone()],
                    tags: default_tags(&cfg),
                    encryption_key_arn: (!cfg.status.encryption_cmk_arn.is_empty())
                        .then(|| cfg.status.encryption_cmk_arn.clone()),
                    endpoint: cfg.parameters.endpoint(),
                };
                info!(cluster = %cfg.name, "creating cluster through the API");
                let created = self.providers.clusters.create_cluster(&req).await?;
                self.store.update(|c| c.status.cluster_arn = created.arn);
                self.store.record_status(&created.status);
            }
        } else if cfg.status.cluster_cfn_stack_id.is_empty() {
            let spec = StackSpec::new(
                format!("{}-cluster", cfg.name),
                cfn::CLUSTER,
                serde_json::json!({ "cluster_name": cfg.name }),
            )?
            .param("ClusterName", &cfg.name)
            .param("Version", &cfg.parameters.version)
            .param("RoleARN", &cfg.status.cluster_role_arn)
            .list_param("SubnetIds", &subnets)
            .list_param("SecurityGroupIds", &[cfg.status.control_plane_security_group_id.as_str()])
            .tags(default_tags(&cfg))
            .timing(Duration::from_secs(60), Duration::from_secs(20), CREATE_TIMEOUT);
            let outputs = self
                .stacks
                .create(stop, spec, |c, id| c.status.cluster_cfn_stack_id = id.to_string())
                .await?;
            let arn = outputs.get("ClusterARN")?;
            let endpoint = outputs.get("ClusterAPIServerEndpoint")?;
            self.store.update(|c| {
                c.status.cluster_arn = arn;
                c.status.cluster_api_server_endpoint = endpoint;
            });
            initial_wait = Duration::ZERO;
        } else {
            initial_wait = Duration::ZERO;
        }

        let desc = self.wait_active(stop, initial_wait).await?;
        self.record_description(&desc)
    }

    async fn wait_active(&self, stop: &StopSignal, initial_wait: Duration) -> Result<ClusterDescription> {
        let (name, endpoint) = self.store.read(|c| (c.name.clone(), c.parameters.endpoint()));
        let spec = PollSpec::new(format!("cluster {name}"), STATUS_ACTIVE)
            .initial_wait(initial_wait)
            .interval(Duration::from_secs(20))
            .timeout(CREATE_TIMEOUT);
        let clusters = self.providers.clusters.clone();
        let stream = poll(spec, stop, move || {
            let clusters = clusters.clone();
            let endpoint = endpoint.clone();
            let name = name.clone();
            async move { clusters.describe_cluster(&endpoint, &name).await }
        });
        let store = self.store.clone();
        let reached = wait_for_with(stream, |ev| {
            if !ev.state.is_empty() {
                store.record_status(&ev.state);
            }
        })
        .await?;
        reached
            .resource
            .ok_or_else(|| Error::cluster("cluster reached ACTIVE without a description"))
    }

    fn record_description(&self, desc: &ClusterDescription) -> Result<()> {
        let ca = desc.certificate_authority.clone().unwrap_or_default();
        let decoded = if ca.is_empty() {
            String::new()
        } else {
            let bytes = STANDARD
                .decode(ca.trim())
                .map_err(|e| Error::cluster(format!("invalid cluster CA: {e}")))?;
            String::from_utf8_lossy(&bytes).into_owned()
        };
        self.store.update(|c| {
            if !desc.arn.is_empty() {
                c.status.cluster_arn = desc.arn.clone();
            }
            if let Some(endpoint) = &desc.endpoint {
                c.status.cluster_api_server_endpoint = endpoint.clone();
            }
            c.status.cluster_oidc_issuer_url = desc.oidc_issuer.clone().unwrap_or_default();
            c.status.cluster_ca = ca;
            c.status.cluster_ca_decoded = decoded;
        });
        info!(endpoint = ?desc.endpoint, "cluster active");
        Ok(())
    }

    async fn record_oidc(&self) -> Result<()> {
        let (issuer_raw, partition, account, have_thumbprint) = self.store.read(|c| {
            (
                c.status.cluster_oidc_issuer_url.clone(),
                c.status.aws_partition.clone(),
                c.status.aws_account_id.clone(),
                !c.status.cluster_oidc_issuer_ca_thumbprint.is_empty(),
            )
        });
        if issuer_raw.is_empty() {
            warn!("cluster reports no OIDC issuer");
            return Ok(());
        }
        let issuer = IssuerUrl::parse(&issuer_raw)?;
        let arn = issuer.provider_arn(&partition, &account);
        let thumbprint = if have_thumbprint {
            None
        } else {
            Some(oidc::fetch_thumbprint(&issuer).await?)
        };
        info!(oidc_provider_arn = %arn, "derived OIDC issuer");
        self.store.update(|c| {
            c.status.cluster_oidc_issuer_url = issuer.normalized();
            c.status.cluster_oidc_issuer_host_path = issuer.host_path();
            c.status.cluster_oidc_issuer_arn = arn;
            if let Some(tp) = thumbprint {
                c.status.cluster_oidc_issuer_ca_thumbprint = tp;
            }
        });
        Ok(())
    }

    /// Write the kubeconfig from the recorded status and build a client.
    /// Also used by `Down` in a fresh process.
    pub async fn connect(&self) -> Result<ClusterAccess> {
        let cfg = self.store.snapshot();
        if cfg.status.cluster_api_server_endpoint.is_empty() {
            return Err(Error::cluster("no API server endpoint recorded"));
        }
        let rendered = kubeconfig::render(&kubeconfig::KubeconfigParams {
            cluster_name: &cfg.name,
            cluster_arn: &cfg.status.cluster_arn,
            endpoint: &cfg.status.cluster_api_server_endpoint,
            ca_base64: &cfg.status.cluster_ca,
            region: &cfg.region,
            aws_cli_path: &cfg.aws_cli_path,
        })?;
        let path = PathBuf::from(&cfg.kubeconfig_path);
        kubeconfig::write(&path, &rendered)?;
        info!(path = %path.display(), "wrote kubeconfig");

        let client = k8s::create_client(&path).await?;
        let tokens = Arc::new(TokenProvider::new(self.providers.identity.clone(), &cfg.name));
        Ok(ClusterAccess {
            client,
            tokens,
            kubeconfig_path: path,
        })
    }

    /// Tear down the control plane and its prerequisites. Every step runs;
    /// failures are collected.
    pub async fn delete(&self) -> Result<()> {
        let mut errs = Vec::new();

        match self.delete_control_plane().await {
            Ok(()) => {
                let path = self.store.read(|c| c.kubeconfig_path.clone());
                if !path.is_empty() {
                    let _ = std::fs::remove_file(&path);
                }
            }
            Err(e) => errs.push(format!("cluster: {e}")),
        }

        if let Err(e) = self.delete_vpc().await {
            errs.push(format!("vpc: {e}"));
        }

        let role_stack = self.store.read(|c| c.status.cluster_role_cfn_stack_id.clone());
        match self.stacks.delete("cluster role", &role_stack, ROLE_TIMEOUT).await {
            Ok(()) => self.store.update(|c| {
                if !role_stack.is_empty() {
                    c.status.cluster_role_cfn_stack_id.clear();
                    c.status.cluster_role_arn.clear();
                }
            }),
            Err(e) => errs.push(format!("cluster role: {e}")),
        }

        // a key given by ARN only is not ours to delete, just forget it
        let key_id = self.store.read(|c| c.status.encryption_cmk_id.clone());
        let forget_key = |c: &mut Config| {
            c.status.encryption_cmk_id.clear();
            c.status.encryption_cmk_arn.clear();
        };
        if key_id.is_empty() {
            self.store.update(forget_key);
        } else {
            match self.providers.kms.schedule_key_deletion(&key_id, KEY_PENDING_DAYS).await {
                Ok(()) => self.store.update(forget_key),
                Err(e) if e.is_not_found() => self.store.update(forget_key),
                Err(e) => errs.push(format!("encryption key: {e}")),
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(errs))
        }
    }

    async fn delete_control_plane(&self) -> Result<()> {
        let (name, endpoint, stack_id, current, arn) = self.store.read(|c| {
            (
                c.name.clone(),
                c.parameters.endpoint(),
                c.status.cluster_cfn_stack_id.clone(),
                c.status.cluster_status_current.clone(),
                c.status.cluster_arn.clone(),
            )
        });
        if current == STATUS_DELETED_OR_NOT_EXIST || (stack_id.is_empty() && arn.is_empty()) {
            self.store.update(|c| clear_cluster_facts(&mut c.status));
            return Ok(());
        }

        if !stack_id.is_empty() {
            self.store.record_status("DELETING");
            self.stacks.delete("cluster", &stack_id, DELETE_TIMEOUT).await?;
            self.store.update(|c| c.status.cluster_cfn_stack_id.clear());
            self.forget_cluster();
            return Ok(());
        }

        info!(cluster = %name, "deleting cluster");
        match self.providers.clusters.delete_cluster(&endpoint, &name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                self.forget_cluster();
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let spec = PollSpec::new(format!("cluster {name}"), STATUS_DELETED_OR_NOT_EXIST)
            .initial_wait(Duration::from_secs(60))
            .interval(Duration::from_secs(20))
            .timeout(DELETE_TIMEOUT)
            .ignore_stop(true);
        let clusters = self.providers.clusters.clone();
        let stream = poll(spec, &StopSignal::never(), move || {
            let clusters = clusters.clone();
            let endpoint = endpoint.clone();
            let name = name.clone();
            async move { clusters.describe_cluster(&endpoint, &name).await }
        });
        let store = self.store.clone();
        wait_for_with(stream, |ev| {
            if !ev.state.is_empty() {
                store.record_status(&ev.state);
            }
        })
        .await?;
        self.forget_cluster();
        Ok(())
    }

    /// Drop every fact learned from a cluster that is now confirmed gone,
    /// so a later Up starts from scratch.
    fn forget_cluster(&self) {
        if self.store.read(|c| c.status.cluster_status_current != STATUS_DELETED_OR_NOT_EXIST) {
            self.store.record_status(STATUS_DELETED_OR_NOT_EXIST);
        }
        self.store.update(|c| clear_cluster_facts(&mut c.status));
    }

    async fn delete_vpc(&self) -> Result<()> {
        let stack_id = self.store.read(|c| c.status.vpc_cfn_stack_id.clone());
        if stack_id.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.stacks.delete("vpc", &stack_id, VPC_TIMEOUT).await {
            // ENIs left by the control plane can hold subnets for a while
            warn!(error = %e, "vpc delete failed, retrying in 30s");
            abortable_sleep(&StopSignal::never(), Duration::from_secs(30), "vpc delete retry").await?;
            self.stacks.delete("vpc", &stack_id, VPC_TIMEOUT).await?;
        }
        self.store.update(|c| {
            c.status.vpc_cfn_stack_id.clear();
            c.status.vpc_id.clear();
        });
        Ok(())
    }
}

fn clear_cluster_facts(s: &mut Status) {
    s.cluster_arn.clear();
    s.cluster_api_server_endpoint.clear();
    s.cluster_ca.clear();
    s.cluster_ca_decoded.clear();
    s.cluster_oidc_issuer_url.clear();
    s.cluster_oidc_issuer_host_path.clear();
    s.cluster_oidc_issuer_arn.clear();
    s.cluster_oidc_issuer_ca_thumbprint.clear();
}
