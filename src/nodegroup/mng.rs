//! Provider-managed node groups: create through the cluster API, scale,
//! upgrade, delete.

use std::time::Duration;

use chrono::Utc;
use futures::future::{join_all, try_join_all};
use tracing::{info, warn};

use super::{NodeGroupDriver, Variant};
use crate::abort::{abortable_sleep, StopSignal};
use crate::cluster::ClusterAccess;
use crate::config::validate::default_tags;
use crate::config::{Mng, TimeFrame, STATUS_ACTIVE, STATUS_DELETED_OR_NOT_EXIST};
use crate::poller::{poll, wait_for, wait_for_with, PollSpec};
use crate::provider::{CreateNodegroupRequest, ScalingConfig};
use crate::{k8s, Error, Result};

const CREATE_TIMEOUT: Duration = Duration::from_secs(40 * 60);
const DELETE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const UPDATE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const INSTANCES_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const NODES_READY_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Node label the provider puts on managed nodes
pub const MANAGED_NODE_GROUP_LABEL: &str = "eks.amazonaws.com/nodegroup";

const UPDATE_SUCCESSFUL: &str = "Successful";
const UPDATE_FAILURE_STATES: &[&str] = &["Failed", "Cancelled"];
const CREATE_FAILURE_STATES: &[&str] = &["CREATE_FAILED", "DELETE_FAILED", "DEGRADED"];

impl NodeGroupDriver {
    /// Create every configured managed node group and wait for its nodes
    pub async fn create_managed(&self, stop: &StopSignal, access: &ClusterAccess) -> Result<()> {
        if !self.store.read(|c| c.add_on_managed_node_groups.enable) {
            return Ok(());
        }
        self.store.update(|c| {
            let mngs = &mut c.add_on_managed_node_groups;
            mngs.created = true;
            mngs.time_frame_create.get_or_insert_with(|| TimeFrame::start(Utc::now()));
        });

        let role_arn = self.ensure_role(stop, Variant::Managed).await?;
        let names: Vec<String> =
            self.store.read(|c| c.add_on_managed_node_groups.mngs.keys().cloned().collect());
        try_join_all(names.iter().map(|name| self.create_mng(stop, access, name, &role_arn))).await?;

        self.store.update(|c| {
            if let Some(tf) = c.add_on_managed_node_groups.time_frame_create.as_mut() {
                tf.finish(Utc::now());
            }
        });
        info!(mngs = names.len(), "managed node groups ready");
        Ok(())
    }

    fn mng(&self, name: &str) -> Result<Mng> {
        self.store
            .read(|c| c.add_on_managed_node_groups.mngs.get(name).cloned())
            .ok_or_else(|| Error::node_group(format!("unknown managed node group {name}")))
    }

    fn update_mng(&self, name: &str, f: impl FnOnce(&mut Mng)) {
        self.store.update(|c| {
            if let Some(m) = c.add_on_managed_node_groups.mngs.get_mut(name) {
                f(m);
            }
        });
    }

    async fn create_mng(
        &self,
        stop: &StopSignal,
        access: &ClusterAccess,
        name: &str,
        role_arn: &str,
    ) -> Result<()> {
        let cfg = self.store.snapshot();
        let endpoint = cfg.add_on_managed_node_groups.endpoint();
        let mng = self.mng(name)?;

        if !mng.create_requested {
            let mut tags = default_tags(&cfg);
            tags.extend(mng.tags.clone());
            let req = CreateNodegroupRequest {
                cluster_name: cfg.name.clone(),
                name: name.to_string(),
                role_arn: role_arn.to_string(),
                subnet_ids: cfg.status.public_subnet_ids.clone(),
                instance_types: mng.instance_types.clone(),
                ami_type: mng.ami_type.clone(),
                disk_size: mng.volume_size,
                scaling: ScalingConfig {
                    min_size: mng.asg_min_size,
                    max_size: mng.asg_max_size,
                    desired_size: mng.asg_desired_capacity,
                },
                remote_access_key: Some(cfg.remote_access_key_name.clone()),
                release_version: (!mng.release_version.is_empty()).then(|| mng.release_version.clone()),
                labels: [("NGName".to_string(), name.to_string())].into(),
                tags,
                endpoint: endpoint.clone(),
            };
            self.update_mng(name, |m| {
                m.create_requested = true;
                m.time_frame_create = Some(TimeFrame::start(Utc::now()));
            });
            info!(mng = %name, "creating managed node group");
            match self.providers.clusters.create_nodegroup(&req).await {
                Ok(desc) => self.update_mng(name, |m| m.status = desc.status),
                Err(e) if e.is_already_exists() => info!(mng = %name, "managed node group already exists"),
                Err(e) => return Err(e.into()),
            }
        }

        let spec = PollSpec::new(format!("managed node group {name}"), STATUS_ACTIVE)
            .failure_states(CREATE_FAILURE_STATES.iter().copied())
            .initial_wait(Duration::from_secs(60))
            .interval(Duration::from_secs(20))
            .timeout(CREATE_TIMEOUT);
        let clusters = self.providers.clusters.clone();
        let (cluster, ng) = (cfg.name.clone(), name.to_string());
        let stream = poll(spec, stop, move || {
            let clusters = clusters.clone();
            let (endpoint, cluster, ng) = (endpoint.clone(), cluster.clone(), ng.clone());
            async move { clusters.describe_nodegroup(&endpoint, &cluster, &ng).await }
        });
        let reached = wait_for_with(stream, |ev| {
            if !ev.state.is_empty() {
                self.update_mng(name, |m| m.status = ev.state.clone());
            }
        })
        .await?;
        let desc = reached.resource.unwrap_or_default();
        let asg_name = desc.autoscaling_groups.first().cloned().unwrap_or_default();
        self.update_mng(name, |m| {
            m.physical_id = desc.arn.clone();
            m.asg_name = asg_name.clone();
            m.remote_access_security_group_id = desc.remote_access_security_group.clone().unwrap_or_default();
        });

        if !asg_name.is_empty() {
            let instances = self
                .wait_instances(stop, &asg_name, mng.asg_desired_capacity, INSTANCES_TIMEOUT)
                .await?;
            self.update_mng(name, |m| m.instances = instances);
        }
        k8s::wait_for_ready_nodes(
            &access.client,
            stop,
            &format!("{MANAGED_NODE_GROUP_LABEL}={name}"),
            mng.asg_desired_capacity as usize,
            NODES_READY_TIMEOUT,
        )
        .await?;
        self.update_mng(name, |m| {
            if let Some(tf) = m.time_frame_create.as_mut() {
                tf.finish(Utc::now());
            }
        });
        info!(mng = %name, nodes = mng.asg_desired_capacity, "managed node group ready");
        Ok(())
    }

    async fn wait_update(&self, stop: &StopSignal, name: &str, update_id: &str) -> Result<()> {
        let (endpoint, cluster) = self
            .store
            .read(|c| (c.add_on_managed_node_groups.endpoint(), c.name.clone()));
        let spec = PollSpec::new(format!("update {update_id} of {name}"), UPDATE_SUCCESSFUL)
            .failure_states(UPDATE_FAILURE_STATES.iter().copied())
            .initial_wait(Duration::from_secs(30))
            .interval(Duration::from_secs(20))
            .timeout(UPDATE_TIMEOUT);
        let clusters = self.providers.clusters.clone();
        let (ng, id) = (name.to_string(), update_id.to_string());
        let stream = poll(spec, stop, move || {
            let clusters = clusters.clone();
            let (endpoint, cluster, ng, id) = (endpoint.clone(), cluster.clone(), ng.clone(), id.clone());
            async move { clusters.describe_update(&endpoint, &cluster, &ng, &id).await }
        });
        wait_for(stream).await?;
        Ok(())
    }

    /// Apply every enabled, not yet applied scale update
    pub async fn scale(&self, stop: &StopSignal, access: &ClusterAccess) -> Result<()> {
        let (enabled, cluster, endpoint, names) = self.store.read(|c| {
            let mngs = &c.add_on_managed_node_groups;
            (
                mngs.enable,
                c.name.clone(),
                mngs.endpoint(),
                mngs.mngs.keys().cloned().collect::<Vec<_>>(),
            )
        });
        if !enabled {
            return Ok(());
        }
        for name in names {
            let mng = self.mng(&name)?;
            for (idx, update) in mng.scale_updates.iter().enumerate() {
                if !update.enable || update.created {
                    continue;
                }
                abortable_sleep(stop, Duration::from_secs(update.initial_wait_seconds), "scale initial wait")
                    .await?;
                let scaling = ScalingConfig {
                    min_size: update.asg_min_size,
                    max_size: update.asg_max_size,
                    desired_size: update.asg_desired_capacity,
                };
                info!(mng = %name, desired = scaling.desired_size, "scaling managed node group");
                let update_id = self
                    .providers
                    .clusters
                    .update_nodegroup_config(&endpoint, &cluster, &name, scaling)
                    .await?;
                self.update_mng(&name, |m| {
                    let u = &mut m.scale_updates[idx];
                    u.created = true;
                    u.id = update_id.clone();
                    u.time_frame_update = Some(TimeFrame::start(Utc::now()));
                });
                self.wait_update(stop, &name, &update_id).await?;
                k8s::wait_for_ready_nodes(
                    &access.client,
                    stop,
                    &format!("{MANAGED_NODE_GROUP_LABEL}={name}"),
                    scaling.desired_size as usize,
                    NODES_READY_TIMEOUT,
                )
                .await?;
                self.update_mng(&name, |m| {
                    m.asg_min_size = scaling.min_size;
                    m.asg_max_size = scaling.max_size;
                    m.asg_desired_capacity = scaling.desired_size;
                    if let Some(tf) = m.scale_updates[idx].time_frame_update.as_mut() {
                        tf.finish(Utc::now());
                    }
                });
            }
        }
        Ok(())
    }

    /// Upgrade every managed node group with an enabled version upgrade
    pub async fn upgrade_version(&self, stop: &StopSignal) -> Result<()> {
        let (enabled, cluster, endpoint, names) = self.store.read(|c| {
            let mngs = &c.add_on_managed_node_groups;
            (
                mngs.enable,
                c.name.clone(),
                mngs.endpoint(),
                mngs.mngs.keys().cloned().collect::<Vec<_>>(),
            )
        });
        if !enabled {
            return Ok(());
        }
        for name in names {
            let Some(upgrade) = self.mng(&name)?.version_upgrade else {
                continue;
            };
            if !upgrade.enable || upgrade.created {
                continue;
            }
            abortable_sleep(stop, Duration::from_secs(upgrade.initial_wait_seconds), "upgrade initial wait")
                .await?;
            info!(mng = %name, version = %upgrade.version, "upgrading managed node group");
            let update_id = self
                .providers
                .clusters
                .update_nodegroup_version(&endpoint, &cluster, &name, &upgrade.version)
                .await?;
            self.update_mng(&name, |m| {
                if let Some(u) = m.version_upgrade.as_mut() {
                    u.created = true;
                    u.time_frame_update = Some(TimeFrame::start(Utc::now()));
                }
            });
            self.wait_update(stop, &name, &update_id).await?;
            self.update_mng(&name, |m| {
                if let Some(tf) = m.version_upgrade.as_mut().and_then(|u| u.time_frame_update.as_mut()) {
                    tf.finish(Utc::now());
                }
            });
        }
        Ok(())
    }

    /// Delete every managed node group in parallel, then the role stack
    pub async fn delete_managed(&self) -> Result<()> {
        let (created, cluster, endpoint, names) = self.store.read(|c| {
            let mngs = &c.add_on_managed_node_groups;
            (
                mngs.created,
                c.name.clone(),
                mngs.endpoint(),
                mngs.mngs
                    .values()
                    .filter(|m| m.create_requested)
                    .map(|m| m.name.clone())
                    .collect::<Vec<_>>(),
            )
        });
        if !created {
            return Ok(());
        }

        let results = join_all(names.iter().map(|name| {
            let endpoint = endpoint.clone();
            let cluster = cluster.clone();
            async move {
                self.delete_mng(&endpoint, &cluster, name)
                    .await
                    .map_err(|e| format!("{name}: {e}"))
            }
        }))
        .await;
        let mut errs: Vec<String> = results.into_iter().filter_map(|r| r.err()).collect();
        if errs.is_empty() {
            if let Err(e) = self.delete_role(Variant::Managed).await {
                errs.push(format!("managed node role: {e}"));
            }
        }
        if !errs.is_empty() {
            warn!(errors = ?errs, "managed node group teardown incomplete");
            return Err(Error::Teardown(errs));
        }
        self.store.update(|c| {
            let mngs = &mut c.add_on_managed_node_groups;
            mngs.created = false;
            mngs.time_frame_delete = Some(TimeFrame::start(Utc::now()));
            if let Some(tf) = mngs.time_frame_delete.as_mut() {
                tf.finish(Utc::now());
            }
        });
        info!("managed node groups deleted");
        Ok(())
    }

    async fn delete_mng(&self, endpoint: &crate::provider::ApiEndpoint, cluster: &str, name: &str) -> Result<()> {
        self.update_mng(name, |m| m.time_frame_delete = Some(TimeFrame::start(Utc::now())));
        info!(mng = %name, "deleting managed node group");
        match self.providers.clusters.delete_nodegroup(endpoint, cluster, name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let spec = PollSpec::new(format!("managed node group {name}"), STATUS_DELETED_OR_NOT_EXIST)
            .failure_states(["DELETE_FAILED"])
            .initial_wait(Duration::from_secs(60))
            .interval(Duration::from_secs(20))
            .timeout(DELETE_TIMEOUT)
            .ignore_stop(true);
        let clusters = self.providers.clusters.clone();
        let (endpoint, cluster, ng) = (endpoint.clone(), cluster.to_string(), name.to_string());
        let stream = poll(spec, &StopSignal::never(), move || {
            let clusters = clusters.clone();
            let (endpoint, cluster, ng) = (endpoint.clone(), cluster.clone(), ng.clone());
            async move { clusters.describe_nodegroup(&endpoint, &cluster, &ng).await }
        });
        wait_for(stream).await?;

        self.update_mng(name, |m| {
            m.create_requested = false;
            m.status = STATUS_DELETED_OR_NOT_EXIST.to_string();
            m.instances.clear();
            if let Some(tf) = m.time_frame_delete.as_mut() {
                tf.finish(Utc::now());
            }
        });
        Ok(())
    }
}
