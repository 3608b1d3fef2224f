//! Batch workloads: the pi job, the echo job and the echo cron job.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info};

use super::{AddOn, AddOnContext};
use crate::abort::StopSignal;
use crate::config::validate::MAX_ECHO_SIZE;
use crate::config::{AddOnKind, Config};
use crate::template::{self, manifests};
use crate::{k8s, Error, Result};

const PER_COMPLETION: Duration = Duration::from_secs(60);
const BASE_DEADLINE: Duration = Duration::from_secs(5 * 60);
const POLL_INTERVAL: Duration = Duration::from_secs(10);
const NAMESPACE_DELETE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

const POD_SUCCEEDED: &str = "Succeeded";

/// Batch job or cron job that must reach a number of successful pods
pub struct BatchJob {
    ctx: AddOnContext,
    kind: AddOnKind,
}

/// Echo payload of `size` bytes, capped
pub fn echo_payload(size: u32) -> String {
    "0".repeat(size.min(MAX_ECHO_SIZE) as usize)
}

/// Time allowed for `completes` successful pods
pub fn deadline(completes: u32) -> Duration {
    PER_COMPLETION * completes + BASE_DEADLINE
}

/// Rendered manifest, label selector of its pods, required completions
pub fn render(cfg: &Config, kind: AddOnKind) -> Result<(String, &'static str, u32)> {
    match kind {
        AddOnKind::JobsPi => {
            let job = &cfg.add_on_jobs_pi;
            let body = template::render(
                manifests::JOB_PI,
                json!({
                    "namespace": job.common.namespace,
                    "completes": job.completes,
                    "parallels": job.parallels.max(1),
                }),
            )?;
            Ok((body, "job-name=job-pi", job.completes))
        }
        AddOnKind::JobsEcho => {
            let job = &cfg.add_on_jobs_echo;
            let body = template::render(
                manifests::JOB_ECHO,
                json!({
                    "namespace": job.common.namespace,
                    "completes": job.completes,
                    "parallels": job.parallels.max(1),
                    "payload": echo_payload(job.echo_size),
                }),
            )?;
            Ok((body, "job-name=job-echo", job.completes))
        }
        AddOnKind::CronJobs => {
            let cron = &cfg.add_on_cron_jobs;
            let body = template::render(
                manifests::CRONJOB_ECHO,
                json!({
                    "namespace": cron.common.namespace,
                    "schedule": cron.schedule,
                    "completes": cron.completes,
                    "parallels": cron.parallels.max(1),
                    "successful_jobs_history_limit": cron.successful_jobs_history_limit,
                    "failed_jobs_history_limit": cron.failed_jobs_history_limit,
                    "payload": echo_payload(cron.echo_size),
                }),
            )?;
            Ok((body, "cronjob-name=cronjob-echo", cron.completes))
        }
        other => Err(Error::add_on(other.name(), "not a batch workload")),
    }
}

/// Names of succeeded pods in `pods`
fn succeeded(pods: &[Pod]) -> impl Iterator<Item = String> + '_ {
    pods.iter()
        .filter(|p| p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some(POD_SUCCEEDED))
        .filter_map(|p| p.metadata.name.clone())
}

impl BatchJob {
    /// Plugin for `kind`
    pub fn new(ctx: AddOnContext, kind: AddOnKind) -> Self {
        Self { ctx, kind }
    }
}

#[async_trait]
impl AddOn for BatchJob {
    fn kind(&self) -> AddOnKind {
        self.kind
    }

    async fn create(&self, stop: &StopSignal) -> Result<()> {
        let cfg = self.ctx.store.snapshot();
        let (body, selector, completes) = render(&cfg, self.kind)?;
        let namespace = self.ctx.namespace(self.kind);
        let client = self.ctx.client();

        k8s::ensure_namespace(client, &namespace).await?;
        k8s::apply_manifests(client, &body).await?;

        // History limits prune finished cron pods, so successes are
        // accumulated by name across polls.
        let seen = Mutex::new(BTreeSet::new());
        let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
        let what = format!("{completes} succeeded pods for {}", self.name());
        k8s::poll_until(stop, deadline(completes), POLL_INTERVAL, what, || {
            let pods = pods.clone();
            let seen = &seen;
            async move {
                let list = pods.list(&ListParams::default().labels(selector)).await?;
                let mut seen = seen.lock();
                seen.extend(succeeded(&list.items));
                debug!(succeeded = seen.len(), want = completes, "batch progress");
                Ok(seen.len() >= completes as usize)
            }
        })
        .await?;
        info!(addon = %self.name(), completes, "batch workload completed");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let cfg = self.ctx.store.snapshot();
        let (body, _, _) = render(&cfg, self.kind)?;
        let namespace = self.ctx.namespace(self.kind);
        let client = self.ctx.client();
        k8s::delete_manifests(client, &body).await?;
        k8s::delete_namespace(client, &StopSignal::never(), &namespace, NAMESPACE_DELETE_TIMEOUT).await
    }
}
