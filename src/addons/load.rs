//! API load generators: config-maps, secrets and the stresser.
//!
//! Every request is timed into an HDR histogram. The run ends with a JSON
//! summary written to the block's `summaryOutputPath`, which the exporter
//! picks up as an artifact.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use hdrhistogram::Histogram;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use super::{AddOn, AddOnContext};
use crate::abort::{abortable_wait, StopSignal};
use crate::config::validate::MAX_OBJECT_SIZE;
use crate::config::{AddOnKind, AddOnLoad, Config};
use crate::{k8s, Error, Result, FIELD_MANAGER};

const NAMESPACE_DELETE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Highest latency the histogram tracks, in microseconds
const MAX_TRACKED_MICROS: u64 = 5 * 60 * 1_000_000;
const STRESSER_OBJECTS: u32 = 10;

/// Latency summary written after a run
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadSummary {
    /// Requests issued
    pub count: u64,
    /// Requests that failed
    pub failures: u64,
    /// Median latency
    #[serde(rename = "p50Ms")]
    pub p50_ms: f64,
    /// 90th percentile latency
    #[serde(rename = "p90Ms")]
    pub p90_ms: f64,
    /// 99th percentile latency
    #[serde(rename = "p99Ms")]
    pub p99_ms: f64,
    /// 99.9th percentile latency
    #[serde(rename = "p99.9Ms")]
    pub p999_ms: f64,
    /// Slowest request
    #[serde(rename = "maxMs")]
    pub max_ms: f64,
}

/// Request latencies and failure count
pub struct Recorder {
    hist: Histogram<u64>,
    failures: u64,
}

impl Recorder {
    /// Empty recorder
    pub fn new() -> Result<Self> {
        let hist = Histogram::new_with_bounds(1, MAX_TRACKED_MICROS, 3)
            .map_err(|e| Error::validation(format!("latency histogram: {e}")))?;
        Ok(Self { hist, failures: 0 })
    }

    /// Record one request
    pub fn record(&mut self, elapsed: Duration, ok: bool) {
        self.hist.saturating_record(elapsed.as_micros().max(1) as u64);
        if !ok {
            self.failures += 1;
        }
    }

    /// Fold another recorder into this one
    pub fn merge(&mut self, other: &Recorder) -> Result<()> {
        self.hist
            .add(&other.hist)
            .map_err(|e| Error::validation(format!("latency histogram: {e}")))?;
        self.failures += other.failures;
        Ok(())
    }

    /// Percentile summary
    pub fn summary(&self) -> LoadSummary {
        let ms = |micros: u64| micros as f64 / 1000.0;
        LoadSummary {
            count: self.hist.len(),
            failures: self.failures,
            p50_ms: ms(self.hist.value_at_quantile(0.5)),
            p90_ms: ms(self.hist.value_at_quantile(0.9)),
            p99_ms: ms(self.hist.value_at_quantile(0.99)),
            p999_ms: ms(self.hist.value_at_quantile(0.999)),
            max_ms: ms(self.hist.max()),
        }
    }
}

/// Write `summary` as pretty JSON
pub fn write_summary(path: &Path, summary: &LoadSummary) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(summary)?)?;
    Ok(())
}

/// Read a summary written by [`write_summary`]
pub fn read_summary(path: &Path) -> Result<LoadSummary> {
    Ok(serde_json::from_slice(&std::fs::read(path)?)?)
}

fn block(cfg: &Config, kind: AddOnKind) -> Result<&AddOnLoad> {
    match kind {
        AddOnKind::ConfigMaps => Ok(&cfg.add_on_config_maps),
        AddOnKind::Secrets => Ok(&cfg.add_on_secrets),
        AddOnKind::Stresser => Ok(&cfg.add_on_stresser),
        other => Err(Error::add_on(other.name(), "not a load generator")),
    }
}

fn payload(size: u32) -> String {
    "0".repeat(size.min(MAX_OBJECT_SIZE) as usize)
}

fn object_name(kind: AddOnKind, i: u32) -> String {
    format!("{}-{i:05}", kind.name())
}

fn config_map(name: &str, namespace: &str, data: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([("data".to_string(), data.to_string())])),
        ..Default::default()
    }
}

fn secret(name: &str, namespace: &str, data: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        string_data: Some(BTreeMap::from([("data".to_string(), data.to_string())])),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

/// Config-map writer, secret writer and reader, or API stresser
pub struct LoadGenerator {
    ctx: AddOnContext,
    kind: AddOnKind,
}

impl LoadGenerator {
    /// Plugin for `kind`
    pub fn new(ctx: AddOnContext, kind: AddOnKind) -> Self {
        Self { ctx, kind }
    }

    /// Create `objects` objects, `concurrency` at a time
    async fn write_objects(&self, namespace: &str, load: &AddOnLoad) -> Result<Recorder> {
        let client = self.ctx.client().clone();
        let data = payload(load.object_size);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let kind = self.kind;

        let timings = stream::iter(0..load.objects)
            .map(|i| {
                let client = client.clone();
                let data = &data;
                let params = &params;
                async move {
                    let name = object_name(kind, i);
                    let start = Instant::now();
                    let res = match kind {
                        AddOnKind::Secrets => {
                            let api: Api<Secret> = Api::namespaced(client, namespace);
                            match api.patch(&name, params, &Patch::Apply(secret(&name, namespace, data))).await {
                                Ok(_) => api.get(&name).await.map(|_| ()),
                                Err(e) => Err(e),
                            }
                        }
                        _ => {
                            let api: Api<ConfigMap> = Api::namespaced(client, namespace);
                            api.patch(&name, params, &Patch::Apply(config_map(&name, namespace, data)))
                                .await
                                .map(|_| ())
                        }
                    };
                    if let Err(e) = &res {
                        warn!(object = %name, error = %e, "load request failed");
                    }
                    (start.elapsed(), res.is_ok())
                }
            })
            .buffer_unordered(load.concurrency.max(1) as usize)
            .collect::<Vec<_>>()
            .await;

        let mut rec = Recorder::new()?;
        for (elapsed, ok) in timings {
            rec.record(elapsed, ok);
        }
        Ok(rec)
    }

    /// Seed a few config maps, then list and get them until the deadline
    async fn stress(&self, namespace: &str, load: &AddOnLoad) -> Result<Recorder> {
        let seed = AddOnLoad {
            objects: STRESSER_OBJECTS,
            ..load.clone()
        };
        let mut total = self.write_objects(namespace, &seed).await?;

        let deadline = Instant::now() + Duration::from_secs(load.duration_seconds);
        let api: Api<ConfigMap> = Api::namespaced(self.ctx.client().clone(), namespace);
        let kind = self.kind;
        let workers = (0..load.concurrency.max(1)).map(|w| {
            let api = api.clone();
            async move {
                let mut rec = Recorder::new()?;
                let mut i = w;
                while Instant::now() < deadline {
                    let start = Instant::now();
                    let ok = if i % 2 == 0 {
                        api.list(&ListParams::default().limit(100)).await.is_ok()
                    } else {
                        api.get(&object_name(kind, i % STRESSER_OBJECTS)).await.is_ok()
                    };
                    rec.record(start.elapsed(), ok);
                    i += 1;
                }
                Ok::<_, Error>(rec)
            }
        });
        for rec in futures::future::join_all(workers).await {
            total.merge(&rec?)?;
        }
        Ok(total)
    }
}

#[async_trait]
impl AddOn for LoadGenerator {
    fn kind(&self) -> AddOnKind {
        self.kind
    }

    async fn create(&self, stop: &StopSignal) -> Result<()> {
        let cfg = self.ctx.store.snapshot();
        let load = block(&cfg, self.kind)?.clone();
        let namespace = self.ctx.namespace(self.kind);
        k8s::ensure_namespace(self.ctx.client(), &namespace).await?;

        info!(
            addon = %self.name(),
            objects = load.objects,
            object_size = load.object_size,
            concurrency = load.concurrency,
            "generating load"
        );
        let what = format!("{} load", self.name());
        let rec = match self.kind {
            AddOnKind::Stresser => abortable_wait(stop, &what, self.stress(&namespace, &load)).await??,
            _ => abortable_wait(stop, &what, self.write_objects(&namespace, &load)).await??,
        };

        let summary = rec.summary();
        write_summary(Path::new(&load.summary_output_path), &summary)?;
        info!(
            addon = %self.name(),
            count = summary.count,
            failures = summary.failures,
            p99_ms = summary.p99_ms,
            path = %load.summary_output_path,
            "load summary written"
        );
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let namespace = self.ctx.namespace(self.kind);
        k8s::delete_namespace(self.ctx.client(), &StopSignal::never(), &namespace, NAMESPACE_DELETE_TIMEOUT).await
    }

    async fn aggregate_results(&self) -> Result<()> {
        let path = self.ctx.store.read(|c| block(c, self.kind).map(|b| b.summary_output_path.clone()))?;
        match read_summary(Path::new(&path)) {
            Ok(s) => info!(
                addon = %self.name(),
                count = s.count,
                failures = s.failures,
                p50_ms = s.p50_ms,
                p90_ms = s.p90_ms,
                p99_ms = s.p99_ms,
                p999_ms = s.p999_ms,
                max_ms = s.max_ms,
                "load results"
            ),
            Err(e) => warn!(addon = %self.name(), path = %path, error = %e, "no load summary"),
        }
        Ok(())
    }
}
