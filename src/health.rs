//! Control plane health checker.
//!
//! Talks to the API server directly with a bearer token rather than through
//! the kube client, so a broken kubeconfig or exec plugin shows up as a
//! failed check instead of hanging. TLS verification is off: the CA can
//! rotate under a long run.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use tracing::{debug, info, warn};

use crate::abort::{abortable_sleep, abortable_wait, StopSignal};
use crate::cluster::token::TokenProvider;
use crate::cluster::ClusterAccess;
use crate::config::{ServerVersionInfo, Store};
use crate::{k8s, Error, Result};

/// Retry budget of [`HealthChecker::check_with_retry`]
pub const RETRY_BUDGET: Duration = Duration::from_secs(5 * 60);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const HEALTHZ_SENTINEL: &str = "healthz check passed";

/// Probes `/version` and `/healthz` and lists kube-system pods
pub struct HealthChecker {
    store: Store,
    client: kube::Client,
    tokens: Arc<TokenProvider>,
    http: reqwest::Client,
}

impl HealthChecker {
    /// Checker for the cluster behind `access`
    pub fn new(store: Store, access: &ClusterAccess) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            store,
            client: access.client.clone(),
            tokens: access.tokens.clone(),
            http,
        })
    }

    /// One health check
    pub async fn check(&self) -> Result<()> {
        let (endpoint, version) = self.store.read(|c| {
            (
                c.status.cluster_api_server_endpoint.clone(),
                c.parameters.version.clone(),
            )
        });
        if endpoint.is_empty() {
            return Err(Error::health("no API server endpoint recorded"));
        }
        let endpoint = endpoint.trim_end_matches('/');
        let token = self.tokens.token().await?;

        let body = self.get(&format!("{endpoint}/version"), &token).await?;
        let info = verify_version(&body, &version)?;
        self.store.update(|c| c.status.server_version_info = Some(info.clone()));

        let body = self.get(&format!("{endpoint}/healthz?verbose"), &token).await?;
        verify_healthz(&body)?;

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), "kube-system");
        let list = pods.list(&ListParams::default()).await?;
        let ready = list.items.iter().filter(|p| k8s::pod_is_ready(p)).count();
        info!(
            git_version = %info.git_version,
            kube_system_pods = list.items.len(),
            ready,
            "cluster healthy"
        );
        Ok(())
    }

    /// Retry [`HealthChecker::check`] every 5 s for up to 5 minutes
    pub async fn check_with_retry(&self, stop: &StopSignal) -> Result<()> {
        let started = tokio::time::Instant::now();
        loop {
            let err = match abortable_wait(stop, "health check", self.check()).await? {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if started.elapsed() >= RETRY_BUDGET {
                return Err(Error::health(format!(
                    "unhealthy after {}s: {err}",
                    RETRY_BUDGET.as_secs()
                )));
            }
            warn!(error = %err, "health check failed, retrying");
            abortable_sleep(stop, RETRY_INTERVAL, "health check").await?;
        }
    }

    async fn get(&self, url: &str, token: &str) -> Result<String> {
        debug!(url = %url, "health probe");
        let resp = self.http.get(url).bearer_auth(token).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(Error::health(format!("{url} returned {status}: {}", body.trim())));
        }
        Ok(body)
    }
}

/// Check the `/version` body against the configured version and parse it
pub fn verify_version(body: &str, version: &str) -> Result<ServerVersionInfo> {
    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    let want = format!("\"gitVersion\":\"v{version}");
    if !compact.contains(&want) {
        return Err(Error::health(format!(
            "/version does not report v{version}: {}",
            body.trim()
        )));
    }
    Ok(serde_json::from_str(body)?)
}

/// Check the verbose `/healthz` body
pub fn verify_healthz(body: &str) -> Result<()> {
    if body.contains(HEALTHZ_SENTINEL) {
        Ok(())
    } else {
        Err(Error::health(format!("/healthz missing {HEALTHZ_SENTINEL:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERSION_BODY: &str = r#"{
  "major": "1",
  "minor": "30",
  "gitVersion": "v1.30.4-eks-a737599",
  "gitCommit": "6a8b5a2",
  "gitTreeState": "clean",
  "buildDate": "2024-08-26T21:27:41Z",
  "goVersion": "go1.22.5",
  "compiler": "gc",
  "platform": "linux/amd64"
}"#;

    #[test]
    fn version_matches_configured_minor() {
        let info = verify_version(VERSION_BODY, "1.30").unwrap();
        assert_eq!(info.git_version, "v1.30.4-eks-a737599");
        assert_eq!(info.minor, "30");
        assert_eq!(info.platform, "linux/amd64");
    }

    #[test]
    fn version_mismatch_is_a_health_error() {
        let err = verify_version(VERSION_BODY, "1.29").unwrap_err();
        assert!(matches!(err, Error::Health(_)));
    }

    /// Story: an API server that accepts connections and never answers does
    /// not hold the operator's interrupt for a whole request timeout
    #[tokio::test]
    async fn story_interrupt_cuts_a_hung_probe_short() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        use crate::config::Config;
        use crate::provider::MockIdentityApi;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config {
            name: "test-001".into(),
            config_path: dir.path().join("test-001.yaml").display().to_string(),
            ..Default::default()
        };
        cfg.parameters.version = "1.30".into();
        cfg.status.cluster_api_server_endpoint = endpoint.clone();

        let mut identity = MockIdentityApi::new();
        identity
            .expect_presign_caller_identity()
            .returning(|_| Ok("https://sts.us-west-2.amazonaws.com/?Action=GetCallerIdentity".into()));
        let client = kube::Client::try_from(kube::Config::new(endpoint.parse().unwrap())).unwrap();
        let checker = HealthChecker {
            store: Store::new(cfg),
            client,
            tokens: Arc::new(TokenProvider::new(Arc::new(identity), "test-001")),
            http: reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build().unwrap(),
        };

        let stop = StopSignal::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.stop("interrupt");
        });

        let started = std::time::Instant::now();
        let err = checker.check_with_retry(&stop).await.unwrap_err();
        assert!(err.is_aborted(), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
    }

    #[test]
    fn healthz_needs_the_sentinel() {
        verify_healthz("[+]ping ok\n[+]etcd ok\nhealthz check passed\n").unwrap();
        assert!(verify_healthz("[-]etcd failed: reason withheld\nhealthz check failed").is_err());
    }
}
