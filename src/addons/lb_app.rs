//! Load-balancer-backed applications: NLB hello-world and ALB 2048.
//!
//! Create applies the app, waits for the cloud controller to publish a
//! hostname, and probes the public URL until the expected body shows up.
//! Delete removes the object that owns the balancer first, waits for the
//! provider to detach ENIs, removes the rest, and finally reaps whatever
//! balancer is left so the VPC can be deleted.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::Api;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{info, warn};

use super::{AddOn, AddOnContext};
use crate::abort::StopSignal;
use crate::config::{AddOnKind, Config};
use crate::reaper::{alb_tags, service_tags, ReapTarget};
use crate::stack::StackSpec;
use crate::template::{self, cfn, manifests};
use crate::{k8s, Error, Result};

const HOSTNAME_TIMEOUT: Duration = Duration::from_secs(3 * 60);
const HOSTNAME_INTERVAL: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const PROBE_INTERVAL: Duration = Duration::from_secs(10);
const READY_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const ENI_DETACH_WAIT: Duration = Duration::from_secs(60);
const POLICY_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const NAMESPACE_DELETE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

const NLB_DEPLOYMENT: &str = "hello-world-deployment";
const NLB_SERVICE: &str = "hello-world-service";
const NLB_EXPECTED_BODY: &str = "<h1>Hello world!</h1>";

const ALB_CONTROLLER: &str = "alb-ingress-controller";
const ALB_DEPLOYMENT: &str = "alb-2048-deployment";
const ALB_INGRESS: &str = "alb-2048-ingress";
const ALB_EXPECTED_BODY: &str = "2048";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flavor {
    Nlb,
    Alb,
}

/// NLB hello-world or ALB 2048
pub struct LbApp {
    ctx: AddOnContext,
    flavor: Flavor,
}

/// Balancer name and ARN encoded in an NLB hostname
/// (`<name>-<id>.elb.<region>.amazonaws.com`)
pub fn nlb_from_hostname(hostname: &str, partition: &str, region: &str, account: &str) -> Option<(String, String)> {
    let label = hostname.split('.').next()?;
    let (name, id) = label.rsplit_once('-')?;
    if name.is_empty() || id.is_empty() {
        return None;
    }
    let arn = format!("arn:{partition}:elasticloadbalancing:{region}:{account}:loadbalancer/net/{name}/{id}");
    Some((name.to_string(), arn))
}

/// Hostname published on a `LoadBalancer` Service
pub fn service_hostname(svc: &Service) -> Option<String> {
    svc.status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .find_map(|i| i.hostname.clone().filter(|h| !h.is_empty()))
}

/// Hostname published on an Ingress
pub fn ingress_hostname(ing: &Ingress) -> Option<String> {
    ing.status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .find_map(|i| i.hostname.clone().filter(|h| !h.is_empty()))
}

fn node_role_names(cfg: &Config) -> Vec<String> {
    let mut roles = Vec::new();
    for (enabled, role) in [
        (cfg.add_on_node_groups.enable, &cfg.add_on_node_groups.role),
        (cfg.add_on_managed_node_groups.enable, &cfg.add_on_managed_node_groups.role),
    ] {
        if !enabled {
            continue;
        }
        let name = if role.role_name.is_empty() {
            role.role_arn.rsplit('/').next().unwrap_or_default().to_string()
        } else {
            role.role_name.clone()
        };
        if !name.is_empty() {
            roles.push(name);
        }
    }
    roles
}

impl LbApp {
    /// NLB hello-world
    pub fn nlb(ctx: AddOnContext) -> Self {
        Self {
            ctx,
            flavor: Flavor::Nlb,
        }
    }

    /// ALB 2048
    pub fn alb(ctx: AddOnContext) -> Self {
        Self {
            ctx,
            flavor: Flavor::Alb,
        }
    }

    fn render_app(&self, cfg: &Config) -> Result<String> {
        match self.flavor {
            Flavor::Nlb => template::render(
                manifests::NLB_HELLO_WORLD,
                json!({
                    "namespace": cfg.add_on_nlb_hello_world.common.namespace,
                    "replicas": cfg.add_on_nlb_hello_world.deployment_replicas.max(1),
                }),
            ),
            Flavor::Alb => template::render(
                manifests::ALB_2048,
                json!({
                    "namespace": cfg.add_on_alb2048.common.namespace,
                    "replicas": cfg.add_on_alb2048.deployment_replicas_2048.max(1),
                }),
            ),
        }
    }

    fn render_controller(cfg: &Config) -> Result<String> {
        template::render(
            manifests::ALB_CONTROLLER,
            json!({
                "cluster_name": cfg.name,
                "region": cfg.region,
                "replicas": cfg.add_on_alb2048.deployment_replicas_alb.max(1),
                "vpc_id": cfg.status.vpc_id,
            }),
        )
    }

    async fn wait_hostname(&self, stop: &StopSignal, namespace: &str) -> Result<String> {
        let client = self.ctx.client().clone();
        let found = Mutex::new(None::<String>);
        let flavor = self.flavor;
        let what = match flavor {
            Flavor::Nlb => format!("hostname of service {namespace}/{NLB_SERVICE}"),
            Flavor::Alb => format!("hostname of ingress {namespace}/{ALB_INGRESS}"),
        };
        k8s::poll_until(stop, HOSTNAME_TIMEOUT, HOSTNAME_INTERVAL, what, || {
            let client = client.clone();
            let found = &found;
            async move {
                let host = match flavor {
                    Flavor::Nlb => {
                        let api: Api<Service> = Api::namespaced(client, namespace);
                        service_hostname(&api.get(NLB_SERVICE).await?)
                    }
                    Flavor::Alb => {
                        let api: Api<Ingress> = Api::namespaced(client, namespace);
                        ingress_hostname(&api.get(ALB_INGRESS).await?)
                    }
                };
                let ready = host.is_some();
                *found.lock() = host;
                Ok(ready)
            }
        })
        .await?;
        found
            .into_inner()
            .ok_or_else(|| Error::add_on(self.name(), "load balancer hostname vanished"))
    }

    async fn ensure_policy(&self, stop: &StopSignal) -> Result<()> {
        let cfg = self.ctx.store.snapshot();
        if !cfg.add_on_alb2048.policy_cfn_stack_id.is_empty() {
            return Ok(());
        }
        let roles = node_role_names(&cfg);
        if roles.is_empty() {
            return Err(Error::add_on(self.name(), "no node role to attach the controller policy to"));
        }
        let spec = StackSpec::new(
            &cfg.add_on_alb2048.policy_name,
            cfn::ALB_POLICY,
            json!({ "cluster_name": cfg.name }),
        )?
        .param("PolicyName", &cfg.add_on_alb2048.policy_name)
        .list_param("RoleNames", &roles)
        .tags(crate::config::validate::default_tags(&cfg))
        .timing(Duration::from_secs(10), Duration::from_secs(10), POLICY_TIMEOUT);
        self.ctx
            .stacks
            .create(stop, spec, |c, id| c.add_on_alb2048.policy_cfn_stack_id = id.to_string())
            .await?;
        Ok(())
    }

    fn record_balancer(&self, hostname: &str) {
        let url = format!("http://{hostname}");
        info!(addon = %self.name(), url = %url, "load balancer published");
        match self.flavor {
            Flavor::Nlb => self.ctx.store.update(|c| {
                let derived = nlb_from_hostname(
                    hostname,
                    &c.status.aws_partition,
                    &c.region,
                    &c.status.aws_account_id,
                );
                let nlb = &mut c.add_on_nlb_hello_world;
                nlb.url = url;
                if let Some((name, arn)) = derived {
                    nlb.load_balancer_name = name;
                    nlb.load_balancer_arn = arn;
                }
            }),
            Flavor::Alb => self.ctx.store.update(|c| {
                let alb = &mut c.add_on_alb2048;
                alb.url = url;
                alb.load_balancer_name = hostname.split('.').next().unwrap_or_default().to_string();
            }),
        }
    }

    /// Objects whose deletion releases the balancer
    fn owns_balancer(&self, obj: &k8s::ManifestObject) -> bool {
        match self.flavor {
            Flavor::Nlb => obj.name == NLB_SERVICE,
            Flavor::Alb => obj.name == ALB_INGRESS,
        }
    }
}

/// GET `url` until its body contains `expected`
pub async fn probe_url(stop: &StopSignal, url: &str, expected: &str, timeout: Duration) -> Result<()> {
    let http = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(10))
        .build()?;
    k8s::poll_until(stop, timeout, PROBE_INTERVAL, format!("{url} serving {expected:?}"), || {
        let http = http.clone();
        async move {
            let body = http.get(url).send().await?.text().await?;
            Ok(body.contains(expected))
        }
    })
    .await?;
    info!(url = %url, "public URL serves expected content");
    Ok(())
}

#[async_trait]
impl AddOn for LbApp {
    fn kind(&self) -> AddOnKind {
        match self.flavor {
            Flavor::Nlb => AddOnKind::NlbHelloWorld,
            Flavor::Alb => AddOnKind::Alb2048,
        }
    }

    async fn create(&self, stop: &StopSignal) -> Result<()> {
        let client = self.ctx.client();
        let namespace = self.ctx.namespace(self.kind());

        if self.flavor == Flavor::Alb {
            self.ensure_policy(stop).await?;
            let controller = Self::render_controller(&self.ctx.store.snapshot())?;
            k8s::apply_manifests(client, &controller).await?;
            k8s::wait_for_deployment(client, stop, "kube-system", ALB_CONTROLLER, READY_TIMEOUT).await?;
        }

        k8s::ensure_namespace(client, &namespace).await?;
        let app = self.render_app(&self.ctx.store.snapshot())?;
        k8s::apply_manifests(client, &app).await?;
        let deployment = match self.flavor {
            Flavor::Nlb => NLB_DEPLOYMENT,
            Flavor::Alb => ALB_DEPLOYMENT,
        };
        k8s::wait_for_deployment(client, stop, &namespace, deployment, READY_TIMEOUT).await?;

        let hostname = self.wait_hostname(stop, &namespace).await?;
        self.record_balancer(&hostname);

        let expected = match self.flavor {
            Flavor::Nlb => NLB_EXPECTED_BODY,
            Flavor::Alb => ALB_EXPECTED_BODY,
        };
        probe_url(stop, &format!("http://{hostname}"), expected, PROBE_TIMEOUT).await
    }

    async fn delete(&self) -> Result<()> {
        let cfg = self.ctx.store.snapshot();
        let client = self.ctx.client();
        let namespace = self.ctx.namespace(self.kind());
        let mut errs = Vec::new();

        let objects = k8s::parse_manifests(&self.render_app(&cfg)?)?;
        let (owners, rest): (Vec<_>, Vec<_>) = objects.iter().partition(|o| self.owns_balancer(o));
        for obj in owners {
            if let Err(e) = k8s::delete_object(client, obj).await {
                errs.push(e.to_string());
            }
        }
        info!(addon = %self.name(), wait_secs = ENI_DETACH_WAIT.as_secs(), "waiting for the provider to detach the balancer");
        tokio::time::sleep(ENI_DETACH_WAIT).await;
        for obj in rest.into_iter().rev() {
            if let Err(e) = k8s::delete_object(client, obj).await {
                errs.push(e.to_string());
            }
        }
        if let Err(e) = k8s::delete_namespace(client, &StopSignal::never(), &namespace, NAMESPACE_DELETE_TIMEOUT).await {
            errs.push(e.to_string());
        }

        if self.flavor == Flavor::Alb {
            match Self::render_controller(&cfg) {
                Ok(body) => {
                    if let Err(e) = k8s::delete_manifests(client, &body).await {
                        errs.push(e.to_string());
                    }
                }
                Err(e) => errs.push(e.to_string()),
            }
        }

        let target = match self.flavor {
            Flavor::Nlb => ReapTarget::new(
                &cfg.add_on_nlb_hello_world.load_balancer_arn,
                &cfg.status.vpc_id,
                service_tags(&cfg.name, &namespace, NLB_SERVICE),
            ),
            Flavor::Alb => ReapTarget::new(
                &cfg.add_on_alb2048.load_balancer_arn,
                &cfg.status.vpc_id,
                alb_tags(&cfg.name, &namespace),
            ),
        };
        if let Err(e) = self.ctx.reaper.reap(&target).await {
            warn!(addon = %self.name(), error = %e, "failed to reap load balancer");
            errs.push(e.to_string());
        }

        if self.flavor == Flavor::Alb && !cfg.add_on_alb2048.policy_cfn_stack_id.is_empty() {
            match self
                .ctx
                .stacks
                .delete("ALB controller policy", &cfg.add_on_alb2048.policy_cfn_stack_id, POLICY_TIMEOUT)
                .await
            {
                Ok(()) => self.ctx.store.update(|c| c.add_on_alb2048.policy_cfn_stack_id.clear()),
                Err(e) => errs.push(e.to_string()),
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(errs))
        }
    }
}
