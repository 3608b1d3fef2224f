//! Embedded stack and manifest templates.
//!
//! Templates are data-only: `{{ name }}` substitution, no control flow.
//! Anything conditional is decided in Rust before rendering, which keeps
//! every rendered body easy to snapshot. Undefined variables are errors.

use std::sync::OnceLock;

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

use crate::Result;

/// Stack template names
pub mod cfn {
    /// IAM role trusted by service principals
    pub const ROLE: &str = "cfn/role.yaml";
    /// IAM role trusted by the cluster OIDC provider
    pub const IRSA_ROLE: &str = "cfn/irsa-role.yaml";
    /// VPC with two public and two private subnets
    pub const VPC: &str = "cfn/vpc.yaml";
    /// Managed control plane
    pub const CLUSTER: &str = "cfn/cluster.yaml";
    /// Shared worker security group
    pub const NODE_SECURITY_GROUP: &str = "cfn/node-security-group.yaml";
    /// Launch template and auto scaling group
    pub const ASG: &str = "cfn/asg.yaml";
    /// ALB ingress controller policy
    pub const ALB_POLICY: &str = "cfn/alb-policy.yaml";
}

/// Kubernetes manifest names
pub mod manifests {
    /// Kubernetes dashboard
    pub const KUBERNETES_DASHBOARD: &str = "manifests/kubernetes-dashboard.yaml";
    /// NLB hello-world deployment and service
    pub const NLB_HELLO_WORLD: &str = "manifests/nlb-hello-world.yaml";
    /// ALB ingress controller
    pub const ALB_CONTROLLER: &str = "manifests/alb-controller.yaml";
    /// 2048 deployment, service and ingress
    pub const ALB_2048: &str = "manifests/alb-2048.yaml";
    /// Perl pi job
    pub const JOB_PI: &str = "manifests/job-pi.yaml";
    /// Echo job
    pub const JOB_ECHO: &str = "manifests/job-echo.yaml";
    /// Echo cron job
    pub const CRONJOB_ECHO: &str = "manifests/cronjob-echo.yaml";
    /// IRSA service account and deployment
    pub const IRSA: &str = "manifests/irsa.yaml";
    /// Cluster autoscaler
    pub const CLUSTER_AUTOSCALER: &str = "manifests/cluster-autoscaler.yaml";
    /// Metrics server
    pub const METRICS_SERVER: &str = "manifests/metrics-server.yaml";
    /// Overprovisioning placeholder pods
    pub const OVERPROVISIONING: &str = "manifests/overprovisioning.yaml";
    /// NVIDIA device plugin
    pub const NVIDIA_DEVICE_PLUGIN: &str = "manifests/nvidia-device-plugin.yaml";
}

macro_rules! embedded {
    ($($name:expr),* $(,)?) => {
        &[$(($name, include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/templates/", $name)))),*]
    };
}

const EMBEDDED: &[(&str, &str)] = embedded![
    "cfn/role.yaml",
    "cfn/irsa-role.yaml",
    "cfn/vpc.yaml",
    "cfn/cluster.yaml",
    "cfn/node-security-group.yaml",
    "cfn/asg.yaml",
    "cfn/alb-policy.yaml",
    "manifests/kubernetes-dashboard.yaml",
    "manifests/nlb-hello-world.yaml",
    "manifests/alb-controller.yaml",
    "manifests/alb-2048.yaml",
    "manifests/job-pi.yaml",
    "manifests/job-echo.yaml",
    "manifests/cronjob-echo.yaml",
    "manifests/irsa.yaml",
    "manifests/cluster-autoscaler.yaml",
    "manifests/metrics-server.yaml",
    "manifests/overprovisioning.yaml",
    "manifests/nvidia-device-plugin.yaml",
];

/// Renders the embedded templates
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Engine with every embedded template registered
    ///
    /// # Panics
    ///
    /// Panics if an embedded template fails to parse. The templates are
    /// compiled into the binary and covered by tests.
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        for (name, source) in EMBEDDED {
            env.add_template(name, source)
                .expect("embedded templates are valid");
        }
        Self { env }
    }

    /// Render an embedded template by name
    pub fn render<S: Serialize>(&self, name: &str, ctx: S) -> Result<String> {
        let tmpl = self.env.get_template(name)?;
        Ok(tmpl.render(ctx)?)
    }

    /// Render an ad-hoc template string
    pub fn render_str<S: Serialize>(&self, source: &str, ctx: S) -> Result<String> {
        Ok(self.env.render_str(source, ctx)?)
    }
}

/// Render an embedded template with the process-wide engine
pub fn render<S: Serialize>(name: &str, ctx: S) -> Result<String> {
    static ENGINE: OnceLock<TemplateEngine> = OnceLock::new();
    ENGINE.get_or_init(TemplateEngine::new).render(name, ctx)
}

/// Raw source of an embedded template
pub fn source(name: &str) -> Option<&'static str> {
    EMBEDDED.iter().find(|(n, _)| *n == name).map(|(_, s)| *s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::context;

    #[test]
    fn every_embedded_template_parses() {
        let engine = TemplateEngine::new();
        for (name, _) in EMBEDDED {
            assert!(engine.env.get_template(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn templates_are_data_only() {
        for (name, source) in EMBEDDED {
            assert!(!source.contains("{%"), "{name} contains control flow");
        }
    }

    #[test]
    fn undefined_variables_are_errors() {
        let engine = TemplateEngine::new();
        let err = engine.render_str("name: {{ missing }}", context! {}).unwrap_err();
        assert!(err.to_string().contains("template"));
    }

    #[test]
    fn nlb_manifest_renders_namespace_and_replicas() {
        let out = render(
            manifests::NLB_HELLO_WORLD,
            context! { namespace => "test-001-nlb-hello-world", replicas => 3, cluster_name => "test-001" },
        )
        .unwrap();
        assert!(out.contains("namespace: test-001-nlb-hello-world"));
        assert!(out.contains("replicas: 3"));
        assert!(out.contains("aws-load-balancer-type: nlb"));
    }

    #[test]
    fn cloudformation_substitutions_survive_rendering() {
        let out = render(
            cfn::ROLE,
            context! { description => "test-001 cluster role" },
        )
        .unwrap();
        assert!(out.contains("${AWS::StackName}") || out.contains("!Ref RoleName"));
        assert!(out.contains("test-001 cluster role"));
    }
}
