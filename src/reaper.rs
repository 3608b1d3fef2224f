//! Load balancer reaper.
//!
//! The in-cluster cloud controller creates load balancers out of band for
//! `LoadBalancer` Services and ALB Ingresses. Deleting the Kubernetes objects
//! does not reliably remove them, and a leftover balancer keeps ENIs in the
//! VPC so the VPC stack cannot be deleted. The reaper finds balancers by ARN
//! or by VPC plus an exact tag set and deletes them.
//!
//! Deletion first tries the dependency order (rules, listeners, target
//! groups, balancer). When that fails it deletes the balancer first and
//! lets the provider cascade, then cleans up target groups.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::provider::{LoadBalancerApi, ProviderError, ProviderResult};
use crate::retry::{retry_if, RetryConfig};
use crate::Result;

const DESCRIBE_TAGS_BATCH: usize = 20;

/// Which balancers to reap
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReapTarget {
    /// One balancer by ARN
    Arn(String),
    /// Every balancer in `vpc_id` carrying all of `tags`
    Tagged {
        /// VPC to search
        vpc_id: String,
        /// Required tag set
        tags: BTreeMap<String, String>,
    },
}

impl ReapTarget {
    /// ARN when known, otherwise the tag search
    pub fn new(arn: &str, vpc_id: &str, tags: BTreeMap<String, String>) -> Self {
        if arn.is_empty() {
            Self::Tagged {
                vpc_id: vpc_id.to_string(),
                tags,
            }
        } else {
            Self::Arn(arn.to_string())
        }
    }
}

/// Deletes load balancers left behind by the cloud controller
#[derive(Clone)]
pub struct Reaper {
    elb: Arc<dyn LoadBalancerApi>,
    retry: RetryConfig,
}

impl Reaper {
    /// Reaper using `elb`
    pub fn new(elb: Arc<dyn LoadBalancerApi>) -> Self {
        Self {
            elb,
            retry: RetryConfig::with_max_attempts(5),
        }
    }

    /// Delete every balancer matching `target`; returns the deleted ARNs
    pub async fn reap(&self, target: &ReapTarget) -> Result<Vec<String>> {
        let arns = match target {
            ReapTarget::Arn(arn) => vec![arn.clone()],
            ReapTarget::Tagged { vpc_id, tags } => self.find(vpc_id, tags).await?,
        };
        if arns.is_empty() {
            info!(target = ?target, "no load balancer to reap");
            return Ok(arns);
        }
        for arn in &arns {
            self.delete(arn).await?;
        }
        Ok(arns)
    }

    /// ARNs of balancers in `vpc_id` whose tags contain every entry of `want`
    pub async fn find(&self, vpc_id: &str, want: &BTreeMap<String, String>) -> Result<Vec<String>> {
        let mut in_vpc = Vec::new();
        let mut marker = None;
        loop {
            let page = self
                .call("describe_load_balancers", || self.elb.describe_load_balancers(marker.clone()))
                .await?;
            in_vpc.extend(
                page.load_balancers
                    .into_iter()
                    .filter(|lb| lb.vpc_id == vpc_id)
                    .map(|lb| lb.arn),
            );
            match page.next_marker {
                Some(m) if !m.is_empty() => marker = Some(m),
                _ => break,
            }
        }

        let mut matched = Vec::new();
        for batch in in_vpc.chunks(DESCRIBE_TAGS_BATCH) {
            let tags = self.call("describe_tags", || self.elb.describe_tags(batch)).await?;
            for arn in batch {
                let have = tags.get(arn);
                if want
                    .iter()
                    .all(|(k, v)| have.and_then(|t| t.get(k)) == Some(v))
                {
                    debug!(arn = %arn, "load balancer matches tag set");
                    matched.push(arn.clone());
                }
            }
        }
        info!(vpc_id = %vpc_id, scanned = in_vpc.len(), matched = matched.len(), "searched load balancers");
        Ok(matched)
    }

    /// Delete one balancer. A balancer that no longer exists counts as deleted.
    pub async fn delete(&self, arn: &str) -> Result<()> {
        match self.delete_ordered(arn).await {
            Ok(()) => {
                info!(arn = %arn, "deleted load balancer");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                warn!(arn = %arn, error = %e, "ordered delete failed, deleting balancer first");
                self.delete_reverse(arn).await?;
                info!(arn = %arn, "deleted load balancer");
                Ok(())
            }
        }
    }

    async fn delete_ordered(&self, arn: &str) -> ProviderResult<()> {
        let listeners = self.call("describe_listeners", || self.elb.describe_listeners(arn)).await?;
        for listener in &listeners {
            let rules = self.call("describe_rules", || self.elb.describe_rules(listener)).await?;
            for rule in rules.iter().filter(|r| !r.is_default) {
                ignore_not_found(self.call("delete_rule", || self.elb.delete_rule(&rule.arn)).await)?;
            }
            ignore_not_found(self.call("delete_listener", || self.elb.delete_listener(listener)).await)?;
        }
        let groups = self
            .call("describe_target_groups", || self.elb.describe_target_groups(arn))
            .await?;
        for tg in &groups {
            ignore_not_found(self.call("delete_target_group", || self.elb.delete_target_group(tg)).await)?;
        }
        self.call("delete_load_balancer", || self.elb.delete_load_balancer(arn))
            .await
    }

    async fn delete_reverse(&self, arn: &str) -> ProviderResult<()> {
        let groups = match self.elb.describe_target_groups(arn).await {
            Ok(groups) => groups,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        ignore_not_found(
            self.call("delete_load_balancer", || self.elb.delete_load_balancer(arn))
                .await,
        )?;
        for tg in &groups {
            if let Err(e) =
                ignore_not_found(self.call("delete_target_group", || self.elb.delete_target_group(tg)).await)
            {
                warn!(target_group = %tg, error = %e, "failed to delete target group");
            }
        }
        Ok(())
    }

    async fn call<T, F, Fut>(&self, name: &str, op: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ProviderResult<T>>,
    {
        retry_if(&self.retry, name, op, ProviderError::is_transient).await
    }
}

fn ignore_not_found(res: ProviderResult<()>) -> ProviderResult<()> {
    match res {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Tag set the ALB ingress controller puts on balancers of one namespace
pub fn alb_tags(cluster_name: &str, namespace: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (format!("kubernetes.io/cluster/{cluster_name}"), "owned".to_string()),
        ("kubernetes.io/namespace".to_string(), namespace.to_string()),
    ])
}

/// Tag set the cloud controller puts on the balancer of one Service
pub fn service_tags(cluster_name: &str, namespace: &str, service: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (format!("kubernetes.io/cluster/{cluster_name}"), "owned".to_string()),
        ("kubernetes.io/service-name".to_string(), format!("{namespace}/{service}")),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        ListenerRule, LoadBalancer, LoadBalancerPage, MockLoadBalancerApi, ProviderErrorKind,
    };

    fn lb(arn: &str, vpc: &str) -> LoadBalancer {
        LoadBalancer {
            arn: arn.into(),
            name: arn.rsplit('/').next().unwrap_or_default().into(),
            vpc_id: vpc.into(),
            dns_name: String::new(),
        }
    }

    fn not_found() -> ProviderError {
        ProviderError::new("elbv2", "DeleteLoadBalancer", ProviderErrorKind::NotFound, "LoadBalancerNotFound")
    }

    // =========================================================================
    // Story: only the balancer carrying the full tag set is deleted
    // =========================================================================

    /// Story: three balancers in the VPC, one tagged for the namespace
    #[tokio::test]
    async fn story_tag_match_deletes_exactly_one() {
        let mut elb = MockLoadBalancerApi::new();
        elb.expect_describe_load_balancers().returning(|marker| {
            Ok(match marker.as_deref() {
                None => LoadBalancerPage {
                    load_balancers: vec![lb("arn:lb/a", "vpc-1"), lb("arn:lb/b", "vpc-1")],
                    next_marker: Some("page-2".into()),
                },
                Some(_) => LoadBalancerPage {
                    load_balancers: vec![lb("arn:lb/c", "vpc-1"), lb("arn:lb/other", "vpc-2")],
                    next_marker: None,
                },
            })
        });
        elb.expect_describe_tags().returning(|arns| {
            assert_eq!(arns.len(), 3, "other VPCs are filtered before tag lookup");
            let mut out = BTreeMap::new();
            out.insert("arn:lb/a".to_string(), alb_tags("test-001", "test-001-alb-2048"));
            out.insert(
                "arn:lb/b".to_string(),
                BTreeMap::from([("kubernetes.io/cluster/test-001".to_string(), "owned".to_string())]),
            );
            out.insert("arn:lb/c".to_string(), alb_tags("test-001", "default"));
            Ok(out)
        });
        elb.expect_describe_listeners()
            .withf(|a| a == "arn:lb/a")
            .returning(|_| Ok(vec!["arn:listener/1".into()]));
        elb.expect_describe_rules().returning(|_| {
            Ok(vec![
                ListenerRule {
                    arn: "arn:rule/default".into(),
                    is_default: true,
                },
                ListenerRule {
                    arn: "arn:rule/1".into(),
                    is_default: false,
                },
            ])
        });
        elb.expect_delete_rule().withf(|a| a == "arn:rule/1").times(1).returning(|_| Ok(()));
        elb.expect_delete_listener().times(1).returning(|_| Ok(()));
        elb.expect_describe_target_groups()
            .returning(|_| Ok(vec!["arn:tg/1".into()]));
        elb.expect_delete_target_group().times(1).returning(|_| Ok(()));
        elb.expect_delete_load_balancer()
            .withf(|a| a == "arn:lb/a")
            .times(1)
            .returning(|_| Ok(()));

        let reaper = Reaper::new(Arc::new(elb));
        let target = ReapTarget::new("", "vpc-1", alb_tags("test-001", "test-001-alb-2048"));
        let deleted = reaper.reap(&target).await.unwrap();
        assert_eq!(deleted, vec!["arn:lb/a".to_string()]);
    }

    /// Story: two matches are both deleted
    #[tokio::test]
    async fn story_two_matches_both_deleted() {
        let mut elb = MockLoadBalancerApi::new();
        elb.expect_describe_load_balancers().returning(|_| {
            Ok(LoadBalancerPage {
                load_balancers: vec![lb("arn:lb/a", "vpc-1"), lb("arn:lb/b", "vpc-1")],
                next_marker: None,
            })
        });
        let tags = service_tags("test-001", "ns", "svc");
        let t = tags.clone();
        elb.expect_describe_tags().returning(move |arns| {
            Ok(arns.iter().map(|a| (a.clone(), t.clone())).collect())
        });
        elb.expect_describe_listeners().returning(|_| Ok(vec![]));
        elb.expect_describe_target_groups().returning(|_| Ok(vec![]));
        elb.expect_delete_load_balancer().times(2).returning(|_| Ok(()));

        let reaper = Reaper::new(Arc::new(elb));
        let deleted = reaper.reap(&ReapTarget::new("", "vpc-1", tags)).await.unwrap();
        assert_eq!(deleted.len(), 2);
    }

    /// Story: when listener cleanup fails the balancer is deleted first
    #[tokio::test]
    async fn story_ordered_failure_falls_back_to_reverse() {
        let mut elb = MockLoadBalancerApi::new();
        elb.expect_describe_listeners().returning(|_| {
            Err(ProviderError::new("elbv2", "DescribeListeners", ProviderErrorKind::Other, "AccessDenied"))
        });
        elb.expect_describe_target_groups()
            .returning(|_| Ok(vec!["arn:tg/1".into()]));
        elb.expect_delete_load_balancer().times(1).returning(|_| Ok(()));
        elb.expect_delete_target_group().times(1).returning(|_| Ok(()));

        let reaper = Reaper::new(Arc::new(elb));
        reaper.delete("arn:lb/a").await.unwrap();
    }

    #[tokio::test]
    async fn missing_balancer_counts_as_deleted() {
        let mut elb = MockLoadBalancerApi::new();
        elb.expect_describe_listeners().returning(|_| Ok(vec![]));
        elb.expect_describe_target_groups().returning(|_| Ok(vec![]));
        elb.expect_delete_load_balancer().returning(|_| Err(not_found()));

        let reaper = Reaper::new(Arc::new(elb));
        reaper.reap(&ReapTarget::Arn("arn:lb/gone".into())).await.unwrap();
    }

    #[tokio::test]
    async fn no_match_is_not_an_error() {
        let mut elb = MockLoadBalancerApi::new();
        elb.expect_describe_load_balancers()
            .returning(|_| Ok(LoadBalancerPage::default()));
        let reaper = Reaper::new(Arc::new(elb));
        let deleted = reaper
            .reap(&ReapTarget::new("", "vpc-1", alb_tags("test-001", "x")))
            .await
            .unwrap();
        assert!(deleted.is_empty());
    }
}
