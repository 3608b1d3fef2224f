//! Load balancer reaper against an in-memory cloud.

mod common;

use std::collections::BTreeMap;

use eks_harness::reaper::{alb_tags, ReapTarget, Reaper};

use common::{FakeCloud, VPC};

/// Story: the ingress controller left two balancers behind. Only the one in
/// our VPC with our tags is deleted, child objects before the balancer, and
/// the default rule is never touched.
#[tokio::test]
async fn story_tagged_reap_deletes_in_dependency_order() {
    let cloud = FakeCloud::new();
    let ours = cloud.seed_balancer(
        "k8s-test001-2048",
        VPC,
        &[
            ("kubernetes.io/cluster/test-001", "owned"),
            ("kubernetes.io/namespace", "test-001-alb-2048"),
            ("ingress.k8s.aws/stack", "test-001-alb-2048/alb-2048-ingress"),
        ],
    );
    cloud.seed_balancer("k8s-other-vpc", "vpc-9999", &[
        ("kubernetes.io/cluster/test-001", "owned"),
        ("kubernetes.io/namespace", "test-001-alb-2048"),
    ]);
    cloud.seed_balancer("k8s-other-ns", VPC, &[
        ("kubernetes.io/cluster/test-001", "owned"),
        ("kubernetes.io/namespace", "default"),
    ]);

    let reaper = Reaper::new(cloud.providers().elb);
    let deleted = reaper
        .reap(&ReapTarget::new("", VPC, alb_tags("test-001", "test-001-alb-2048")))
        .await
        .unwrap();

    assert_eq!(deleted, vec![ours.clone()]);
    let listener = format!("{ours}/listener-1");
    assert_eq!(
        cloud.mutations(),
        vec![
            format!("delete_rule {listener}/rule-1"),
            format!("delete_listener {listener}"),
            format!("delete_target_group {ours}/tg-1"),
            format!("delete_load_balancer {ours}"),
        ]
    );
    assert_eq!(cloud.balancer_names(), vec!["k8s-other-vpc", "k8s-other-ns"]);
}

/// Story: a balancer that was already removed is not an error
#[tokio::test]
async fn story_reaping_a_missing_balancer_succeeds() {
    let cloud = FakeCloud::new();
    let reaper = Reaper::new(cloud.providers().elb);
    let arn = "arn:aws:elasticloadbalancing:us-west-2:123456789012:loadbalancer/net/gone/0001";

    let deleted = reaper
        .reap(&ReapTarget::new(arn, VPC, BTreeMap::new()))
        .await
        .unwrap();
    assert_eq!(deleted, vec![arn.to_string()]);
    assert!(cloud.mutations().is_empty());
}

/// Story: nothing tagged for us means nothing is deleted
#[tokio::test]
async fn story_no_match_deletes_nothing() {
    let cloud = FakeCloud::new();
    cloud.seed_balancer("unrelated", VPC, &[("team", "payments")]);
    let reaper = Reaper::new(cloud.providers().elb);

    let deleted = reaper
        .reap(&ReapTarget::new("", VPC, alb_tags("test-001", "test-001-alb-2048")))
        .await
        .unwrap();
    assert!(deleted.is_empty());
    assert!(cloud.mutations().is_empty());
    assert_eq!(cloud.balancer_names(), vec!["unrelated"]);
}
