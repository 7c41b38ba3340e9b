//! The load balancer root node.
//!
//! Creation order: the load balancer itself, then target groups (listener
//! default actions and rules resolve target group ARNs), then listeners.
//! Deletion runs in reverse: rules, listeners, the load balancer, then
//! target groups. A target group delete rejected with `ResourceInUse` is
//! retried once after listener reconciliation has finished.

use alb_ingress_common::{Error, Result};
use tracing::{debug, info};

use alb_ingress_aws::types::LoadBalancerDesc;

use super::listener::Listener;
use super::target_group::TargetGroup;
use super::ReconcileCtx;

/// One load balancer tree, keyed by its deterministic name.
#[derive(Clone, Debug, Default)]
pub struct LoadBalancer {
    /// Deterministic name derived from `{cluster, namespace, ingress}`;
    /// the join key between desired and observed state
    pub name: String,
    /// `{namespace}/{name}` of the owning Ingress
    pub ingress_key: String,
    /// Observed state
    pub current: Option<LoadBalancerDesc>,
    /// Goal state
    pub desired: Option<LoadBalancerDesc>,
    /// Listener children
    pub listeners: Vec<Listener>,
    /// Target group children
    pub target_groups: Vec<TargetGroup>,
    /// Managed security group name, when the controller owns the pair
    pub managed_sg: Option<String>,
    /// Set once the whole tree is gone
    pub deleted: bool,
}

impl LoadBalancer {
    /// Server-assigned ARN, available once created
    pub fn arn(&self) -> Option<String> {
        self.current.as_ref().and_then(|c| c.arn.clone())
    }

    /// DNS name assigned by AWS, available once created
    pub fn dns_name(&self) -> Option<String> {
        self.current.as_ref().and_then(|c| c.dns_name.clone())
    }

    /// Ports of all desired listeners, for the security group port set
    pub fn desired_listener_ports(&self) -> std::collections::BTreeSet<i32> {
        self.listeners
            .iter()
            .filter_map(|l| l.desired.as_ref().map(|d| d.port))
            .collect()
    }

    /// Drop the desired state recursively, turning the next pass into a
    /// full teardown
    pub fn strip_desired_state(&mut self) {
        self.desired = None;
        for listener in &mut self.listeners {
            listener.strip_desired_state();
        }
        for tg in &mut self.target_groups {
            tg.strip_desired_state();
        }
    }

    /// Drop the current state recursively, disowning the cloud resources
    /// without deleting them
    pub fn strip_current_state(&mut self) {
        self.current = None;
        for listener in &mut self.listeners {
            listener.strip_current_state();
        }
        for tg in &mut self.target_groups {
            tg.strip_current_state();
        }
    }

    /// Merge a freshly assembled desired tree into this (observed) tree.
    ///
    /// Children are matched on stable identity: listeners by port, rules
    /// by priority, target groups by name. Children absent from the fresh
    /// tree get their desired state stripped so the next pass deletes
    /// them.
    pub fn merge_desired(&mut self, fresh: LoadBalancer) {
        self.desired = fresh.desired;
        self.managed_sg = fresh.managed_sg;
        self.ingress_key = fresh.ingress_key;

        // Target groups by name
        let fresh_tg_names: Vec<String> = fresh
            .target_groups
            .iter()
            .filter_map(|t| t.name().map(String::from))
            .collect();
        for ftg in fresh.target_groups {
            match self
                .target_groups
                .iter_mut()
                .find(|t| t.name() == ftg.name())
            {
                Some(existing) => {
                    existing.desired = ftg.desired;
                    existing.tags = ftg.tags;
                    existing.service_name = ftg.service_name;
                    existing.targets.set_desired(ftg.targets.desired);
                }
                None => self.target_groups.push(ftg),
            }
        }
        for tg in &mut self.target_groups {
            if !tg.name().is_some_and(|n| fresh_tg_names.iter().any(|f| f == n)) {
                tg.strip_desired_state();
            }
        }

        // Listeners by port
        let fresh_ports: Vec<i32> = fresh.listeners.iter().filter_map(Listener::port).collect();
        for flistener in fresh.listeners {
            match self
                .listeners
                .iter_mut()
                .find(|l| l.port() == flistener.port())
            {
                Some(existing) => {
                    existing.desired = flistener.desired;
                    existing.default_service = flistener.default_service;
                    merge_rules(existing, flistener.rules);
                }
                None => self.listeners.push(flistener),
            }
        }
        for listener in &mut self.listeners {
            if !listener.port().is_some_and(|p| fresh_ports.contains(&p)) {
                listener.strip_desired_state();
            }
        }
    }

    /// Structural diff ignoring ARN and DNS name.
    pub fn needs_modification(&self) -> bool {
        match (&self.current, &self.desired) {
            (Some(current), Some(desired)) => {
                current.scheme != desired.scheme
                    || current.subnets != desired.subnets
                    || current.security_groups != desired.security_groups
                    || current.tags != desired.tags
            }
            _ => true,
        }
    }

    /// Converge the whole tree.
    pub async fn reconcile(&mut self, ctx: &ReconcileCtx<'_>) -> Result<()> {
        match (&self.current, &self.desired) {
            (None, None) => return Ok(()),
            (Some(_), None) => return self.delete_tree(ctx).await,
            (None, Some(_)) => self.create(ctx).await?,
            (Some(_), Some(_)) => {
                if self.needs_modification() {
                    self.modify(ctx).await?;
                }
            }
        }
        self.reconcile_children(ctx).await
    }

    async fn create(&mut self, ctx: &ReconcileCtx<'_>) -> Result<()> {
        let desired = self
            .desired
            .as_ref()
            .ok_or_else(|| Error::internal_with_context("load-balancer", "create without desired"))?;

        info!(name = %self.name, scheme = %desired.scheme, "creating load balancer");
        let created = ctx.elb.create_load_balancer(desired).await?;
        self.current = Some(created);
        Ok(())
    }

    async fn modify(&mut self, ctx: &ReconcileCtx<'_>) -> Result<()> {
        let (Some(current), Some(desired)) = (&self.current, &self.desired) else {
            return Err(Error::internal_with_context(
                "load-balancer",
                "modify without both snapshots",
            ));
        };

        if current.scheme != desired.scheme {
            return Err(Error::validation_for(
                &self.ingress_key,
                format!(
                    "load balancer scheme cannot change from {} to {}; delete and recreate the Ingress",
                    current.scheme, desired.scheme
                ),
            ));
        }

        let arn = self
            .arn()
            .ok_or_else(|| Error::internal_with_context("load-balancer", "modify without ARN"))?;

        if current.subnets != desired.subnets {
            debug!(name = %self.name, "updating load balancer subnets");
            ctx.elb.set_subnets(&arn, &desired.subnets).await?;
        }
        if current.security_groups != desired.security_groups {
            debug!(name = %self.name, "updating load balancer security groups");
            ctx.elb
                .set_security_groups(&arn, &desired.security_groups)
                .await?;
        }
        if current.tags != desired.tags {
            let (to_add, to_remove) = current.tags.diff(&desired.tags);
            if !to_add.is_empty() {
                ctx.elb.add_tags(&arn, &to_add).await?;
            }
            if !to_remove.is_empty() {
                ctx.elb.remove_tags(&arn, &to_remove).await?;
            }
        }

        let mut updated = desired.clone();
        updated.arn = current.arn.clone();
        updated.dns_name = current.dns_name.clone();
        self.current = Some(updated);
        Ok(())
    }

    async fn reconcile_children(&mut self, ctx: &ReconcileCtx<'_>) -> Result<()> {
        let lb_arn = self.arn().ok_or_else(|| {
            Error::internal_with_context("load-balancer", "reconciled load balancer has no ARN")
        })?;

        let mut errors = Vec::new();

        // Target groups first: listeners and rules read their ARNs.
        // Deletions rejected with ResourceInUse wait for the listeners.
        let mut conflicted: Vec<usize> = Vec::new();
        for (i, tg) in self.target_groups.iter_mut().enumerate() {
            if let Err(e) = tg.reconcile(ctx).await {
                if e.is_conflict() && tg.desired.is_none() {
                    conflicted.push(i);
                } else {
                    errors.push(e);
                }
            }
        }

        for listener in &mut self.listeners {
            if let Err(e) = listener.reconcile(ctx, &lb_arn, &self.target_groups).await {
                errors.push(e);
            }
        }

        for i in conflicted {
            if let Err(e) = self.target_groups[i].reconcile(ctx).await {
                errors.push(e);
            }
        }

        self.listeners
            .retain(|l| !l.deleted && (l.current.is_some() || l.desired.is_some()));
        self.target_groups
            .retain(|t| !t.deleted && (t.current.is_some() || t.desired.is_some()));
        Error::composite(errors)
    }

    /// Tear the tree down: rules and listeners, the load balancer, then
    /// target groups.
    async fn delete_tree(&mut self, ctx: &ReconcileCtx<'_>) -> Result<()> {
        info!(name = %self.name, ingress = %self.ingress_key, "deleting load balancer tree");

        let mut errors = Vec::new();
        for listener in &mut self.listeners {
            listener.strip_desired_state();
            if let Err(e) = listener.reconcile(ctx, "", &[]).await {
                errors.push(e);
            }
        }
        self.listeners.retain(|l| l.current.is_some());
        // The load balancer must not go while listeners remain
        Error::composite(errors)?;

        if let Some(arn) = self.arn() {
            ctx.elb.delete_load_balancer(&arn).await?;
        }
        self.current = None;

        let mut errors = Vec::new();
        for tg in &mut self.target_groups {
            tg.strip_desired_state();
            let result = match tg.reconcile(ctx).await {
                Err(e) if e.is_conflict() => tg.reconcile(ctx).await,
                other => other,
            };
            if let Err(e) = result {
                errors.push(e);
            }
        }
        self.target_groups.retain(|t| t.current.is_some());
        Error::composite(errors)?;

        self.deleted = true;
        Ok(())
    }
}

fn merge_rules(listener: &mut Listener, fresh_rules: Vec<super::rule::Rule>) {
    let fresh_priorities: Vec<_> = fresh_rules.iter().filter_map(|r| r.priority()).collect();
    for frule in fresh_rules {
        match listener
            .rules
            .iter_mut()
            .find(|r| r.priority() == frule.priority())
        {
            Some(existing) => {
                existing.desired = frule.desired;
                existing.service_name = frule.service_name;
            }
            None => listener.rules.push(frule),
        }
    }
    for rule in &mut listener.rules {
        if !rule.priority().is_some_and(|p| fresh_priorities.contains(&p)) {
            rule.strip_desired_state();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alb::rule::Rule;
    use crate::alb::targets::Targets;
    use crate::fake::FakeCloud;
    use alb_ingress_aws::types::{
        HealthCheck, ListenerDesc, Protocol, Scheme, Target, TargetGroupDesc,
    };
    use alb_ingress_common::{AwsErrorKind, Tags};

    fn health_check() -> HealthCheck {
        HealthCheck {
            path: "/".to_string(),
            interval_seconds: 15,
            timeout_seconds: 5,
            healthy_threshold: 2,
            unhealthy_threshold: 2,
            protocol: Protocol::Http,
            port: "traffic-port".to_string(),
        }
    }

    fn desired_tree() -> LoadBalancer {
        let tg_desc = TargetGroupDesc {
            arn: None,
            name: "cluster-svca-abc1234".to_string(),
            protocol: Protocol::Http,
            port: 30080,
            vpc_id: "vpc-1".to_string(),
            health_check: health_check(),
        };
        let targets = Targets::from_desired([Target::new("i-aaa", 30080)].into());
        let tg = TargetGroup::new_desired("svc-a", tg_desc, Tags::new(), targets);

        let rules = vec![Rule::new_desired(
            1,
            Some("foo.example.com"),
            Some("/"),
            "svc-a",
        )];
        let listener = Listener::new_desired(
            ListenerDesc {
                arn: None,
                port: 80,
                protocol: Protocol::Http,
                certificate_arn: None,
                ssl_policy: None,
                default_target_group_arn: None,
            },
            "svc-a",
            rules,
        );

        let mut tags = Tags::new();
        tags.insert("kubernetes.io/cluster/cluster", "owned");
        tags.insert("kubernetes.io/ingress-name", "default/web");

        LoadBalancer {
            name: "cluster-default-web-abc1234".to_string(),
            ingress_key: "default/web".to_string(),
            current: None,
            desired: Some(LoadBalancerDesc {
                name: "cluster-default-web-abc1234".to_string(),
                arn: None,
                dns_name: None,
                scheme: Scheme::InternetFacing,
                subnets: vec!["subnet-a".to_string(), "subnet-b".to_string()],
                security_groups: vec!["sg-alb".to_string()],
                tags,
            }),
            listeners: vec![listener],
            target_groups: vec![tg],
            managed_sg: None,
            deleted: false,
        }
    }

    #[tokio::test]
    async fn create_from_empty_orders_lb_then_tgs_then_listeners() {
        let cloud = FakeCloud::new();
        let ctx = ReconcileCtx { elb: &cloud };

        let mut lb = desired_tree();
        lb.reconcile(&ctx).await.expect("create should succeed");

        assert_eq!(
            cloud.calls(),
            vec![
                "CreateLoadBalancer",
                "CreateTargetGroup",
                "ModifyTargetGroupAttributes",
                "RegisterTargets",
                "CreateListener",
                "CreateRule",
            ]
        );
        assert!(lb.arn().is_some());
        assert!(lb.dns_name().is_some());
    }

    #[tokio::test]
    async fn second_pass_is_a_no_op() {
        let cloud = FakeCloud::new();
        let ctx = ReconcileCtx { elb: &cloud };

        let mut lb = desired_tree();
        lb.reconcile(&ctx).await.expect("first pass should succeed");
        let first_pass = cloud.calls().len();

        lb.reconcile(&ctx).await.expect("second pass should succeed");
        assert_eq!(
            cloud.calls().len(),
            first_pass,
            "an unchanged tree must not issue any further mutations"
        );
    }

    #[tokio::test]
    async fn scheme_change_is_fatal() {
        let cloud = FakeCloud::new();
        let ctx = ReconcileCtx { elb: &cloud };

        let mut lb = desired_tree();
        lb.reconcile(&ctx).await.expect("create should succeed");

        lb.desired.as_mut().expect("desired is set").scheme = Scheme::Internal;
        let err = lb
            .reconcile(&ctx)
            .await
            .expect_err("scheme change must fail validation");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("scheme"));
    }

    #[tokio::test]
    async fn subnet_change_issues_set_subnets() {
        let cloud = FakeCloud::new();
        let ctx = ReconcileCtx { elb: &cloud };

        let mut lb = desired_tree();
        lb.reconcile(&ctx).await.expect("create should succeed");
        cloud.clear_calls();

        lb.desired.as_mut().expect("desired is set").subnets =
            vec!["subnet-a".to_string(), "subnet-c".to_string()];
        lb.reconcile(&ctx).await.expect("modify should succeed");

        assert_eq!(cloud.calls(), vec!["SetSubnets"]);
    }

    #[tokio::test]
    async fn tag_change_issues_add_and_remove() {
        let cloud = FakeCloud::new();
        let ctx = ReconcileCtx { elb: &cloud };

        let mut lb = desired_tree();
        lb.reconcile(&ctx).await.expect("create should succeed");
        cloud.clear_calls();

        let desired = lb.desired.as_mut().expect("desired is set");
        let mut tags = Tags::new();
        tags.insert("kubernetes.io/cluster/cluster", "owned");
        tags.insert("kubernetes.io/ingress-name", "default/web");
        tags.insert("team", "payments");
        desired.tags = tags;

        lb.reconcile(&ctx).await.expect("modify should succeed");
        assert_eq!(cloud.calls(), vec!["AddTags"]);
    }

    #[tokio::test]
    async fn deletion_runs_child_before_parent() {
        let cloud = FakeCloud::new();
        let ctx = ReconcileCtx { elb: &cloud };

        let mut lb = desired_tree();
        lb.reconcile(&ctx).await.expect("create should succeed");
        cloud.clear_calls();

        lb.strip_desired_state();
        lb.reconcile(&ctx).await.expect("delete should succeed");

        assert_eq!(
            cloud.calls(),
            vec![
                "DeleteRule",
                "DeleteListener",
                "DeleteLoadBalancer",
                "DeleteTargetGroup",
            ]
        );
        assert!(lb.deleted);
        assert!(lb.listeners.is_empty());
        assert!(lb.target_groups.is_empty());
    }

    #[tokio::test]
    async fn failed_create_records_no_current_state() {
        let cloud = FakeCloud::new();
        cloud.fail_next("CreateLoadBalancer", AwsErrorKind::Server);
        let ctx = ReconcileCtx { elb: &cloud };

        let mut lb = desired_tree();
        let err = lb
            .reconcile(&ctx)
            .await
            .expect_err("injected failure must propagate");
        assert!(err.is_retryable());
        assert!(lb.current.is_none());

        // Retrying the pass converges
        lb.reconcile(&ctx).await.expect("retry should succeed");
        assert!(lb.arn().is_some());
    }

    #[tokio::test]
    async fn parent_failure_skips_children() {
        let cloud = FakeCloud::new();
        cloud.fail_next("CreateLoadBalancer", AwsErrorKind::Server);
        let ctx = ReconcileCtx { elb: &cloud };

        let mut lb = desired_tree();
        lb.reconcile(&ctx).await.expect_err("create must fail");

        assert_eq!(
            cloud.calls(),
            vec!["CreateLoadBalancer"],
            "children of a failed parent must not be attempted"
        );
    }

    #[tokio::test]
    async fn merge_strips_children_absent_from_fresh_tree() {
        let cloud = FakeCloud::new();
        let ctx = ReconcileCtx { elb: &cloud };

        let mut lb = desired_tree();
        lb.reconcile(&ctx).await.expect("create should succeed");
        cloud.clear_calls();

        // Fresh tree without the rule at priority 1
        let mut fresh = desired_tree();
        fresh.listeners[0].rules.clear();
        lb.merge_desired(fresh);

        lb.reconcile(&ctx).await.expect("reconcile should succeed");
        assert_eq!(cloud.calls(), vec!["DeleteRule"]);
        assert!(lb.listeners[0].rules.is_empty());
    }

    #[tokio::test]
    async fn merge_keeps_current_and_replaces_desired() {
        let cloud = FakeCloud::new();
        let ctx = ReconcileCtx { elb: &cloud };

        let mut lb = desired_tree();
        lb.reconcile(&ctx).await.expect("create should succeed");
        let arn = lb.arn().expect("arn assigned");
        cloud.clear_calls();

        let fresh = desired_tree();
        lb.merge_desired(fresh);

        assert_eq!(lb.arn().as_deref(), Some(arn.as_str()), "merge must keep current");
        lb.reconcile(&ctx).await.expect("reconcile should succeed");
        assert!(cloud.calls().is_empty(), "unchanged desired state is a no-op");
    }
}
