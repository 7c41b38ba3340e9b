//! One target group and its registered targets.
//!
//! `ModifyTargetGroup` is only issued on a true health-check delta; the
//! API treats every write as a change and spurious writes reset health
//! state. Port, protocol and VPC are immutable on AWS, but they
//! participate in the derived name, so changing them yields a new target
//! group instead of a modify.

use alb_ingress_common::{Error, Result};
use tracing::debug;

use alb_ingress_aws::types::TargetGroupDesc;
use alb_ingress_common::Tags;

use super::targets::Targets;
use super::ReconcileCtx;

/// Default `deregistration_delay.timeout_seconds` applied after create.
pub const DEREGISTRATION_DELAY_SECONDS: u32 = 300;

/// One target group node.
#[derive(Clone, Debug, Default)]
pub struct TargetGroup {
    /// Backend service this group fronts; the rule lookup key
    pub service_name: String,
    /// Identity tags applied at create
    pub tags: Tags,
    /// Observed state
    pub current: Option<TargetGroupDesc>,
    /// Goal state
    pub desired: Option<TargetGroupDesc>,
    /// Registered backends
    pub targets: Targets,
    /// Set after a successful delete so the parent can prune this node
    pub deleted: bool,
}

impl TargetGroup {
    /// Build a desired target group (assembly path)
    pub fn new_desired(service_name: &str, desc: TargetGroupDesc, tags: Tags, targets: Targets) -> Self {
        Self {
            service_name: service_name.to_string(),
            tags,
            current: None,
            desired: Some(desc),
            targets,
            deleted: false,
        }
    }

    /// Wrap a target group observed on AWS (bootstrap path)
    pub fn new_observed(service_name: String, desc: TargetGroupDesc, targets: Targets) -> Self {
        Self {
            service_name,
            tags: Tags::new(),
            current: Some(desc),
            desired: None,
            targets,
            deleted: false,
        }
    }

    /// Stable name of this group, from whichever snapshot is present
    pub fn name(&self) -> Option<&str> {
        self.desired
            .as_ref()
            .or(self.current.as_ref())
            .map(|d| d.name.as_str())
    }

    /// Server-assigned ARN, available once created
    pub fn arn(&self) -> Option<String> {
        self.current.as_ref().and_then(|c| c.arn.clone())
    }

    /// Drop the desired state, turning the next pass into a delete
    pub fn strip_desired_state(&mut self) {
        self.desired = None;
        self.targets.strip_desired_state();
    }

    /// Drop the current state
    pub fn strip_current_state(&mut self) {
        self.current = None;
    }

    /// Structural diff on the health-check fields only; ARN and VPC are
    /// server- or assembly-assigned, port and protocol are name-bearing.
    pub fn needs_modification(&self) -> bool {
        match (&self.current, &self.desired) {
            (Some(current), Some(desired)) => current.health_check != desired.health_check,
            _ => true,
        }
    }

    /// Converge this target group, then its targets.
    pub async fn reconcile(&mut self, ctx: &ReconcileCtx<'_>) -> Result<()> {
        match (&self.current, &self.desired) {
            (None, None) => return Ok(()),
            (None, Some(_)) => self.create(ctx).await?,
            (Some(_), None) => {
                self.delete(ctx).await?;
                return Ok(());
            }
            (Some(_), Some(_)) => {
                if self.needs_modification() {
                    self.modify(ctx).await?;
                }
            }
        }

        let arn = self.arn().ok_or_else(|| {
            Error::internal_with_context("target-group", "reconciled group has no ARN")
        })?;
        self.targets.reconcile(ctx, &arn).await
    }

    async fn create(&mut self, ctx: &ReconcileCtx<'_>) -> Result<()> {
        let desired = self
            .desired
            .as_ref()
            .ok_or_else(|| Error::internal_with_context("target-group", "create without desired"))?;

        debug!(name = %desired.name, service = %self.service_name, "creating target group");
        let created = ctx.elb.create_target_group(desired, &self.tags).await?;
        let arn = created.arn.clone().ok_or_else(|| {
            Error::internal_with_context("target-group", "CreateTargetGroup returned no ARN")
        })?;
        ctx.elb
            .modify_target_group_attributes(&arn, DEREGISTRATION_DELAY_SECONDS)
            .await?;
        self.current = Some(created);
        Ok(())
    }

    async fn modify(&mut self, ctx: &ReconcileCtx<'_>) -> Result<()> {
        let desired = self
            .desired
            .as_ref()
            .ok_or_else(|| Error::internal_with_context("target-group", "modify without desired"))?;
        let arn = self.arn().ok_or_else(|| {
            Error::internal_with_context("target-group", "modify without current ARN")
        })?;

        debug!(name = %desired.name, "modifying target group health check");
        let modified = ctx.elb.modify_target_group(&arn, &desired.health_check).await?;
        self.current = Some(modified);
        Ok(())
    }

    /// Delete the group. May fail with `ResourceInUse` while listener
    /// rules still reference it; the load balancer retries once after
    /// listener reconciliation.
    pub(super) async fn delete(&mut self, ctx: &ReconcileCtx<'_>) -> Result<()> {
        let Some(arn) = self.arn() else {
            self.current = None;
            self.deleted = true;
            return Ok(());
        };

        debug!(arn = %arn, "deleting target group");
        ctx.elb.delete_target_group(&arn).await?;
        self.current = None;
        self.deleted = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeCloud;
    use alb_ingress_aws::types::{HealthCheck, Protocol, Target};
    use alb_ingress_common::AwsErrorKind;

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

    fn desired_desc(name: &str) -> TargetGroupDesc {
        TargetGroupDesc {
            arn: None,
            name: name.to_string(),
            protocol: Protocol::Http,
            port: 30080,
            vpc_id: "vpc-1".to_string(),
            health_check: health_check(),
        }
    }

    #[tokio::test]
    async fn create_sets_attributes_and_registers_targets() {
        let cloud = FakeCloud::new();
        let ctx = ReconcileCtx { elb: &cloud };

        let targets = Targets::from_desired([Target::new("i-aaa", 30080)].into());
        let mut tg = TargetGroup::new_desired("svc-a", desired_desc("cluster-svca"), Tags::new(), targets);

        tg.reconcile(&ctx).await.expect("create should succeed");

        assert_eq!(
            cloud.calls(),
            vec![
                "CreateTargetGroup",
                "ModifyTargetGroupAttributes",
                "RegisterTargets"
            ]
        );
        assert!(tg.arn().is_some());
    }

    #[tokio::test]
    async fn equal_health_check_issues_no_modify() {
        let cloud = FakeCloud::new();
        let ctx = ReconcileCtx { elb: &cloud };

        let mut tg = TargetGroup::new_desired(
            "svc-a",
            desired_desc("cluster-svca"),
            Tags::new(),
            Targets::default(),
        );
        let mut observed = desired_desc("cluster-svca");
        observed.arn = Some("arn:tg/a".to_string());
        tg.current = Some(observed);

        tg.reconcile(&ctx).await.expect("no-op should succeed");
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn health_check_delta_issues_one_modify() {
        let cloud = FakeCloud::new();
        let ctx = ReconcileCtx { elb: &cloud };

        let mut tg = TargetGroup::new_desired(
            "svc-a",
            desired_desc("cluster-svca"),
            Tags::new(),
            Targets::default(),
        );
        let mut observed = desired_desc("cluster-svca");
        observed.arn = Some("arn:tg/a".to_string());
        observed.health_check.path = "/old-healthz".to_string();
        tg.current = Some(observed);

        tg.reconcile(&ctx).await.expect("modify should succeed");
        assert_eq!(cloud.calls(), vec!["ModifyTargetGroup"]);
    }

    #[tokio::test]
    async fn stripped_desired_state_deletes_the_group() {
        let cloud = FakeCloud::new();
        let ctx = ReconcileCtx { elb: &cloud };

        let mut observed = desired_desc("cluster-svca");
        observed.arn = Some("arn:tg/a".to_string());
        let mut tg = TargetGroup::new_observed("svc-a".to_string(), observed, Targets::default());

        tg.reconcile(&ctx).await.expect("delete should succeed");
        assert_eq!(cloud.calls(), vec!["DeleteTargetGroup"]);
        assert!(tg.deleted);
        assert!(tg.current.is_none());
    }

    #[tokio::test]
    async fn failed_create_leaves_no_current_state() {
        let cloud = FakeCloud::new();
        cloud.fail_next("CreateTargetGroup", AwsErrorKind::Conflict);
        let ctx = ReconcileCtx { elb: &cloud };

        let mut tg = TargetGroup::new_desired(
            "svc-a",
            desired_desc("cluster-svca"),
            Tags::new(),
            Targets::default(),
        );

        let err = tg.reconcile(&ctx).await.expect_err("injected failure must propagate");
        assert!(err.is_conflict());
        assert!(tg.current.is_none());
    }
}
