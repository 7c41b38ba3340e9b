//! One port/protocol endpoint on the load balancer.
//!
//! A listener reconciles itself first so its rules can read the listener
//! ARN; on deletion the order flips and rules go first. Rules are leaf
//! siblings: one failing rule does not stop the others, and the errors
//! are accumulated into a composite.

use alb_ingress_common::{Error, Result};
use tracing::debug;

use alb_ingress_aws::types::ListenerDesc;

use super::rule::Rule;
use super::target_group::TargetGroup;
use super::ReconcileCtx;

/// One listener node.
#[derive(Clone, Debug, Default)]
pub struct Listener {
    /// Backend service of the default forward action; resolved to a
    /// target group ARN at reconcile time
    pub default_service: String,
    /// Observed state
    pub current: Option<ListenerDesc>,
    /// Goal state
    pub desired: Option<ListenerDesc>,
    /// Routing rules, priority order
    pub rules: Vec<Rule>,
    /// Set after a successful delete so the parent can prune this node
    pub deleted: bool,
}

impl Listener {
    /// Build a desired listener (assembly path)
    pub fn new_desired(desc: ListenerDesc, default_service: &str, rules: Vec<Rule>) -> Self {
        Self {
            default_service: default_service.to_string(),
            current: None,
            desired: Some(desc),
            rules,
            deleted: false,
        }
    }

    /// Wrap a listener observed on AWS (bootstrap path)
    pub fn new_observed(desc: ListenerDesc, default_service: String, rules: Vec<Rule>) -> Self {
        Self {
            default_service,
            current: Some(desc),
            desired: None,
            rules,
            deleted: false,
        }
    }

    /// Port of this listener, from whichever snapshot is present
    pub fn port(&self) -> Option<i32> {
        self.desired
            .as_ref()
            .or(self.current.as_ref())
            .map(|d| d.port)
    }

    /// Server-assigned ARN, available once created
    pub fn arn(&self) -> Option<String> {
        self.current.as_ref().and_then(|c| c.arn.clone())
    }

    /// Drop the desired state recursively, turning the next pass into a
    /// delete of the listener and all its rules
    pub fn strip_desired_state(&mut self) {
        self.desired = None;
        for rule in &mut self.rules {
            rule.strip_desired_state();
        }
    }

    /// Drop the current state recursively
    pub fn strip_current_state(&mut self) {
        self.current = None;
        for rule in &mut self.rules {
            rule.strip_current_state();
        }
    }

    /// Structural diff ignoring the ARN: port, protocol, certificate,
    /// SSL policy and the default action's target group.
    pub fn needs_modification(&self) -> bool {
        match (&self.current, &self.desired) {
            (Some(current), Some(desired)) => {
                current.port != desired.port
                    || current.protocol != desired.protocol
                    || current.certificate_arn != desired.certificate_arn
                    || (desired.ssl_policy.is_some()
                        && current.ssl_policy != desired.ssl_policy)
                    || (desired.default_target_group_arn.is_some()
                        && current.default_target_group_arn != desired.default_target_group_arn)
            }
            _ => true,
        }
    }

    /// Converge this listener, then its rules.
    pub async fn reconcile(
        &mut self,
        ctx: &ReconcileCtx<'_>,
        lb_arn: &str,
        target_groups: &[TargetGroup],
    ) -> Result<()> {
        match (&self.current, &self.desired) {
            (None, None) => return Ok(()),
            (Some(_), None) => return self.delete(ctx).await,
            (None, Some(_)) => self.create(ctx, lb_arn, target_groups).await?,
            (Some(_), Some(_)) => {
                self.resolve_default_action(target_groups)?;
                if self.needs_modification() {
                    self.modify(ctx, target_groups).await?;
                }
            }
        }

        let listener_arn = self.arn().ok_or_else(|| {
            Error::internal_with_context("listener", "reconciled listener has no ARN")
        })?;

        let mut errors = Vec::new();
        for rule in &mut self.rules {
            if let Err(e) = rule.reconcile(ctx, &listener_arn, target_groups).await {
                errors.push(e);
            }
        }
        self.rules.retain(|r| !r.deleted);
        Error::composite(errors)
    }

    fn resolve_default_action(&mut self, target_groups: &[TargetGroup]) -> Result<()> {
        let arn = target_groups
            .iter()
            .find(|tg| tg.service_name == self.default_service)
            .and_then(TargetGroup::arn)
            .ok_or_else(|| {
                Error::internal_with_context(
                    "listener",
                    format!(
                        "no target group found for default service {}",
                        self.default_service
                    ),
                )
            })?;
        if let Some(desired) = self.desired.as_mut() {
            desired.default_target_group_arn = Some(arn);
        }
        Ok(())
    }

    async fn create(
        &mut self,
        ctx: &ReconcileCtx<'_>,
        lb_arn: &str,
        target_groups: &[TargetGroup],
    ) -> Result<()> {
        self.resolve_default_action(target_groups)?;
        let desired = self
            .desired
            .as_ref()
            .ok_or_else(|| Error::internal_with_context("listener", "create without desired"))?;

        debug!(port = desired.port, protocol = %desired.protocol, "creating listener");
        let created = ctx.elb.create_listener(lb_arn, desired).await?;
        self.current = Some(created);
        Ok(())
    }

    async fn modify(
        &mut self,
        ctx: &ReconcileCtx<'_>,
        target_groups: &[TargetGroup],
    ) -> Result<()> {
        self.resolve_default_action(target_groups)?;
        let desired = self
            .desired
            .as_ref()
            .ok_or_else(|| Error::internal_with_context("listener", "modify without desired"))?;
        let arn = self
            .arn()
            .ok_or_else(|| Error::internal_with_context("listener", "modify without current ARN"))?;

        debug!(port = desired.port, protocol = %desired.protocol, "modifying listener");
        let modified = ctx.elb.modify_listener(&arn, desired).await?;
        self.current = Some(modified);
        Ok(())
    }

    /// Delete rules first, then the listener itself.
    async fn delete(&mut self, ctx: &ReconcileCtx<'_>) -> Result<()> {
        let mut errors = Vec::new();
        for rule in &mut self.rules {
            rule.strip_desired_state();
            if let Err(e) = rule.reconcile(ctx, "", &[]).await {
                errors.push(e);
            }
        }
        self.rules.retain(|r| r.current.is_some());
        // Child deletion must finish before the parent goes
        Error::composite(errors)?;

        if let Some(arn) = self.arn() {
            debug!(arn = %arn, "deleting listener");
            ctx.elb.delete_listener(&arn).await?;
        }
        self.current = None;
        self.deleted = true;
        Ok(())
    }
}
