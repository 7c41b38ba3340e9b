//! One routing rule under a listener.
//!
//! The default rule is owned by the listener through its default action:
//! a desired rule with the `default` priority produces no calls, and a
//! current `default` rule is never deleted here.

use alb_ingress_common::{Error, Result};
use tracing::debug;

use alb_ingress_aws::types::{ConditionField, RuleCondition, RuleDesc, RulePriority};

use super::target_group::TargetGroup;
use super::ReconcileCtx;

/// One priority slot on a listener.
#[derive(Clone, Debug, Default)]
pub struct Rule {
    /// Backend service this rule forwards to; resolved to a target group
    /// ARN at reconcile time
    pub service_name: String,
    /// Observed state
    pub current: Option<RuleDesc>,
    /// Goal state
    pub desired: Option<RuleDesc>,
    /// Set after a successful delete so the parent can prune this node
    pub deleted: bool,
}

impl Rule {
    /// Build a desired rule for a `{host, path}` pair.
    ///
    /// Input priority 0 maps to the `default` sentinel and produces a
    /// condition-less rule owned by the listener.
    pub fn new_desired(
        priority: u32,
        host: Option<&str>,
        path: Option<&str>,
        service_name: &str,
    ) -> Self {
        let priority = RulePriority::from_input(priority);

        let mut conditions = Vec::new();
        if priority != RulePriority::Default {
            if let Some(host) = host.filter(|h| !h.is_empty()) {
                conditions.push(RuleCondition::new(ConditionField::HostHeader, host));
            }
            if let Some(path) = path.filter(|p| !p.is_empty()) {
                conditions.push(RuleCondition::new(ConditionField::PathPattern, path));
            }
        }

        Self {
            service_name: service_name.to_string(),
            current: None,
            desired: Some(RuleDesc {
                arn: None,
                priority,
                conditions,
                target_group_arn: None,
            }),
            deleted: false,
        }
    }

    /// Wrap a rule observed on AWS (bootstrap path)
    pub fn new_observed(desc: RuleDesc, service_name: String) -> Self {
        Self {
            service_name,
            current: Some(desc),
            desired: None,
            deleted: false,
        }
    }

    /// Drop the desired state, turning the next pass into a delete
    pub fn strip_desired_state(&mut self) {
        self.desired = None;
    }

    /// Drop the current state
    pub fn strip_current_state(&mut self) {
        self.current = None;
    }

    /// Priority of this slot, from whichever snapshot is present
    pub fn priority(&self) -> Option<RulePriority> {
        self.desired
            .as_ref()
            .or(self.current.as_ref())
            .map(|d| d.priority)
    }

    /// Find the ARN of the sibling target group backing this rule
    pub fn target_group_arn(&self, target_groups: &[TargetGroup]) -> Option<String> {
        target_groups
            .iter()
            .find(|tg| tg.service_name == self.service_name)
            .and_then(TargetGroup::arn)
    }

    /// Structural diff, ignoring ARNs: conditions as unordered per-field
    /// value sets, plus the forward target group.
    pub fn needs_modification(&self) -> bool {
        match (&self.current, &self.desired) {
            (Some(current), Some(desired)) => {
                !current.conditions_equal(desired)
                    || (desired.target_group_arn.is_some()
                        && current.target_group_arn != desired.target_group_arn)
            }
            _ => true,
        }
    }

    /// Converge this rule.
    pub async fn reconcile(
        &mut self,
        ctx: &ReconcileCtx<'_>,
        listener_arn: &str,
        target_groups: &[TargetGroup],
    ) -> Result<()> {
        // The listener owns its default rule via DefaultActions; a desired
        // default here is fully handled by the listener's own reconcile.
        if self.desired.as_ref().is_some_and(RuleDesc::is_default) {
            return Ok(());
        }

        match (&self.current, &self.desired) {
            (None, None) => Ok(()),
            (None, Some(_)) => self.create(ctx, listener_arn, target_groups).await,
            (Some(_), None) => self.delete(ctx).await,
            (Some(_), Some(_)) => {
                self.resolve_action(target_groups)?;
                if self.needs_modification() {
                    self.modify(ctx, target_groups).await
                } else {
                    Ok(())
                }
            }
        }
    }

    fn resolve_action(&mut self, target_groups: &[TargetGroup]) -> Result<()> {
        let arn = self.target_group_arn(target_groups).ok_or_else(|| {
            Error::internal_with_context(
                "rule",
                format!("no target group found for service {}", self.service_name),
            )
        })?;
        if let Some(desired) = self.desired.as_mut() {
            desired.target_group_arn = Some(arn);
        }
        Ok(())
    }

    async fn create(
        &mut self,
        ctx: &ReconcileCtx<'_>,
        listener_arn: &str,
        target_groups: &[TargetGroup],
    ) -> Result<()> {
        self.resolve_action(target_groups)?;
        let desired = self
            .desired
            .as_ref()
            .ok_or_else(|| Error::internal_with_context("rule", "create without desired state"))?;

        debug!(priority = %desired.priority.as_aws(), service = %self.service_name, "creating rule");
        let created = ctx.elb.create_rule(listener_arn, desired).await?;
        self.current = Some(created);
        Ok(())
    }

    async fn modify(
        &mut self,
        ctx: &ReconcileCtx<'_>,
        target_groups: &[TargetGroup],
    ) -> Result<()> {
        self.resolve_action(target_groups)?;
        let desired = self
            .desired
            .as_ref()
            .ok_or_else(|| Error::internal_with_context("rule", "modify without desired state"))?;
        let arn = self
            .current
            .as_ref()
            .and_then(|c| c.arn.clone())
            .ok_or_else(|| Error::internal_with_context("rule", "modify without current ARN"))?;

        debug!(priority = %desired.priority.as_aws(), service = %self.service_name, "modifying rule");
        let modified = ctx.elb.modify_rule(&arn, desired).await?;
        self.current = Some(modified);
        Ok(())
    }

    async fn delete(&mut self, ctx: &ReconcileCtx<'_>) -> Result<()> {
        let Some(current) = &self.current else {
            return Ok(());
        };
        // Default rules live and die with the listener
        if current.is_default() {
            return Ok(());
        }
        let arn = current
            .arn
            .clone()
            .ok_or_else(|| Error::internal_with_context("rule", "delete without current ARN"))?;

        debug!(priority = %current.priority.as_aws(), "deleting rule");
        ctx.elb.delete_rule(&arn).await?;
        self.current = None;
        self.deleted = true;
        Ok(())
    }
}
