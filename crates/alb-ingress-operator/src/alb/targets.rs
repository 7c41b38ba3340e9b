//! Registered backends of one target group.
//!
//! The diff is pure set arithmetic: registrations are `desired − current`,
//! deregistrations are `current − desired`, each submitted as one batch
//! call. Targets observed in `initial` or `draining` are already moving
//! toward the desired state and are left alone.

use std::collections::{BTreeMap, BTreeSet};

use alb_ingress_common::Result;

use alb_ingress_aws::types::{Target, TargetState};

use super::ReconcileCtx;

/// The target set of one target group.
#[derive(Clone, Debug, Default)]
pub struct Targets {
    /// What AWS reports as registered, with health state
    current: BTreeMap<Target, TargetState>,
    /// What the cluster's nodes and the service's node port imply
    pub desired: BTreeSet<Target>,
}

impl Targets {
    /// Build from a desired set only (assembly path)
    pub fn from_desired(desired: BTreeSet<Target>) -> Self {
        Self {
            current: BTreeMap::new(),
            desired,
        }
    }

    /// Build from observed target health (bootstrap path)
    pub fn from_observed(observed: impl IntoIterator<Item = (Target, TargetState)>) -> Self {
        Self {
            current: observed.into_iter().collect(),
            desired: BTreeSet::new(),
        }
    }

    /// Replace the desired set for this pass
    pub fn set_desired(&mut self, desired: BTreeSet<Target>) {
        self.desired = desired;
    }

    /// The targets AWS currently reports as registered
    pub fn registered(&self) -> BTreeSet<Target> {
        self.current.keys().cloned().collect()
    }

    /// Drop the desired set (deletion path)
    pub fn strip_desired_state(&mut self) {
        self.desired.clear();
    }

    /// Targets to register: desired and not currently registered
    pub fn additions(&self) -> Vec<Target> {
        self.desired
            .iter()
            .filter(|t| !self.current.contains_key(t))
            .cloned()
            .collect()
    }

    /// Targets to deregister: registered, not desired, and not already
    /// draining out
    pub fn removals(&self) -> Vec<Target> {
        self.current
            .iter()
            .filter(|(t, state)| !self.desired.contains(t) && **state != TargetState::Draining)
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Whether a pass would issue any calls
    pub fn needs_modification(&self) -> bool {
        !self.additions().is_empty() || !self.removals().is_empty()
    }

    /// Converge the registered set toward the desired set.
    pub async fn reconcile(&mut self, ctx: &ReconcileCtx<'_>, tg_arn: &str) -> Result<()> {
        let additions = self.additions();
        let removals = self.removals();

        if !additions.is_empty() {
            ctx.elb.register_targets(tg_arn, &additions).await?;
        }
        if !removals.is_empty() {
            ctx.elb.deregister_targets(tg_arn, &removals).await?;
        }

        for t in additions {
            self.current.insert(t, TargetState::Initial);
        }
        for t in removals {
            self.current.remove(&t);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeCloud;

    fn target(id: &str, port: i32) -> Target {
        Target::new(id, port)
    }

    #[test]
    fn additions_and_removals_are_set_differences() {
        let mut t = Targets::from_observed([
            (target("i-aaa", 30080), TargetState::Healthy),
            (target("i-bbb", 30080), TargetState::Healthy),
        ]);
        t.set_desired([target("i-bbb", 30080), target("i-ccc", 30080)].into());

        assert_eq!(t.additions(), vec![target("i-ccc", 30080)]);
        assert_eq!(t.removals(), vec![target("i-aaa", 30080)]);
    }

    #[test]
    fn draining_targets_are_not_deregistered_again() {
        let mut t = Targets::from_observed([
            (target("i-aaa", 30080), TargetState::Draining),
            (target("i-bbb", 30080), TargetState::Healthy),
        ]);
        t.set_desired([target("i-bbb", 30080)].into());

        assert!(t.removals().is_empty());
        assert!(!t.needs_modification());
    }

    #[test]
    fn initial_targets_count_as_registered() {
        let mut t = Targets::from_observed([(target("i-aaa", 30080), TargetState::Initial)]);
        t.set_desired([target("i-aaa", 30080)].into());

        assert!(t.additions().is_empty());
        assert!(!t.needs_modification());
    }

    #[tokio::test]
    async fn reconcile_issues_one_batch_call_per_direction() {
        let cloud = FakeCloud::new();
        let ctx = ReconcileCtx { elb: &cloud };

        let mut t = Targets::from_observed([
            (target("i-old", 30080), TargetState::Healthy),
            (target("i-keep", 30080), TargetState::Healthy),
        ]);
        t.set_desired([target("i-keep", 30080), target("i-new", 30080)].into());

        t.reconcile(&ctx, "arn:tg/svc-a").await.expect("reconcile should succeed");

        assert_eq!(
            cloud.calls(),
            vec!["RegisterTargets", "DeregisterTargets"]
        );
        // Converged: a second pass is a no-op
        assert!(!t.needs_modification());
        t.reconcile(&ctx, "arn:tg/svc-a").await.expect("second pass should succeed");
        assert_eq!(cloud.calls().len(), 2);
    }

    #[tokio::test]
    async fn converged_set_issues_no_calls() {
        let cloud = FakeCloud::new();
        let ctx = ReconcileCtx { elb: &cloud };

        let mut t = Targets::from_observed([(target("i-aaa", 30080), TargetState::Healthy)]);
        t.set_desired([target("i-aaa", 30080)].into());

        t.reconcile(&ctx, "arn:tg/svc-a").await.expect("reconcile should succeed");
        assert!(cloud.calls().is_empty());
    }
}
