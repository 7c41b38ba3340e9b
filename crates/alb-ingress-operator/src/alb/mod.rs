//! The differential reconciliation tree.
//!
//! Every node carries a `{current, desired}` snapshot pair; the
//! nullability of the pair is the whole state machine:
//!
//! - `current == None, desired == Some` → CREATE
//! - `current == Some, desired == None` → DELETE
//! - both present, structurally equal   → no-op
//! - both present, unequal              → MODIFY
//! - both `None`                        → terminal, pruned by the parent
//!
//! Structural equality ignores server-assigned fields (ARNs, DNS names).
//! A parent reconciles itself before its children so ARNs flow downward;
//! deletion runs in the reverse order. On failure a node leaves `current`
//! untouched, so a retried pass is always sound.

pub mod listener;
pub mod load_balancer;
pub mod rule;
pub mod security_group;
pub mod target_group;
pub mod targets;

pub use listener::Listener;
pub use load_balancer::LoadBalancer;
pub use rule::Rule;
pub use security_group::SecurityGroupManager;
pub use target_group::TargetGroup;
pub use targets::Targets;

use alb_ingress_aws::ElbApi;

/// Dependencies threaded through one reconciliation pass.
pub struct ReconcileCtx<'a> {
    /// The ELBv2 API surface all nodes mutate through
    pub elb: &'a dyn ElbApi,
}
