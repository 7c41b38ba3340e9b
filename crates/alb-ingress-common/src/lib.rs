//! Common types for the ALB ingress controller: errors, events, retries, tags

#![deny(missing_docs)]

pub mod error;
pub mod events;
pub mod retry;
pub mod tags;

pub use error::{AwsErrorKind, Error};
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use tags::Tags;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default port for the health endpoint
pub const DEFAULT_HEALTH_PORT: u16 = 10254;

/// Tag key prefix marking cluster ownership; the full key is
/// `kubernetes.io/cluster/{CLUSTER}` with value `owned`
pub const CLUSTER_TAG_PREFIX: &str = "kubernetes.io/cluster/";

/// Tag value marking cluster ownership
pub const CLUSTER_TAG_OWNED: &str = "owned";

/// Tag key carrying the `{namespace}/{name}` of the owning Ingress
pub const INGRESS_NAME_TAG: &str = "kubernetes.io/ingress-name";

/// Tag key carrying the backend service name on target groups
pub const SERVICE_NAME_TAG: &str = "kubernetes.io/service-name";

/// Tag key identifying resources this controller manages
pub const MANAGED_BY_TAG: &str = "ManagedBy";

/// Tag value identifying resources this controller manages
pub const MANAGED_BY_VALUE: &str = "alb-ingress";

/// Build the cluster ownership tag key for a cluster name
pub fn cluster_tag_key(cluster: &str) -> String {
    format!("{CLUSTER_TAG_PREFIX}{cluster}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_tag_key_includes_cluster_name() {
        assert_eq!(
            cluster_tag_key("prod-us-east-1"),
            "kubernetes.io/cluster/prod-us-east-1"
        );
    }
}
