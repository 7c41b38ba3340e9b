//! Cluster-side resolution: service backends to node ports, nodes to EC2
//! instance ids.
//!
//! The assembler stays pure by consuming the [`ServiceResolver`] trait;
//! the Kubernetes-backed implementation lives here.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::ListParams;
use kube::{Api, Client};

use alb_ingress_common::{Error, Result};

/// The port reference carried by an Ingress backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendPort {
    /// `spec.ports[].port` number
    Number(i32),
    /// `spec.ports[].name`
    Name(String),
}

/// Maps a service backend to the node port traffic is forwarded to.
#[async_trait]
pub trait ServiceResolver: Send + Sync {
    /// Resolve `{namespace, service, port}` to the service's node port
    async fn node_port(&self, namespace: &str, service: &str, port: &BackendPort) -> Result<i32>;
}

/// Kubernetes-backed resolver.
pub struct KubeServiceResolver {
    client: Client,
}

impl KubeServiceResolver {
    /// Create a resolver over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceResolver for KubeServiceResolver {
    async fn node_port(&self, namespace: &str, service: &str, port: &BackendPort) -> Result<i32> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let svc = api.get(service).await?;

        let ports = svc
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .ok_or_else(|| {
                Error::validation(format!("service {namespace}/{service} has no ports"))
            })?;

        let matched = ports
            .iter()
            .find(|p| match port {
                BackendPort::Number(n) => p.port == *n,
                BackendPort::Name(name) => p.name.as_deref() == Some(name),
            })
            .ok_or_else(|| {
                Error::validation(format!(
                    "service {namespace}/{service} has no port matching the Ingress backend"
                ))
            })?;

        matched.node_port.ok_or_else(|| {
            Error::validation(format!(
                "service {namespace}/{service} has no node port; ALB instance targets require type NodePort or LoadBalancer"
            ))
        })
    }
}

/// Extract the EC2 instance id from a node's `spec.providerID`
/// (`aws:///us-east-1a/i-0123456789abcdef0`).
pub fn instance_id_from_provider(provider_id: &str) -> Option<String> {
    provider_id
        .strip_prefix("aws://")
        .and_then(|rest| rest.rsplit('/').next())
        .filter(|id| id.starts_with("i-"))
        .map(String::from)
}

/// List the EC2 instance ids of every node in the cluster.
pub async fn cluster_instances(client: &Client) -> Result<Vec<String>> {
    let api: Api<Node> = Api::all(client.clone());
    let nodes = api.list(&ListParams::default()).await?;

    let mut ids: Vec<String> = nodes
        .items
        .iter()
        .filter_map(|n| n.spec.as_ref().and_then(|s| s.provider_id.as_deref()))
        .filter_map(instance_id_from_provider)
        .collect();
    ids.sort();
    ids.dedup();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_instance_id_from_aws_provider_id() {
        assert_eq!(
            instance_id_from_provider("aws:///us-east-1a/i-0123456789abcdef0"),
            Some("i-0123456789abcdef0".to_string())
        );
    }

    #[test]
    fn rejects_non_aws_provider_ids() {
        assert_eq!(instance_id_from_provider("gce://project/zone/instance"), None);
        assert_eq!(instance_id_from_provider("aws:///us-east-1a/not-an-instance"), None);
        assert_eq!(instance_id_from_provider(""), None);
    }
}
