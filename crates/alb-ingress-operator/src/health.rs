//! The `/healthz` endpoint.
//!
//! Returns 200 iff both reachability probes — ELBv2 and the Kubernetes
//! API server — pass within five seconds. Broken AWS credentials show up
//! here first: the probes start failing and readiness drops.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use kube::Client;
use tracing::{info, warn};

use alb_ingress_aws::{Ec2Api, ElbApi};

/// Probe deadline
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Dependencies the probes run against.
pub struct HealthState {
    /// Kubernetes API client
    pub client: Client,
    /// ELBv2 surface
    pub elb: Arc<dyn ElbApi>,
    /// EC2 surface
    pub ec2: Arc<dyn Ec2Api>,
}

/// Build the router
pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Serve the health endpoint until the process exits.
pub async fn serve(state: Arc<HealthState>, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "health endpoint listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn healthz(State(state): State<Arc<HealthState>>) -> (StatusCode, String) {
    match tokio::time::timeout(PROBE_TIMEOUT, probes(&state)).await {
        Ok(Ok(())) => (StatusCode::OK, "ok".to_string()),
        Ok(Err(failed)) => {
            warn!(probe = %failed, "health probe failed");
            (StatusCode::SERVICE_UNAVAILABLE, failed)
        }
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "probe timed out".to_string(),
        ),
    }
}

/// Run all probes, returning the first failure's description.
async fn probes(state: &HealthState) -> Result<(), String> {
    state
        .client
        .apiserver_version()
        .await
        .map_err(|e| format!("kubernetes api unreachable: {e}"))?;
    state
        .elb
        .probe()
        .await
        .map_err(|e| format!("elbv2 unreachable: {e}"))?;
    state
        .ec2
        .probe()
        .await
        .map_err(|e| format!("ec2 unreachable: {e}"))?;
    Ok(())
}
