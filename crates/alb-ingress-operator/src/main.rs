//! ALB Ingress Controller - Kubernetes Ingress to AWS ALB reconciliation

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use alb_ingress_aws::{AwsEc2, AwsElb};
use alb_ingress_common::{KubeEventPublisher, DEFAULT_HEALTH_PORT};
use alb_ingress_operator::controller::{self, Context, ControllerConfig};
use alb_ingress_operator::health::{self, HealthState};
use alb_ingress_operator::store::Store;

/// Reconciles annotated Kubernetes Ingress objects into AWS Application
/// Load Balancers
#[derive(Parser, Debug)]
#[command(name = "alb-ingress-operator", version, about, long_about = None)]
struct Cli {
    /// Cluster name; scopes ownership tags and derived resource names
    #[arg(long, env = "CLUSTER_NAME")]
    cluster_name: String,

    /// AWS region override; defaults to the SDK provider chain
    #[arg(long, env = "AWS_REGION")]
    aws_region: Option<String>,

    /// Log filter (tracing EnvFilter syntax)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Resync period in seconds for converged Ingresses
    #[arg(long, env = "POLL_INTERVAL", default_value_t = 60)]
    poll_interval: u64,

    /// Port for the /healthz endpoint
    #[arg(long, env = "HEALTH_PORT", default_value_t = DEFAULT_HEALTH_PORT)]
    health_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    tracing::info!(cluster = %cli.cluster_name, "alb-ingress-operator starting");

    // AWS clients from the standard provider chain, with an optional
    // explicit region
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = cli.aws_region.clone() {
        loader = loader.region(aws_config::Region::new(region));
    }
    let aws = loader.load().await;
    let elb = Arc::new(AwsElb::new(&aws));
    let ec2 = Arc::new(AwsEc2::new(&aws));

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    // Recover the trees of every load balancer we own before serving
    // any events
    let store = Store::bootstrap(elb.as_ref(), &cli.cluster_name)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bootstrap state from AWS: {e}"))?;
    tracing::info!(managed = store.keys().len(), "state bootstrap complete");

    let events = Arc::new(KubeEventPublisher::new(client.clone(), "alb-ingress-operator"));
    let config = ControllerConfig {
        cluster_name: cli.cluster_name,
        poll_interval: Duration::from_secs(cli.poll_interval),
        ..Default::default()
    };
    let ctx = Arc::new(Context::new(
        client.clone(),
        elb.clone(),
        ec2.clone(),
        store,
        events,
        config,
    ));

    let health_state = Arc::new(HealthState { client, elb, ec2 });
    let health_port = cli.health_port;
    tokio::spawn(async move {
        if let Err(e) = health::serve(health_state, health_port).await {
            tracing::error!(error = %e, "health endpoint failed");
        }
    });

    controller::run(ctx).await
}
