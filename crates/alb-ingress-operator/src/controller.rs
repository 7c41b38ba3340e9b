//! The outer controller loop.
//!
//! kube-runtime supplies the work queue, per-key serialization and event
//! deduplication. Endpoint changes fan out to the Ingresses routing to
//! the changed service; node changes fan out to every Ingress, since the
//! target set depends on node membership. Failed keys are re-enqueued
//! with per-key exponential backoff (1s, doubling, capped at 5 minutes,
//! ±10% jitter), reset on success. Validation failures wait for a spec
//! change instead.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Node};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use alb_ingress_aws::{Ec2Api, ElbApi};
use alb_ingress_common::events::{actions, reasons};
use alb_ingress_common::retry::Backoff;
use alb_ingress_common::{Error, EventPublisher, Result};

use crate::alb::{ReconcileCtx, SecurityGroupManager};
use crate::annotations::IngressAnnotations;
use crate::assembler::{assemble, referenced_services, AssembleInput};
use crate::resolver::{cluster_instances, KubeServiceResolver};
use crate::store::Store;
use crate::{FINALIZER, INGRESS_CLASS};

/// Conflict errors get this fixed re-enqueue interval
const CONFLICT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Conflicts are retried this many times before the Ingress is treated
/// as failed until its spec changes
const CONFLICT_MAX_ATTEMPTS: u32 = 3;

/// Static controller configuration.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Cluster name, the root of every derived name and ownership tag
    pub cluster_name: String,
    /// Resync period for converged Ingresses
    pub poll_interval: Duration,
    /// Per-pass deadline
    pub deadline: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            poll_interval: Duration::from_secs(60),
            deadline: Duration::from_secs(300),
        }
    }
}

/// Everything a reconciliation pass needs, constructed once at startup.
/// No global state: AWS clients, the store and the security group
/// manager are all owned here.
pub struct Context {
    /// Kubernetes API client
    pub client: Client,
    /// ELBv2 surface
    pub elb: Arc<dyn ElbApi>,
    /// EC2 surface
    pub ec2: Arc<dyn Ec2Api>,
    /// Tree index, bootstrapped from AWS before the first event
    pub store: Store,
    /// Managed security group pairs
    pub sg_manager: SecurityGroupManager,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Static configuration
    pub config: ControllerConfig,
    failures: Mutex<FailureTracker>,
    dns_reported: Mutex<HashSet<String>>,
}

impl Context {
    /// Build a context.
    pub fn new(
        client: Client,
        elb: Arc<dyn ElbApi>,
        ec2: Arc<dyn Ec2Api>,
        store: Store,
        events: Arc<dyn EventPublisher>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            client,
            elb,
            ec2,
            store,
            sg_manager: SecurityGroupManager::new(),
            events,
            config,
            failures: Mutex::new(FailureTracker::default()),
            dns_reported: Mutex::new(HashSet::new()),
        }
    }

    fn next_backoff(&self, key: &str) -> Duration {
        self.failures.lock().expect("failures lock").next_backoff(key)
    }

    fn bump_conflicts(&self, key: &str) -> u32 {
        self.failures.lock().expect("failures lock").bump_conflicts(key)
    }

    fn reset_failures(&self, key: &str) {
        self.failures.lock().expect("failures lock").reset(key);
    }

    /// True exactly once per Ingress lifetime
    fn mark_dns_reported(&self, key: &str) -> bool {
        self.dns_reported
            .lock()
            .expect("dns lock")
            .insert(key.to_string())
    }
}

/// Per-key failure accounting: a backoff schedule and a conflict counter.
#[derive(Default)]
struct FailureTracker {
    backoffs: HashMap<String, Backoff>,
    conflicts: HashMap<String, u32>,
}

impl FailureTracker {
    fn next_backoff(&mut self, key: &str) -> Duration {
        self.backoffs
            .entry(key.to_string())
            .or_insert_with(Backoff::for_requeue)
            .next_delay()
    }

    fn bump_conflicts(&mut self, key: &str) -> u32 {
        let count = self.conflicts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn reset(&mut self, key: &str) {
        self.backoffs.remove(key);
        self.conflicts.remove(key);
    }
}

/// What a successful pass produced, for the completion event.
struct Summary {
    listeners: usize,
    rules: usize,
    target_groups: usize,
    dns_name: Option<String>,
}

impl Summary {
    fn from_tree(tree: &crate::alb::LoadBalancer) -> Self {
        Self {
            listeners: tree.listeners.len(),
            rules: tree.listeners.iter().map(|l| l.rules.len()).sum(),
            target_groups: tree.target_groups.len(),
            dns_name: tree.dns_name(),
        }
    }

    fn message(&self) -> String {
        format!(
            "reconciled: {} listener(s), {} rule(s), {} target group(s)",
            self.listeners, self.rules, self.target_groups
        )
    }
}

/// Whether an Ingress requests ALB-backed ingress from this controller.
pub fn is_alb_ingress(ingress: &Ingress) -> bool {
    if ingress
        .spec
        .as_ref()
        .and_then(|s| s.ingress_class_name.as_deref())
        == Some(INGRESS_CLASS)
    {
        return true;
    }
    ingress
        .annotations()
        .get("kubernetes.io/ingress.class")
        .map(String::as_str)
        == Some(INGRESS_CLASS)
}

fn ingress_key(ingress: &Ingress) -> String {
    format!(
        "{}/{}",
        ingress.namespace().unwrap_or_default(),
        ingress.name_any()
    )
}

/// Run the controller until shutdown.
pub async fn run(ctx: Arc<Context>) -> anyhow::Result<()> {
    let ingresses: Api<Ingress> = Api::all(ctx.client.clone());
    let endpoints: Api<Endpoints> = Api::all(ctx.client.clone());
    let nodes: Api<Node> = Api::all(ctx.client.clone());

    info!(
        cluster = %ctx.config.cluster_name,
        managed = ctx.store.keys().len(),
        "starting ingress controller"
    );

    let endpoint_ctx = ctx.clone();
    let node_ctx = ctx.clone();

    Controller::new(ingresses, WatcherConfig::default())
        // A service's endpoints changed: re-reconcile every Ingress
        // routing to it
        .watches(endpoints, WatcherConfig::default(), move |ep: Endpoints| {
            let service_key = format!(
                "{}/{}",
                ep.namespace().unwrap_or_default(),
                ep.name_any()
            );
            endpoint_ctx
                .store
                .ingresses_for_service(&service_key)
                .into_iter()
                .filter_map(object_ref_for_key)
        })
        // Node membership changed: every target set is stale
        .watches(nodes, WatcherConfig::default(), move |_node: Node| {
            node_ctx
                .store
                .keys()
                .into_iter()
                .filter_map(object_ref_for_key)
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(ingress = %obj.name, "reconciliation completed"),
                Err(e) => error!(error = %e, "reconciliation error"),
            }
        })
        .await;

    info!("ingress controller shut down");
    Ok(())
}

fn object_ref_for_key(key: String) -> Option<ObjectRef<Ingress>> {
    let (namespace, name) = key.split_once('/')?;
    Some(ObjectRef::new(name).within(namespace))
}

async fn remove_finalizer(api: &Api<Ingress>, ingress: &Ingress) -> Result<()> {
    let remaining: Vec<String> = ingress
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": remaining } });
    api.patch(
        &ingress.name_any(),
        &kube::api::PatchParams::default(),
        &kube::api::Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Entry point for one queue item.
pub async fn reconcile(ingress: Arc<Ingress>, ctx: Arc<Context>) -> Result<Action> {
    let key = ingress_key(&ingress);

    let namespace = ingress.namespace().unwrap_or_default();
    let api: Api<Ingress> = Api::namespaced(ctx.client.clone(), &namespace);

    if !is_alb_ingress(&ingress) {
        // Class changed away from us while we still own cloud state
        if ctx.store.contains(&key) {
            info!(ingress = %key, "ingress no longer requests ALB ingress, tearing down");
            cleanup(&ingress, &ctx).await?;
        }
        if ingress.finalizers().iter().any(|f| f == FINALIZER) {
            remove_finalizer(&api, &ingress).await?;
        }
        return Ok(Action::await_change());
    }
    let ctx_for_event = ctx.clone();

    finalizer(&api, FINALIZER, ingress, |event| async move {
        match event {
            FinalizerEvent::Apply(ing) => apply(&ing, &ctx_for_event).await,
            FinalizerEvent::Cleanup(ing) => {
                cleanup(&ing, &ctx_for_event).await?;
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(|e| match e {
        kube::runtime::finalizer::Error::ApplyFailed(err)
        | kube::runtime::finalizer::Error::CleanupFailed(err) => err,
        other => Error::internal_with_context("finalizer", other.to_string()),
    })
}

/// Retry policy: validation waits for the spec, conflicts use a short
/// fixed interval, everything else backs off exponentially per key.
pub fn error_policy(ingress: Arc<Ingress>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = ingress_key(&ingress);

    if !error.is_retryable() {
        return Action::await_change();
    }
    if error.is_conflict() {
        return Action::requeue(CONFLICT_RETRY_DELAY);
    }

    let delay = ctx.next_backoff(&key);
    warn!(ingress = %key, error = %error, delay_ms = delay.as_millis(), "re-enqueueing after failure");
    Action::requeue(delay)
}

/// One forward pass: assemble, merge, converge, report.
async fn apply(ingress: &Ingress, ctx: &Context) -> Result<Action> {
    let key = ingress_key(ingress);
    let obj_ref = ingress.object_ref(&());

    let outcome = match tokio::time::timeout(ctx.config.deadline, apply_inner(ingress, ctx, &key))
        .await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(Error::internal_with_context(
            "controller",
            format!("reconciliation exceeded the {:?} deadline", ctx.config.deadline),
        )),
    };

    match outcome {
        Ok(summary) => {
            ctx.reset_failures(&key);
            ctx.events
                .publish(
                    &obj_ref,
                    EventType::Normal,
                    reasons::RECONCILED,
                    actions::RECONCILE,
                    Some(summary.message()),
                )
                .await;
            if let Some(dns) = &summary.dns_name {
                if ctx.mark_dns_reported(&key) {
                    ctx.events
                        .publish(
                            &obj_ref,
                            EventType::Normal,
                            reasons::DNS_ASSIGNED,
                            actions::RECONCILE,
                            Some(format!("load balancer available at {dns}")),
                        )
                        .await;
                }
            }
            Ok(Action::requeue(ctx.config.poll_interval))
        }
        Err(e) if !e.is_retryable() => {
            warn!(ingress = %key, error = %e, "validation failed; waiting for a spec change");
            ctx.events
                .publish(
                    &obj_ref,
                    EventType::Warning,
                    reasons::VALIDATION_FAILED,
                    actions::RECONCILE,
                    Some(e.to_string()),
                )
                .await;
            Ok(Action::await_change())
        }
        Err(e) if e.is_conflict() => {
            let attempts = ctx.bump_conflicts(&key);
            ctx.events
                .publish(
                    &obj_ref,
                    EventType::Warning,
                    reasons::CONFLICT,
                    actions::RECONCILE,
                    Some(e.to_string()),
                )
                .await;
            if attempts >= CONFLICT_MAX_ATTEMPTS {
                warn!(ingress = %key, attempts, "conflict persists; treating as failed until the spec changes");
                ctx.reset_failures(&key);
                Ok(Action::await_change())
            } else {
                Err(e)
            }
        }
        Err(e) => {
            ctx.events
                .publish(
                    &obj_ref,
                    EventType::Warning,
                    reasons::RECONCILE_FAILED,
                    actions::RECONCILE,
                    Some(e.to_string()),
                )
                .await;
            Err(e)
        }
    }
}

async fn apply_inner(ingress: &Ingress, ctx: &Context, key: &str) -> Result<Summary> {
    let annotations = IngressAnnotations::parse(ingress.annotations(), key)?;

    // Subnets resolve outside the assembler so it stays pure
    let subnets = ctx.ec2.resolve_subnets(&annotations.subnets).await?;
    let distinct_azs: HashSet<&str> = subnets
        .iter()
        .map(|s| s.availability_zone.as_str())
        .collect();
    if subnets.len() < 2 || distinct_azs.len() != subnets.len() {
        return Err(Error::validation_for_field(
            key,
            format!("{}/subnets", crate::ANNOTATION_PREFIX),
            "at least 2 subnets in distinct availability zones are required",
        ));
    }
    let subnet_ids: Vec<String> = subnets.into_iter().map(|s| s.id).collect();
    let vpc_id = ctx.ec2.vpc_for_subnet(&subnet_ids[0]).await?;

    let instances = cluster_instances(&ctx.client).await?;
    let resolver = KubeServiceResolver::new(ctx.client.clone());
    let fresh = assemble(
        AssembleInput {
            ingress,
            annotations: &annotations,
            cluster: &ctx.config.cluster_name,
            vpc_id: &vpc_id,
            subnet_ids,
            instance_ids: &instances,
        },
        &resolver,
    )
    .await?;

    ctx.store.set_services(key, referenced_services(ingress));

    let mut tree = match ctx.store.take(key) {
        Some(mut existing) => {
            existing.merge_desired(fresh);
            existing
        }
        None => fresh,
    };

    // Resolve the managed security group pair before the load balancer
    // is created or modified; its id lands on the desired snapshot
    let managed_sg = tree.managed_sg.clone();
    if let Some(sg_name) = &managed_sg {
        let ports = tree.desired_listener_ports();
        let tags = tree
            .desired
            .as_ref()
            .map(|d| d.tags.clone())
            .unwrap_or_default();
        let pair = ctx
            .sg_manager
            .reconcile(ctx.ec2.as_ref(), &vpc_id, sg_name, key, ports, &tags)
            .await?;
        if let Some(desired) = tree.desired.as_mut() {
            desired.security_groups = vec![pair.alb_sg_id];
        }
    }

    let rctx = ReconcileCtx {
        elb: ctx.elb.as_ref(),
    };
    let result = tree.reconcile(&rctx).await;
    let summary = Summary::from_tree(&tree);
    ctx.store.put(key, tree);
    result?;

    // Instances carry the instance SG so the ALB can reach node ports
    if let Some(sg_name) = &managed_sg {
        ctx.sg_manager
            .attach_instances(ctx.ec2.as_ref(), sg_name, &instances)
            .await?;
    }

    Ok(summary)
}

/// Tear down everything an Ingress owns.
async fn cleanup(ingress: &Ingress, ctx: &Context) -> Result<()> {
    let key = ingress_key(ingress);
    let obj_ref = ingress.object_ref(&());

    let Some(mut tree) = ctx.store.take(&key) else {
        ctx.store.remove(&key);
        return Ok(());
    };

    let managed_sg = tree
        .managed_sg
        .clone()
        .or_else(|| {
            // Trees recovered at bootstrap carry no managed-SG marker;
            // fall back to the conventional name
            Some(crate::name::security_group_name(
                &ctx.config.cluster_name,
                &ingress.name_any(),
            ))
        });
    let vpc_hint = match tree.current.as_ref().and_then(|c| c.subnets.first()) {
        Some(subnet) => Some(ctx.ec2.vpc_for_subnet(subnet).await?),
        None => None,
    };

    tree.strip_desired_state();
    let rctx = ReconcileCtx {
        elb: ctx.elb.as_ref(),
    };
    if let Err(e) = tree.reconcile(&rctx).await {
        ctx.store.put(&key, tree);
        ctx.events
            .publish(
                &obj_ref,
                EventType::Warning,
                reasons::RECONCILE_FAILED,
                actions::DELETE,
                Some(e.to_string()),
            )
            .await;
        return Err(e);
    }

    if let Some(sg_name) = managed_sg {
        let instances = cluster_instances(&ctx.client).await?;
        ctx.sg_manager
            .release(
                ctx.ec2.as_ref(),
                &sg_name,
                &key,
                &instances,
                vpc_hint.as_deref(),
            )
            .await?;
    }

    ctx.store.remove(&key);
    ctx.events
        .publish(
            &obj_ref,
            EventType::Normal,
            reasons::DELETED,
            actions::DELETE,
            Some("all load balancer resources removed".to_string()),
        )
        .await;
    info!(ingress = %key, "cloud resources removed");
    Ok(())
}
