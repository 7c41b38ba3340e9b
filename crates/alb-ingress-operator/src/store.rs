//! The in-memory index of load balancer trees, keyed by Ingress.
//!
//! Populated once at startup by listing every ALB tagged for this
//! cluster and rebuilding its tree (listeners, rules, target groups,
//! registered targets) from the observed state. Events merge desired
//! trees against this index; the tag set on the load balancer is the
//! only join key.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use tracing::{info, warn};

use alb_ingress_aws::ElbApi;
use alb_ingress_common::{cluster_tag_key, Result, CLUSTER_TAG_OWNED, INGRESS_NAME_TAG, SERVICE_NAME_TAG};

use crate::alb::{Listener, LoadBalancer, Rule, TargetGroup, Targets};

/// Shared controller state.
#[derive(Default)]
pub struct Store {
    trees: RwLock<HashMap<String, LoadBalancer>>,
    /// `{namespace}/{service}` → Ingress keys routing to it
    service_index: RwLock<HashMap<String, HashSet<String>>>,
}

impl Store {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the index from AWS. Called once before any event is served.
    pub async fn bootstrap(elb: &dyn ElbApi, cluster: &str) -> Result<Store> {
        let store = Store::new();
        let owned_key = cluster_tag_key(cluster);

        let lbs = elb.list_load_balancers().await?;
        let arns: Vec<String> = lbs.iter().filter_map(|lb| lb.arn.clone()).collect();
        if arns.is_empty() {
            info!(cluster = %cluster, "no existing load balancers found");
            return Ok(store);
        }
        let tags_by_arn = elb.resource_tags(&arns).await?;

        for mut lb in lbs {
            let Some(arn) = lb.arn.clone() else { continue };
            let Some(tags) = tags_by_arn.get(&arn) else { continue };
            if tags.get(&owned_key) != Some(CLUSTER_TAG_OWNED) {
                continue;
            }
            let Some(ingress_key) = tags.get(INGRESS_NAME_TAG).map(String::from) else {
                warn!(arn = %arn, "owned load balancer missing ingress-name tag, skipping");
                continue;
            };
            lb.tags = tags.clone();

            let tree = rebuild_tree(elb, lb, ingress_key.clone()).await?;
            info!(
                ingress = %ingress_key,
                name = %tree.name,
                listeners = tree.listeners.len(),
                target_groups = tree.target_groups.len(),
                "recovered load balancer tree"
            );
            store.put(&ingress_key, tree);
        }

        Ok(store)
    }

    /// Take exclusive ownership of a tree for one reconciliation pass
    pub fn take(&self, ingress_key: &str) -> Option<LoadBalancer> {
        self.trees.write().expect("trees lock").remove(ingress_key)
    }

    /// Put a tree back after a pass
    pub fn put(&self, ingress_key: &str, tree: LoadBalancer) {
        self.trees
            .write()
            .expect("trees lock")
            .insert(ingress_key.to_string(), tree);
    }

    /// Whether an Ingress currently has a tree
    pub fn contains(&self, ingress_key: &str) -> bool {
        self.trees.read().expect("trees lock").contains_key(ingress_key)
    }

    /// All indexed Ingress keys
    pub fn keys(&self) -> Vec<String> {
        self.trees.read().expect("trees lock").keys().cloned().collect()
    }

    /// Ingresses routing to a `{namespace}/{service}`
    pub fn ingresses_for_service(&self, service_key: &str) -> Vec<String> {
        self.service_index
            .read()
            .expect("service index lock")
            .get(service_key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Replace the service references of one Ingress in the fan-out index
    pub fn set_services(&self, ingress_key: &str, services: HashSet<String>) {
        let mut index = self.service_index.write().expect("service index lock");
        for refs in index.values_mut() {
            refs.remove(ingress_key);
        }
        index.retain(|_, refs| !refs.is_empty());
        for service in services {
            index
                .entry(service)
                .or_default()
                .insert(ingress_key.to_string());
        }
    }

    /// Drop every trace of one Ingress
    pub fn remove(&self, ingress_key: &str) {
        self.trees.write().expect("trees lock").remove(ingress_key);
        self.set_services(ingress_key, HashSet::new());
    }
}

/// Rebuild one observed tree from the AWS API.
async fn rebuild_tree(
    elb: &dyn ElbApi,
    lb: alb_ingress_aws::types::LoadBalancerDesc,
    ingress_key: String,
) -> Result<LoadBalancer> {
    let arn = lb
        .arn
        .clone()
        .unwrap_or_default();

    // Target groups first: their service-name tags let rules and
    // listeners recover which backend they forward to
    let tg_descs = elb.target_groups(&arn).await?;
    let tg_arns: Vec<String> = tg_descs.iter().filter_map(|t| t.arn.clone()).collect();
    let tg_tags = elb.resource_tags(&tg_arns).await?;

    let mut service_by_arn: HashMap<String, String> = HashMap::new();
    let mut target_groups = Vec::new();
    for desc in tg_descs {
        let Some(tg_arn) = desc.arn.clone() else { continue };
        let service = tg_tags
            .get(&tg_arn)
            .and_then(|t| t.get(SERVICE_NAME_TAG))
            .unwrap_or_default()
            .to_string();
        service_by_arn.insert(tg_arn.clone(), service.clone());

        let health = elb.target_health(&tg_arn).await?;
        target_groups.push(TargetGroup::new_observed(
            service,
            desc,
            Targets::from_observed(health),
        ));
    }

    let mut listeners = Vec::new();
    for listener_desc in elb.listeners(&arn).await? {
        let Some(listener_arn) = listener_desc.arn.clone() else { continue };
        let default_service = listener_desc
            .default_target_group_arn
            .as_ref()
            .and_then(|tg| service_by_arn.get(tg))
            .cloned()
            .unwrap_or_default();

        let mut rules = Vec::new();
        for rule_desc in elb.rules(&listener_arn).await? {
            let service = rule_desc
                .target_group_arn
                .as_ref()
                .and_then(|tg| service_by_arn.get(tg))
                .cloned()
                .unwrap_or_default();
            rules.push(Rule::new_observed(rule_desc, service));
        }
        rules.sort_by_key(|r| r.priority());

        listeners.push(Listener::new_observed(
            listener_desc,
            default_service,
            rules,
        ));
    }

    Ok(LoadBalancer {
        name: lb.name.clone(),
        ingress_key,
        current: Some(lb),
        desired: None,
        listeners,
        target_groups,
        managed_sg: None,
        deleted: false,
    })
}
