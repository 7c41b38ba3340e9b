//! In-memory cloud used by the reconciliation tests.
//!
//! Records every API call in order and keeps just enough state for the
//! scenario tests to assert on the resulting cloud shape (security group
//! port sets, surviving resources, registered targets). One-shot
//! failures can be injected per operation to exercise the partial
//! failure paths.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use alb_ingress_aws::types::{
    HealthCheck, ListenerDesc, LoadBalancerDesc, RuleDesc, SubnetInfo, Target, TargetGroupDesc,
    TargetState,
};
use alb_ingress_aws::{Ec2Api, ElbApi};
use alb_ingress_common::{AwsErrorKind, Error, Result, Tags};

#[derive(Debug, Default)]
struct FakeSg {
    name: String,
    vpc_id: String,
    ports: BTreeSet<i32>,
    /// Security groups allowed full-range ingress (the ALB SG of a pair)
    group_refs: Vec<String>,
}

#[derive(Debug, Default)]
struct CloudState {
    lbs: BTreeMap<String, LoadBalancerDesc>,
    lb_tags: BTreeMap<String, Tags>,
    listeners: BTreeMap<String, (String, ListenerDesc)>,
    rules: BTreeMap<String, (String, RuleDesc)>,
    tgs: BTreeMap<String, (TargetGroupDesc, Tags)>,
    targets: BTreeMap<String, BTreeMap<Target, TargetState>>,
    sgs: BTreeMap<String, FakeSg>,
    instances: BTreeMap<String, Vec<String>>,
}

/// The fake AWS account.
#[derive(Default)]
pub struct FakeCloud {
    calls: Mutex<Vec<String>>,
    fail: Mutex<HashMap<&'static str, AwsErrorKind>>,
    state: Mutex<CloudState>,
    counter: AtomicU64,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// All API calls issued so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().expect("calls lock").clear();
    }

    /// Make the next call of `operation` fail with the given kind
    pub fn fail_next(&self, operation: &'static str, kind: AwsErrorKind) {
        self.fail.lock().expect("fail lock").insert(operation, kind);
    }

    /// Ingress TCP port set of a security group
    pub fn sg_ports(&self, sg_id: &str) -> BTreeSet<i32> {
        self.state
            .lock()
            .expect("state lock")
            .sgs
            .get(sg_id)
            .map(|sg| sg.ports.clone())
            .unwrap_or_default()
    }

    pub fn sg_exists(&self, sg_id: &str) -> bool {
        self.state.lock().expect("state lock").sgs.contains_key(sg_id)
    }

    /// Security groups currently attached to an instance
    pub fn instance_groups(&self, instance_id: &str) -> Vec<String> {
        self.state
            .lock()
            .expect("state lock")
            .instances
            .get(instance_id)
            .cloned()
            .unwrap_or_default()
    }

    /// ARNs of all surviving load balancers
    pub fn load_balancer_arns(&self) -> Vec<String> {
        self.state.lock().expect("state lock").lbs.keys().cloned().collect()
    }

    /// ARNs of all surviving target groups
    pub fn target_group_arns(&self) -> Vec<String> {
        self.state.lock().expect("state lock").tgs.keys().cloned().collect()
    }

    /// Registered targets of a target group
    pub fn registered_targets(&self, tg_arn: &str) -> BTreeSet<Target> {
        self.state
            .lock()
            .expect("state lock")
            .targets
            .get(tg_arn)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn record(&self, operation: &'static str) -> Result<()> {
        self.calls.lock().expect("calls lock").push(operation.to_string());
        if let Some(kind) = self.fail.lock().expect("fail lock").remove(operation) {
            return Err(Error::aws(operation, kind, "injected failure"));
        }
        Ok(())
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}-{n}")
    }
}

#[async_trait]
impl ElbApi for FakeCloud {
    async fn create_load_balancer(&self, lb: &LoadBalancerDesc) -> Result<LoadBalancerDesc> {
        self.record("CreateLoadBalancer")?;
        let mut created = lb.clone();
        let arn = self.next_id(&format!("arn:lb/{}", lb.name));
        created.arn = Some(arn.clone());
        created.dns_name = Some(format!("{}.elb.example.com", lb.name));
        let mut state = self.state.lock().expect("state lock");
        state.lbs.insert(arn.clone(), created.clone());
        state.lb_tags.insert(arn, lb.tags.clone());
        Ok(created)
    }

    async fn delete_load_balancer(&self, arn: &str) -> Result<()> {
        self.record("DeleteLoadBalancer")?;
        let mut state = self.state.lock().expect("state lock");
        state.lbs.remove(arn);
        state.lb_tags.remove(arn);
        let orphaned: Vec<String> = state
            .listeners
            .iter()
            .filter(|(_, (lb, _))| lb == arn)
            .map(|(k, _)| k.clone())
            .collect();
        for l in orphaned {
            state.listeners.remove(&l);
        }
        Ok(())
    }

    async fn set_subnets(&self, arn: &str, subnets: &[String]) -> Result<()> {
        self.record("SetSubnets")?;
        if let Some(lb) = self.state.lock().expect("state lock").lbs.get_mut(arn) {
            lb.subnets = subnets.to_vec();
        }
        Ok(())
    }

    async fn set_security_groups(&self, arn: &str, groups: &[String]) -> Result<()> {
        self.record("SetSecurityGroups")?;
        if let Some(lb) = self.state.lock().expect("state lock").lbs.get_mut(arn) {
            lb.security_groups = groups.to_vec();
        }
        Ok(())
    }

    async fn add_tags(&self, arn: &str, tags: &Tags) -> Result<()> {
        self.record("AddTags")?;
        if let Some(existing) = self.state.lock().expect("state lock").lb_tags.get_mut(arn) {
            existing.merge(tags);
        }
        Ok(())
    }

    async fn remove_tags(&self, arn: &str, keys: &[String]) -> Result<()> {
        self.record("RemoveTags")?;
        if let Some(existing) = self.state.lock().expect("state lock").lb_tags.get_mut(arn) {
            let kept: Tags = existing
                .iter()
                .filter(|(k, _)| !keys.iter().any(|r| r == k))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            *existing = kept;
        }
        Ok(())
    }

    async fn list_load_balancers(&self) -> Result<Vec<LoadBalancerDesc>> {
        self.record("DescribeLoadBalancers")?;
        Ok(self.state.lock().expect("state lock").lbs.values().cloned().collect())
    }

    async fn resource_tags(&self, arns: &[String]) -> Result<HashMap<String, Tags>> {
        self.record("DescribeTags")?;
        let state = self.state.lock().expect("state lock");
        let mut out = HashMap::new();
        for arn in arns {
            if let Some(tags) = state.lb_tags.get(arn) {
                out.insert(arn.clone(), tags.clone());
            } else if let Some((_, tags)) = state.tgs.get(arn) {
                out.insert(arn.clone(), tags.clone());
            }
        }
        Ok(out)
    }

    async fn create_listener(
        &self,
        lb_arn: &str,
        listener: &ListenerDesc,
    ) -> Result<ListenerDesc> {
        self.record("CreateListener")?;
        let mut created = listener.clone();
        let arn = self.next_id("arn:listener");
        created.arn = Some(arn.clone());
        self.state
            .lock()
            .expect("state lock")
            .listeners
            .insert(arn, (lb_arn.to_string(), created.clone()));
        Ok(created)
    }

    async fn modify_listener(&self, arn: &str, listener: &ListenerDesc) -> Result<ListenerDesc> {
        self.record("ModifyListener")?;
        let mut modified = listener.clone();
        modified.arn = Some(arn.to_string());
        if let Some((_, stored)) = self.state.lock().expect("state lock").listeners.get_mut(arn) {
            *stored = modified.clone();
        }
        Ok(modified)
    }

    async fn delete_listener(&self, arn: &str) -> Result<()> {
        self.record("DeleteListener")?;
        let mut state = self.state.lock().expect("state lock");
        state.listeners.remove(arn);
        let orphaned: Vec<String> = state
            .rules
            .iter()
            .filter(|(_, (listener, _))| listener == arn)
            .map(|(k, _)| k.clone())
            .collect();
        for r in orphaned {
            state.rules.remove(&r);
        }
        Ok(())
    }

    async fn listeners(&self, lb_arn: &str) -> Result<Vec<ListenerDesc>> {
        self.record("DescribeListeners")?;
        Ok(self
            .state
            .lock()
            .expect("state lock")
            .listeners
            .values()
            .filter(|(lb, _)| lb == lb_arn)
            .map(|(_, l)| l.clone())
            .collect())
    }

    async fn create_rule(&self, listener_arn: &str, rule: &RuleDesc) -> Result<RuleDesc> {
        self.record("CreateRule")?;
        let mut created = rule.clone();
        let arn = self.next_id("arn:rule");
        created.arn = Some(arn.clone());
        self.state
            .lock()
            .expect("state lock")
            .rules
            .insert(arn, (listener_arn.to_string(), created.clone()));
        Ok(created)
    }

    async fn modify_rule(&self, arn: &str, rule: &RuleDesc) -> Result<RuleDesc> {
        self.record("ModifyRule")?;
        let mut modified = rule.clone();
        modified.arn = Some(arn.to_string());
        if let Some((_, stored)) = self.state.lock().expect("state lock").rules.get_mut(arn) {
            *stored = modified.clone();
        }
        Ok(modified)
    }

    async fn delete_rule(&self, arn: &str) -> Result<()> {
        self.record("DeleteRule")?;
        self.state.lock().expect("state lock").rules.remove(arn);
        Ok(())
    }

    async fn rules(&self, listener_arn: &str) -> Result<Vec<RuleDesc>> {
        self.record("DescribeRules")?;
        Ok(self
            .state
            .lock()
            .expect("state lock")
            .rules
            .values()
            .filter(|(listener, _)| listener == listener_arn)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn create_target_group(
        &self,
        tg: &TargetGroupDesc,
        tags: &Tags,
    ) -> Result<TargetGroupDesc> {
        self.record("CreateTargetGroup")?;
        let mut created = tg.clone();
        let arn = self.next_id(&format!("arn:tg/{}", tg.name));
        created.arn = Some(arn.clone());
        let mut state = self.state.lock().expect("state lock");
        state.tgs.insert(arn.clone(), (created.clone(), tags.clone()));
        state.targets.insert(arn, BTreeMap::new());
        Ok(created)
    }

    async fn modify_target_group(
        &self,
        arn: &str,
        health_check: &HealthCheck,
    ) -> Result<TargetGroupDesc> {
        self.record("ModifyTargetGroup")?;
        let mut state = self.state.lock().expect("state lock");
        let (stored, _) = state
            .tgs
            .get_mut(arn)
            .ok_or_else(|| Error::aws("ModifyTargetGroup", AwsErrorKind::Other, "not found"))?;
        stored.health_check = health_check.clone();
        Ok(stored.clone())
    }

    async fn modify_target_group_attributes(
        &self,
        _arn: &str,
        _deregistration_delay_seconds: u32,
    ) -> Result<()> {
        self.record("ModifyTargetGroupAttributes")
    }

    async fn delete_target_group(&self, arn: &str) -> Result<()> {
        self.record("DeleteTargetGroup")?;
        let mut state = self.state.lock().expect("state lock");
        // AWS refuses to delete a group still referenced by a rule or a
        // listener default action
        let referenced = state
            .rules
            .values()
            .any(|(_, r)| r.target_group_arn.as_deref() == Some(arn))
            || state
                .listeners
                .values()
                .any(|(_, l)| l.default_target_group_arn.as_deref() == Some(arn));
        if referenced {
            return Err(Error::aws(
                "DeleteTargetGroup",
                AwsErrorKind::Conflict,
                "ResourceInUse: target group is referenced by a listener or rule",
            ));
        }
        state.tgs.remove(arn);
        state.targets.remove(arn);
        Ok(())
    }

    async fn target_groups(&self, lb_arn: &str) -> Result<Vec<TargetGroupDesc>> {
        self.record("DescribeTargetGroups")?;
        let state = self.state.lock().expect("state lock");
        let listener_arns: Vec<&String> = state
            .listeners
            .iter()
            .filter(|(_, (lb, _))| lb == lb_arn)
            .map(|(arn, _)| arn)
            .collect();

        let mut referenced: BTreeSet<String> = state
            .listeners
            .values()
            .filter(|(lb, _)| lb == lb_arn)
            .filter_map(|(_, l)| l.default_target_group_arn.clone())
            .collect();
        for (listener, rule) in state.rules.values() {
            if listener_arns.iter().any(|a| *a == listener) {
                if let Some(tg) = &rule.target_group_arn {
                    referenced.insert(tg.clone());
                }
            }
        }

        Ok(referenced
            .iter()
            .filter_map(|arn| state.tgs.get(arn).map(|(tg, _)| tg.clone()))
            .collect())
    }

    async fn register_targets(&self, tg_arn: &str, targets: &[Target]) -> Result<()> {
        self.record("RegisterTargets")?;
        let mut state = self.state.lock().expect("state lock");
        let entry = state.targets.entry(tg_arn.to_string()).or_default();
        for t in targets {
            entry.insert(t.clone(), TargetState::Healthy);
        }
        Ok(())
    }

    async fn deregister_targets(&self, tg_arn: &str, targets: &[Target]) -> Result<()> {
        self.record("DeregisterTargets")?;
        let mut state = self.state.lock().expect("state lock");
        if let Some(entry) = state.targets.get_mut(tg_arn) {
            for t in targets {
                entry.remove(t);
            }
        }
        Ok(())
    }

    async fn target_health(&self, tg_arn: &str) -> Result<Vec<(Target, TargetState)>> {
        self.record("DescribeTargetHealth")?;
        Ok(self
            .state
            .lock()
            .expect("state lock")
            .targets
            .get(tg_arn)
            .map(|m| m.iter().map(|(t, s)| (t.clone(), *s)).collect())
            .unwrap_or_default())
    }

    async fn probe(&self) -> Result<()> {
        self.record("DescribeLoadBalancers")
    }
}

#[async_trait]
impl Ec2Api for FakeCloud {
    async fn find_security_group(&self, vpc_id: &str, name: &str) -> Result<Option<String>> {
        self.record("DescribeSecurityGroups")?;
        Ok(self
            .state
            .lock()
            .expect("state lock")
            .sgs
            .iter()
            .find(|(_, sg)| sg.vpc_id == vpc_id && sg.name == name)
            .map(|(id, _)| id.clone()))
    }

    async fn find_instance_security_group(&self, alb_sg_id: &str) -> Result<Option<String>> {
        self.record("DescribeSecurityGroups")?;
        Ok(self
            .state
            .lock()
            .expect("state lock")
            .sgs
            .iter()
            .find(|(_, sg)| sg.group_refs.iter().any(|r| r == alb_sg_id))
            .map(|(id, _)| id.clone()))
    }

    async fn security_group_ports(&self, sg_id: &str) -> Result<Vec<i32>> {
        self.record("DescribeSecurityGroups")?;
        Ok(self.sg_ports(sg_id).into_iter().collect())
    }

    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        _tags: &Tags,
    ) -> Result<String> {
        self.record("CreateSecurityGroup")?;
        let id = self.next_id("sg");
        self.state.lock().expect("state lock").sgs.insert(
            id.clone(),
            FakeSg {
                name: name.to_string(),
                vpc_id: vpc_id.to_string(),
                ports: BTreeSet::new(),
                group_refs: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn authorize_port(&self, sg_id: &str, port: i32) -> Result<()> {
        self.record("AuthorizeSecurityGroupIngress")?;
        if let Some(sg) = self.state.lock().expect("state lock").sgs.get_mut(sg_id) {
            sg.ports.insert(port);
        }
        Ok(())
    }

    async fn revoke_port(&self, sg_id: &str, port: i32) -> Result<()> {
        self.record("RevokeSecurityGroupIngress")?;
        if let Some(sg) = self.state.lock().expect("state lock").sgs.get_mut(sg_id) {
            sg.ports.remove(&port);
        }
        Ok(())
    }

    async fn authorize_group_ingress(
        &self,
        sg_id: &str,
        source_sg_id: &str,
        _vpc_id: &str,
    ) -> Result<()> {
        self.record("AuthorizeSecurityGroupIngress")?;
        if let Some(sg) = self.state.lock().expect("state lock").sgs.get_mut(sg_id) {
            sg.group_refs.push(source_sg_id.to_string());
        }
        Ok(())
    }

    async fn delete_security_group(&self, sg_id: &str) -> Result<()> {
        self.record("DeleteSecurityGroup")?;
        self.state.lock().expect("state lock").sgs.remove(sg_id);
        Ok(())
    }

    async fn attach_security_group(&self, instance_ids: &[String], sg_id: &str) -> Result<()> {
        self.record("DescribeInstances")?;
        for instance in instance_ids {
            let mut state = self.state.lock().expect("state lock");
            let groups = state.instances.entry(instance.clone()).or_default();
            if !groups.iter().any(|g| g == sg_id) {
                groups.push(sg_id.to_string());
                drop(state);
                self.record("ModifyInstanceAttribute")?;
            }
        }
        Ok(())
    }

    async fn detach_security_group(&self, instance_ids: &[String], sg_id: &str) -> Result<()> {
        self.record("DescribeInstances")?;
        for instance in instance_ids {
            let mut state = self.state.lock().expect("state lock");
            if let Some(groups) = state.instances.get_mut(instance) {
                if groups.iter().any(|g| g == sg_id) {
                    groups.retain(|g| g != sg_id);
                    drop(state);
                    self.record("ModifyInstanceAttribute")?;
                }
            }
        }
        Ok(())
    }

    async fn vpc_for_subnet(&self, _subnet_id: &str) -> Result<String> {
        self.record("DescribeSubnets")?;
        Ok("vpc-1".to_string())
    }

    async fn resolve_subnets(&self, ids_or_names: &[String]) -> Result<Vec<SubnetInfo>> {
        self.record("DescribeSubnets")?;
        Ok(ids_or_names
            .iter()
            .enumerate()
            .map(|(i, id)| SubnetInfo {
                id: id.clone(),
                availability_zone: format!("us-east-1{}", (b'a' + (i % 26) as u8) as char),
            })
            .collect())
    }

    async fn probe(&self) -> Result<()> {
        self.record("DescribeTags")
    }
}
