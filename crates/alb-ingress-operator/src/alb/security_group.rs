//! The managed security group pair.
//!
//! When no user-supplied security groups are given, the controller owns
//! two groups per SG name: the ALB group (TCP from 0.0.0.0/0 on exactly
//! the union of listener ports) and the instance group
//! (`instance-{name}`, full-range TCP from the ALB group), attached to
//! every instance backing the target groups.
//!
//! Several Ingresses may share one SG name; each declares its port-set
//! intent and the manager reconciles the union. The single mutex is what
//! serializes updates to a shared pair — an Ingress-local reconcile of a
//! shared group would thrash.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::Mutex;
use tracing::{debug, info};

use alb_ingress_aws::Ec2Api;
use alb_ingress_common::{Result, Tags};

/// Name prefix of the instance-side group
pub const INSTANCE_SG_PREFIX: &str = "instance-";

#[derive(Debug, Default)]
struct ManagedPair {
    vpc_id: String,
    alb_sg_id: Option<String>,
    instance_sg_id: Option<String>,
    /// Port-set intent per Ingress key
    intents: HashMap<String, BTreeSet<i32>>,
}

impl ManagedPair {
    fn port_union(&self) -> BTreeSet<i32> {
        self.intents.values().flatten().copied().collect()
    }
}

/// Process-local owner of all managed security group pairs.
#[derive(Debug, Default)]
pub struct SecurityGroupManager {
    pairs: Mutex<HashMap<String, ManagedPair>>,
}

/// Resolved pair ids returned by [`SecurityGroupManager::reconcile`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityGroupPair {
    /// The ALB-facing group
    pub alb_sg_id: String,
    /// The instance-facing group
    pub instance_sg_id: String,
}

impl SecurityGroupManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one Ingress's port-set intent and converge the pair toward
    /// the union of all intents. Returns the pair's group ids.
    pub async fn reconcile(
        &self,
        ec2: &dyn Ec2Api,
        vpc_id: &str,
        sg_name: &str,
        ingress_key: &str,
        ports: BTreeSet<i32>,
        tags: &Tags,
    ) -> Result<SecurityGroupPair> {
        let mut pairs = self.pairs.lock().await;
        let pair = pairs.entry(sg_name.to_string()).or_default();
        pair.vpc_id = vpc_id.to_string();
        pair.intents.insert(ingress_key.to_string(), ports);
        let union = pair.port_union();

        // Resolve or create the ALB-facing group
        let alb_sg_id = match &pair.alb_sg_id {
            Some(id) => id.clone(),
            None => match ec2.find_security_group(vpc_id, sg_name).await? {
                Some(id) => id,
                None => {
                    info!(sg = %sg_name, "creating managed security group");
                    let mut sg_tags = tags.clone();
                    sg_tags.insert("Name", sg_name);
                    ec2.create_security_group(vpc_id, sg_name, &sg_tags).await?
                }
            },
        };

        // Reconcile the port set as a set: authorize additions, revoke
        // removals. No delete-and-recreate window.
        let current: BTreeSet<i32> = ec2
            .security_group_ports(&alb_sg_id)
            .await?
            .into_iter()
            .collect();
        for port in union.difference(&current) {
            debug!(sg = %sg_name, port, "authorizing listener port");
            ec2.authorize_port(&alb_sg_id, *port).await?;
        }
        for port in current.difference(&union) {
            debug!(sg = %sg_name, port, "revoking stale listener port");
            ec2.revoke_port(&alb_sg_id, *port).await?;
        }

        // Resolve or create the instance-facing group
        let instance_name = format!("{INSTANCE_SG_PREFIX}{sg_name}");
        let instance_sg_id = match &pair.instance_sg_id {
            Some(id) => id.clone(),
            None => match ec2.find_security_group(vpc_id, &instance_name).await? {
                Some(id) => id,
                None => {
                    info!(sg = %instance_name, "creating managed instance security group");
                    let mut sg_tags = tags.clone();
                    sg_tags.insert("Name", instance_name.as_str());
                    let id = ec2
                        .create_security_group(vpc_id, &instance_name, &sg_tags)
                        .await?;
                    ec2.authorize_group_ingress(&id, &alb_sg_id, vpc_id).await?;
                    id
                }
            },
        };

        pair.alb_sg_id = Some(alb_sg_id.clone());
        pair.instance_sg_id = Some(instance_sg_id.clone());

        Ok(SecurityGroupPair {
            alb_sg_id,
            instance_sg_id,
        })
    }

    /// Ensure every instance backing the target groups carries the
    /// instance group.
    pub async fn attach_instances(
        &self,
        ec2: &dyn Ec2Api,
        sg_name: &str,
        instance_ids: &[String],
    ) -> Result<()> {
        let instance_sg_id = {
            let pairs = self.pairs.lock().await;
            pairs
                .get(sg_name)
                .and_then(|p| p.instance_sg_id.clone())
        };
        match instance_sg_id {
            Some(id) => ec2.attach_security_group(instance_ids, &id).await,
            None => Ok(()),
        }
    }

    /// Withdraw one Ingress's intent. When the last intent goes, the
    /// instance group is detached from all instances and the pair is
    /// deleted, instance group first (its ingress rule references the
    /// ALB group).
    ///
    /// `vpc_hint` covers the restart case: intents are process-local, so
    /// a pair created before a restart is resolved by name and removed.
    pub async fn release(
        &self,
        ec2: &dyn Ec2Api,
        sg_name: &str,
        ingress_key: &str,
        instance_ids: &[String],
        vpc_hint: Option<&str>,
    ) -> Result<()> {
        let mut pairs = self.pairs.lock().await;
        let Some(pair) = pairs.get_mut(sg_name) else {
            drop(pairs);
            return self
                .release_by_name(ec2, sg_name, instance_ids, vpc_hint)
                .await;
        };
        pair.intents.remove(ingress_key);

        if !pair.intents.is_empty() {
            // Other Ingresses still contribute; shrink the port set only
            let union = pair.port_union();
            if let Some(alb_sg_id) = pair.alb_sg_id.clone() {
                let current: BTreeSet<i32> = ec2
                    .security_group_ports(&alb_sg_id)
                    .await?
                    .into_iter()
                    .collect();
                for port in current.difference(&union) {
                    ec2.revoke_port(&alb_sg_id, *port).await?;
                }
            }
            return Ok(());
        }

        info!(sg = %sg_name, "releasing managed security group pair");
        if let Some(instance_sg_id) = pair.instance_sg_id.clone() {
            ec2.detach_security_group(instance_ids, &instance_sg_id)
                .await?;
            ec2.delete_security_group(&instance_sg_id).await?;
        }
        if let Some(alb_sg_id) = pair.alb_sg_id.clone() {
            ec2.delete_security_group(&alb_sg_id).await?;
        }
        pairs.remove(sg_name);
        Ok(())
    }

    /// Resolve and delete a pair this process never created (the
    /// controller restarted since). No intent tracking exists for it, so
    /// the groups are found by their conventional names.
    async fn release_by_name(
        &self,
        ec2: &dyn Ec2Api,
        sg_name: &str,
        instance_ids: &[String],
        vpc_hint: Option<&str>,
    ) -> Result<()> {
        let Some(vpc_id) = vpc_hint else {
            return Ok(());
        };
        let Some(alb_sg_id) = ec2.find_security_group(vpc_id, sg_name).await? else {
            return Ok(());
        };

        info!(sg = %sg_name, "releasing managed security group pair by name");
        let instance_name = format!("{INSTANCE_SG_PREFIX}{sg_name}");
        let instance_sg_id = match ec2.find_security_group(vpc_id, &instance_name).await? {
            Some(id) => Some(id),
            // The name may have been truncated or edited out of band; the
            // permission reference back to the ALB group still finds it
            None => ec2.find_instance_security_group(&alb_sg_id).await?,
        };
        if let Some(instance_sg_id) = instance_sg_id {
            ec2.detach_security_group(instance_ids, &instance_sg_id)
                .await?;
            ec2.delete_security_group(&instance_sg_id).await?;
        }
        ec2.delete_security_group(&alb_sg_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeCloud;

    fn ports(list: &[i32]) -> BTreeSet<i32> {
        list.iter().copied().collect()
    }

    #[tokio::test]
    async fn creates_pair_with_exact_port_set() {
        let cloud = FakeCloud::new();
        let manager = SecurityGroupManager::new();

        let pair = manager
            .reconcile(&cloud, "vpc-1", "cluster-web", "default/web", ports(&[80, 443]), &Tags::new())
            .await
            .expect("create should succeed");

        assert_eq!(
            cloud.sg_ports(&pair.alb_sg_id),
            ports(&[80, 443]),
            "ALB SG ingress ports must equal the union of listener ports"
        );
        assert!(cloud.sg_exists(&pair.instance_sg_id));
    }

    #[tokio::test]
    async fn port_change_authorizes_and_revokes_the_difference() {
        let cloud = FakeCloud::new();
        let manager = SecurityGroupManager::new();

        let pair = manager
            .reconcile(&cloud, "vpc-1", "cluster-web", "default/web", ports(&[80]), &Tags::new())
            .await
            .expect("create should succeed");
        cloud.clear_calls();

        manager
            .reconcile(&cloud, "vpc-1", "cluster-web", "default/web", ports(&[80, 443]), &Tags::new())
            .await
            .expect("update should succeed");

        let calls = cloud.calls();
        assert_eq!(
            calls
                .iter()
                .filter(|c| *c == "AuthorizeSecurityGroupIngress")
                .count(),
            1,
            "exactly one authorize for the one new port"
        );
        assert!(!calls.iter().any(|c| c == "RevokeSecurityGroupIngress"));
        assert_eq!(cloud.sg_ports(&pair.alb_sg_id), ports(&[80, 443]));
    }

    #[tokio::test]
    async fn shared_name_unions_ports_across_ingresses() {
        let cloud = FakeCloud::new();
        let manager = SecurityGroupManager::new();

        let pair = manager
            .reconcile(&cloud, "vpc-1", "cluster-web", "default/web", ports(&[80]), &Tags::new())
            .await
            .expect("first ingress should succeed");
        manager
            .reconcile(&cloud, "vpc-1", "cluster-web", "team/web", ports(&[443]), &Tags::new())
            .await
            .expect("second ingress should succeed");

        assert_eq!(cloud.sg_ports(&pair.alb_sg_id), ports(&[80, 443]));

        // Releasing one ingress only shrinks the union
        manager
            .release(&cloud, "cluster-web", "team/web", &[], None)
            .await
            .expect("release should succeed");
        assert_eq!(cloud.sg_ports(&pair.alb_sg_id), ports(&[80]));
        assert!(cloud.sg_exists(&pair.alb_sg_id));
    }

    #[tokio::test]
    async fn last_release_detaches_and_deletes_the_pair() {
        let cloud = FakeCloud::new();
        let manager = SecurityGroupManager::new();

        let pair = manager
            .reconcile(&cloud, "vpc-1", "cluster-web", "default/web", ports(&[80]), &Tags::new())
            .await
            .expect("create should succeed");
        let instances = vec!["i-aaa".to_string()];
        manager
            .attach_instances(&cloud, "cluster-web", &instances)
            .await
            .expect("attach should succeed");
        cloud.clear_calls();

        manager
            .release(&cloud, "cluster-web", "default/web", &instances, None)
            .await
            .expect("release should succeed");

        let calls = cloud.calls();
        let detach_pos = calls
            .iter()
            .position(|c| c == "ModifyInstanceAttribute")
            .expect("instances must be detached");
        let delete_pos = calls
            .iter()
            .position(|c| c == "DeleteSecurityGroup")
            .expect("groups must be deleted");
        assert!(detach_pos < delete_pos, "detach must precede delete");
        assert!(
            !cloud.instance_groups("i-aaa").contains(&pair.instance_sg_id),
            "instance must no longer carry the instance SG"
        );
        assert!(!cloud.sg_exists(&pair.instance_sg_id));
        assert!(!cloud.sg_exists(&pair.alb_sg_id));
    }

    #[tokio::test]
    async fn release_after_restart_resolves_the_pair_by_name() {
        let cloud = FakeCloud::new();

        // A previous process created the pair
        let previous = SecurityGroupManager::new();
        let pair = previous
            .reconcile(&cloud, "vpc-1", "cluster-web", "default/web", ports(&[80]), &Tags::new())
            .await
            .expect("create should succeed");

        // This process has no intent state for it
        let manager = SecurityGroupManager::new();
        manager
            .release(&cloud, "cluster-web", "default/web", &[], Some("vpc-1"))
            .await
            .expect("release by name should succeed");

        assert!(!cloud.sg_exists(&pair.alb_sg_id));
        assert!(!cloud.sg_exists(&pair.instance_sg_id));
    }

    #[tokio::test]
    async fn second_pass_is_idempotent() {
        let cloud = FakeCloud::new();
        let manager = SecurityGroupManager::new();

        manager
            .reconcile(&cloud, "vpc-1", "cluster-web", "default/web", ports(&[80]), &Tags::new())
            .await
            .expect("first pass should succeed");
        cloud.clear_calls();

        manager
            .reconcile(&cloud, "vpc-1", "cluster-web", "default/web", ports(&[80]), &Tags::new())
            .await
            .expect("second pass should succeed");

        assert!(
            !cloud
                .calls()
                .iter()
                .any(|c| c.starts_with("Authorize") || c.starts_with("Revoke") || c.starts_with("Create")),
            "converged pair must not be mutated"
        );
    }
}
