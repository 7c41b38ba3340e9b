//! EC2 API surface: security groups, instance attachment, subnet lookups.
//!
//! Security group port sets are mutated one port per call in each
//! direction so a port change never passes through a delete-then-recreate
//! window. Instance attachment always submits the full replacement group
//! list, which is what `ModifyInstanceAttribute` expects.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_ec2::types::{Filter, IpPermission, IpRange, Tag, TagSpecification, UserIdGroupPair};
use aws_sdk_ec2::Client;
use moka::future::Cache;
use tracing::debug;

use alb_ingress_common::{Error, Result, Tags};

use crate::sdk::sdk_err;
use crate::types::SubnetInfo;

/// Subnet→VPC lookups are memoized this long.
const VPC_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// EC2 operations the security group manager and assembler perform.
#[async_trait]
pub trait Ec2Api: Send + Sync {
    /// Find a security group by VPC and group name
    async fn find_security_group(&self, vpc_id: &str, name: &str) -> Result<Option<String>>;
    /// Find the instance security group whose ingress references the
    /// given ALB security group. Errors if more than one matches.
    async fn find_instance_security_group(&self, alb_sg_id: &str) -> Result<Option<String>>;
    /// The TCP ingress ports currently authorized on a security group
    async fn security_group_ports(&self, sg_id: &str) -> Result<Vec<i32>>;
    /// `CreateSecurityGroup` with identity tags; returns the group id
    async fn create_security_group(&self, vpc_id: &str, name: &str, tags: &Tags)
        -> Result<String>;
    /// Authorize TCP ingress from 0.0.0.0/0 on a single port
    async fn authorize_port(&self, sg_id: &str, port: i32) -> Result<()>;
    /// Revoke TCP ingress from 0.0.0.0/0 on a single port
    async fn revoke_port(&self, sg_id: &str, port: i32) -> Result<()>;
    /// Authorize full-range TCP ingress from another security group
    async fn authorize_group_ingress(
        &self,
        sg_id: &str,
        source_sg_id: &str,
        vpc_id: &str,
    ) -> Result<()>;
    /// `DeleteSecurityGroup`
    async fn delete_security_group(&self, sg_id: &str) -> Result<()>;
    /// Ensure every listed instance carries the security group
    async fn attach_security_group(&self, instance_ids: &[String], sg_id: &str) -> Result<()>;
    /// Ensure no listed instance carries the security group
    async fn detach_security_group(&self, instance_ids: &[String], sg_id: &str) -> Result<()>;
    /// VPC id of a subnet, memoized for an hour
    async fn vpc_for_subnet(&self, subnet_id: &str) -> Result<String>;
    /// Resolve subnet ids or Name tags to `{id, az}` pairs
    async fn resolve_subnets(&self, ids_or_names: &[String]) -> Result<Vec<SubnetInfo>>;
    /// Cheap read used by the health endpoint
    async fn probe(&self) -> Result<()>;
}

/// SDK-backed [`Ec2Api`] implementation.
#[derive(Clone)]
pub struct AwsEc2 {
    client: Client,
    vpc_cache: Cache<String, String>,
}

impl AwsEc2 {
    /// Create a client from a shared AWS config
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: Client::new(config),
            vpc_cache: Cache::builder().time_to_live(VPC_CACHE_TTL).build(),
        }
    }

    /// One `DescribeInstances` page at a time, yielding every instance
    /// with its current security group ids.
    async fn instances_with_groups(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<(String, Vec<String>)>> {
        let mut out = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let page = self
                .client
                .describe_instances()
                .set_instance_ids(Some(instance_ids.to_vec()))
                .set_next_token(next_token.clone())
                .send()
                .await
                .map_err(|e| sdk_err("DescribeInstances", e))?;

            for reservation in page.reservations() {
                for inst in reservation.instances() {
                    let Some(id) = inst.instance_id() else { continue };
                    let groups = inst
                        .security_groups()
                        .iter()
                        .filter_map(|g| g.group_id().map(str::to_string))
                        .collect();
                    out.push((id.to_string(), groups));
                }
            }

            next_token = page.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(out)
    }

    async fn replace_instance_groups(&self, instance_id: &str, groups: Vec<String>) -> Result<()> {
        let mut req = self
            .client
            .modify_instance_attribute()
            .instance_id(instance_id);
        for g in groups {
            req = req.groups(g);
        }
        req.send()
            .await
            .map_err(|e| sdk_err("ModifyInstanceAttribute", e))?;
        Ok(())
    }
}

fn cidr_permission(port: i32) -> IpPermission {
    IpPermission::builder()
        .ip_protocol("tcp")
        .from_port(port)
        .to_port(port)
        .ip_ranges(
            IpRange::builder()
                .cidr_ip("0.0.0.0/0")
                .description("Allow all inbound traffic.")
                .build(),
        )
        .build()
}

fn name_filter(name: &str, value: &str) -> Filter {
    Filter::builder().name(name).values(value).build()
}

#[async_trait]
impl Ec2Api for AwsEc2 {
    async fn find_security_group(&self, vpc_id: &str, name: &str) -> Result<Option<String>> {
        let out = self
            .client
            .describe_security_groups()
            .filters(name_filter("vpc-id", vpc_id))
            .filters(name_filter("group-name", name))
            .send()
            .await
            .map_err(|e| sdk_err("DescribeSecurityGroups", e))?;

        Ok(out
            .security_groups()
            .first()
            .and_then(|sg| sg.group_id().map(str::to_string)))
    }

    async fn find_instance_security_group(&self, alb_sg_id: &str) -> Result<Option<String>> {
        let out = self
            .client
            .describe_security_groups()
            .filters(name_filter("ip-permission.group-id", alb_sg_id))
            .send()
            .await
            .map_err(|e| sdk_err("DescribeSecurityGroups", e))?;

        let groups = out.security_groups();
        match groups.len() {
            0 => Ok(None),
            1 => Ok(groups[0].group_id().map(str::to_string)),
            n => Err(Error::internal_with_context(
                "ec2",
                format!("found {n} instance security groups referencing {alb_sg_id}, expected 1"),
            )),
        }
    }

    async fn security_group_ports(&self, sg_id: &str) -> Result<Vec<i32>> {
        let out = self
            .client
            .describe_security_groups()
            .group_ids(sg_id)
            .send()
            .await
            .map_err(|e| sdk_err("DescribeSecurityGroups", e))?;

        let Some(sg) = out.security_groups().first() else {
            return Ok(Vec::new());
        };
        Ok(sg
            .ip_permissions()
            .iter()
            .filter_map(|p| p.from_port())
            .collect())
    }

    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        tags: &Tags,
    ) -> Result<String> {
        debug!(vpc = %vpc_id, name = %name, "creating security group");
        let sdk_tags: Vec<Tag> = tags
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build())
            .collect();

        let out = self
            .client
            .create_security_group()
            .vpc_id(vpc_id)
            .group_name(name)
            .description(name)
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(aws_sdk_ec2::types::ResourceType::SecurityGroup)
                    .set_tags(Some(sdk_tags))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| sdk_err("CreateSecurityGroup", e))?;

        out.group_id()
            .map(str::to_string)
            .ok_or_else(|| Error::internal_with_context("ec2", "CreateSecurityGroup returned no id"))
    }

    async fn authorize_port(&self, sg_id: &str, port: i32) -> Result<()> {
        self.client
            .authorize_security_group_ingress()
            .group_id(sg_id)
            .ip_permissions(cidr_permission(port))
            .send()
            .await
            .map_err(|e| sdk_err("AuthorizeSecurityGroupIngress", e))?;
        Ok(())
    }

    async fn revoke_port(&self, sg_id: &str, port: i32) -> Result<()> {
        self.client
            .revoke_security_group_ingress()
            .group_id(sg_id)
            .ip_permissions(cidr_permission(port))
            .send()
            .await
            .map_err(|e| sdk_err("RevokeSecurityGroupIngress", e))?;
        Ok(())
    }

    async fn authorize_group_ingress(
        &self,
        sg_id: &str,
        source_sg_id: &str,
        vpc_id: &str,
    ) -> Result<()> {
        self.client
            .authorize_security_group_ingress()
            .group_id(sg_id)
            .ip_permissions(
                IpPermission::builder()
                    .ip_protocol("tcp")
                    .from_port(0)
                    .to_port(65535)
                    .user_id_group_pairs(
                        UserIdGroupPair::builder()
                            .group_id(source_sg_id)
                            .vpc_id(vpc_id)
                            .build(),
                    )
                    .build(),
            )
            .send()
            .await
            .map_err(|e| sdk_err("AuthorizeSecurityGroupIngress", e))?;
        Ok(())
    }

    async fn delete_security_group(&self, sg_id: &str) -> Result<()> {
        self.client
            .delete_security_group()
            .group_id(sg_id)
            .send()
            .await
            .map_err(|e| sdk_err("DeleteSecurityGroup", e))?;
        Ok(())
    }

    async fn attach_security_group(&self, instance_ids: &[String], sg_id: &str) -> Result<()> {
        if instance_ids.is_empty() {
            return Ok(());
        }
        for (instance_id, mut groups) in self.instances_with_groups(instance_ids).await? {
            if groups.iter().any(|g| g == sg_id) {
                continue;
            }
            groups.push(sg_id.to_string());
            debug!(instance = %instance_id, sg = %sg_id, "attaching security group");
            self.replace_instance_groups(&instance_id, groups).await?;
        }
        Ok(())
    }

    async fn detach_security_group(&self, instance_ids: &[String], sg_id: &str) -> Result<()> {
        if instance_ids.is_empty() {
            return Ok(());
        }
        for (instance_id, groups) in self.instances_with_groups(instance_ids).await? {
            if !groups.iter().any(|g| g == sg_id) {
                continue;
            }
            let remaining: Vec<String> = groups.into_iter().filter(|g| g != sg_id).collect();
            debug!(instance = %instance_id, sg = %sg_id, "detaching security group");
            self.replace_instance_groups(&instance_id, remaining).await?;
        }
        Ok(())
    }

    async fn vpc_for_subnet(&self, subnet_id: &str) -> Result<String> {
        if let Some(vpc) = self.vpc_cache.get(subnet_id).await {
            return Ok(vpc);
        }

        let out = self
            .client
            .describe_subnets()
            .subnet_ids(subnet_id)
            .send()
            .await
            .map_err(|e| sdk_err("DescribeSubnets", e))?;

        let vpc = out
            .subnets()
            .first()
            .and_then(|s| s.vpc_id())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::internal_with_context("ec2", format!("subnet {subnet_id} has no VPC"))
            })?;

        self.vpc_cache
            .insert(subnet_id.to_string(), vpc.clone())
            .await;
        Ok(vpc)
    }

    async fn resolve_subnets(&self, ids_or_names: &[String]) -> Result<Vec<SubnetInfo>> {
        let (ids, names): (Vec<String>, Vec<String>) = ids_or_names
            .iter()
            .cloned()
            .partition(|s| s.starts_with("subnet-"));

        let mut out = Vec::new();

        if !ids.is_empty() {
            let page = self
                .client
                .describe_subnets()
                .set_subnet_ids(Some(ids))
                .send()
                .await
                .map_err(|e| sdk_err("DescribeSubnets", e))?;
            for s in page.subnets() {
                if let (Some(id), Some(az)) = (s.subnet_id(), s.availability_zone()) {
                    out.push(SubnetInfo {
                        id: id.to_string(),
                        availability_zone: az.to_string(),
                    });
                }
            }
        }

        for name in names {
            let page = self
                .client
                .describe_subnets()
                .filters(name_filter("tag:Name", &name))
                .send()
                .await
                .map_err(|e| sdk_err("DescribeSubnets", e))?;
            let subnet = page.subnets().first().ok_or_else(|| {
                Error::validation(format!("no subnet found with Name tag '{name}'"))
            })?;
            if let (Some(id), Some(az)) = (subnet.subnet_id(), subnet.availability_zone()) {
                out.push(SubnetInfo {
                    id: id.to_string(),
                    availability_zone: az.to_string(),
                });
            }
        }

        out.sort_by(|a, b| a.id.cmp(&b.id));
        out.dedup();
        Ok(out)
    }

    async fn probe(&self) -> Result<()> {
        self.client
            .describe_tags()
            .max_results(6)
            .send()
            .await
            .map_err(|e| sdk_err("DescribeTags", e))?;
        Ok(())
    }
}
