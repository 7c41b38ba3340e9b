//! ELBv2 API surface.
//!
//! [`ElbApi`] is the seam the reconciliation tree reconciles through; the
//! tests drive whole trees against in-memory implementations and assert
//! on the exact mutation sequence. [`AwsElb`] is the SDK-backed client.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_elasticloadbalancingv2::types::{
    Action, ActionTypeEnum, Certificate, LoadBalancerSchemeEnum, LoadBalancerTypeEnum,
    ProtocolEnum, RuleCondition as SdkRuleCondition, Tag, TargetDescription,
    TargetGroupAttribute, TargetHealthStateEnum, TargetTypeEnum,
};
use aws_sdk_elasticloadbalancingv2::Client;
use tracing::debug;

use alb_ingress_common::{Error, Result, Tags};

use crate::sdk::sdk_err;
use crate::types::{
    ConditionField, HealthCheck, ListenerDesc, LoadBalancerDesc, Protocol, RuleCondition,
    RuleDesc, RulePriority, Scheme, Target, TargetGroupDesc, TargetState,
};

/// `DescribeTags` accepts at most this many resource ARNs per call.
const DESCRIBE_TAGS_CHUNK: usize = 20;

/// ELBv2 operations the reconciliation tree performs.
#[async_trait]
pub trait ElbApi: Send + Sync {
    /// `CreateLoadBalancer`; returns the server state including ARN and DNS name
    async fn create_load_balancer(&self, lb: &LoadBalancerDesc) -> Result<LoadBalancerDesc>;
    /// `DeleteLoadBalancer`
    async fn delete_load_balancer(&self, arn: &str) -> Result<()>;
    /// `SetSubnets`
    async fn set_subnets(&self, arn: &str, subnets: &[String]) -> Result<()>;
    /// `SetSecurityGroups`
    async fn set_security_groups(&self, arn: &str, groups: &[String]) -> Result<()>;
    /// `AddTags`
    async fn add_tags(&self, arn: &str, tags: &Tags) -> Result<()>;
    /// `RemoveTags`
    async fn remove_tags(&self, arn: &str, keys: &[String]) -> Result<()>;
    /// `DescribeLoadBalancers`, fully paginated, application LBs only
    async fn list_load_balancers(&self) -> Result<Vec<LoadBalancerDesc>>;
    /// `DescribeTags` for a set of resource ARNs, keyed by ARN
    async fn resource_tags(&self, arns: &[String]) -> Result<HashMap<String, Tags>>;

    /// `CreateListener`
    async fn create_listener(&self, lb_arn: &str, listener: &ListenerDesc)
        -> Result<ListenerDesc>;
    /// `ModifyListener`
    async fn modify_listener(&self, arn: &str, listener: &ListenerDesc) -> Result<ListenerDesc>;
    /// `DeleteListener`
    async fn delete_listener(&self, arn: &str) -> Result<()>;
    /// `DescribeListeners` for one load balancer
    async fn listeners(&self, lb_arn: &str) -> Result<Vec<ListenerDesc>>;

    /// `CreateRule`; the desired priority must not be the default sentinel
    async fn create_rule(&self, listener_arn: &str, rule: &RuleDesc) -> Result<RuleDesc>;
    /// `ModifyRule`; conditions and action only, priority is immutable here
    async fn modify_rule(&self, arn: &str, rule: &RuleDesc) -> Result<RuleDesc>;
    /// `DeleteRule`
    async fn delete_rule(&self, arn: &str) -> Result<()>;
    /// `DescribeRules` for one listener
    async fn rules(&self, listener_arn: &str) -> Result<Vec<RuleDesc>>;

    /// `CreateTargetGroup` with identity tags
    async fn create_target_group(
        &self,
        tg: &TargetGroupDesc,
        tags: &Tags,
    ) -> Result<TargetGroupDesc>;
    /// `ModifyTargetGroup`; health-check fields only
    async fn modify_target_group(
        &self,
        arn: &str,
        health_check: &HealthCheck,
    ) -> Result<TargetGroupDesc>;
    /// `ModifyTargetGroupAttributes` for the deregistration delay
    async fn modify_target_group_attributes(
        &self,
        arn: &str,
        deregistration_delay_seconds: u32,
    ) -> Result<()>;
    /// `DeleteTargetGroup`
    async fn delete_target_group(&self, arn: &str) -> Result<()>;
    /// `DescribeTargetGroups` for one load balancer
    async fn target_groups(&self, lb_arn: &str) -> Result<Vec<TargetGroupDesc>>;
    /// `RegisterTargets`, one batch call
    async fn register_targets(&self, tg_arn: &str, targets: &[Target]) -> Result<()>;
    /// `DeregisterTargets`, one batch call
    async fn deregister_targets(&self, tg_arn: &str, targets: &[Target]) -> Result<()>;
    /// `DescribeTargetHealth`
    async fn target_health(&self, tg_arn: &str) -> Result<Vec<(Target, TargetState)>>;

    /// Cheap read used by the health endpoint
    async fn probe(&self) -> Result<()>;
}

/// SDK-backed [`ElbApi`] implementation.
#[derive(Clone)]
pub struct AwsElb {
    client: Client,
}

impl AwsElb {
    /// Create a client from a shared AWS config
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: Client::new(config),
        }
    }
}

fn protocol_to_sdk(p: Protocol) -> ProtocolEnum {
    match p {
        Protocol::Http => ProtocolEnum::Http,
        Protocol::Https => ProtocolEnum::Https,
    }
}

fn protocol_from_sdk(p: Option<&ProtocolEnum>) -> Result<Protocol> {
    let p = p.ok_or_else(|| Error::internal_with_context("elbv2", "resource without protocol"))?;
    p.as_str().parse()
}

fn scheme_to_sdk(s: Scheme) -> LoadBalancerSchemeEnum {
    match s {
        Scheme::Internal => LoadBalancerSchemeEnum::Internal,
        Scheme::InternetFacing => LoadBalancerSchemeEnum::InternetFacing,
    }
}

fn forward_action(target_group_arn: &str) -> Result<Action> {
    Ok(Action::builder()
        .r#type(ActionTypeEnum::Forward)
        .target_group_arn(target_group_arn)
        .build())
}

fn sdk_tags(tags: &Tags) -> Result<Vec<Tag>> {
    Ok(tags
        .iter()
        .map(|(k, v)| Tag::builder().key(k).value(v).build())
        .collect())
}

fn target_description(t: &Target) -> Result<TargetDescription> {
    Ok(TargetDescription::builder()
        .id(&t.instance_id)
        .port(t.port)
        .build())
}

fn lb_from_sdk(
    lb: &aws_sdk_elasticloadbalancingv2::types::LoadBalancer,
    tags: Tags,
) -> Result<LoadBalancerDesc> {
    let scheme = lb
        .scheme()
        .map(|s| s.as_str().parse())
        .transpose()?
        .unwrap_or(Scheme::Internal);
    let mut subnets: Vec<String> = lb
        .availability_zones()
        .iter()
        .filter_map(|az| az.subnet_id().map(str::to_string))
        .collect();
    subnets.sort();
    let mut security_groups: Vec<String> =
        lb.security_groups().iter().map(String::from).collect();
    security_groups.sort();

    Ok(LoadBalancerDesc {
        name: lb.load_balancer_name().unwrap_or_default().to_string(),
        arn: lb.load_balancer_arn().map(str::to_string),
        dns_name: lb.dns_name().map(str::to_string),
        scheme,
        subnets,
        security_groups,
        tags,
    })
}

fn listener_from_sdk(
    l: &aws_sdk_elasticloadbalancingv2::types::Listener,
) -> Result<ListenerDesc> {
    let default_target_group_arn = l
        .default_actions()
        .iter()
        .find_map(|a| a.target_group_arn().map(str::to_string));
    Ok(ListenerDesc {
        arn: l.listener_arn().map(str::to_string),
        port: l
            .port()
            .ok_or_else(|| Error::internal_with_context("elbv2", "listener without port"))?,
        protocol: protocol_from_sdk(l.protocol())?,
        certificate_arn: l
            .certificates()
            .iter()
            .find_map(|c| c.certificate_arn().map(str::to_string)),
        ssl_policy: l.ssl_policy().map(str::to_string),
        default_target_group_arn,
    })
}

fn rule_from_sdk(r: &aws_sdk_elasticloadbalancingv2::types::Rule) -> Result<RuleDesc> {
    let priority = match r.priority() {
        Some(p) => RulePriority::parse(p)?,
        None if r.is_default().unwrap_or(false) => RulePriority::Default,
        None => {
            return Err(Error::internal_with_context(
                "elbv2",
                "rule without priority",
            ))
        }
    };

    let mut conditions = Vec::new();
    for c in r.conditions() {
        let Some(field) = c.field() else { continue };
        // Fields this controller does not manage (e.g. source-ip added out
        // of band) would make the diff unstable; reject them instead.
        let field = ConditionField::parse(field)?;
        conditions.push(RuleCondition {
            field,
            values: c.values().iter().map(String::from).collect(),
        });
    }

    Ok(RuleDesc {
        arn: r.rule_arn().map(str::to_string),
        priority,
        conditions,
        target_group_arn: r
            .actions()
            .iter()
            .find_map(|a| a.target_group_arn().map(str::to_string)),
    })
}

fn tg_from_sdk(
    tg: &aws_sdk_elasticloadbalancingv2::types::TargetGroup,
) -> Result<TargetGroupDesc> {
    Ok(TargetGroupDesc {
        arn: tg.target_group_arn().map(str::to_string),
        name: tg.target_group_name().unwrap_or_default().to_string(),
        protocol: protocol_from_sdk(tg.protocol())?,
        port: tg
            .port()
            .ok_or_else(|| Error::internal_with_context("elbv2", "target group without port"))?,
        vpc_id: tg.vpc_id().unwrap_or_default().to_string(),
        health_check: HealthCheck {
            path: tg.health_check_path().unwrap_or("/").to_string(),
            interval_seconds: tg.health_check_interval_seconds().unwrap_or(15),
            timeout_seconds: tg.health_check_timeout_seconds().unwrap_or(5),
            healthy_threshold: tg.healthy_threshold_count().unwrap_or(2),
            unhealthy_threshold: tg.unhealthy_threshold_count().unwrap_or(2),
            protocol: tg
                .health_check_protocol()
                .map(|p| p.as_str().parse())
                .transpose()?
                .unwrap_or(Protocol::Http),
            port: tg.health_check_port().unwrap_or("traffic-port").to_string(),
        },
    })
}

fn sdk_conditions(conditions: &[RuleCondition]) -> Vec<SdkRuleCondition> {
    conditions
        .iter()
        .map(|c| {
            SdkRuleCondition::builder()
                .field(c.field.as_str())
                .set_values(Some(c.values.clone()))
                .build()
        })
        .collect()
}

fn required_target_group(rule: &RuleDesc) -> Result<&str> {
    rule.target_group_arn
        .as_deref()
        .ok_or_else(|| Error::internal_with_context("elbv2", "rule action without target group"))
}

#[async_trait]
impl ElbApi for AwsElb {
    async fn create_load_balancer(&self, lb: &LoadBalancerDesc) -> Result<LoadBalancerDesc> {
        debug!(name = %lb.name, scheme = %lb.scheme, "creating load balancer");
        let out = self
            .client
            .create_load_balancer()
            .name(&lb.name)
            .r#type(LoadBalancerTypeEnum::Application)
            .scheme(scheme_to_sdk(lb.scheme))
            .set_subnets(Some(lb.subnets.clone()))
            .set_security_groups(Some(lb.security_groups.clone()))
            .set_tags(Some(sdk_tags(&lb.tags)?))
            .send()
            .await
            .map_err(|e| sdk_err("CreateLoadBalancer", e))?;

        let created = out
            .load_balancers()
            .first()
            .ok_or_else(|| Error::internal_with_context("elbv2", "CreateLoadBalancer returned nothing"))?;
        lb_from_sdk(created, lb.tags.clone())
    }

    async fn delete_load_balancer(&self, arn: &str) -> Result<()> {
        self.client
            .delete_load_balancer()
            .load_balancer_arn(arn)
            .send()
            .await
            .map_err(|e| sdk_err("DeleteLoadBalancer", e))?;
        Ok(())
    }

    async fn set_subnets(&self, arn: &str, subnets: &[String]) -> Result<()> {
        self.client
            .set_subnets()
            .load_balancer_arn(arn)
            .set_subnets(Some(subnets.to_vec()))
            .send()
            .await
            .map_err(|e| sdk_err("SetSubnets", e))?;
        Ok(())
    }

    async fn set_security_groups(&self, arn: &str, groups: &[String]) -> Result<()> {
        self.client
            .set_security_groups()
            .load_balancer_arn(arn)
            .set_security_groups(Some(groups.to_vec()))
            .send()
            .await
            .map_err(|e| sdk_err("SetSecurityGroups", e))?;
        Ok(())
    }

    async fn add_tags(&self, arn: &str, tags: &Tags) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        self.client
            .add_tags()
            .resource_arns(arn)
            .set_tags(Some(sdk_tags(tags)?))
            .send()
            .await
            .map_err(|e| sdk_err("AddTags", e))?;
        Ok(())
    }

    async fn remove_tags(&self, arn: &str, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.client
            .remove_tags()
            .resource_arns(arn)
            .set_tag_keys(Some(keys.to_vec()))
            .send()
            .await
            .map_err(|e| sdk_err("RemoveTags", e))?;
        Ok(())
    }

    async fn list_load_balancers(&self) -> Result<Vec<LoadBalancerDesc>> {
        let mut out = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = self
                .client
                .describe_load_balancers()
                .set_marker(marker.clone())
                .send()
                .await
                .map_err(|e| sdk_err("DescribeLoadBalancers", e))?;

            for lb in page.load_balancers() {
                if lb.r#type() != Some(&LoadBalancerTypeEnum::Application) {
                    continue;
                }
                out.push(lb_from_sdk(lb, Tags::new())?);
            }

            marker = page.next_marker().map(str::to_string);
            if marker.is_none() {
                break;
            }
        }
        Ok(out)
    }

    async fn resource_tags(&self, arns: &[String]) -> Result<HashMap<String, Tags>> {
        let mut out = HashMap::new();
        for chunk in arns.chunks(DESCRIBE_TAGS_CHUNK) {
            let page = self
                .client
                .describe_tags()
                .set_resource_arns(Some(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| sdk_err("DescribeTags", e))?;

            for desc in page.tag_descriptions() {
                let Some(arn) = desc.resource_arn() else { continue };
                let tags: Tags = desc
                    .tags()
                    .iter()
                    .filter_map(|t| {
                        t.key()
                            .map(|k| (k.to_string(), t.value().unwrap_or_default().to_string()))
                    })
                    .collect();
                out.insert(arn.to_string(), tags);
            }
        }
        Ok(out)
    }

    async fn create_listener(
        &self,
        lb_arn: &str,
        listener: &ListenerDesc,
    ) -> Result<ListenerDesc> {
        let tg_arn = listener.default_target_group_arn.as_deref().ok_or_else(|| {
            Error::internal_with_context("elbv2", "listener default action unresolved")
        })?;

        let mut req = self
            .client
            .create_listener()
            .load_balancer_arn(lb_arn)
            .port(listener.port)
            .protocol(protocol_to_sdk(listener.protocol))
            .default_actions(forward_action(tg_arn)?);
        if let Some(cert) = &listener.certificate_arn {
            req = req.certificates(Certificate::builder().certificate_arn(cert).build());
        }
        if let Some(policy) = &listener.ssl_policy {
            req = req.ssl_policy(policy);
        }

        let out = req
            .send()
            .await
            .map_err(|e| sdk_err("CreateListener", e))?;
        let created = out
            .listeners()
            .first()
            .ok_or_else(|| Error::internal_with_context("elbv2", "CreateListener returned nothing"))?;
        listener_from_sdk(created)
    }

    async fn modify_listener(&self, arn: &str, listener: &ListenerDesc) -> Result<ListenerDesc> {
        let tg_arn = listener.default_target_group_arn.as_deref().ok_or_else(|| {
            Error::internal_with_context("elbv2", "listener default action unresolved")
        })?;

        let mut req = self
            .client
            .modify_listener()
            .listener_arn(arn)
            .port(listener.port)
            .protocol(protocol_to_sdk(listener.protocol))
            .default_actions(forward_action(tg_arn)?);
        if let Some(cert) = &listener.certificate_arn {
            req = req.certificates(Certificate::builder().certificate_arn(cert).build());
        }
        if let Some(policy) = &listener.ssl_policy {
            req = req.ssl_policy(policy);
        }

        let out = req
            .send()
            .await
            .map_err(|e| sdk_err("ModifyListener", e))?;
        let modified = out
            .listeners()
            .first()
            .ok_or_else(|| Error::internal_with_context("elbv2", "ModifyListener returned nothing"))?;
        listener_from_sdk(modified)
    }

    async fn delete_listener(&self, arn: &str) -> Result<()> {
        self.client
            .delete_listener()
            .listener_arn(arn)
            .send()
            .await
            .map_err(|e| sdk_err("DeleteListener", e))?;
        Ok(())
    }

    async fn listeners(&self, lb_arn: &str) -> Result<Vec<ListenerDesc>> {
        let mut out = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = self
                .client
                .describe_listeners()
                .load_balancer_arn(lb_arn)
                .set_marker(marker.clone())
                .send()
                .await
                .map_err(|e| sdk_err("DescribeListeners", e))?;

            for l in page.listeners() {
                out.push(listener_from_sdk(l)?);
            }

            marker = page.next_marker().map(str::to_string);
            if marker.is_none() {
                break;
            }
        }
        Ok(out)
    }

    async fn create_rule(&self, listener_arn: &str, rule: &RuleDesc) -> Result<RuleDesc> {
        let RulePriority::Number(priority) = rule.priority else {
            return Err(Error::internal_with_context(
                "elbv2",
                "default rules are owned by the listener and cannot be created",
            ));
        };

        let out = self
            .client
            .create_rule()
            .listener_arn(listener_arn)
            .priority(priority as i32)
            .set_conditions(Some(sdk_conditions(&rule.conditions)))
            .actions(forward_action(required_target_group(rule)?)?)
            .send()
            .await
            .map_err(|e| sdk_err("CreateRule", e))?;

        let created = out
            .rules()
            .first()
            .ok_or_else(|| Error::internal_with_context("elbv2", "CreateRule returned nothing"))?;
        rule_from_sdk(created)
    }

    async fn modify_rule(&self, arn: &str, rule: &RuleDesc) -> Result<RuleDesc> {
        let out = self
            .client
            .modify_rule()
            .rule_arn(arn)
            .set_conditions(Some(sdk_conditions(&rule.conditions)))
            .actions(forward_action(required_target_group(rule)?)?)
            .send()
            .await
            .map_err(|e| sdk_err("ModifyRule", e))?;

        let modified = out
            .rules()
            .first()
            .ok_or_else(|| Error::internal_with_context("elbv2", "ModifyRule returned nothing"))?;
        rule_from_sdk(modified)
    }

    async fn delete_rule(&self, arn: &str) -> Result<()> {
        self.client
            .delete_rule()
            .rule_arn(arn)
            .send()
            .await
            .map_err(|e| sdk_err("DeleteRule", e))?;
        Ok(())
    }

    async fn rules(&self, listener_arn: &str) -> Result<Vec<RuleDesc>> {
        let mut out = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = self
                .client
                .describe_rules()
                .listener_arn(listener_arn)
                .set_marker(marker.clone())
                .send()
                .await
                .map_err(|e| sdk_err("DescribeRules", e))?;

            for r in page.rules() {
                out.push(rule_from_sdk(r)?);
            }

            marker = page.next_marker().map(str::to_string);
            if marker.is_none() {
                break;
            }
        }
        Ok(out)
    }

    async fn create_target_group(
        &self,
        tg: &TargetGroupDesc,
        tags: &Tags,
    ) -> Result<TargetGroupDesc> {
        debug!(name = %tg.name, port = tg.port, "creating target group");
        let hc = &tg.health_check;
        let out = self
            .client
            .create_target_group()
            .name(&tg.name)
            .protocol(protocol_to_sdk(tg.protocol))
            .port(tg.port)
            .vpc_id(&tg.vpc_id)
            .target_type(TargetTypeEnum::Instance)
            .health_check_path(&hc.path)
            .health_check_interval_seconds(hc.interval_seconds)
            .health_check_timeout_seconds(hc.timeout_seconds)
            .healthy_threshold_count(hc.healthy_threshold)
            .unhealthy_threshold_count(hc.unhealthy_threshold)
            .health_check_protocol(protocol_to_sdk(hc.protocol))
            .health_check_port(&hc.port)
            .set_tags(Some(sdk_tags(tags)?))
            .send()
            .await
            .map_err(|e| sdk_err("CreateTargetGroup", e))?;

        let created = out
            .target_groups()
            .first()
            .ok_or_else(|| {
                Error::internal_with_context("elbv2", "CreateTargetGroup returned nothing")
            })?;
        tg_from_sdk(created)
    }

    async fn modify_target_group(
        &self,
        arn: &str,
        health_check: &HealthCheck,
    ) -> Result<TargetGroupDesc> {
        let out = self
            .client
            .modify_target_group()
            .target_group_arn(arn)
            .health_check_path(&health_check.path)
            .health_check_interval_seconds(health_check.interval_seconds)
            .health_check_timeout_seconds(health_check.timeout_seconds)
            .healthy_threshold_count(health_check.healthy_threshold)
            .unhealthy_threshold_count(health_check.unhealthy_threshold)
            .health_check_protocol(protocol_to_sdk(health_check.protocol))
            .health_check_port(&health_check.port)
            .send()
            .await
            .map_err(|e| sdk_err("ModifyTargetGroup", e))?;

        let modified = out
            .target_groups()
            .first()
            .ok_or_else(|| {
                Error::internal_with_context("elbv2", "ModifyTargetGroup returned nothing")
            })?;
        tg_from_sdk(modified)
    }

    async fn modify_target_group_attributes(
        &self,
        arn: &str,
        deregistration_delay_seconds: u32,
    ) -> Result<()> {
        self.client
            .modify_target_group_attributes()
            .target_group_arn(arn)
            .attributes(
                TargetGroupAttribute::builder()
                    .key("deregistration_delay.timeout_seconds")
                    .value(deregistration_delay_seconds.to_string())
                    .build(),
            )
            .send()
            .await
            .map_err(|e| sdk_err("ModifyTargetGroupAttributes", e))?;
        Ok(())
    }

    async fn delete_target_group(&self, arn: &str) -> Result<()> {
        self.client
            .delete_target_group()
            .target_group_arn(arn)
            .send()
            .await
            .map_err(|e| sdk_err("DeleteTargetGroup", e))?;
        Ok(())
    }

    async fn target_groups(&self, lb_arn: &str) -> Result<Vec<TargetGroupDesc>> {
        let mut out = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = self
                .client
                .describe_target_groups()
                .load_balancer_arn(lb_arn)
                .set_marker(marker.clone())
                .send()
                .await
                .map_err(|e| sdk_err("DescribeTargetGroups", e))?;

            for tg in page.target_groups() {
                out.push(tg_from_sdk(tg)?);
            }

            marker = page.next_marker().map(str::to_string);
            if marker.is_none() {
                break;
            }
        }
        Ok(out)
    }

    async fn register_targets(&self, tg_arn: &str, targets: &[Target]) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let descriptions: Result<Vec<TargetDescription>> =
            targets.iter().map(target_description).collect();
        self.client
            .register_targets()
            .target_group_arn(tg_arn)
            .set_targets(Some(descriptions?))
            .send()
            .await
            .map_err(|e| sdk_err("RegisterTargets", e))?;
        Ok(())
    }

    async fn deregister_targets(&self, tg_arn: &str, targets: &[Target]) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let descriptions: Result<Vec<TargetDescription>> =
            targets.iter().map(target_description).collect();
        self.client
            .deregister_targets()
            .target_group_arn(tg_arn)
            .set_targets(Some(descriptions?))
            .send()
            .await
            .map_err(|e| sdk_err("DeregisterTargets", e))?;
        Ok(())
    }

    async fn target_health(&self, tg_arn: &str) -> Result<Vec<(Target, TargetState)>> {
        let out = self
            .client
            .describe_target_health()
            .target_group_arn(tg_arn)
            .send()
            .await
            .map_err(|e| sdk_err("DescribeTargetHealth", e))?;

        let mut result = Vec::new();
        for desc in out.target_health_descriptions() {
            let Some(target) = desc.target() else { continue };
            let Some(id) = target.id() else { continue };
            let state = match desc.target_health().and_then(|h| h.state()) {
                Some(TargetHealthStateEnum::Healthy) => TargetState::Healthy,
                Some(TargetHealthStateEnum::Initial) => TargetState::Initial,
                Some(TargetHealthStateEnum::Draining) => TargetState::Draining,
                Some(TargetHealthStateEnum::Unhealthy) => TargetState::Unhealthy,
                Some(TargetHealthStateEnum::Unused) => TargetState::Unused,
                _ => TargetState::Unavailable,
            };
            result.push((
                Target::new(id, target.port().unwrap_or_default()),
                state,
            ));
        }
        Ok(result)
    }

    async fn probe(&self) -> Result<()> {
        self.client
            .describe_load_balancers()
            .page_size(1)
            .send()
            .await
            .map_err(|e| sdk_err("DescribeLoadBalancers", e))?;
        Ok(())
    }
}
