//! Translation of one Ingress object into one desired load balancer tree.
//!
//! Deterministic: identical Ingress specs always yield identical trees,
//! including rule priorities (assigned in spec iteration order starting
//! at 1). The only I/O is the service resolver. One listener per declared
//! port, one rule per `{host, path}` pair, one target group per unique
//! `{service, node port, protocol}` triple.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;

use alb_ingress_aws::types::{
    ListenerDesc, LoadBalancerDesc, Protocol, Target, TargetGroupDesc, MAX_RULE_PRIORITY,
};
use alb_ingress_common::{
    cluster_tag_key, Error, Result, Tags, CLUSTER_TAG_OWNED, INGRESS_NAME_TAG, MANAGED_BY_TAG,
    MANAGED_BY_VALUE, SERVICE_NAME_TAG,
};

use crate::alb::{Listener, LoadBalancer, Rule, TargetGroup, Targets};
use crate::annotations::IngressAnnotations;
use crate::name;
use crate::resolver::{BackendPort, ServiceResolver};

/// Everything the assembler needs besides the resolver.
pub struct AssembleInput<'a> {
    /// The Ingress being translated
    pub ingress: &'a Ingress,
    /// Its validated annotations
    pub annotations: &'a IngressAnnotations,
    /// Cluster name, part of every derived name and tag
    pub cluster: &'a str,
    /// VPC the subnets live in
    pub vpc_id: &'a str,
    /// Resolved subnet ids
    pub subnet_ids: Vec<String>,
    /// EC2 instance ids of the cluster's nodes
    pub instance_ids: &'a [String],
}

/// One `{host, path} → service` routing entry extracted from the spec.
#[derive(Clone, Debug)]
struct Backend {
    host: Option<String>,
    path: Option<String>,
    service: String,
    port: BackendPort,
}

/// Assemble the desired tree for one Ingress.
pub async fn assemble(
    input: AssembleInput<'_>,
    resolver: &dyn ServiceResolver,
) -> Result<LoadBalancer> {
    let namespace = input.ingress.namespace().unwrap_or_else(|| "default".into());
    let ingress_name = input.ingress.name_any();
    let ingress_key = format!("{namespace}/{ingress_name}");

    let backends = extract_backends(input.ingress, &ingress_key)?;
    if backends.is_empty() {
        return Err(Error::validation_for(
            &ingress_key,
            "Ingress declares no service backends",
        ));
    }
    if backends.len() as u32 > MAX_RULE_PRIORITY {
        return Err(Error::validation_for(
            &ingress_key,
            format!(
                "{} rules exceed the ELBv2 per-listener limit of {MAX_RULE_PRIORITY}",
                backends.len()
            ),
        ));
    }

    let mut tags = Tags::new();
    tags.insert(cluster_tag_key(input.cluster), CLUSTER_TAG_OWNED);
    tags.insert(INGRESS_NAME_TAG, ingress_key.as_str());
    tags.insert(MANAGED_BY_TAG, MANAGED_BY_VALUE);
    tags.merge(&input.annotations.tags);

    // One target group per unique {service, node port, protocol}
    let backend_protocol = input.annotations.backend_protocol;
    let mut node_ports: BTreeMap<String, i32> = BTreeMap::new();
    let mut target_groups: Vec<TargetGroup> = Vec::new();
    for backend in &backends {
        if node_ports.contains_key(&backend.service) {
            continue;
        }
        let node_port = resolver
            .node_port(&namespace, &backend.service, &backend.port)
            .await?;
        node_ports.insert(backend.service.clone(), node_port);

        let tg_name = name::target_group_name(
            input.cluster,
            &namespace,
            &ingress_name,
            &backend.service,
            node_port,
            backend_protocol.as_str(),
        );
        let mut tg_tags = tags.clone();
        tg_tags.insert(SERVICE_NAME_TAG, backend.service.as_str());

        let desired_targets: BTreeSet<Target> = input
            .instance_ids
            .iter()
            .map(|id| Target::new(id.clone(), node_port))
            .collect();

        target_groups.push(TargetGroup::new_desired(
            &backend.service,
            TargetGroupDesc {
                arn: None,
                name: tg_name,
                protocol: backend_protocol,
                port: node_port,
                vpc_id: input.vpc_id.to_string(),
                health_check: input.annotations.health_check.clone(),
            },
            tg_tags,
            Targets::from_desired(desired_targets),
        ));
    }

    // The listener default action forwards to the first backend in spec
    // iteration order (or the explicit default backend, which sorts first)
    let default_service = backends[0].service.clone();

    // One rule per {host, path} pair, priorities in spec order from 1.
    // The default backend produced a condition-less entry that the
    // listener owns; skip it here.
    let rules: Vec<Rule> = backends
        .iter()
        .filter(|b| b.host.is_some() || b.path.is_some())
        .enumerate()
        .map(|(i, b)| {
            Rule::new_desired(
                i as u32 + 1,
                b.host.as_deref(),
                b.path.as_deref(),
                &b.service,
            )
        })
        .collect();

    let listeners: Vec<Listener> = input
        .annotations
        .listen_ports
        .iter()
        .map(|pp| {
            let https = pp.protocol == Protocol::Https;
            Listener::new_desired(
                ListenerDesc {
                    arn: None,
                    port: pp.port,
                    protocol: pp.protocol,
                    certificate_arn: if https {
                        input.annotations.certificate_arn.clone()
                    } else {
                        None
                    },
                    ssl_policy: if https {
                        input.annotations.ssl_policy.clone()
                    } else {
                        None
                    },
                    default_target_group_arn: None,
                },
                &default_service,
                rules.clone(),
            )
        })
        .collect();

    let mut subnets = input.subnet_ids;
    subnets.sort();
    let mut security_groups = input.annotations.security_groups.clone();
    security_groups.sort();

    let lb_name = name::load_balancer_name(input.cluster, &namespace, &ingress_name);
    let managed_sg = input
        .annotations
        .managed_security_groups()
        .then(|| name::security_group_name(input.cluster, &ingress_name));

    Ok(LoadBalancer {
        name: lb_name.clone(),
        ingress_key,
        current: None,
        desired: Some(LoadBalancerDesc {
            name: lb_name,
            arn: None,
            dns_name: None,
            scheme: input.annotations.scheme,
            subnets,
            security_groups,
            tags,
        }),
        listeners,
        target_groups,
        managed_sg,
        deleted: false,
    })
}

/// The `{namespace}/{service}` pairs an Ingress routes to; feeds the
/// endpoint-event fan-out index.
pub fn referenced_services(ingress: &Ingress) -> HashSet<String> {
    let namespace = ingress.namespace().unwrap_or_else(|| "default".into());
    let key = format!(
        "{namespace}/{}",
        ingress.name_any()
    );
    extract_backends(ingress, &key)
        .map(|backends| {
            backends
                .into_iter()
                .map(|b| format!("{namespace}/{}", b.service))
                .collect()
        })
        .unwrap_or_default()
}

fn extract_backends(ingress: &Ingress, ingress_key: &str) -> Result<Vec<Backend>> {
    let mut backends = Vec::new();

    let Some(spec) = &ingress.spec else {
        return Ok(backends);
    };

    // An explicit default backend is the listener default action; it
    // sorts first so it is also the fallback default service
    if let Some(default) = &spec.default_backend {
        if let Some(svc) = &default.service {
            backends.push(Backend {
                host: None,
                path: None,
                service: svc.name.clone(),
                port: backend_port(ingress_key, &svc.port)?,
            });
        }
    }

    for rule in spec.rules.as_deref().unwrap_or_default() {
        let Some(http) = &rule.http else { continue };
        for path in &http.paths {
            let Some(svc) = &path.backend.service else {
                return Err(Error::validation_for(
                    ingress_key,
                    "only service backends are supported",
                ));
            };
            backends.push(Backend {
                host: rule.host.clone().filter(|h| !h.is_empty()),
                path: path.path.clone().filter(|p| !p.is_empty()),
                service: svc.name.clone(),
                port: backend_port(ingress_key, &svc.port)?,
            });
        }
    }

    Ok(backends)
}

fn backend_port(
    ingress_key: &str,
    port: &Option<k8s_openapi::api::networking::v1::ServiceBackendPort>,
) -> Result<BackendPort> {
    let Some(port) = port else {
        return Err(Error::validation_for(
            ingress_key,
            "Ingress backend declares no service port",
        ));
    };
    if let Some(number) = port.number {
        return Ok(BackendPort::Number(number));
    }
    if let Some(name) = &port.name {
        return Ok(BackendPort::Name(name.clone()));
    }
    Err(Error::validation_for(
        ingress_key,
        "Ingress backend declares neither a port number nor a port name",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::PortProtocol;
    use alb_ingress_aws::types::{ConditionField, HealthCheck, RulePriority, Scheme};
    use async_trait::async_trait;
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule, IngressServiceBackend,
        IngressSpec, ServiceBackendPort,
    };
    use kube::api::ObjectMeta;
    use std::collections::HashMap;

    struct FixedResolver {
        node_ports: HashMap<String, i32>,
    }

    #[async_trait]
    impl ServiceResolver for FixedResolver {
        async fn node_port(
            &self,
            _namespace: &str,
            service: &str,
            _port: &BackendPort,
        ) -> Result<i32> {
            self.node_ports
                .get(service)
                .copied()
                .ok_or_else(|| Error::validation(format!("unknown service {service}")))
        }
    }

    fn resolver(entries: &[(&str, i32)]) -> FixedResolver {
        FixedResolver {
            node_ports: entries
                .iter()
                .map(|(s, p)| (s.to_string(), *p))
                .collect(),
        }
    }

    fn ingress(rules: Vec<IngressRule>) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(rules),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn http_rule(host: &str, paths: Vec<(&str, &str)>) -> IngressRule {
        IngressRule {
            host: Some(host.to_string()),
            http: Some(HTTPIngressRuleValue {
                paths: paths
                    .into_iter()
                    .map(|(path, svc)| HTTPIngressPath {
                        path: Some(path.to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: svc.to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(80),
                                    name: None,
                                }),
                            }),
                            resource: None,
                        },
                    })
                    .collect(),
            }),
        }
    }

    fn default_annotations() -> IngressAnnotations {
        IngressAnnotations {
            scheme: Scheme::InternetFacing,
            subnets: vec!["subnet-a".to_string(), "subnet-b".to_string()],
            security_groups: vec![],
            listen_ports: vec![PortProtocol {
                protocol: Protocol::Http,
                port: 80,
            }],
            certificate_arn: None,
            ssl_policy: None,
            backend_protocol: Protocol::Http,
            health_check: HealthCheck {
                path: "/".to_string(),
                interval_seconds: 15,
                timeout_seconds: 5,
                healthy_threshold: 2,
                unhealthy_threshold: 2,
                protocol: Protocol::Http,
                port: "traffic-port".to_string(),
            },
            tags: Tags::new(),
        }
    }

    fn input<'a>(
        ing: &'a Ingress,
        ann: &'a IngressAnnotations,
        instances: &'a [String],
    ) -> AssembleInput<'a> {
        AssembleInput {
            ingress: ing,
            annotations: ann,
            cluster: "cluster",
            vpc_id: "vpc-1",
            subnet_ids: vec!["subnet-a".to_string(), "subnet-b".to_string()],
            instance_ids: instances,
        }
    }

    #[tokio::test]
    async fn single_host_and_path_builds_the_minimal_tree() {
        let ing = ingress(vec![http_rule("foo.example.com", vec![("/", "svc-a")])]);
        let ann = default_annotations();
        let instances = vec!["i-aaa".to_string()];

        let lb = assemble(input(&ing, &ann, &instances), &resolver(&[("svc-a", 30080)]))
            .await
            .expect("assembly should succeed");

        let desired = lb.desired.as_ref().expect("lb desired set");
        assert_eq!(desired.scheme, Scheme::InternetFacing);
        assert!(lb.name.len() <= 32);

        assert_eq!(lb.listeners.len(), 1);
        let listener = &lb.listeners[0];
        assert_eq!(listener.port(), Some(80));
        assert_eq!(listener.default_service, "svc-a");

        assert_eq!(listener.rules.len(), 1);
        let rule = listener.rules[0].desired.as_ref().expect("rule desired set");
        assert_eq!(rule.priority, RulePriority::Number(1));
        assert_eq!(rule.conditions.len(), 2);
        assert_eq!(rule.conditions[0].field, ConditionField::HostHeader);
        assert_eq!(rule.conditions[0].values, vec!["foo.example.com"]);
        assert_eq!(rule.conditions[1].field, ConditionField::PathPattern);
        assert_eq!(rule.conditions[1].values, vec!["/"]);

        assert_eq!(lb.target_groups.len(), 1);
        let tg = lb.target_groups[0].desired.as_ref().expect("tg desired set");
        assert_eq!(tg.port, 30080);
        assert_eq!(
            lb.target_groups[0].targets.desired,
            [Target::new("i-aaa", 30080)].into()
        );
    }

    #[tokio::test]
    async fn priorities_follow_spec_iteration_order() {
        let ing = ingress(vec![
            http_rule("a.example.com", vec![("/x", "svc-a"), ("/y", "svc-b")]),
            http_rule("b.example.com", vec![("/z", "svc-a")]),
        ]);
        let ann = default_annotations();
        let instances = vec![];

        let lb = assemble(
            input(&ing, &ann, &instances),
            &resolver(&[("svc-a", 30080), ("svc-b", 30081)]),
        )
        .await
        .expect("assembly should succeed");

        let priorities: Vec<_> = lb.listeners[0]
            .rules
            .iter()
            .filter_map(|r| r.priority())
            .collect();
        assert_eq!(
            priorities,
            vec![
                RulePriority::Number(1),
                RulePriority::Number(2),
                RulePriority::Number(3)
            ]
        );

        // Determinism: a second assembly of the same spec is identical
        let again = assemble(
            input(&ing, &ann, &instances),
            &resolver(&[("svc-a", 30080), ("svc-b", 30081)]),
        )
        .await
        .expect("assembly should succeed");
        let again_priorities: Vec<_> = again.listeners[0]
            .rules
            .iter()
            .filter_map(|r| r.priority())
            .collect();
        assert_eq!(priorities, again_priorities);
        assert_eq!(lb.name, again.name);
    }

    #[tokio::test]
    async fn target_groups_dedup_by_service() {
        let ing = ingress(vec![
            http_rule("a.example.com", vec![("/x", "svc-a")]),
            http_rule("b.example.com", vec![("/y", "svc-a")]),
        ]);
        let ann = default_annotations();
        let instances = vec![];

        let lb = assemble(input(&ing, &ann, &instances), &resolver(&[("svc-a", 30080)]))
            .await
            .expect("assembly should succeed");

        assert_eq!(lb.target_groups.len(), 1);
    }

    #[tokio::test]
    async fn two_listeners_share_rules_and_target_groups() {
        let ing = ingress(vec![http_rule("foo.example.com", vec![("/", "svc-a")])]);
        let mut ann = default_annotations();
        ann.listen_ports = vec![
            PortProtocol {
                protocol: Protocol::Http,
                port: 80,
            },
            PortProtocol {
                protocol: Protocol::Https,
                port: 443,
            },
        ];
        ann.certificate_arn = Some("arn:aws:acm:us-east-1:123:certificate/abc".to_string());
        let instances = vec![];

        let lb = assemble(input(&ing, &ann, &instances), &resolver(&[("svc-a", 30080)]))
            .await
            .expect("assembly should succeed");

        assert_eq!(lb.listeners.len(), 2);
        assert_eq!(lb.target_groups.len(), 1);

        let https = &lb.listeners[1];
        let desired = https.desired.as_ref().expect("desired set");
        assert_eq!(desired.protocol, Protocol::Https);
        assert_eq!(
            desired.certificate_arn.as_deref(),
            Some("arn:aws:acm:us-east-1:123:certificate/abc")
        );
        assert_eq!(https.rules.len(), 1);
    }

    #[tokio::test]
    async fn managed_sg_intent_follows_annotations() {
        let ing = ingress(vec![http_rule("foo.example.com", vec![("/", "svc-a")])]);
        let ann = default_annotations();
        let instances = vec![];

        let lb = assemble(input(&ing, &ann, &instances), &resolver(&[("svc-a", 30080)]))
            .await
            .expect("assembly should succeed");
        assert_eq!(lb.managed_sg.as_deref(), Some("cluster-web"));

        let mut user_sg = default_annotations();
        user_sg.security_groups = vec!["sg-222".to_string(), "sg-111".to_string()];
        let lb = assemble(input(&ing, &user_sg, &instances), &resolver(&[("svc-a", 30080)]))
            .await
            .expect("assembly should succeed");
        assert_eq!(lb.managed_sg, None);
        assert_eq!(
            lb.desired.as_ref().expect("desired set").security_groups,
            vec!["sg-111", "sg-222"],
            "user security groups are carried sorted"
        );
    }

    #[tokio::test]
    async fn identity_tags_are_always_present() {
        let ing = ingress(vec![http_rule("foo.example.com", vec![("/", "svc-a")])]);
        let ann = default_annotations();
        let instances = vec![];

        let lb = assemble(input(&ing, &ann, &instances), &resolver(&[("svc-a", 30080)]))
            .await
            .expect("assembly should succeed");

        let tags = &lb.desired.as_ref().expect("desired set").tags;
        assert_eq!(tags.get("kubernetes.io/cluster/cluster"), Some("owned"));
        assert_eq!(tags.get("kubernetes.io/ingress-name"), Some("default/web"));
        assert_eq!(tags.get("ManagedBy"), Some("alb-ingress"));
    }

    #[tokio::test]
    async fn ingress_without_backends_fails_validation() {
        let ing = ingress(vec![]);
        let ann = default_annotations();
        let instances = vec![];

        let err = assemble(input(&ing, &ann, &instances), &resolver(&[]))
            .await
            .expect_err("no backends must fail validation");
        assert!(!err.is_retryable());
    }

    #[test]
    fn referenced_services_feed_the_fanout_index() {
        let ing = ingress(vec![
            http_rule("a.example.com", vec![("/x", "svc-a")]),
            http_rule("b.example.com", vec![("/y", "svc-b")]),
        ]);
        let services = referenced_services(&ing);
        assert!(services.contains("default/svc-a"));
        assert!(services.contains("default/svc-b"));
        assert_eq!(services.len(), 2);
    }
}
