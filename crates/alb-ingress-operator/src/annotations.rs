//! Parsing and validation of `alb.ingress.kubernetes.io/*` annotations.
//!
//! Annotation failures are validation errors: they are surfaced as
//! Kubernetes events on the Ingress and not retried until the spec
//! changes.

use std::collections::BTreeMap;
use std::str::FromStr;

use alb_ingress_aws::types::{HealthCheck, Protocol, Scheme};
use alb_ingress_common::{Error, Result, Tags};

use crate::ANNOTATION_PREFIX;

/// A declared listener endpoint from the `listen-ports` annotation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortProtocol {
    /// HTTP or HTTPS
    pub protocol: Protocol,
    /// 1-65535
    pub port: i32,
}

/// The validated annotation set of one Ingress.
#[derive(Clone, Debug)]
pub struct IngressAnnotations {
    /// internal or internet-facing; defaults to internal
    pub scheme: Scheme,
    /// Subnet ids or Name tags, ≥2 required
    pub subnets: Vec<String>,
    /// User-supplied security group ids; empty means controller-managed
    pub security_groups: Vec<String>,
    /// Declared listeners; defaults to `[{"HTTP":80}]`
    pub listen_ports: Vec<PortProtocol>,
    /// ACM certificate, required iff an HTTPS listener is declared
    pub certificate_arn: Option<String>,
    /// ELBv2 predefined SSL policy name
    pub ssl_policy: Option<String>,
    /// Target group protocol; defaults to HTTP
    pub backend_protocol: Protocol,
    /// Target group health check configuration
    pub health_check: HealthCheck,
    /// User tags merged into every managed resource
    pub tags: Tags,
}

impl IngressAnnotations {
    /// Parse and validate the annotation map of an Ingress.
    pub fn parse(annotations: &BTreeMap<String, String>, ingress_key: &str) -> Result<Self> {
        let get = |k: &str| annotations.get(&format!("{ANNOTATION_PREFIX}/{k}"));

        let scheme = match get("scheme") {
            Some(raw) => Scheme::from_str(raw).map_err(|e| {
                Error::validation_for_field(ingress_key, annotation_key("scheme"), e.to_string())
            })?,
            None => Scheme::Internal,
        };

        let subnets: Vec<String> = get("subnets")
            .map(|raw| split_list(raw))
            .unwrap_or_default();
        if subnets.len() < 2 {
            return Err(Error::validation_for_field(
                ingress_key,
                annotation_key("subnets"),
                format!(
                    "at least 2 subnets in distinct availability zones are required, got {}",
                    subnets.len()
                ),
            ));
        }

        let security_groups = get("security-groups")
            .map(|raw| split_list(raw))
            .unwrap_or_default();

        let backend_protocol = match get("backend-protocol") {
            Some(raw) => Protocol::from_str(raw).map_err(|e| {
                Error::validation_for_field(
                    ingress_key,
                    annotation_key("backend-protocol"),
                    e.to_string(),
                )
            })?,
            None => Protocol::Http,
        };

        let listen_ports = match get("listen-ports") {
            Some(raw) => parse_listen_ports(raw, ingress_key)?,
            None => vec![PortProtocol {
                protocol: Protocol::Http,
                port: 80,
            }],
        };

        let certificate_arn = get("certificate-arn").cloned();
        let wants_https = listen_ports.iter().any(|p| p.protocol == Protocol::Https);
        if wants_https && certificate_arn.is_none() {
            return Err(Error::validation_for_field(
                ingress_key,
                annotation_key("certificate-arn"),
                "an ACM certificate ARN is required for HTTPS listeners",
            ));
        }

        let health_check = HealthCheck {
            path: get("healthcheck-path").cloned().unwrap_or_else(|| "/".to_string()),
            interval_seconds: parse_number(get("healthcheck-interval-seconds"), 15, ingress_key)?,
            timeout_seconds: parse_number(get("healthcheck-timeout-seconds"), 5, ingress_key)?,
            healthy_threshold: parse_number(
                get("healthcheck-healthy-threshold-count"),
                2,
                ingress_key,
            )?,
            unhealthy_threshold: parse_number(
                get("healthcheck-unhealthy-threshold-count"),
                2,
                ingress_key,
            )?,
            protocol: match get("healthcheck-protocol") {
                Some(raw) => Protocol::from_str(raw).map_err(|e| {
                    Error::validation_for_field(
                        ingress_key,
                        annotation_key("healthcheck-protocol"),
                        e.to_string(),
                    )
                })?,
                None => backend_protocol,
            },
            port: get("healthcheck-port")
                .cloned()
                .unwrap_or_else(|| "traffic-port".to_string()),
        };

        let tags = match get("tags") {
            Some(raw) => Tags::parse_kv_list(raw).map_err(|e| {
                Error::validation_for_field(ingress_key, annotation_key("tags"), e.to_string())
            })?,
            None => Tags::new(),
        };

        Ok(Self {
            scheme,
            subnets,
            security_groups,
            listen_ports,
            certificate_arn,
            ssl_policy: get("ssl-policy").cloned(),
            backend_protocol,
            health_check,
            tags,
        })
    }

    /// Whether the controller manages the security group pair itself
    pub fn managed_security_groups(&self) -> bool {
        self.security_groups.is_empty()
    }
}

fn annotation_key(k: &str) -> String {
    format!("{ANNOTATION_PREFIX}/{k}")
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_number(raw: Option<&String>, default: i32, ingress_key: &str) -> Result<i32> {
    match raw {
        None => Ok(default),
        Some(s) => s.trim().parse::<i32>().map_err(|_| {
            Error::validation_for(ingress_key, format!("'{s}' is not a valid number"))
        }),
    }
}

/// Parse the `listen-ports` annotation: a JSON array of single-entry
/// objects, e.g. `[{"HTTP":80},{"HTTPS":443}]`.
fn parse_listen_ports(raw: &str, ingress_key: &str) -> Result<Vec<PortProtocol>> {
    let field = annotation_key("listen-ports");
    let entries: Vec<BTreeMap<String, u16>> = serde_json::from_str(raw).map_err(|e| {
        Error::validation_for_field(ingress_key, &field, format!("invalid JSON: {e}"))
    })?;

    let mut ports = Vec::new();
    for entry in &entries {
        if entry.len() != 1 {
            return Err(Error::validation_for_field(
                ingress_key,
                &field,
                "each entry must be a single {\"PROTOCOL\": port} object",
            ));
        }
        for (proto, port) in entry {
            let protocol = Protocol::from_str(proto).map_err(|e| {
                Error::validation_for_field(ingress_key, &field, e.to_string())
            })?;
            if *port == 0 {
                return Err(Error::validation_for_field(
                    ingress_key,
                    &field,
                    "port must be between 1 and 65535",
                ));
            }
            ports.push(PortProtocol {
                protocol,
                port: i32::from(*port),
            });
        }
    }

    if ports.is_empty() {
        return Err(Error::validation_for_field(
            ingress_key,
            &field,
            "at least one listener port is required",
        ));
    }

    let mut seen = std::collections::BTreeSet::new();
    for p in &ports {
        if !seen.insert(p.port) {
            return Err(Error::validation_for_field(
                ingress_key,
                &field,
                format!("port {} declared more than once", p.port),
            ));
        }
    }

    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (format!("{ANNOTATION_PREFIX}/{k}"), v.to_string()))
            .collect()
    }

    #[test]
    fn minimal_annotations_get_defaults() {
        let parsed = IngressAnnotations::parse(
            &annotations(&[("subnets", "subnet-a,subnet-b")]),
            "default/web",
        )
        .expect("minimal annotations should parse");

        assert_eq!(parsed.scheme, Scheme::Internal);
        assert_eq!(
            parsed.listen_ports,
            vec![PortProtocol {
                protocol: Protocol::Http,
                port: 80
            }]
        );
        assert_eq!(parsed.backend_protocol, Protocol::Http);
        assert!(parsed.managed_security_groups());
        assert_eq!(parsed.health_check.path, "/");
        assert_eq!(parsed.health_check.interval_seconds, 15);
        assert_eq!(parsed.health_check.port, "traffic-port");
    }

    #[test]
    fn listen_ports_json_parses() {
        let parsed = IngressAnnotations::parse(
            &annotations(&[
                ("subnets", "subnet-a,subnet-b"),
                ("listen-ports", r#"[{"HTTP":80},{"HTTPS":443}]"#),
                ("certificate-arn", "arn:aws:acm:us-east-1:123:certificate/abc"),
            ]),
            "default/web",
        )
        .expect("listen-ports should parse");

        assert_eq!(parsed.listen_ports.len(), 2);
        assert_eq!(parsed.listen_ports[1].protocol, Protocol::Https);
        assert_eq!(parsed.listen_ports[1].port, 443);
    }

    #[test]
    fn https_without_certificate_is_rejected() {
        let err = IngressAnnotations::parse(
            &annotations(&[
                ("subnets", "subnet-a,subnet-b"),
                ("listen-ports", r#"[{"HTTPS":443}]"#),
            ]),
            "default/web",
        )
        .expect_err("HTTPS without certificate must fail validation");

        assert!(!err.is_retryable());
        assert!(err.to_string().contains("certificate"));
    }

    #[test]
    fn fewer_than_two_subnets_is_rejected() {
        let err = IngressAnnotations::parse(
            &annotations(&[("subnets", "subnet-a")]),
            "default/web",
        )
        .expect_err("a single subnet must fail validation");
        assert!(err.to_string().contains("2 subnets"));
    }

    #[test]
    fn duplicate_listener_ports_are_rejected() {
        let err = IngressAnnotations::parse(
            &annotations(&[
                ("subnets", "subnet-a,subnet-b"),
                ("listen-ports", r#"[{"HTTP":80},{"HTTP":80}]"#),
            ]),
            "default/web",
        )
        .expect_err("duplicate ports must fail validation");
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn malformed_listen_ports_json_is_rejected() {
        let err = IngressAnnotations::parse(
            &annotations(&[
                ("subnets", "subnet-a,subnet-b"),
                ("listen-ports", "80,443"),
            ]),
            "default/web",
        )
        .expect_err("non-JSON listen-ports must fail validation");
        assert!(err.to_string().contains("invalid JSON"));
    }

    #[test]
    fn user_security_groups_disable_managed_mode() {
        let parsed = IngressAnnotations::parse(
            &annotations(&[
                ("subnets", "subnet-a,subnet-b"),
                ("security-groups", "sg-111,sg-222"),
            ]),
            "default/web",
        )
        .expect("security-groups should parse");

        assert!(!parsed.managed_security_groups());
        assert_eq!(parsed.security_groups, vec!["sg-111", "sg-222"]);
    }

    #[test]
    fn tags_annotation_merges_into_tag_set() {
        let parsed = IngressAnnotations::parse(
            &annotations(&[
                ("subnets", "subnet-a,subnet-b"),
                ("tags", "team=payments,env=prod"),
            ]),
            "default/web",
        )
        .expect("tags should parse");
        assert_eq!(parsed.tags.get("team"), Some("payments"));
        assert_eq!(parsed.tags.get("env"), Some("prod"));
    }

    #[test]
    fn healthcheck_overrides_apply() {
        let parsed = IngressAnnotations::parse(
            &annotations(&[
                ("subnets", "subnet-a,subnet-b"),
                ("healthcheck-path", "/healthz"),
                ("healthcheck-interval-seconds", "30"),
                ("healthcheck-protocol", "HTTPS"),
            ]),
            "default/web",
        )
        .expect("healthcheck annotations should parse");

        assert_eq!(parsed.health_check.path, "/healthz");
        assert_eq!(parsed.health_check.interval_seconds, 30);
        assert_eq!(parsed.health_check.protocol, Protocol::Https);
    }
}
