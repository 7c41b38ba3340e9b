//! Domain types exchanged with the AWS API layer.
//!
//! These are plain data carriers: every resource node in the
//! reconciliation tree holds one as its `current` and `desired` snapshot.
//! Server-assigned fields (ARNs, DNS names) are `Option` and excluded
//! from the structural comparisons the nodes perform.

use std::fmt;
use std::str::FromStr;

use alb_ingress_common::{Error, Tags};

/// Listener / target group protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    /// Plain HTTP
    Http,
    /// TLS-terminated HTTP
    Https,
}

impl Protocol {
    /// The wire representation AWS expects
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HTTP" => Ok(Protocol::Http),
            "HTTPS" => Ok(Protocol::Https),
            other => Err(Error::validation(format!(
                "unknown protocol '{other}', expected HTTP or HTTPS"
            ))),
        }
    }
}

/// Load balancer scheme
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    /// Reachable only within the VPC
    Internal,
    /// Reachable from the internet
    InternetFacing,
}

impl Scheme {
    /// The wire representation AWS expects
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Internal => "internal",
            Scheme::InternetFacing => "internet-facing",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal" => Ok(Scheme::Internal),
            "internet-facing" => Ok(Scheme::InternetFacing),
            other => Err(Error::validation(format!(
                "unknown scheme '{other}', expected internal or internet-facing"
            ))),
        }
    }
}

/// One application load balancer, as created or observed.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadBalancerDesc {
    /// Stable controller-derived name (≤32 chars)
    pub name: String,
    /// Server-assigned
    pub arn: Option<String>,
    /// Server-assigned
    pub dns_name: Option<String>,
    /// Immutable for the lifetime of the load balancer
    pub scheme: Scheme,
    /// Sorted subnet ids
    pub subnets: Vec<String>,
    /// Sorted security group ids
    pub security_groups: Vec<String>,
    /// Identity and user tags
    pub tags: Tags,
}

/// One listener on a load balancer.
#[derive(Clone, Debug, PartialEq)]
pub struct ListenerDesc {
    /// Server-assigned
    pub arn: Option<String>,
    /// 1-65535
    pub port: i32,
    /// HTTP or HTTPS
    pub protocol: Protocol,
    /// Required iff protocol is HTTPS
    pub certificate_arn: Option<String>,
    /// ELBv2 predefined policy name; HTTPS only
    pub ssl_policy: Option<String>,
    /// Target group of the single forward default action. `None` on a
    /// desired snapshot until the sibling target group has an ARN.
    pub default_target_group_arn: Option<String>,
}

/// Rule priority; AWS encodes the listener-owned default rule with the
/// string sentinel `"default"` and everything else as `"1"`..`"50000"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RulePriority {
    /// The listener's default rule
    Default,
    /// An explicit priority, 1..=50000
    Number(u32),
}

/// Highest priority AWS accepts on a listener rule
pub const MAX_RULE_PRIORITY: u32 = 50_000;

impl RulePriority {
    /// Map the input namespace onto the wire namespace: 0 becomes the
    /// `default` sentinel, everything else is literal.
    pub fn from_input(n: u32) -> Self {
        if n == 0 {
            RulePriority::Default
        } else {
            RulePriority::Number(n)
        }
    }

    /// Parse the wire representation
    pub fn parse(s: &str) -> Result<Self, Error> {
        if s == "default" {
            return Ok(RulePriority::Default);
        }
        s.parse::<u32>()
            .map(RulePriority::Number)
            .map_err(|_| Error::validation(format!("invalid rule priority '{s}'")))
    }

    /// Numeric value used for ordering; the default rule sorts first
    pub fn numeric(self) -> u32 {
        match self {
            RulePriority::Default => 0,
            RulePriority::Number(n) => n,
        }
    }

    /// The wire representation AWS expects
    pub fn as_aws(self) -> String {
        match self {
            RulePriority::Default => "default".to_string(),
            RulePriority::Number(n) => n.to_string(),
        }
    }
}

impl PartialOrd for RulePriority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RulePriority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.numeric().cmp(&other.numeric())
    }
}

/// Field a rule condition matches on
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConditionField {
    /// `host-header`
    HostHeader,
    /// `path-pattern`
    PathPattern,
}

impl ConditionField {
    /// The wire representation AWS expects
    pub fn as_str(self) -> &'static str {
        match self {
            ConditionField::HostHeader => "host-header",
            ConditionField::PathPattern => "path-pattern",
        }
    }

    /// Parse the wire representation
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "host-header" => Ok(ConditionField::HostHeader),
            "path-pattern" => Ok(ConditionField::PathPattern),
            other => Err(Error::validation(format!(
                "unsupported rule condition field '{other}'"
            ))),
        }
    }
}

/// One `{field, values}` condition on a rule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleCondition {
    /// What the condition matches on
    pub field: ConditionField,
    /// Accepted values for the field
    pub values: Vec<String>,
}

impl RuleCondition {
    /// Convenience constructor
    pub fn new(field: ConditionField, value: impl Into<String>) -> Self {
        Self {
            field,
            values: vec![value.into()],
        }
    }
}

/// One routing rule under a listener.
#[derive(Clone, Debug, PartialEq)]
pub struct RuleDesc {
    /// Server-assigned
    pub arn: Option<String>,
    /// Priority within the listener
    pub priority: RulePriority,
    /// Match conditions; empty iff this is the default rule
    pub conditions: Vec<RuleCondition>,
    /// Forward target. `None` on a desired snapshot until resolved
    /// against the sibling target groups.
    pub target_group_arn: Option<String>,
}

impl RuleDesc {
    /// Whether this is the listener-owned default rule
    pub fn is_default(&self) -> bool {
        self.priority == RulePriority::Default
    }

    /// Order-insensitive condition comparison: per-field value sets are
    /// compared as sorted multisets.
    pub fn conditions_equal(&self, other: &RuleDesc) -> bool {
        normalized_conditions(&self.conditions) == normalized_conditions(&other.conditions)
    }
}

fn normalized_conditions(conditions: &[RuleCondition]) -> Vec<(ConditionField, Vec<String>)> {
    let mut out: Vec<(ConditionField, Vec<String>)> = conditions
        .iter()
        .map(|c| {
            let mut values = c.values.clone();
            values.sort();
            (c.field, values)
        })
        .collect();
    out.sort();
    out
}

/// Health check configuration of a target group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthCheck {
    /// Request path
    pub path: String,
    /// Seconds between probes
    pub interval_seconds: i32,
    /// Probe timeout in seconds
    pub timeout_seconds: i32,
    /// Consecutive successes before healthy
    pub healthy_threshold: i32,
    /// Consecutive failures before unhealthy
    pub unhealthy_threshold: i32,
    /// Probe protocol
    pub protocol: Protocol,
    /// Probe port: `"traffic-port"` or a literal port number
    pub port: String,
}

/// One target group.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetGroupDesc {
    /// Server-assigned
    pub arn: Option<String>,
    /// Stable controller-derived name (≤32 chars)
    pub name: String,
    /// Backend protocol
    pub protocol: Protocol,
    /// Node port of the backing service
    pub port: i32,
    /// VPC the targets live in
    pub vpc_id: String,
    /// Health check configuration
    pub health_check: HealthCheck,
}

/// One registered backend: an EC2 instance and the port traffic is
/// forwarded to.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target {
    /// EC2 instance id (`i-...`)
    pub instance_id: String,
    /// Node port
    pub port: i32,
}

impl Target {
    /// Convenience constructor
    pub fn new(instance_id: impl Into<String>, port: i32) -> Self {
        Self {
            instance_id: instance_id.into(),
            port,
        }
    }
}

/// Registration state of a target as reported by `DescribeTargetHealth`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetState {
    /// Passing health checks
    Healthy,
    /// Registered, not yet passing
    Initial,
    /// Deregistering
    Draining,
    /// Failing health checks
    Unhealthy,
    /// Registered but the target group has no traffic
    Unused,
    /// Health state could not be determined
    Unavailable,
}

/// A subnet resolved from an id or Name tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubnetInfo {
    /// `subnet-...`
    pub id: String,
    /// e.g. `us-east-1a`
    pub availability_zone: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_zero_maps_to_default_sentinel() {
        assert_eq!(RulePriority::from_input(0), RulePriority::Default);
        assert_eq!(RulePriority::from_input(1), RulePriority::Number(1));
        assert_eq!(RulePriority::Default.as_aws(), "default");
        assert_eq!(RulePriority::Number(5).as_aws(), "5");
    }

    #[test]
    fn priority_parses_wire_representation() {
        assert_eq!(
            RulePriority::parse("default").expect("sentinel should parse"),
            RulePriority::Default
        );
        assert_eq!(
            RulePriority::parse("5").expect("number should parse"),
            RulePriority::Number(5)
        );
        assert!(RulePriority::parse("not-a-priority").is_err());
    }

    #[test]
    fn priority_orders_default_first() {
        let mut priorities = vec![
            RulePriority::Number(10),
            RulePriority::Default,
            RulePriority::Number(2),
        ];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![
                RulePriority::Default,
                RulePriority::Number(2),
                RulePriority::Number(10)
            ]
        );
    }

    #[test]
    fn condition_comparison_ignores_order() {
        let a = RuleDesc {
            arn: None,
            priority: RulePriority::Number(1),
            conditions: vec![
                RuleCondition::new(ConditionField::HostHeader, "foo.example.com"),
                RuleCondition::new(ConditionField::PathPattern, "/api"),
            ],
            target_group_arn: None,
        };
        let b = RuleDesc {
            arn: Some("arn:aws:elasticloadbalancing:rule/abc".to_string()),
            priority: RulePriority::Number(1),
            conditions: vec![
                RuleCondition::new(ConditionField::PathPattern, "/api"),
                RuleCondition::new(ConditionField::HostHeader, "foo.example.com"),
            ],
            target_group_arn: None,
        };
        assert!(a.conditions_equal(&b));
    }

    #[test]
    fn condition_comparison_detects_value_changes() {
        let a = RuleDesc {
            arn: None,
            priority: RulePriority::Number(1),
            conditions: vec![RuleCondition::new(ConditionField::PathPattern, "/old")],
            target_group_arn: None,
        };
        let mut b = a.clone();
        b.conditions = vec![RuleCondition::new(ConditionField::PathPattern, "/new")];
        assert!(!a.conditions_equal(&b));
    }

    #[test]
    fn condition_values_compare_as_sorted_multisets() {
        let a = RuleDesc {
            arn: None,
            priority: RulePriority::Number(1),
            conditions: vec![RuleCondition {
                field: ConditionField::HostHeader,
                values: vec!["a.example.com".into(), "b.example.com".into()],
            }],
            target_group_arn: None,
        };
        let b = RuleDesc {
            arn: None,
            priority: RulePriority::Number(1),
            conditions: vec![RuleCondition {
                field: ConditionField::HostHeader,
                values: vec!["b.example.com".into(), "a.example.com".into()],
            }],
            target_group_arn: None,
        };
        assert!(a.conditions_equal(&b));
    }

    #[test]
    fn protocol_and_scheme_round_trip() {
        assert_eq!("HTTP".parse::<Protocol>().expect("parses"), Protocol::Http);
        assert_eq!("https".parse::<Protocol>().expect("parses"), Protocol::Https);
        assert!("TCP".parse::<Protocol>().is_err());

        assert_eq!(
            "internet-facing".parse::<Scheme>().expect("parses"),
            Scheme::InternetFacing
        );
        assert!("public".parse::<Scheme>().is_err());
    }
}
