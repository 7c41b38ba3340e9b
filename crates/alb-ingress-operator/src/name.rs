//! Stable resource names.
//!
//! ALB and target group names are capped at 32 characters by AWS and must
//! stay invariant for the lifetime of the resource: they are the join key
//! between the desired tree assembled from an Ingress and the current
//! state listed from AWS. Names are built from a sanitized human-readable
//! prefix plus a short SHA-256 suffix over the full identity, so
//! truncation can never make two identities collide.

use aws_lc_rs::digest::{digest, SHA256};

/// AWS limit on ALB and target group names
const MAX_NAME_LEN: usize = 32;

/// Hex characters of hash appended to every name
const HASH_LEN: usize = 7;

/// Derive the load balancer name for an Ingress.
///
/// Deterministic in `{cluster, namespace, ingress}` and ≤32 characters.
pub fn load_balancer_name(cluster: &str, namespace: &str, ingress: &str) -> String {
    compose(
        &[cluster, namespace, ingress],
        &format!("{cluster}/{namespace}/{ingress}"),
    )
}

/// Derive the target group name for a backend.
///
/// Deterministic in `{cluster, namespace, ingress, service, port, protocol}`
/// and ≤32 characters. The node port and protocol participate so a service
/// port change produces a new target group rather than an in-place mutation
/// of an immutable field.
pub fn target_group_name(
    cluster: &str,
    namespace: &str,
    ingress: &str,
    service: &str,
    port: i32,
    protocol: &str,
) -> String {
    compose(
        &[cluster, service],
        &format!("{cluster}/{namespace}/{ingress}/{service}/{port}/{protocol}"),
    )
}

/// Derive the managed ALB security group name for an Ingress.
///
/// Not hash-truncated: security group names allow 255 characters, and the
/// plain `{cluster}-{ingress}` form is what makes intentional sharing
/// between same-named Ingresses possible.
pub fn security_group_name(cluster: &str, ingress: &str) -> String {
    format!("{}-{}", sanitize(cluster), sanitize(ingress))
}

fn compose(prefix_parts: &[&str], identity: &str) -> String {
    let hash = short_hash(identity);

    let mut prefix = prefix_parts
        .iter()
        .map(|p| sanitize(p))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    // Room for '-' + hash suffix
    prefix.truncate(MAX_NAME_LEN - HASH_LEN - 1);
    let prefix = prefix.trim_end_matches('-');

    format!("{prefix}-{hash}")
}

fn short_hash(identity: &str) -> String {
    let hash = digest(&SHA256, identity.as_bytes());
    hash.as_ref()
        .iter()
        .flat_map(|b| [b >> 4, b & 0xf])
        .take(HASH_LEN)
        .map(|n| char::from_digit(n as u32, 16).unwrap_or('0'))
        .collect()
}

/// ALB names allow only alphanumerics and hyphens and must not lead with
/// a hyphen.
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}
