//! Tag model shared by every managed AWS resource.
//!
//! Tags are the only authoritative join key between desired state
//! (assembled from Ingress objects) and current state (listed from AWS),
//! so the same ordered map representation is used everywhere.

use std::collections::BTreeMap;

use crate::error::Error;

/// An ordered set of AWS resource tags.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tags(BTreeMap<String, String>);

impl Tags {
    /// Create an empty tag set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a tag
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up a tag value by key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Number of tags
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(key, value)` pairs in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merge `other` into `self`, with `other` winning on key collisions
    pub fn merge(&mut self, other: &Tags) {
        for (k, v) in other.iter() {
            self.insert(k, v);
        }
    }

    /// Compute the tag delta from `self` (current) to `desired`.
    ///
    /// Returns the tags to add or overwrite and the keys to remove, fed
    /// straight into `AddTags`/`RemoveTags`.
    pub fn diff(&self, desired: &Tags) -> (Tags, Vec<String>) {
        let mut to_add = Tags::new();
        for (k, v) in desired.iter() {
            if self.get(k) != Some(v) {
                to_add.insert(k, v);
            }
        }

        let to_remove = self
            .iter()
            .filter(|(k, _)| desired.get(k).is_none())
            .map(|(k, _)| k.to_string())
            .collect();

        (to_add, to_remove)
    }

    /// Parse a comma-separated `k=v` list, as carried by the
    /// `alb.ingress.kubernetes.io/tags` annotation.
    pub fn parse_kv_list(input: &str) -> Result<Tags, Error> {
        let mut tags = Tags::new();
        for pair in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| Error::validation(format!("tag '{pair}' is not of the form k=v")))?;
            if k.trim().is_empty() {
                return Err(Error::validation(format!("tag '{pair}' has an empty key")));
            }
            tags.insert(k.trim(), v.trim());
        }
        Ok(tags)
    }
}

impl FromIterator<(String, String)> for Tags {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Tags(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Tags {
    type Item = (&'a String, &'a String);
    type IntoIter = std::collections::btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn diff_detects_additions_changes_and_removals() {
        let current = tags(&[("env", "staging"), ("team", "infra"), ("stale", "yes")]);
        let desired = tags(&[("env", "prod"), ("team", "infra"), ("new", "tag")]);

        let (to_add, to_remove) = current.diff(&desired);

        assert_eq!(to_add, tags(&[("env", "prod"), ("new", "tag")]));
        assert_eq!(to_remove, vec!["stale".to_string()]);
    }

    #[test]
    fn diff_of_equal_sets_is_empty() {
        let t = tags(&[("a", "1"), ("b", "2")]);
        let (to_add, to_remove) = t.diff(&t.clone());
        assert!(to_add.is_empty());
        assert!(to_remove.is_empty());
    }

    #[test]
    fn merge_overwrites_on_collision() {
        let mut base = tags(&[("env", "staging"), ("team", "infra")]);
        base.merge(&tags(&[("env", "prod")]));
        assert_eq!(base.get("env"), Some("prod"));
        assert_eq!(base.get("team"), Some("infra"));
    }

    #[test]
    fn parses_annotation_kv_list() {
        let parsed = Tags::parse_kv_list("env=prod, team=infra ,owner=payments")
            .expect("well-formed list should parse");
        assert_eq!(parsed, tags(&[("env", "prod"), ("team", "infra"), ("owner", "payments")]));
    }

    #[test]
    fn rejects_malformed_kv_pairs() {
        assert!(Tags::parse_kv_list("no-equals-sign").is_err());
        assert!(Tags::parse_kv_list("=missing-key").is_err());
    }

    #[test]
    fn empty_segments_are_ignored() {
        let parsed = Tags::parse_kv_list("a=1,,b=2,").expect("trailing commas are tolerated");
        assert_eq!(parsed.len(), 2);
    }
}
