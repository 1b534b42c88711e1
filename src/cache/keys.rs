//! Query key definitions.
//!
//! A [`QueryKey`] is the identity of one cached query result. Keys are ordered
//! string segments; a flat string key is simply a key with one segment.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a cached query result.
///
/// Invalidation matches by segment prefix: `["inventory"]` covers
/// `["inventory", "all"]` but not `["inventory-stats"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RawQueryKey", into = "Vec<String>")]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true when `other` equals this key or extends it segment by segment.
    pub fn is_prefix_of(&self, other: &QueryKey) -> bool {
        other.0.starts_with(&self.0)
    }
}

impl From<&str> for QueryKey {
    fn from(value: &str) -> Self {
        Self(vec![value.to_string()])
    }
}

impl From<String> for QueryKey {
    fn from(value: String) -> Self {
        Self(vec![value])
    }
}

impl<const N: usize> From<[&str; N]> for QueryKey {
    fn from(value: [&str; N]) -> Self {
        Self::new(value)
    }
}

impl From<Vec<String>> for QueryKey {
    fn from(value: Vec<String>) -> Self {
        Self(value)
    }
}

impl From<QueryKey> for Vec<String> {
    fn from(value: QueryKey) -> Self {
        value.0
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// Wire shape accepted for keys in configuration: a bare string or a list of segments.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawQueryKey {
    Flat(String),
    Segments(Vec<String>),
}

impl From<RawQueryKey> for QueryKey {
    fn from(raw: RawQueryKey) -> Self {
        match raw {
            RawQueryKey::Flat(value) => Self::from(value),
            RawQueryKey::Segments(segments) => Self(segments),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_and_single_segment_keys_are_equal() {
        assert_eq!(QueryKey::from("inventory-stats"), QueryKey::from(["inventory-stats"]));
    }

    #[test]
    fn prefix_matching_is_segment_wise() {
        let namespace = QueryKey::from("inventory");

        assert!(namespace.is_prefix_of(&QueryKey::from(["inventory", "all"])));
        assert!(namespace.is_prefix_of(&namespace));
        assert!(!namespace.is_prefix_of(&QueryKey::from("inventory-stats")));
        assert!(!QueryKey::from(["inventory", "all"]).is_prefix_of(&namespace));
    }

    #[test]
    fn deserializes_flat_and_structured_forms() {
        let keys: Vec<QueryKey> =
            serde_json::from_str(r#"["rooms", ["inventory", "all"]]"#).expect("valid keys");

        assert_eq!(
            keys,
            vec![QueryKey::from("rooms"), QueryKey::from(["inventory", "all"])]
        );
    }

    #[test]
    fn serializes_as_segment_list() {
        let json = serde_json::to_string(&QueryKey::from("keys")).expect("serializable");
        assert_eq!(json, r#"["keys"]"#);
    }

    #[test]
    fn display_lists_segments() {
        assert_eq!(
            QueryKey::from(["supply-requests", "user"]).to_string(),
            "[supply-requests, user]"
        );
    }
}
