//! Cache Key Strategy
//!
//! Deterministic, order-independent keys built from a namespace, an
//! identifier and an optional parameter bag. Parameters are normalized into
//! a `BTreeMap` (sorted by name), serialized to canonical JSON and hashed, so
//! the same parameters in any order always produce the same key.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Transformation parameters, sorted by attribute name
pub type Params = BTreeMap<String, Value>;

/// Separator between key components
const SEPARATOR: char = ':';

/// Number of hex characters of the parameter digest kept in the key
const PARAM_HASH_LEN: usize = 16;

/// Cache key string
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already generated key string
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Key as string slice
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespace component of the key
    pub fn namespace(&self) -> &str {
        KeyStrategy::namespace_of(&self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Key generation strategy
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyStrategy;

impl KeyStrategy {
    /// Create a key strategy
    pub fn new() -> Self {
        Self
    }

    /// Generate the key for `(namespace, identifier, params)`.
    ///
    /// Never fails: empty components still yield a key.
    pub fn generate_key(&self, namespace: &str, identifier: &str, params: Option<&Params>) -> CacheKey {
        match params.filter(|p| !p.is_empty()) {
            Some(params) => CacheKey(format!(
                "{ns}{sep}{id}{sep}{hash}",
                ns = namespace,
                id = identifier,
                sep = SEPARATOR,
                hash = Self::hash_params(params)
            )),
            None => CacheKey(format!("{}{}{}", namespace, SEPARATOR, identifier)),
        }
    }

    /// Build a normalized parameter map from any list of pairs
    pub fn params<I, K, V>(pairs: I) -> Params
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect()
    }

    /// Recover the namespace prefix from a generated key
    pub fn namespace_of(key: &str) -> &str {
        key.split_once(SEPARATOR).map_or(key, |(ns, _)| ns)
    }

    /// Prefix shared by every key in a namespace
    pub fn namespace_prefix(namespace: &str) -> String {
        format!("{}{}", namespace, SEPARATOR)
    }

    fn hash_params(params: &Params) -> String {
        // BTreeMap serializes in key order; nested objects are serde_json
        // Maps, which are sorted as well without the preserve_order feature.
        let canonical = serde_json::to_string(params).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        let mut hex = format!("{:x}", digest);
        hex.truncate(PARAM_HASH_LEN);
        hex
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_key_without_params() {
        let key = KeyStrategy::new().generate_key("image", "photos/cat.jpg", None);
        assert_eq!(key.as_str(), "image:photos/cat.jpg");
        assert_eq!(key.namespace(), "image");
    }

    #[test]
    fn test_empty_params_equal_no_params() {
        let ks = KeyStrategy::new();
        assert_eq!(
            ks.generate_key("image", "a.png", Some(&Params::new())),
            ks.generate_key("image", "a.png", None)
        );
    }

    #[test]
    fn test_param_order_does_not_matter() {
        let ks = KeyStrategy::new();
        let a = KeyStrategy::params([("width", json!(100)), ("height", json!(200))]);
        let b = KeyStrategy::params([("height", json!(200)), ("width", json!(100))]);

        assert_eq!(
            ks.generate_key("image", "cat.jpg", Some(&a)),
            ks.generate_key("image", "cat.jpg", Some(&b))
        );
    }

    #[test]
    fn test_different_params_differ() {
        let ks = KeyStrategy::new();
        let a = KeyStrategy::params([("width", 100)]);
        let b = KeyStrategy::params([("width", 101)]);
        assert_ne!(
            ks.generate_key("image", "cat.jpg", Some(&a)),
            ks.generate_key("image", "cat.jpg", Some(&b))
        );
    }

    #[test]
    fn test_key_shape_with_params() {
        let ks = KeyStrategy::new();
        let params = KeyStrategy::params([("format", "webp")]);
        let key = ks.generate_key("image", "cat.jpg", Some(&params));

        let parts: Vec<&str> = key.as_str().split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "image");
        assert_eq!(parts[1], "cat.jpg");
        assert_eq!(parts[2].len(), PARAM_HASH_LEN);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_malformed_input_still_yields_key() {
        let key = KeyStrategy::new().generate_key("", "", None);
        assert_eq!(key.as_str(), ":");
        assert_eq!(key.namespace(), "");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Property: reordering parameter attributes never changes the key.
        #[test]
        fn prop_key_is_order_independent(
            ns in "[a-z]{1,8}",
            id in "[a-zA-Z0-9/._-]{1,24}",
            pairs in prop::collection::vec(("[a-z]{1,6}", any::<i64>()), 0..8),
        ) {
            let ks = KeyStrategy::new();
            let forward = KeyStrategy::params(pairs.iter().cloned());
            let reversed = KeyStrategy::params(pairs.iter().rev().cloned());

            // Duplicate names resolve last-write-wins, so compare against a
            // reversed list only when names are unique.
            let mut names: Vec<_> = pairs.iter().map(|(k, _)| k.clone()).collect();
            names.sort();
            names.dedup();
            prop_assume!(names.len() == pairs.len());

            prop_assert_eq!(
                ks.generate_key(&ns, &id, Some(&forward)),
                ks.generate_key(&ns, &id, Some(&reversed))
            );
        }

        /// Property: identical input always yields the identical key.
        #[test]
        fn prop_key_is_deterministic(
            ns in "[a-z]{1,8}",
            id in "[a-zA-Z0-9/._-]{1,24}",
            pairs in prop::collection::vec(("[a-z]{1,6}", "[a-z0-9]{0,6}"), 0..8),
        ) {
            let ks = KeyStrategy::new();
            let params = KeyStrategy::params(pairs.clone());
            let first = ks.generate_key(&ns, &id, Some(&params));
            let second = ks.generate_key(&ns, &id, Some(&KeyStrategy::params(pairs)));
            prop_assert_eq!(first.clone(), second);
            prop_assert_eq!(first.namespace(), ns.as_str());
        }
    }
}
