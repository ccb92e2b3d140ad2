//! Storage key derivation.

use sha2::{Digest, Sha256};

/// Separator placed between identity and resource before hashing.
const KEY_SEPARATOR: char = '|';

/// A key that uniquely identifies the tracker for one identity on one resource.
///
/// The key is a hex digest, so it is safe for any backend's key alphabet and
/// does not reveal the identity it was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackerKey(String);

impl TrackerKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TrackerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives tracker keys, optionally under a namespace such as `"app:prod"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyDeriver {
    namespace: Option<String>,
}

impl KeyDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix every derived key with `namespace` followed by `:`.
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            namespace: (!namespace.is_empty()).then_some(namespace),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Derive the key for `identity` on `resource`.
    pub fn derive(&self, identity: &str, resource: &str) -> TrackerKey {
        let mut hasher = Sha256::new();
        hasher.update(identity.as_bytes());
        hasher.update([KEY_SEPARATOR as u8]);
        hasher.update(resource.as_bytes());
        let digest = hex::encode(hasher.finalize());

        match &self.namespace {
            Some(ns) => TrackerKey(format!("{}:{}", ns, digest)),
            None => TrackerKey(digest),
        }
    }
}
