//! The index adapter seam.
//!
//! SealDB does not implement full-text or structured indexing itself.
//! An [`IndexAdapter`] is plugged in per `(collection, index name)` and
//! is notified after document writes commit; queries go back through it
//! to obtain candidate ids. The database only stores the registration
//! record (name, mapping fingerprint, reserved posting prefix) so that
//! re-registration conflicts are detected across restarts.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An external index maintained alongside a collection.
///
/// Ordering contract: `on_put`/`on_delete` are invoked strictly after
/// the corresponding document write committed, from the writing caller's
/// thread. Implementations that index asynchronously must preserve that
/// order per document id.
pub trait IndexAdapter: Send + Sync {
    /// A document body was written.
    fn on_put(&self, collection: &str, id: &str, body: &[u8]);

    /// A document was deleted.
    fn on_delete(&self, collection: &str, id: &str);

    /// Resolves an opaque query request into candidate document ids,
    /// best match first.
    fn query(&self, request: &[u8]) -> Vec<String>;

    /// Serializes the adapter's state for backup. The default adapter
    /// state is empty.
    fn snapshot(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Restores adapter state captured by [`IndexAdapter::snapshot`].
    fn restore(&self, _state: &[u8]) {}
}

/// The stored registration record of an index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct IndexMeta {
    /// Index name, unique per collection.
    pub name: String,
    /// 2-byte prefix reserved for the adapter's postings.
    pub posting_prefix: [u8; 2],
    /// SHA-256 of the mapping the index was registered with.
    pub mapping_fingerprint: [u8; 32],
}

impl IndexMeta {
    pub(crate) fn new(name: &str, mapping: &[u8]) -> Self {
        let name_digest = Sha256::digest(name.as_bytes());
        let mapping_digest = Sha256::digest(mapping);
        let mut fingerprint = [0u8; 32];
        fingerprint.copy_from_slice(&mapping_digest);
        Self {
            name: name.to_string(),
            posting_prefix: [name_digest[0], name_digest[1]],
            mapping_fingerprint: fingerprint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_is_deterministic() {
        let a = IndexMeta::new("email", b"mapping-v1");
        let b = IndexMeta::new("email", b"mapping-v1");
        assert_eq!(a, b);
    }

    #[test]
    fn different_mapping_changes_fingerprint() {
        let a = IndexMeta::new("email", b"mapping-v1");
        let b = IndexMeta::new("email", b"mapping-v2");
        assert_eq!(a.posting_prefix, b.posting_prefix);
        assert_ne!(a.mapping_fingerprint, b.mapping_fingerprint);
    }
}
