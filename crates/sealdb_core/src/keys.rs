//! Engine key derivation.
//!
//! The whole store lives in one ordered byte key space, multiplexed by a
//! one-byte top-level prefix tag. All functions here are pure; nothing
//! else in the crate builds keys by hand.
//!
//! Layout:
//!
//! ```text
//! 0x00                                          config blob
//! 0x01 ∥ cp[2] ∥ 0x00 ∥ id                      document body
//! 0x01 ∥ cp[2] ∥ 0x01 ∥ index_name              index metadata
//! 0x01 ∥ cp[2] ∥ 0x02 ∥ h(id)[32] ∥ be64(n)     document version n
//! 0x02 ∥ h(id)[32] ∥ 0x00                       file metadata
//! 0x02 ∥ h(id)[32] ∥ chunk_suffix(n)            file chunk n ≥ 1
//! 0x03 ∥ cp[2] ∥ doc_id                         related-file id list
//! 0x04 ∥ be64(when_nanos) ∥ rand[8]             TTL record
//! ```

use sha2::{Digest, Sha256};

/// Top-level prefix: encrypted configuration blob.
pub(crate) const PREFIX_CONFIG: u8 = 0;
/// Top-level prefix: collection data and index bookkeeping.
pub(crate) const PREFIX_COLLECTIONS: u8 = 1;
/// Top-level prefix: file metadata and chunks.
pub(crate) const PREFIX_FILES: u8 = 2;
/// Top-level prefix: related-file back-reference lists.
pub(crate) const PREFIX_FILES_RELATED: u8 = 3;
/// Top-level prefix: time-ordered deletion schedule.
pub(crate) const PREFIX_TTL: u8 = 4;

/// Second-level collection tag: document data.
pub(crate) const COLLECTION_DATA: u8 = 0;
/// Second-level collection tag: index metadata.
pub(crate) const COLLECTION_INDEX: u8 = 1;
/// Second-level collection tag: document version history.
pub(crate) const COLLECTION_HISTORY: u8 = 2;

/// Length of a file metadata key: tag + 32-byte fingerprint + 0x00.
pub(crate) const FILE_META_KEY_LEN: usize = 34;

/// The key of the config blob.
pub(crate) fn config_key() -> Vec<u8> {
    vec![PREFIX_CONFIG]
}

/// 32-byte fingerprint of a user-supplied id.
///
/// Files are chunked, so their keys need a stable fixed-width prefix no
/// other id can overlap.
pub(crate) fn fingerprint(id: &str) -> [u8; 32] {
    let digest = Sha256::digest(id.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Derives the stable 2-byte prefix of a collection from its name.
///
/// Distinct names may collide; the database surfaces that as a
/// `HashCollision` at registration time.
pub(crate) fn collection_prefix(name: &str) -> [u8; 2] {
    let digest = Sha256::digest(name.as_bytes());
    [digest[0], digest[1]]
}

/// Key of a document body.
pub(crate) fn document_key(cp: [u8; 2], id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + id.len());
    key.push(PREFIX_COLLECTIONS);
    key.extend_from_slice(&cp);
    key.push(COLLECTION_DATA);
    key.extend_from_slice(id.as_bytes());
    key
}

/// Key of an index metadata record.
pub(crate) fn index_meta_key(cp: [u8; 2], index_name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + index_name.len());
    key.push(PREFIX_COLLECTIONS);
    key.extend_from_slice(&cp);
    key.push(COLLECTION_INDEX);
    key.extend_from_slice(index_name.as_bytes());
    key
}

/// Prefix under which all index metadata of a collection lives.
pub(crate) fn index_meta_prefix(cp: [u8; 2]) -> Vec<u8> {
    vec![PREFIX_COLLECTIONS, cp[0], cp[1], COLLECTION_INDEX]
}

/// Prefix of all version records of one document.
///
/// The fixed-width fingerprint guarantees the scan can never bleed into
/// another document's versions.
pub(crate) fn history_prefix(cp: [u8; 2], id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(36);
    key.push(PREFIX_COLLECTIONS);
    key.extend_from_slice(&cp);
    key.push(COLLECTION_HISTORY);
    key.extend_from_slice(&fingerprint(id));
    key
}

/// Key of one version record; `counter` is monotonic per document,
/// starting at 1.
pub(crate) fn history_key(cp: [u8; 2], id: &str, counter: u64) -> Vec<u8> {
    let mut key = history_prefix(cp, id);
    key.extend_from_slice(&counter.to_be_bytes());
    key
}

/// Prefix under which everything of one collection lives.
pub(crate) fn collection_scope(cp: [u8; 2]) -> Vec<u8> {
    vec![PREFIX_COLLECTIONS, cp[0], cp[1]]
}

/// Prefix covering the metadata and every chunk of one file.
pub(crate) fn file_prefix(id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(PREFIX_FILES);
    key.extend_from_slice(&fingerprint(id));
    key
}

/// Key of a file's metadata record (chunk 0).
pub(crate) fn file_meta_key(id: &str) -> Vec<u8> {
    let mut key = file_prefix(id);
    key.push(0);
    key
}

/// Key of file chunk `n` (n ≥ 1).
pub(crate) fn file_chunk_key(id: &str, n: u64) -> Vec<u8> {
    let mut key = file_prefix(id);
    key.extend_from_slice(&chunk_suffix(n));
    key
}

/// Suffix encoding of chunk number `n` (n ≥ 1): `n / 256` bytes of
/// `0xFF` followed by one byte `n mod 256`.
///
/// Byte-lexicographic order of suffixes equals numeric chunk order, and
/// every suffix sorts after the metadata suffix `0x00`.
pub(crate) fn chunk_suffix(n: u64) -> Vec<u8> {
    let full = (n / 256) as usize;
    let rest = (n % 256) as u8;
    let mut suffix = vec![0xFF; full];
    suffix.push(rest);
    suffix
}

/// Key of the related-file list of `(collection, document)`.
pub(crate) fn related_key(cp: [u8; 2], doc_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(3 + doc_id.len());
    key.push(PREFIX_FILES_RELATED);
    key.extend_from_slice(&cp);
    key.extend_from_slice(doc_id.as_bytes());
    key
}

/// Prefix of all related-file lists of one collection.
pub(crate) fn related_scope(cp: [u8; 2]) -> Vec<u8> {
    vec![PREFIX_FILES_RELATED, cp[0], cp[1]]
}

/// Key of a TTL record scheduled at `when` (unix nanoseconds), with a
/// caller-provided entropy suffix breaking ties.
pub(crate) fn ttl_key(when_unix_nanos: u64, entropy: [u8; 8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(PREFIX_TTL);
    key.extend_from_slice(&when_unix_nanos.to_be_bytes());
    key.extend_from_slice(&entropy);
    key
}

/// Prefix of the whole TTL schedule.
pub(crate) fn ttl_scope() -> Vec<u8> {
    vec![PREFIX_TTL]
}

/// Extracts the scheduled time from a TTL key.
pub(crate) fn ttl_key_time(key: &[u8]) -> Option<u64> {
    if key.len() != 17 || key[0] != PREFIX_TTL {
        return None;
    }
    let mut be = [0u8; 8];
    be.copy_from_slice(&key[1..9]);
    Some(u64::from_be_bytes(be))
}

/// Whether a key under the files prefix is a metadata key.
pub(crate) fn is_file_meta_key(key: &[u8]) -> bool {
    key.len() == FILE_META_KEY_LEN
        && key[0] == PREFIX_FILES
        && key[FILE_META_KEY_LEN - 1] == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_suffixes_are_strictly_increasing() {
        // Crosses both the one-byte boundary at 256 and the two-byte
        // boundary at 512.
        let mut prev = chunk_suffix(1);
        for n in 2..1500u64 {
            let next = chunk_suffix(n);
            assert!(prev < next, "suffix({}) !< suffix({})", n - 1, n);
            prev = next;
        }
    }

    #[test]
    fn chunk_suffix_compressed_form() {
        assert_eq!(chunk_suffix(1), vec![1]);
        assert_eq!(chunk_suffix(255), vec![255]);
        assert_eq!(chunk_suffix(256), vec![0xFF, 0]);
        assert_eq!(chunk_suffix(257), vec![0xFF, 1]);
        assert_eq!(chunk_suffix(512), vec![0xFF, 0xFF, 0]);
    }

    #[test]
    fn metadata_sorts_before_every_chunk() {
        let meta = file_meta_key("some file");
        for n in [1u64, 2, 255, 256, 1000] {
            assert!(meta < file_chunk_key("some file", n));
        }
    }

    #[test]
    fn file_keys_share_prefix_and_nothing_else_does() {
        let prefix = file_prefix("a");
        assert!(file_meta_key("a").starts_with(&prefix));
        assert!(file_chunk_key("a", 7).starts_with(&prefix));
        assert!(!file_meta_key("b").starts_with(&prefix));
    }

    #[test]
    fn meta_key_shape() {
        let key = file_meta_key("x");
        assert_eq!(key.len(), FILE_META_KEY_LEN);
        assert!(is_file_meta_key(&key));
        assert!(!is_file_meta_key(&file_chunk_key("x", 1)));
    }

    #[test]
    fn history_keys_order_by_counter() {
        let cp = collection_prefix("col");
        assert!(history_key(cp, "doc", 1) < history_key(cp, "doc", 2));
        assert!(history_key(cp, "doc", 255) < history_key(cp, "doc", 256));
        assert!(history_key(cp, "doc", 1).starts_with(&history_prefix(cp, "doc")));
    }

    #[test]
    fn history_of_prefixed_ids_does_not_overlap() {
        let cp = collection_prefix("col");
        // "a" is a string prefix of "ab" but their fingerprints differ.
        assert!(!history_key(cp, "ab", 1).starts_with(&history_prefix(cp, "a")));
    }

    #[test]
    fn ttl_keys_order_by_time() {
        let early = ttl_key(1_000, [0xFF; 8]);
        let late = ttl_key(2_000, [0x00; 8]);
        assert!(early < late);
        assert_eq!(ttl_key_time(&early), Some(1_000));
    }

    #[test]
    fn collection_prefix_is_stable() {
        assert_eq!(collection_prefix("users"), collection_prefix("users"));
    }
}
