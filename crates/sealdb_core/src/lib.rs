//! # SealDB
//!
//! An embedded, single-process document and blob store with end-to-end
//! encrypted persistence.
//!
//! Every value on disk is sealed with XChaCha20-Poly1305 before it
//! reaches the ordered key/value engine; keys stay plaintext so the
//! engine can sort them for prefix iteration. All mutations funnel
//! through one write coordinator, which makes multi-key requests atomic
//! and writes from one caller FIFO.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                   sealdb_core                    │
//! ├──────────────────────────────────────────────────┤
//! │  • database     - facade, config blob, rotation  │
//! │  • collection   - documents, history, indexes    │
//! │  • file         - chunked blobs, handles         │
//! │  • transaction  - write queue + coordinator      │
//! │  • ttl          - timed deletion schedule        │
//! │  • crypto/keys  - sealing and key derivation     │
//! │  • backup       - encrypted state streaming      │
//! ├──────────────────────────────────────────────────┤
//! │          sealdb_engine (redb / memory)           │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use sealdb_core::{Config, Database, MasterKey};
//!
//! let db = Database::open(Config::new("./data", MasterKey::generate()))?;
//!
//! let posts = db.collection("posts")?;
//! posts.put("p1", &serde_json::json!({"title": "hello"}))?;
//!
//! let files = db.file_store();
//! files.put_file("cover", "cover.png", &mut image_reader)?;
//!
//! db.close()?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backup;
mod collection;
mod config;
mod crypto;
mod database;
mod error;
mod file;
mod index;
mod keys;
mod transaction;
mod ttl;

pub use collection::{Collection, QueryHit, QueryResult};
pub use config::{
    Config, DEFAULT_CHUNK_SIZE, DEFAULT_INTERNAL_QUERY_LIMIT, DEFAULT_QUEUE_DEPTH,
    DEFAULT_READER_WRITER_TIMEOUT, DEFAULT_TRANSACTION_TIMEOUT,
};
pub use crypto::{MasterKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use database::Database;
pub use error::{Error, Result};
pub use file::{FileIterator, FileMeta, FileReader, FileStore, FileWriter};
pub use index::IndexAdapter;

// The engine seam, re-exported for callers providing their own engine
// via `Database::open_with_engine`.
pub use sealdb_engine::{EngineError, KvEngine, MemoryEngine, RedbEngine};
