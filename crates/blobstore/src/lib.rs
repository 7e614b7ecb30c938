//! Object store for whole-database snapshots.
//!
//! Objects are opaque blobs addressed by key and tagged with [`ObjectMeta`].
//! Backends:
//!
//! - [`MemoryObjectStore`] for tests and single-process clusters
//! - [`DirObjectStore`] storing `<key>.blob` and `<key>.meta.json` in a directory
//! - [`HttpObjectStore`] speaking plain `PUT`/`GET`/`HEAD` to a backup endpoint

pub mod dir;
pub mod http;
pub mod memory;

pub use dir::DirObjectStore;
pub use http::HttpObjectStore;
pub use memory::MemoryObjectStore;

use async_trait::async_trait;
use bytes::Bytes;
use common::{DbError, DbResult};
use serde::{Deserialize, Serialize};

/// Metadata stored next to every object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Ledger sequence of the database at the time of the snapshot.
    pub sequence: u64,
    /// Wall-clock time the object was produced, in unix milliseconds.
    pub modified_ms: u64,
    /// Node that produced the object.
    pub node_id: String,
}

/// Metadata and size of a stored object, without its contents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub meta: ObjectMeta,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub meta: ObjectMeta,
    pub size: u64,
    pub data: Bytes,
}

impl StoredObject {
    pub fn info(&self) -> ObjectInfo {
        ObjectInfo {
            meta: self.meta.clone(),
            size: self.size,
        }
    }
}

/// Blob storage keyed by name. All failures surface as `DbError::Snapshot`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `key`, replacing any previous object. Returns the stored size.
    async fn put(&self, key: &str, data: Bytes, meta: ObjectMeta) -> DbResult<u64>;

    async fn get(&self, key: &str) -> DbResult<Option<StoredObject>>;

    async fn info(&self, key: &str) -> DbResult<Option<ObjectInfo>>;
}

pub(crate) fn store_error(action: &str, key: &str, err: impl std::fmt::Display) -> DbError {
    DbError::Snapshot(format!("{action} {key}: {err}"))
}
