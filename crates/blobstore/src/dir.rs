//! Directory-backed object store.
//!
//! Each object is two files: `<key>.blob` with the contents and
//! `<key>.meta.json` with the [`ObjectInfo`]. Both are written to a temporary
//! name, synced and renamed; the metadata file is renamed last, so an object
//! is visible only once its blob is complete.

use crate::{store_error, ObjectInfo, ObjectMeta, ObjectStore, StoredObject};
use async_trait::async_trait;
use bytes::Bytes;
use common::{DbError, DbResult};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Clone, Debug)]
pub struct DirObjectStore {
    dir: PathBuf,
}

impl DirObjectStore {
    pub fn open(dir: impl AsRef<Path>) -> DbResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, key: &str) -> DbResult<PathBuf> {
        Ok(self.dir.join(format!("{}.blob", checked_key(key)?)))
    }

    fn meta_path(&self, key: &str) -> DbResult<PathBuf> {
        Ok(self.dir.join(format!("{}.meta.json", checked_key(key)?)))
    }

    async fn read_info(&self, key: &str) -> DbResult<Option<ObjectInfo>> {
        let contents = match fs::read(self.meta_path(key)?).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_error("read metadata", key, e)),
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|e| store_error("decode metadata", key, e))
    }
}

fn checked_key(key: &str) -> DbResult<&str> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !key.starts_with('.');
    if valid {
        Ok(key)
    } else {
        Err(DbError::Snapshot(format!("invalid object key {key:?}")))
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    let mut file = fs::File::create(&temp).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&temp, path).await
}

#[async_trait]
impl ObjectStore for DirObjectStore {
    async fn put(&self, key: &str, data: Bytes, meta: ObjectMeta) -> DbResult<u64> {
        let info = ObjectInfo {
            meta,
            size: data.len() as u64,
        };
        let meta_json =
            serde_json::to_vec_pretty(&info).map_err(|e| store_error("encode metadata", key, e))?;

        write_atomic(&self.blob_path(key)?, &data)
            .await
            .map_err(|e| store_error("write", key, e))?;
        write_atomic(&self.meta_path(key)?, &meta_json)
            .await
            .map_err(|e| store_error("write metadata", key, e))?;

        tracing::debug!(key, size = info.size, dir = %self.dir.display(), "stored object");
        Ok(info.size)
    }

    async fn get(&self, key: &str) -> DbResult<Option<StoredObject>> {
        let Some(info) = self.read_info(key).await? else {
            return Ok(None);
        };
        let data = fs::read(self.blob_path(key)?)
            .await
            .map_err(|e| store_error("read", key, e))?;
        Ok(Some(StoredObject {
            meta: info.meta,
            size: data.len() as u64,
            data: Bytes::from(data),
        }))
    }

    async fn info(&self, key: &str) -> DbResult<Option<ObjectInfo>> {
        self.read_info(key).await
    }
}
