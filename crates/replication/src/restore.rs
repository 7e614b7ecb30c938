//! Seeding a node's database from the latest snapshot.

use blobstore::{ObjectMeta, ObjectStore};
use common::{DbError, DbResult, SNAPSHOT_KEY};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// A local database already exists and was left alone.
    LocalExists,
    /// The snapshot was written into place.
    Restored(ObjectMeta),
    /// No snapshot exists; the node starts empty.
    Empty,
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Write the latest snapshot to `db_path` unless a database is already there.
///
/// Must run before the state machine opens the file.
pub async fn restore_database(objects: &dyn ObjectStore, db_path: &Path) -> DbResult<RestoreOutcome> {
    if fs::try_exists(db_path).await? {
        info!(path = %db_path.display(), "local database found; skipping restore");
        return Ok(RestoreOutcome::LocalExists);
    }

    let Some(object) = objects.get(SNAPSHOT_KEY).await? else {
        info!("no snapshot found; starting from an empty database");
        return Ok(RestoreOutcome::Empty);
    };

    remove_if_exists(&sibling(db_path, "-wal")).await?;
    remove_if_exists(&sibling(db_path, "-shm")).await?;

    let staging = sibling(db_path, ".restore");
    fs::write(&staging, &object.data).await?;
    fs::File::open(&staging).await?.sync_all().await?;
    fs::rename(&staging, db_path)
        .await
        .map_err(|e| DbError::Snapshot(format!("install restored database: {e}")))?;

    info!(
        sequence = object.meta.sequence,
        size = object.size,
        node = %object.meta.node_id,
        "restored database from snapshot"
    );
    Ok(RestoreOutcome::Restored(object.meta))
}
