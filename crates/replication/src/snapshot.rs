//! Uploading the database to the object store.

use crate::context::NodeContext;
use blobstore::{ObjectInfo, ObjectMeta, ObjectStore};
use bytes::Bytes;
use common::{elapsed_ms, unix_millis, DbResult, SNAPSHOT_KEY};
use std::time::Instant;
use tracing::info;

/// Metadata of the current snapshot record, if any.
pub async fn latest_snapshot(objects: &dyn ObjectStore) -> DbResult<Option<ObjectInfo>> {
    objects.info(SNAPSHOT_KEY).await
}

/// Copy the database file into the object store tagged with the current ledger.
///
/// The sequence is read together with the bytes, so the record never
/// claims less progress than the file it describes.
pub async fn upload_snapshot(ctx: &NodeContext) -> DbResult<ObjectInfo> {
    let started = Instant::now();
    let (sequence, data) = ctx.state_machine.snapshot_bytes().await?;
    let meta = ObjectMeta {
        sequence,
        modified_ms: unix_millis(),
        node_id: ctx.node_id.clone(),
    };
    let size = ctx
        .objects
        .put(SNAPSHOT_KEY, Bytes::from(data), meta.clone())
        .await?;
    info!(
        sequence,
        size,
        elapsed_ms = elapsed_ms(started.elapsed()),
        "snapshot uploaded"
    );
    Ok(ObjectInfo { meta, size })
}
