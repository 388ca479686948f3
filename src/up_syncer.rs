//! `UpSyncer` — streaming uploader that tails local writes and pushes them
//! to the remote, recording completion back into each object's status.
//!
//! Driven by an unbounded `tokio::sync::mpsc` channel of write
//! notifications; one worker task drains it sequentially, but per-object
//! ordering and exclusivity during the actual upload session comes from
//! `SynchronizerOnObjId`, not from channel ordering alone (two writes to
//! different objects may be queued in either order and still upload
//! concurrently once a multi-worker pool is warranted — a single worker is
//! enough for the concurrency this crate targets, see spec section 5).

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{instrument, warn};

use crate::error::{Result, StoreError};
use crate::obj_files::ObjFiles;
use crate::obj_id::ObjId;
use crate::ports::{ByteRange, RemoteStorage};

const UPLOAD_CHUNK_LEN: u64 = 64 * 1024;

enum Task {
    Upload { obj_id: ObjId, version: u64 },
    RemoveCurrent { obj_id: ObjId },
}

pub struct UpSyncer {
    tx: mpsc::UnboundedSender<Task>,
    worker: JoinHandle<()>,
}

impl UpSyncer {
    pub fn start(obj_files: Arc<ObjFiles>, remote: Arc<dyn RemoteStorage>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(obj_files, remote, rx));
        Self { tx, worker }
    }

    /// Notify the syncer that `version` was just written locally for
    /// `obj_id` and should be pushed to remote.
    pub fn tap_file_write(&self, obj_id: ObjId, version: u64) -> Result<()> {
        self.tx
            .send(Task::Upload { obj_id, version })
            .map_err(|_| StoreError::Cancelled)
    }

    /// Queue a removal-upload for the object's current version, ordered
    /// after any writes already queued for it.
    pub fn remove_current_version_of(&self, obj_id: ObjId) -> Result<()> {
        self.tx
            .send(Task::RemoveCurrent { obj_id })
            .map_err(|_| StoreError::Cancelled)
    }

    pub fn stop(self) {
        self.worker.abort();
    }
}

async fn run_worker(
    obj_files: Arc<ObjFiles>,
    remote: Arc<dyn RemoteStorage>,
    mut rx: mpsc::UnboundedReceiver<Task>,
) {
    while let Some(task) = rx.recv().await {
        let result = match task {
            Task::Upload { obj_id, version } => upload_one(&obj_files, &remote, &obj_id, version).await,
            Task::RemoveCurrent { obj_id } => remove_one(&obj_files, &obj_id).await,
        };
        if let Err(err) = result {
            warn!(error = %err, "up-sync task failed");
        }
    }
}

#[instrument(skip(obj_files, remote), fields(%obj_id, version))]
async fn upload_one(
    obj_files: &Arc<ObjFiles>,
    remote: &Arc<dyn RemoteStorage>,
    obj_id: &ObjId,
    version: u64,
) -> Result<()> {
    let obj = obj_files
        .find_obj(obj_id)?
        .ok_or_else(|| StoreError::NotFound(obj_id.to_string()))?;

    obj_files
        .synchronizer()
        .sync(obj_id, || async {
            let base_version = obj.latest_synced_remote_version();
            let diffed_layout = obj.diff_for_upload_of(version, &[])?;
            let local_header = diffed_layout.header.clone();
            let mut header = Vec::new();
            diffed_layout.encode(&mut header)?;

            let session = remote
                .begin_upload(obj_id, base_version.is_none(), base_version, &header)
                .await?;
            obj.begin_upload(
                version,
                session.assigned_version,
                local_header.clone(),
                local_header,
            )?;

            let upload_result = stream_and_finalize(&obj, remote, &session.id, version).await;
            match upload_result {
                Ok(outcome) => {
                    obj.record_upload_completion(version, outcome.remote_version, outcome.header_change)?;
                    obj_files.schedule_gc(obj_id.clone());
                    Ok(())
                }
                Err(err) => {
                    obj.abort_upload()?;
                    Err(err)
                }
            }
        })
        .await
}

async fn stream_and_finalize(
    obj: &crate::synced_obj::SyncedObj,
    remote: &Arc<dyn RemoteStorage>,
    session: &crate::ports::UploadSessionId,
    version: u64,
) -> Result<crate::ports::UploadOutcome> {
    let mut src = obj.get_obj_src_from_local_and_synced_branch(version)?;
    let total = src.total_len();
    let mut offset = 0u64;
    while offset < total {
        let end = (offset + UPLOAD_CHUNK_LEN).min(total);
        let bytes = src.read_range(ByteRange { start: offset, end })?;
        remote.continue_upload(session, bytes).await?;
        offset = end;
    }
    remote.finalize_upload(session).await
}

#[instrument(skip(obj_files), fields(%obj_id))]
async fn remove_one(obj_files: &Arc<ObjFiles>, obj_id: &ObjId) -> Result<()> {
    let obj = obj_files
        .find_obj(obj_id)?
        .ok_or_else(|| StoreError::NotFound(obj_id.to_string()))?;

    obj_files
        .synchronizer()
        .sync(obj_id, || async {
            obj.record_removal_upload_and_gc().await?;
            obj_files.schedule_gc(obj_id.clone());
            Ok::<(), StoreError>(())
        })
        .await
}
