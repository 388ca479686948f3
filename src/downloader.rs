//! `Downloader` — on-demand fetch of missing segments of a remote version.
//!
//! Range GETs are idempotent, so failures are retried with exponential
//! back-off up to a small attempt ceiling; anything left over surfaces as
//! `StoreError::Transient` to the caller rather than being retried forever.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{instrument, warn};

use crate::error::{Result, StoreError};
use crate::obj_id::ObjId;
use crate::ports::{ByteRange, RemoteStorage};

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct Downloader {
    remote: Arc<dyn RemoteStorage>,
}

impl Downloader {
    pub fn new(remote: Arc<dyn RemoteStorage>) -> Self {
        Self { remote }
    }

    #[instrument(skip(self), fields(obj_id = %obj_id, version))]
    pub async fn fetch_range(&self, obj_id: &ObjId, version: u64, range: ByteRange) -> Result<Bytes> {
        let mut backoff = INITIAL_BACKOFF;
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            match self.remote.download_range(obj_id, version, range).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) if err.is_transient() => {
                    warn!(attempt, ?backoff, "transient download error, retrying");
                    last_err = Some(err);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| StoreError::Transient("download exhausted retries".into())))
    }

    /// Fetch several disjoint ranges and splice them together in order.
    /// Used by `SyncedObj` to fill in the gaps `read_segs_only_from_disk`
    /// reports for a version not fully materialised locally.
    pub async fn fetch_and_splice(
        &self,
        obj_id: &ObjId,
        version: u64,
        missing: &[ByteRange],
    ) -> Result<Bytes> {
        let mut out = BytesMut::new();
        for range in missing {
            let chunk = self.fetch_range(obj_id, version, *range).await?;
            out.put(chunk);
        }
        Ok(out.freeze())
    }
}
