//! `SyncedObj` — the per-object façade.
//!
//! Owns one object's status, its local/remote version-handle caches, and
//! coordinates reads, writes, uploads, and base absorption. Every public
//! method here assumes the caller already holds the `SynchronizerOnObjId`
//! lock for this object's id (see `obj_files::ObjFiles`, which owns that
//! synchronizer and is the only thing that constructs a `SyncedObj`).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use parking_lot::Mutex as SyncMutex;
use synced_store_wire::{LayoutTable, UploadHeaderSidecar};
use tracing::instrument;

use crate::downloader::Downloader;
use crate::error::{Result, StoreError};
use crate::events::{NodeEvent, NodeEventBus, NodeEventKind};
use crate::obj_id::ObjId;
use crate::obj_on_disk::{NewVersionWriter, ObjOnDisk, ObjSource, ReuseHint};
use crate::obj_status::ObjStatus;
use crate::ports::{ByteRange, EncryptedByteSource, RemoteStorage};

type VersionHandle = Arc<SyncMutex<ObjOnDisk>>;

fn write_sidecar_atomic(path: &std::path::Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("upload.tmp");
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

pub struct SyncedObj {
    obj_id: ObjId,
    folder: PathBuf,
    remote: Arc<dyn RemoteStorage>,
    downloader: Downloader,
    events: NodeEventBus,
    status: SyncMutex<ObjStatus>,
    status_path: PathBuf,
    /// keyed by local version number
    local_vers: Cache<u64, VersionHandle>,
    /// keyed by remote version number
    remote_vers: Cache<u64, VersionHandle>,
}

impl SyncedObj {
    pub fn new(
        obj_id: ObjId,
        folder: PathBuf,
        remote: Arc<dyn RemoteStorage>,
        events: NodeEventBus,
        version_handle_ttl: Duration,
        status: ObjStatus,
    ) -> Self {
        let status_path = folder.join("status.json");
        Self {
            obj_id,
            folder,
            downloader: Downloader::new(remote.clone()),
            remote,
            events,
            status: SyncMutex::new(status),
            status_path,
            local_vers: Cache::builder().time_to_idle(version_handle_ttl).build(),
            remote_vers: Cache::builder().time_to_idle(version_handle_ttl).build(),
        }
    }

    pub fn obj_id(&self) -> &ObjId {
        &self.obj_id
    }

    pub fn sync_status(&self) -> crate::obj_status::SyncStatus {
        self.status.lock().sync_status()
    }

    fn persist_status(&self) -> Result<()> {
        self.status.lock().write_to(&self.status_path)
    }

    fn local_path(&self, version: u64) -> PathBuf {
        self.folder.join(format!("{version}.unsynced"))
    }

    fn remote_path(&self, version: u64) -> PathBuf {
        self.folder.join(format!("{version}.v"))
    }

    fn upload_sidecar_path(&self, local_version: u64) -> PathBuf {
        self.folder.join(format!("{local_version}.upload"))
    }

    fn open_local(&self, version: u64) -> Result<VersionHandle> {
        if let Some(handle) = self.local_vers.get(&version) {
            return Ok(handle);
        }
        let obj = ObjOnDisk::for_existing_file(self.local_path(version), version)?;
        let handle = Arc::new(SyncMutex::new(obj));
        self.local_vers.insert(version, handle.clone());
        Ok(handle)
    }

    fn open_remote_cached(&self, version: u64) -> Option<VersionHandle> {
        self.remote_vers.get(&version)
    }

    /// Write a new version from an encrypted byte stream the crypto
    /// pipeline produces. `base_version` is the immediate predecessor whose
    /// segments the stream may reference by offset (the pipeline decides
    /// what to diff against; this just records the relation).
    #[instrument(skip(self, header, source), fields(obj_id = %self.obj_id))]
    pub async fn save_new_version(
        &self,
        header: Vec<u8>,
        base_version: Option<u64>,
        mut source: Box<dyn EncryptedByteSource>,
    ) -> Result<u64> {
        let next_version = {
            let status = self.status.lock();
            if status.conflicting {
                return Err(StoreError::Conflict {
                    obj_id: self.obj_id.to_string(),
                    version: status.current_version.unwrap_or(0),
                });
            }
            status.current_version.map(|v| v + 1).unwrap_or(1)
        };

        let mut writer = NewVersionWriter::new(self.folder.clone(), next_version, header);
        while let Some(chunk) = source.next_chunk().await? {
            writer.append_bytes(&chunk);
        }
        let obj = writer.finish()?;
        self.local_vers
            .insert(next_version, Arc::new(SyncMutex::new(obj)));

        {
            let mut status = self.status.lock();
            status.set_local_current_version(next_version, base_version);
        }
        self.persist_status()?;
        Ok(next_version)
    }

    /// Rewrite `version`'s base-referenced segments into present ones, then
    /// drop the base relation from status so the base becomes collectable.
    pub fn combine_local_base_if_present(&self, version: u64) -> Result<()> {
        let base_version = {
            let status = self.status.lock();
            match status.base_of_local_version(version) {
                Some(b) => b,
                None => return Ok(()),
            }
        };

        let handle = self.open_local(version)?;
        let base_handle = self.get_base_handle(base_version)?;

        let mut base_src = base_handle.lock().get_src()?;
        handle
            .lock()
            .absorb_immediate_base_version(&mut base_src)?;

        {
            let mut status = self.status.lock();
            status.clear_local_base(version);
        }
        self.persist_status()
    }

    fn get_base_handle(&self, version: u64) -> Result<VersionHandle> {
        let already_synced = self.status.lock().synced_versions.contains_key(&version);
        if already_synced {
            if let Some(handle) = self.open_remote_cached(version) {
                return Ok(handle);
            }
        }
        self.open_local(version)
    }

    /// Serve a read of `version`, addressed in local version numbering:
    /// versions at or below the synced threshold now live under their
    /// remote file name; everything else is still an `.unsynced` file.
    pub fn get_obj_src_from_local_and_synced_branch(&self, version: u64) -> Result<ObjSource> {
        let (remote_version, base) = {
            let status = self.status.lock();
            let remote_version = status.synced_versions.get(&version).copied();
            let base = status.base_of_local_version(version);
            (remote_version, base)
        };

        let mut src = if let Some(remote_version) = remote_version {
            let handle = self
                .open_remote_cached(remote_version)
                .map(Ok)
                .unwrap_or_else(|| {
                    let obj = ObjOnDisk::for_existing_file(
                        self.remote_path(remote_version),
                        remote_version,
                    )?;
                    let handle = Arc::new(SyncMutex::new(obj));
                    self.remote_vers.insert(remote_version, handle.clone());
                    Ok(handle)
                })?;
            handle.lock().get_src()?
        } else {
            self.open_local(version)?.lock().get_src()?
        };

        if let Some(base_version) = base {
            let base_handle = self.get_base_handle(base_version)?;
            let base_src = base_handle.lock().get_src()?;
            src = src.with_base(base_src);
        }
        Ok(src)
    }

    /// Serve a read of `version` addressed in *remote* version numbering,
    /// downloading it on demand via the `RemoteStorage` port if this
    /// device has never materialised it.
    #[instrument(skip(self), fields(obj_id = %self.obj_id))]
    pub async fn get_obj_src_from_remote_and_synced_branch(&self, version: u64) -> Result<ObjSource> {
        let handle = match self.open_remote_cached(version) {
            Some(handle) => handle,
            None => self.download_remote_version(version).await?,
        };
        handle.lock().get_src()
    }

    async fn download_remote_version(&self, version: u64) -> Result<VersionHandle> {
        let current = self.remote.get_current_obj_version(&self.obj_id).await?;
        if current.version != version {
            return Err(StoreError::NotFound(format!(
                "{}@{version}: only the current remote version can be fetched by this port",
                self.obj_id
            )));
        }
        let total_len = current.layout.total_len();
        let bytes = self
            .downloader
            .fetch_range(&self.obj_id, version, ByteRange { start: 0, end: total_len })
            .await?;
        let obj = ObjOnDisk::create_file_for_existing_version(
            &self.folder,
            version,
            "v",
            current.layout,
            &bytes,
        )?;
        let handle = Arc::new(SyncMutex::new(obj));
        self.remote_vers.insert(version, handle.clone());
        Ok(handle)
    }

    /// Diff `version`'s on-disk layout against reuse hints so the upload
    /// can skip bytes the server already holds in its base.
    pub fn diff_for_upload_of(&self, version: u64, reuse: &[ReuseHint]) -> Result<LayoutTable> {
        let handle = self.open_local(version)?;
        let layout = handle.lock().diff_from_base(reuse);
        Ok(layout)
    }

    /// Mark `local_version` as having an upload in flight targeting
    /// `upload_version`, pinning it against GC for the duration (I1), and
    /// persist the crash-resumable `.upload` sidecar recording both headers.
    pub fn begin_upload(
        &self,
        local_version: u64,
        upload_version: u64,
        local_header: Vec<u8>,
        upload_header: Vec<u8>,
    ) -> Result<()> {
        let sidecar = UploadHeaderSidecar::new(local_version, upload_version, local_header, upload_header)?;
        let mut buf = Vec::new();
        sidecar.encode(&mut buf)?;
        write_sidecar_atomic(&self.upload_sidecar_path(local_version), &buf)?;

        {
            let mut status = self.status.lock();
            status.begin_upload(local_version, upload_version);
        }
        self.persist_status()
    }

    pub fn abort_upload(&self) -> Result<()> {
        let local_version = { self.status.lock().in_flight_upload.map(|u| u.local_version) };
        if let Some(local_version) = local_version {
            let _ = std::fs::remove_file(self.upload_sidecar_path(local_version));
        }
        {
            let mut status = self.status.lock();
            status.abort_upload();
        }
        self.persist_status()
    }

    /// Record that `local_version`'s upload completed as `upload_version`:
    /// status moves it into `synced_versions`, and its file is renamed from
    /// `.unsynced` to `.v` (I3), moving cache residency accordingly. If the
    /// server rewrote the header in `header_change`, it is applied to the
    /// version file before the rename. The `.upload` sidecar is removed.
    #[instrument(skip(self, header_change), fields(obj_id = %self.obj_id))]
    pub fn record_upload_completion(
        &self,
        local_version: u64,
        upload_version: u64,
        header_change: Option<Vec<u8>>,
    ) -> Result<()> {
        let handle = self.open_local(local_version)?;
        handle
            .lock()
            .move_file_and_proxy_this(self.remote_path(upload_version), header_change)?;
        self.local_vers.invalidate(&local_version);
        self.remote_vers.insert(upload_version, handle);

        let _ = std::fs::remove_file(self.upload_sidecar_path(local_version));

        {
            let mut status = self.status.lock();
            status.record_upload_completion(local_version, upload_version);
        }
        self.persist_status()
    }

    /// User-initiated removal of the current version: there is no longer a
    /// locally visible current version, and the object needs a removal
    /// request pushed to the server.
    pub fn remove_current_version(&self) -> Result<()> {
        {
            let mut status = self.status.lock();
            status.current_version = None;
            status.mark_removal_requested();
        }
        self.persist_status()
    }

    /// Push the pending removal to the server and fold the acknowledgement
    /// into status; the caller (`ObjFiles`) is responsible for scheduling a
    /// GC pass afterwards so the now-garbage files are actually deleted.
    #[instrument(skip(self), fields(obj_id = %self.obj_id))]
    pub async fn record_removal_upload_and_gc(&self) -> Result<()> {
        self.remote.request_removal(&self.obj_id).await?;
        {
            let mut status = self.status.lock();
            status.record_remote_removal_completion();
        }
        self.persist_status()
    }

    pub fn record_remote_change(&self, new_remote_version: u64) -> Result<()> {
        {
            let mut status = self.status.lock();
            status.record_remote_change(new_remote_version);
        }
        self.persist_status()?;
        self.publish(NodeEventKind::RemoteChange { new_remote_version });
        Ok(())
    }

    pub fn record_remote_removal(&self) -> Result<()> {
        {
            let mut status = self.status.lock();
            status.record_remote_removal();
        }
        self.persist_status()?;
        self.publish(NodeEventKind::RemoteRemoval);
        Ok(())
    }

    pub fn record_version_archival(&self, archived_version: u64) -> Result<()> {
        {
            let mut status = self.status.lock();
            status.record_version_archival(archived_version);
        }
        self.persist_status()?;
        self.publish(NodeEventKind::RemoteVersionArchival { archived_version });
        Ok(())
    }

    pub fn record_arch_version_removal(&self, removed_arch_version: u64) -> Result<()> {
        {
            let mut status = self.status.lock();
            status.record_arch_version_removal(removed_arch_version);
        }
        self.persist_status()?;
        self.publish(NodeEventKind::RemoteArchVersionRemoval {
            removed_arch_version,
        });
        Ok(())
    }

    fn publish(&self, kind: NodeEventKind) {
        self.events.publish(NodeEvent {
            obj_id: self.obj_id.clone(),
            kind,
            sync_status: self.sync_status(),
        });
    }

    pub fn get_non_garbage_versions(&self) -> crate::obj_status::NonGarbageSnapshot {
        self.status.lock().get_non_garbage_versions()
    }

    pub fn is_fully_collectable(&self) -> bool {
        self.status.lock().is_fully_collectable()
    }

    pub fn needs_removal_on_remote(&self) -> bool {
        self.status.lock().needs_removal_on_remote()
    }

    /// The remote version number this object's current synced head maps
    /// to, if any — the base `UpSyncer` diffs the next upload against.
    pub fn latest_synced_remote_version(&self) -> Option<u64> {
        let status = self.status.lock();
        status
            .latest_synced_version()
            .and_then(|local| status.synced_versions.get(&local).copied())
    }
}
