//! `ObjFiles` — the store: factory and owning cache of `SyncedObj`,
//! arbitrating concurrent access by object id.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use tracing::{error, instrument, warn};

use crate::config::StoreConfig;
use crate::downloader::Downloader;
use crate::error::{Result, StoreError};
use crate::events::NodeEventBus;
use crate::gc::GC;
use crate::obj_folders::ObjFolders;
use crate::obj_id::ObjId;
use crate::obj_status::ObjStatus;
use crate::ports::{EncryptedByteSource, RemoteStorage};
use crate::sync_mutex::SynchronizerOnObjId;
use crate::synced_obj::SyncedObj;
use crate::up_syncer::UpSyncer;

pub struct ObjFiles {
    folders: Arc<ObjFolders>,
    sync: Arc<SynchronizerOnObjId>,
    remote: Arc<dyn RemoteStorage>,
    downloader: Downloader,
    events: NodeEventBus,
    gc: Arc<GC>,
    objs: Cache<ObjId, Arc<SyncedObj>>,
    version_handle_ttl: Duration,
}

impl ObjFiles {
    pub fn new(root: impl Into<PathBuf>, remote: Arc<dyn RemoteStorage>, config: &StoreConfig) -> Self {
        let folders = Arc::new(ObjFolders::new(
            root,
            config.recent_tier_capacity,
            config.version_handle_ttl,
        ));
        let sync = Arc::new(SynchronizerOnObjId::new());
        let gc = GC::new(folders.clone(), sync.clone());
        Self {
            folders,
            sync,
            downloader: Downloader::new(remote.clone()),
            remote,
            events: NodeEventBus::default(),
            gc,
            objs: Cache::builder().time_to_idle(config.synced_obj_ttl).build(),
            version_handle_ttl: config.version_handle_ttl,
        }
    }

    pub fn events(&self) -> &NodeEventBus {
        &self.events
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    pub fn gc(&self) -> &Arc<GC> {
        &self.gc
    }

    pub fn folders(&self) -> &Arc<ObjFolders> {
        &self.folders
    }

    pub fn synchronizer(&self) -> &Arc<SynchronizerOnObjId> {
        &self.sync
    }

    fn status_path(&self, obj_id: &ObjId) -> PathBuf {
        self.folders
            .get_folder_access_for(obj_id)
            .join("status.json")
    }

    fn make_synced_obj(&self, obj_id: ObjId, status: ObjStatus) -> Arc<SyncedObj> {
        let folder = self.folders.get_folder_access_for(&obj_id);
        Arc::new(SyncedObj::new(
            obj_id,
            folder,
            self.remote.clone(),
            self.events.clone(),
            self.version_handle_ttl,
            status,
        ))
    }

    /// Look up an already-known object, loading its status from disk on a
    /// cache miss. Returns `None` if the object has never been created
    /// (nor downloaded) on this device.
    #[instrument(skip(self), fields(obj_id = %obj_id))]
    pub fn find_obj(&self, obj_id: &ObjId) -> Result<Option<Arc<SyncedObj>>> {
        if let Some(obj) = self.objs.get(obj_id) {
            return Ok(Some(obj));
        }
        let path = self.status_path(obj_id);
        if !path.exists() {
            return Ok(None);
        }
        let status = match ObjStatus::read_from(&path) {
            Ok(status) => status,
            Err(StoreError::Json(err)) => {
                return Err(self.quarantine_corrupt(obj_id, &path, err.to_string()));
            }
            Err(err) => return Err(err),
        };
        let obj = self.make_synced_obj(obj_id.clone(), status);
        self.objs.insert(obj_id.clone(), obj.clone());
        Ok(Some(obj))
    }

    /// Move a status file that failed to parse out of the way and surface
    /// `StoreError::Corrupt` rather than let a single bad file wedge every
    /// future lookup of this object.
    fn quarantine_corrupt(&self, obj_id: &ObjId, path: &Path, reason: String) -> StoreError {
        let quarantined = path.with_extension("json.corrupt");
        if let Err(err) = std::fs::rename(path, &quarantined) {
            warn!(%obj_id, error = %err, "failed to quarantine corrupt status file");
        }
        error!(%obj_id, reason = %reason, "quarantining object with corrupt status file");
        StoreError::Corrupt { obj_id: obj_id.to_string(), reason }
    }

    /// Create the first version of a brand-new object. Fails with
    /// `ObjectExists` if this device already knows about `obj_id`.
    #[instrument(skip(self, header, source), fields(obj_id = %obj_id))]
    pub async fn save_first_version(
        &self,
        obj_id: ObjId,
        header: Vec<u8>,
        source: Box<dyn EncryptedByteSource>,
    ) -> Result<Arc<SyncedObj>> {
        if self.find_obj(&obj_id)?.is_some() {
            return Err(StoreError::ObjectExists(obj_id.to_string()));
        }
        let folder = self.folders.get_folder_access_for(&obj_id);
        std::fs::create_dir_all(&folder)?;

        let obj = self.make_synced_obj(obj_id.clone(), ObjStatus::make_new(obj_id.clone()));
        if let Err(err) = obj.save_new_version(header, None, source).await {
            let _ = std::fs::remove_dir_all(&folder);
            self.folders.remove_folder_of(&obj_id);
            return Err(err);
        }
        self.objs.insert(obj_id, obj.clone());
        Ok(obj)
    }

    /// Learn about an object for the first time by downloading its current
    /// remote version, rather than writing it locally.
    #[instrument(skip(self), fields(obj_id = %obj_id))]
    pub async fn make_by_downloading_current_version(
        &self,
        obj_id: ObjId,
    ) -> Result<Arc<SyncedObj>> {
        if let Some(obj) = self.find_obj(&obj_id)? {
            return Ok(obj);
        }
        let current = self.remote.get_current_obj_version(&obj_id).await?;
        let folder = self.folders.get_folder_access_for(&obj_id);
        std::fs::create_dir_all(&folder)?;

        let status = ObjStatus::make_for_downloaded_version(obj_id.clone(), current.version, true);
        status.write_to(&folder.join("status.json"))?;

        let obj = self.make_synced_obj(obj_id.clone(), status);
        let _ = obj
            .get_obj_src_from_remote_and_synced_branch(current.version)
            .await?;
        self.objs.insert(obj_id, obj.clone());
        Ok(obj)
    }

    /// Objects flagged `needsRemovalOnRemote` that have not yet had their
    /// removal request pushed — swept periodically by a higher-level
    /// scheduler and handed to `SyncedObj::record_removal_upload_and_gc`.
    pub fn find_objs_to_remove_on_remote(&self) -> Vec<ObjId> {
        self.objs
            .iter()
            .filter(|(_, obj)| obj.needs_removal_on_remote())
            .map(|(id, _)| (*id).clone())
            .collect()
    }

    pub fn schedule_gc(&self, obj_id: ObjId) {
        self.gc.schedule_collection(obj_id);
    }

    /// User-initiated removal: drops the locally visible current version and
    /// queues the removal upload through `up_syncer`, which later schedules
    /// the GC pass that reclaims the folder once the server acknowledges.
    #[instrument(skip(self, up_syncer), fields(obj_id = %obj_id))]
    pub fn remove_obj(&self, obj_id: ObjId, up_syncer: &UpSyncer) -> Result<()> {
        let obj = self
            .find_obj(&obj_id)?
            .ok_or_else(|| StoreError::NotFound(obj_id.to_string()))?;
        obj.remove_current_version()?;
        up_syncer.remove_current_version_of(obj_id)
    }
}
