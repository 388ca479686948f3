//! `GC` — incremental, per-object-serialised garbage collector.
//!
//! Operates purely at the file level: for a given object, it reads
//! `status.json`, computes the non-garbage snapshot (I1), and deletes any
//! `<n>.unsynced` / `<n>.v` / `<n>.upload` file that falls outside it.
//! Concurrent writers are excluded via `SynchronizerOnObjId`, so a
//! collection pass and a write/upload/remote-event fold never interleave
//! for the same object.
//!
//! `wip`/`scheduled` track which objects are mid-collection and which were
//! re-requested while that collection was running, so a schedule that
//! arrives during a pass is never dropped — it just triggers one more pass
//! once the current one finishes.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{instrument, warn};

use crate::error::Result;
use crate::obj_folders::ObjFolders;
use crate::obj_id::ObjId;
use crate::obj_status::ObjStatus;
use crate::sync_mutex::SynchronizerOnObjId;

#[derive(Default)]
struct GcState {
    wip: HashSet<ObjId>,
    scheduled: HashSet<ObjId>,
}

pub struct GC {
    folders: Arc<ObjFolders>,
    sync: Arc<SynchronizerOnObjId>,
    state: Mutex<GcState>,
}

impl GC {
    pub fn new(folders: Arc<ObjFolders>, sync: Arc<SynchronizerOnObjId>) -> Arc<Self> {
        Arc::new(Self {
            folders,
            sync,
            state: Mutex::new(GcState::default()),
        })
    }

    /// Request a collection pass for `obj_id`. If one is already running,
    /// the request is remembered and re-run immediately after the current
    /// pass completes, rather than being dropped or run concurrently.
    pub fn schedule_collection(self: &Arc<Self>, obj_id: ObjId) {
        let should_spawn = {
            let mut state = self.state.lock();
            if state.wip.contains(&obj_id) {
                state.scheduled.insert(obj_id.clone());
                false
            } else {
                state.wip.insert(obj_id.clone());
                true
            }
        };
        if should_spawn {
            let this = self.clone();
            tokio::spawn(async move {
                this.run_until_dry(obj_id).await;
            });
        }
    }

    async fn run_until_dry(self: Arc<Self>, obj_id: ObjId) {
        loop {
            if let Err(err) = self.sync.sync(&obj_id, || self.collect_in(&obj_id)).await {
                warn!(%obj_id, error = %err, "garbage collection pass failed");
            }
            let mut state = self.state.lock();
            if state.scheduled.remove(&obj_id) {
                continue;
            }
            state.wip.remove(&obj_id);
            break;
        }
    }

    #[instrument(skip(self), fields(obj_id = %obj_id))]
    async fn collect_in(&self, obj_id: &ObjId) -> Result<()> {
        let folder = self.folders.get_folder_access_for(obj_id);
        let status_path = folder.join("status.json");
        if !status_path.exists() {
            return Ok(());
        }
        let status = ObjStatus::read_from(&status_path)?;
        let snapshot = status.get_non_garbage_versions();
        let in_flight_local = status.in_flight_upload.map(|u| u.local_version);

        let mut remaining = 0usize;
        for entry in std::fs::read_dir(&folder)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some((stem, ext)) = name.rsplit_once('.') else {
                continue;
            };
            if name.as_ref() == "status.json" {
                remaining += 1;
                continue;
            }
            let Ok(version) = stem.parse::<u64>() else {
                // I2: unparseable version numbers are orphans, always collectable.
                std::fs::remove_file(entry.path())?;
                continue;
            };

            let garbage = match ext {
                "unsynced" => snapshot.local.is_garbage(version),
                "v" => snapshot.remote.is_garbage(version),
                "upload" => in_flight_local != Some(version),
                _ => false,
            };

            if garbage {
                std::fs::remove_file(entry.path())?;
            } else {
                remaining += 1;
            }
        }

        if status.is_fully_collectable() {
            if remaining <= 1 {
                // Only status.json (or nothing) left; remove it and the folder.
                let _ = std::fs::remove_file(&status_path);
                remove_empty_dir(&folder);
                self.folders.remove_folder_of(obj_id);
            }
        }
        Ok(())
    }
}

fn remove_empty_dir(path: &Path) {
    if let Err(err) = std::fs::remove_dir(path) {
        warn!(path = %path.display(), error = %err, "failed to remove object folder");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj_on_disk::NewVersionWriter;
    use std::time::Duration;

    fn setup() -> (tempfile::TempDir, Arc<ObjFolders>, Arc<SynchronizerOnObjId>) {
        let dir = tempfile::tempdir().unwrap();
        let folders = Arc::new(ObjFolders::new(dir.path(), 16, Duration::from_secs(60)));
        let sync = Arc::new(SynchronizerOnObjId::new());
        (dir, folders, sync)
    }

    #[tokio::test]
    async fn deletes_superseded_unsynced_version_once_absorbed_and_synced() {
        let (_dir, folders, sync) = setup();
        let obj_id = ObjId::parse("obj-A").unwrap();
        let folder = folders.get_folder_access_for(&obj_id);
        std::fs::create_dir_all(&folder).unwrap();

        // version 1 is stale: already superseded and synced away, so it's
        // no longer referenced by current_version, synced_versions, or any
        // base chain.
        NewVersionWriter::new(folder.clone(), 1, vec![])
            .finish()
            .unwrap();

        let mut status = ObjStatus::make_new(obj_id.clone());
        status.set_local_current_version(2, None);
        status.write_to(&folder.join("status.json")).unwrap();

        let gc = GC::new(folders, sync);
        gc.collect_in(&obj_id).await.unwrap();

        assert!(!folder.join("1.unsynced").exists());
    }

    #[tokio::test]
    async fn keeps_current_version_file() {
        let (_dir, folders, sync) = setup();
        let obj_id = ObjId::parse("obj-A").unwrap();
        let folder = folders.get_folder_access_for(&obj_id);
        std::fs::create_dir_all(&folder).unwrap();

        NewVersionWriter::new(folder.clone(), 1, vec![]).finish().unwrap();

        let mut status = ObjStatus::make_new(obj_id.clone());
        status.set_local_current_version(1, None);
        status.write_to(&folder.join("status.json")).unwrap();

        let gc = GC::new(folders, sync);
        gc.collect_in(&obj_id).await.unwrap();

        assert!(folder.join("1.unsynced").exists());
    }

    #[tokio::test]
    async fn removes_orphan_file_with_unparseable_version() {
        let (_dir, folders, sync) = setup();
        let obj_id = ObjId::parse("obj-A").unwrap();
        let folder = folders.get_folder_access_for(&obj_id);
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("garbled.unsynced"), b"x").unwrap();

        let status = ObjStatus::make_new(obj_id.clone());
        status.write_to(&folder.join("status.json")).unwrap();

        let gc = GC::new(folders, sync);
        gc.collect_in(&obj_id).await.unwrap();

        assert!(!folder.join("garbled.unsynced").exists());
    }

    #[tokio::test]
    async fn removes_folder_once_fully_archived_and_empty() {
        let (_dir, folders, sync) = setup();
        let obj_id = ObjId::parse("obj-A").unwrap();
        let folder = folders.get_folder_access_for(&obj_id);
        std::fs::create_dir_all(&folder).unwrap();

        let mut status = ObjStatus::make_new(obj_id.clone());
        status.archived = true;
        status.write_to(&folder.join("status.json")).unwrap();

        let gc = GC::new(folders, sync);
        gc.collect_in(&obj_id).await.unwrap();

        assert!(!folder.exists());
    }
}
