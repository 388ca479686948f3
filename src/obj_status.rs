//! `ObjStatus` — persistent per-object state machine.
//!
//! Backed by `status.json` in the object folder, loaded once and kept
//! in-memory; every mutator here is meant to be called while holding the
//! object's `SynchronizerOnObjId` lock, and every public mutation is
//! followed by a call to `write_to` before the caller releases that lock
//! (see `synced_obj`).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::obj_id::ObjId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightUpload {
    pub local_version: u64,
    pub upload_version: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NonGarbageSet {
    pub versions: BTreeSet<u64>,
    pub gc_max_ver: Option<u64>,
}

impl NonGarbageSet {
    /// Matches the GC rule in spec section 4.10: a version is garbage iff
    /// it is absent from this set AND (no `gc_max_ver` bound, or the version
    /// is below it). `gc_max_ver` is a conservative high-water mark: once
    /// set, everything at or above it is treated as live by default.
    pub fn is_garbage(&self, version: u64) -> bool {
        let below_bound = self.gc_max_ver.map(|max| version < max).unwrap_or(true);
        !self.versions.contains(&version) && below_bound
    }
}

#[derive(Debug, Clone, Default)]
pub struct NonGarbageSnapshot {
    pub local: NonGarbageSet,
    pub remote: NonGarbageSet,
    pub upload_version: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Synced,
    Unsynced,
    Behind,
    Conflicting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub state: SyncState,
    pub local: Option<u64>,
    pub synced: Option<u64>,
    pub remote: Option<u64>,
}

/// Persistent, JSON-serialised state for one object. Field names are
/// snake_case Rust idiom; the on-disk shape is otherwise a direct mapping
/// of spec section 3's `ObjStatus` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjStatus {
    pub obj_id: ObjId,
    pub current_version: Option<u64>,
    /// local-only version -> its base version, if any
    pub local_versions: BTreeMap<u64, Option<u64>>,
    /// local version -> uploaded remote version
    pub synced_versions: BTreeMap<u64, u64>,
    pub remote_latest: u64,
    pub archived_versions: BTreeSet<u64>,
    pub archived: bool,
    pub needs_removal_on_remote: bool,
    pub conflicting: bool,
    pub local_gc_max_ver: Option<u64>,
    pub remote_gc_max_ver: Option<u64>,
    pub in_flight_upload: Option<InFlightUpload>,
}

impl ObjStatus {
    pub fn make_new(obj_id: ObjId) -> Self {
        Self {
            obj_id,
            current_version: None,
            local_versions: BTreeMap::new(),
            synced_versions: BTreeMap::new(),
            remote_latest: 0,
            archived_versions: BTreeSet::new(),
            archived: false,
            needs_removal_on_remote: false,
            conflicting: false,
            local_gc_max_ver: None,
            remote_gc_max_ver: None,
            in_flight_upload: None,
        }
    }

    /// Status for an object whose existence this device learned about by
    /// downloading its current remote version (rather than writing it).
    pub fn make_for_downloaded_version(obj_id: ObjId, version: u64, current_on_server: bool) -> Self {
        let mut status = Self::make_new(obj_id);
        status.remote_latest = version;
        if current_on_server {
            status.current_version = Some(version);
        }
        status
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Atomic replace: write to a sibling temp file, then rename over the
    /// target, so a crash never leaves `status.json` partially written.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &bytes)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn set_local_current_version(&mut self, version: u64, base_version: Option<u64>) {
        self.local_versions.insert(version, base_version);
        self.current_version = Some(version);
    }

    /// Called once `ObjOnDisk::absorb_immediate_base_version` has rewritten
    /// a local file so it no longer points at its base; the base relation
    /// is dropped so the base version becomes eligible for GC.
    pub fn clear_local_base(&mut self, version: u64) {
        if let Some(base) = self.local_versions.get_mut(&version) {
            *base = None;
        }
    }

    pub fn begin_upload(&mut self, local_version: u64, upload_version: u64) {
        self.in_flight_upload = Some(InFlightUpload {
            local_version,
            upload_version,
        });
    }

    pub fn abort_upload(&mut self) {
        self.in_flight_upload = None;
    }

    /// Records that `local_version`'s upload was acknowledged as
    /// `upload_version`. The local-only bookkeeping entry is dropped (its
    /// `.unsynced` file has been renamed to `.v` by the caller — see I3)
    /// and `local_gc_max_ver` is raised so any stale, untracked
    /// `.unsynced` files at or below it fall out of the conservative
    /// "assume live" zone.
    pub fn record_upload_completion(&mut self, local_version: u64, upload_version: u64) {
        self.synced_versions.insert(local_version, upload_version);
        self.remote_latest = self.remote_latest.max(upload_version);
        self.local_versions.remove(&local_version);
        self.local_gc_max_ver = Some(local_version + 1);
        if self
            .in_flight_upload
            .as_ref()
            .is_some_and(|u| u.local_version == local_version)
        {
            self.in_flight_upload = None;
        }
    }

    /// Idempotent: a stale or duplicate notification (`new_ver <=
    /// remote_latest`) is ignored, leaving status bit-identical (P4).
    pub fn record_remote_change(&mut self, new_ver: u64) {
        if new_ver <= self.remote_latest {
            return;
        }
        let previous_remote_latest = self.remote_latest;
        self.remote_latest = new_ver;

        let Some(cur) = self.current_version else {
            return;
        };
        let Some(base) = self.local_versions.get(&cur) else {
            // current version is already synced (or doesn't exist locally);
            // a remote advance alone cannot conflict with it.
            return;
        };
        if *base != Some(previous_remote_latest) {
            self.conflicting = true;
        }
    }

    pub fn record_remote_removal(&mut self) {
        self.archived = true;
        self.needs_removal_on_remote = false;
    }

    pub fn record_version_archival(&mut self, version: u64) {
        self.archived_versions.insert(version);
    }

    pub fn record_arch_version_removal(&mut self, version: u64) {
        self.archived_versions.remove(&version);
    }

    pub fn mark_removal_requested(&mut self) {
        self.needs_removal_on_remote = true;
    }

    pub fn record_remote_removal_completion(&mut self) {
        self.needs_removal_on_remote = false;
        self.archived = true;
    }

    pub fn get_non_garbage_versions(&self) -> NonGarbageSnapshot {
        let mut local_ng = BTreeSet::new();
        if let Some(cur) = self.current_version {
            if self.local_versions.contains_key(&cur) {
                local_ng.insert(cur);
            }
        }
        for base in self.local_versions.values().flatten() {
            local_ng.insert(*base);
        }
        if let Some(upload) = &self.in_flight_upload {
            if self.local_versions.contains_key(&upload.local_version) {
                local_ng.insert(upload.local_version);
            }
        }

        let mut remote_ng = BTreeSet::new();
        if self.remote_latest > 0 {
            remote_ng.insert(self.remote_latest);
        }
        if let Some(cur) = self.current_version {
            if let Some(rv) = self.synced_versions.get(&cur) {
                remote_ng.insert(*rv);
            }
        }
        remote_ng.extend(&self.archived_versions);

        NonGarbageSnapshot {
            local: NonGarbageSet {
                versions: local_ng,
                gc_max_ver: self.local_gc_max_ver,
            },
            remote: NonGarbageSet {
                versions: remote_ng,
                gc_max_ver: self.remote_gc_max_ver,
            },
            upload_version: self.in_flight_upload.as_ref().map(|u| u.upload_version),
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archived
    }

    pub fn never_uploaded(&self) -> bool {
        self.synced_versions.is_empty()
    }

    pub fn needs_removal_on_remote(&self) -> bool {
        self.needs_removal_on_remote
    }

    /// Largest *local* version number that has been synced — the threshold
    /// `SyncedObj::get_obj_src_from_local_and_synced_branch` uses to decide
    /// whether a requested version now lives under its remote name.
    pub fn latest_synced_version(&self) -> Option<u64> {
        self.synced_versions.keys().copied().max()
    }

    pub fn base_of_local_version(&self, version: u64) -> Option<u64> {
        self.local_versions.get(&version).copied().flatten()
    }

    pub fn sync_status(&self) -> SyncStatus {
        let local = self.current_version;
        let synced = self
            .current_version
            .and_then(|v| self.synced_versions.get(&v).copied());
        let remote = (self.remote_latest > 0).then_some(self.remote_latest);

        let state = if self.conflicting {
            SyncState::Conflicting
        } else if let Some(cur) = self.current_version {
            if self.local_versions.contains_key(&cur) {
                SyncState::Unsynced
            } else if let Some(rv) = synced {
                if self.remote_latest > rv {
                    SyncState::Behind
                } else {
                    SyncState::Synced
                }
            } else {
                SyncState::Unsynced
            }
        } else {
            SyncState::Synced
        };

        SyncStatus {
            state,
            local,
            synced,
            remote,
        }
    }

    /// I5: an object folder may be removed only once archived, with no
    /// pending removal upload, and no non-garbage versions on either side.
    pub fn is_fully_collectable(&self) -> bool {
        let snapshot = self.get_non_garbage_versions();
        self.archived
            && !self.needs_removal_on_remote
            && snapshot.local.versions.is_empty()
            && snapshot.remote.versions.is_empty()
            && snapshot.upload_version.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj_id() -> ObjId {
        ObjId::parse("obj-A").unwrap()
    }

    #[test]
    fn fresh_object_is_unsynced() {
        let mut status = ObjStatus::make_new(obj_id());
        status.set_local_current_version(1, None);
        assert!(status.local_versions.contains_key(&1));
        assert_eq!(status.current_version, Some(1));
        assert_eq!(status.sync_status().state, SyncState::Unsynced);
    }

    #[test]
    fn upload_completion_flips_to_synced() {
        let mut status = ObjStatus::make_new(obj_id());
        status.set_local_current_version(1, None);
        status.begin_upload(1, 7);
        status.record_upload_completion(1, 7);

        assert_eq!(status.synced_versions.get(&1), Some(&7));
        assert_eq!(status.remote_latest, 7);
        assert!(!status.local_versions.contains_key(&1));
        assert!(status.in_flight_upload.is_none());
        assert_eq!(status.sync_status().state, SyncState::Synced);
    }

    #[test]
    fn remote_change_marks_behind_when_current_is_synced() {
        let mut status = ObjStatus::make_new(obj_id());
        status.set_local_current_version(1, None);
        status.record_upload_completion(1, 7);

        status.record_remote_change(8);
        assert_eq!(status.remote_latest, 8);
        assert_eq!(status.sync_status().state, SyncState::Behind);
        assert!(!status.conflicting);
    }

    #[test]
    fn remote_change_is_idempotent() {
        let mut status = ObjStatus::make_new(obj_id());
        status.set_local_current_version(1, None);
        status.record_upload_completion(1, 7);
        status.record_remote_change(8);

        let before = format!("{status:?}");
        status.record_remote_change(8);
        let after = format!("{status:?}");
        assert_eq!(before, after);

        // a stale notification is also a no-op
        status.record_remote_change(3);
        assert_eq!(format!("{status:?}"), after);
    }

    #[test]
    fn unrelated_remote_advance_with_pending_local_write_conflicts() {
        // Scenario 4: local save v=2 is based on version 5, stale even at
        // the time it was written (remote was already at 7); absorbing a
        // remote head whose base isn't our last-known remote_latest is a
        // conflict.
        let mut status = ObjStatus::make_new(obj_id());
        status.set_local_current_version(1, None);
        status.record_upload_completion(1, 7);
        status.set_local_current_version(2, Some(5));

        status.record_remote_change(9);
        assert!(status.conflicting);
        assert_eq!(status.sync_status().state, SyncState::Conflicting);
    }

    #[test]
    fn shared_base_remote_advance_does_not_conflict() {
        let mut status = ObjStatus::make_new(obj_id());
        status.set_local_current_version(1, None);
        status.record_upload_completion(1, 7);
        status.set_local_current_version(2, Some(7));

        status.record_remote_change(8);
        assert!(!status.conflicting);
    }

    #[test]
    fn non_garbage_tracks_current_and_bases() {
        let mut status = ObjStatus::make_new(obj_id());
        status.set_local_current_version(1, None);
        status.set_local_current_version(2, Some(1));

        let snapshot = status.get_non_garbage_versions();
        assert!(snapshot.local.versions.contains(&1));
        assert!(snapshot.local.versions.contains(&2));
    }

    #[test]
    fn non_garbage_drops_absorbed_base() {
        let mut status = ObjStatus::make_new(obj_id());
        status.set_local_current_version(1, None);
        status.set_local_current_version(2, Some(1));
        status.clear_local_base(2);

        let snapshot = status.get_non_garbage_versions();
        assert!(!snapshot.local.versions.contains(&1));
        assert!(snapshot.local.versions.contains(&2));
    }

    #[test]
    fn gc_max_ver_protects_versions_above_bound_regardless_of_nonGarbage() {
        let set = NonGarbageSet {
            versions: BTreeSet::new(),
            gc_max_ver: Some(5),
        };
        assert!(!set.is_garbage(5));
        assert!(!set.is_garbage(10));
        assert!(set.is_garbage(4));
    }

    #[test]
    fn collectable_only_when_archived_and_empty() {
        let mut status = ObjStatus::make_new(obj_id());
        assert!(!status.is_fully_collectable());
        status.archived = true;
        assert!(status.is_fully_collectable());

        status.archived_versions.insert(3);
        assert!(!status.is_fully_collectable());
    }

    #[test]
    fn persist_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");

        let mut status = ObjStatus::make_new(obj_id());
        status.set_local_current_version(1, None);
        status.write_to(&path).unwrap();

        let reloaded = ObjStatus::read_from(&path).unwrap();
        assert_eq!(reloaded.obj_id, status.obj_id);
        assert_eq!(reloaded.current_version, Some(1));
    }
}
