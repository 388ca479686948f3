//! `ObjFolders` — maps object ids to on-disk folders through a two-level
//! cache hierarchy.
//!
//! Recently-touched objects live in a bounded, TTL-backed recent tier
//! (`moka::sync::Cache`); everything else resolves by a deterministic,
//! hash-prefixed path under the deeper tier and is not cached in memory at
//! all — it's just a disk lookup. Objects are demoted out of the recent
//! tier conservatively: only once neither tier sees ongoing activity.

use std::path::{Path, PathBuf};
use std::time::Duration;

use moka::sync::Cache;

use crate::obj_id::ObjId;

pub struct ObjFolders {
    root: PathBuf,
    recent: Cache<ObjId, PathBuf>,
}

impl ObjFolders {
    pub fn new(root: impl Into<PathBuf>, recent_tier_capacity: u64, ttl: Duration) -> Self {
        Self {
            root: root.into(),
            recent: Cache::builder()
                .max_capacity(recent_tier_capacity)
                .time_to_idle(ttl)
                .build(),
        }
    }

    fn deep_path(&self, obj_id: &ObjId) -> PathBuf {
        // `ObjId::Root`'s `as_str()` is "" — joining that segment would
        // collapse the path onto the shard directory itself, colliding with
        // every other object sharing the shard prefix. Give it a distinct
        // segment instead.
        let key = match obj_id {
            ObjId::Root => "_root",
            ObjId::Id(s) => s.as_str(),
        };
        let prefix = deep_hash_prefix(key);
        self.root.join("deep").join(prefix).join(key)
    }

    /// Resolve (and, via the recent tier, remember) the folder for `obj_id`.
    /// Does not touch the filesystem — callers create the folder lazily on
    /// first write.
    pub fn get_folder_access_for(&self, obj_id: &ObjId) -> PathBuf {
        if let Some(path) = self.recent.get(obj_id) {
            return path;
        }
        let path = self.deep_path(obj_id);
        self.recent.insert(obj_id.clone(), path.clone());
        path
    }

    /// Ids currently resident in the recent tier.
    pub fn list_recent(&self) -> Vec<ObjId> {
        self.recent.iter().map(|(k, _)| (*k).clone()).collect()
    }

    /// Conservative: only demote an id whose folder access count has not
    /// grown since the last GC pass touched it — callers supply that via
    /// `still_active`, since activity tracking (open handles, in-flight
    /// uploads) lives in `SyncedObj`/`UpSyncer`, not here.
    pub fn can_move_obj_to_deeper_cache(&self, obj_id: &ObjId, still_active: bool) -> bool {
        !still_active && self.recent.contains_key(obj_id)
    }

    pub fn remove_folder_of(&self, obj_id: &ObjId) {
        let path = self.deep_path(obj_id);
        let _ = std::fs::remove_dir_all(&path);
        self.recent.invalidate(obj_id);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn deep_hash_prefix(key: &str) -> String {
    // A short, stable shard prefix — not cryptographic, just enough to keep
    // any one deep-tier directory from growing unbounded.
    let mut hash: u32 = 2166136261;
    for byte in key.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    format!("{:02x}", hash & 0xff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_stable_path_for_same_id() {
        let folders = ObjFolders::new("/store", 16, Duration::from_secs(60));
        let obj_id = ObjId::parse("obj-A").unwrap();
        let first = folders.get_folder_access_for(&obj_id);
        let second = folders.get_folder_access_for(&obj_id);
        assert_eq!(first, second);
    }

    #[test]
    fn distinct_ids_get_distinct_paths() {
        let folders = ObjFolders::new("/store", 16, Duration::from_secs(60));
        let a = folders.get_folder_access_for(&ObjId::parse("obj-A").unwrap());
        let b = folders.get_folder_access_for(&ObjId::parse("obj-B").unwrap());
        assert_ne!(a, b);
    }

    #[test]
    fn recent_tier_lists_accessed_ids() {
        let folders = ObjFolders::new("/store", 16, Duration::from_secs(60));
        let obj_id = ObjId::parse("obj-A").unwrap();
        folders.get_folder_access_for(&obj_id);
        folders.recent.run_pending_tasks();
        assert!(folders.list_recent().contains(&obj_id));
    }

    #[test]
    fn demotion_requires_inactivity() {
        let folders = ObjFolders::new("/store", 16, Duration::from_secs(60));
        let obj_id = ObjId::parse("obj-A").unwrap();
        folders.get_folder_access_for(&obj_id);
        assert!(!folders.can_move_obj_to_deeper_cache(&obj_id, true));
        assert!(folders.can_move_obj_to_deeper_cache(&obj_id, false));
    }

    #[test]
    fn remove_folder_evicts_from_recent_tier() {
        let folders = ObjFolders::new("/store", 16, Duration::from_secs(60));
        let obj_id = ObjId::parse("obj-A").unwrap();
        folders.get_folder_access_for(&obj_id);
        folders.remove_folder_of(&obj_id);
        folders.recent.run_pending_tasks();
        assert!(!folders.list_recent().contains(&obj_id));
    }
}
