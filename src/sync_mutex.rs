//! `SynchronizerOnObjId` — a set of named FIFO mutexes keyed by `ObjId`.
//!
//! `sync(obj_id, action)` runs `action` under the mutex for that id. Actions
//! chain in acquisition order; once an action starts running it runs to
//! completion (no re-entrant cancellation). Entries are reference-counted
//! and dropped from the map once idle, so the map does not grow unbounded
//! over an object's lifetime.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use crate::obj_id::ObjId;

struct Entry {
    lock: AsyncMutex<()>,
    refs: std::sync::atomic::AtomicUsize,
}

#[derive(Default)]
pub struct SynchronizerOnObjId {
    locks: DashMap<ObjId, Arc<Entry>>,
}

impl SynchronizerOnObjId {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn entry_for(&self, obj_id: &ObjId) -> Arc<Entry> {
        let entry = self
            .locks
            .entry(obj_id.clone())
            .or_insert_with(|| {
                Arc::new(Entry {
                    lock: AsyncMutex::new(()),
                    refs: std::sync::atomic::AtomicUsize::new(0),
                })
            })
            .clone();
        entry
            .refs
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        entry
    }

    fn release(&self, obj_id: &ObjId, entry: &Arc<Entry>) {
        if entry.refs.fetch_sub(1, std::sync::atomic::Ordering::SeqCst) == 1 {
            // We were the last holder at the moment of decrement; drop the
            // map entry if nobody grabbed a fresh reference in the meantime.
            self.locks.remove_if(obj_id, |_, v| Arc::ptr_eq(v, entry));
        }
    }

    /// Run `action` with exclusive access to `obj_id`'s critical section.
    pub async fn sync<F, Fut, T>(&self, obj_id: &ObjId, action: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let entry = self.entry_for(obj_id);
        let result = {
            let _guard = entry.lock.lock().await;
            action().await
        };
        self.release(obj_id, &entry);
        result
    }
}
