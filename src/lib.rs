//! Client-side infrastructure for a 3NWeb-style personal cloud: a per-user,
//! per-device storage subsystem that keeps an encrypted, versioned,
//! content-addressed object store on local disk, synchronises each
//! object's version history with a remote server, reacts to remote change
//! notifications, and garbage-collects superseded versions under
//! concurrency.
//!
//! The cryptographic pipeline and the server wire protocol are external
//! collaborators, reached only through the `ports` module's traits.

pub mod config;
pub mod downloader;
pub mod error;
pub mod events;
pub mod gc;
pub mod obj_files;
pub mod obj_folders;
pub mod obj_id;
pub mod obj_on_disk;
pub mod obj_status;
pub mod ports;
pub mod remote_events;
pub mod sync_mutex;
pub mod synced_obj;
pub mod up_syncer;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use events::{NodeEvent, NodeEventBus, NodeEventKind};
pub use obj_files::ObjFiles;
pub use obj_id::ObjId;
pub use obj_status::{NonGarbageSnapshot, ObjStatus, SyncState, SyncStatus};
pub use remote_events::RemoteEvents;
pub use up_syncer::UpSyncer;
