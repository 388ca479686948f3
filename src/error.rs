//! Crate-wide error taxonomy.
//!
//! Mirrors the transient/not-found/conflict/corruption split from the
//! synchronisation design: callers on user-initiated paths see these
//! propagate; the GC, upload retries, and event ingestion log and swallow
//! them instead (see `gc`, `up_syncer`, `remote_events`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient transport error: {0}")]
    Transient(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    ObjectExists(String),

    #[error("version {version} of object {obj_id} conflicts with local history")]
    Conflict { obj_id: String, version: u64 },

    #[error("corrupt object state for {obj_id}: {reason}")]
    Corrupt { obj_id: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("version {0} has no base to diff against")]
    NoBaseVersion(u64),

    #[error("wire codec error: {0}")]
    Wire(#[from] synced_store_wire::WireError),

    #[error("status (de)serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// True for errors a retry loop should back off and try again, rather
    /// than give up or surface to the caller as permanent.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}
