//! External collaborators, expressed as ports so the rest of the crate can
//! be built and tested against mocks. Real implementations of these traits
//! (the encryption pipeline and the server wire format) live outside this
//! crate's scope.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::obj_id::ObjId;
use synced_store_wire::LayoutTable;

/// A half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What the server reports as the current version of an object.
#[derive(Debug, Clone)]
pub struct RemoteCurrentVersion {
    pub version: u64,
    pub layout: LayoutTable,
}

/// Identifies one in-flight chunked upload session on the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadSessionId(pub String);

/// What `begin_upload` hands back: the session id to stream bytes against,
/// plus the remote version number the server has provisionally assigned
/// this upload. The assignment lets the caller write the crash-resumable
/// `.upload` sidecar (see `SyncedObj::begin_upload`) before any bytes are
/// sent, rather than only after `finalize_upload` returns.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub id: UploadSessionId,
    pub assigned_version: u64,
}

/// Result of finalising an upload: the version number the server assigned,
/// and an optional replacement header if the server rewrote it (e.g. to
/// normalise a diff against a base it chose differently than requested).
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub remote_version: u64,
    pub header_change: Option<Vec<u8>>,
}

/// Kinds of server-origin notifications ingested by `RemoteEvents`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteEventKind {
    ObjChanged,
    ObjRemoved,
    ObjVersionArchived,
    ObjArchivedVersionRemoved,
}

#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub kind: RemoteEventKind,
    pub obj_id: ObjId,
    pub new_version: Option<u64>,
    pub archived_version: Option<u64>,
    pub removed_arch_version: Option<u64>,
}

/// A heartbeat tick or connection-state signal from the event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatSignal {
    Tick,
    Skip,
    Disconnected,
}

/// The two channels a `WebSocketListening` implementation feeds: one for
/// domain events, one for heartbeat/connection signals. Modelled as plain
/// channels (rather than an async-trait returning a boxed stream) per the
/// "channels with a worker per sink" plumbing this crate standardises on.
pub struct EventSourceHandle {
    pub events: mpsc::Receiver<RemoteEvent>,
    pub heartbeat: mpsc::Receiver<HeartbeatSignal>,
}

/// Opaque ordered producer of encrypted bytes for a new version, supplied
/// by the (out-of-scope) encryption pipeline. `SyncedObj::save_new_version`
/// drains this to produce the on-disk layout.
#[async_trait]
pub trait EncryptedByteSource: Send + Sync {
    /// Pull the next chunk of encrypted bytes, or `None` at end of stream.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// The server-side storage API this crate treats as an external collaborator.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    async fn get_current_obj_version(&self, obj_id: &ObjId) -> Result<RemoteCurrentVersion>;

    async fn download_range(
        &self,
        obj_id: &ObjId,
        version: u64,
        range: ByteRange,
    ) -> Result<Bytes>;

    async fn begin_upload(
        &self,
        obj_id: &ObjId,
        is_first_version: bool,
        base_version: Option<u64>,
        header: &[u8],
    ) -> Result<UploadSession>;

    async fn continue_upload(&self, session: &UploadSessionId, bytes: Bytes) -> Result<()>;

    async fn finalize_upload(&self, session: &UploadSessionId) -> Result<UploadOutcome>;

    async fn request_removal(&self, obj_id: &ObjId) -> Result<()>;

    async fn open_event_source(&self) -> Result<EventSourceHandle>;
}
