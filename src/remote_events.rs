//! `RemoteEvents` — WebSocket-driven ingestion of server-origin
//! notifications, folded into the affected objects' statuses.
//!
//! Each event kind gets its own single-threaded worker (fed by an unbounded
//! channel from the dispatch loop), so two `ObjChanged` events never race
//! each other, but an `ObjChanged` and an `ObjVersionArchived` for
//! unrelated objects can fold concurrently. The outer loop reconnects with
//! a fixed back-off whenever the event source drops or a heartbeat reports
//! disconnection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{instrument, warn};

use crate::config::StoreConfig;
use crate::obj_files::ObjFiles;
use crate::ports::{HeartbeatSignal, RemoteEvent, RemoteEventKind, RemoteStorage};

pub struct RemoteEvents {
    handle: JoinHandle<()>,
    connected: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl RemoteEvents {
    pub fn start(obj_files: Arc<ObjFiles>, remote: Arc<dyn RemoteStorage>, config: StoreConfig) -> Self {
        let connected = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let handle = tokio::spawn(run_loop(obj_files, remote, config, connected.clone(), notify.clone()));
        Self { handle, connected, notify }
    }

    /// Whether an event source is currently open (spec section 4.9).
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Resolves once the event source is connected; resolves immediately if
    /// already connected.
    pub async fn when_connected(&self) {
        loop {
            if self.connected.load(Ordering::SeqCst) {
                return;
            }
            self.notify.notified().await;
        }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

async fn run_loop(
    obj_files: Arc<ObjFiles>,
    remote: Arc<dyn RemoteStorage>,
    config: StoreConfig,
    connected: Arc<AtomicBool>,
    notify: Arc<Notify>,
) {
    loop {
        match remote.open_event_source().await {
            Ok(source) => {
                connected.store(true, Ordering::SeqCst);
                notify.notify_waiters();
                ingest_until_disconnected(&obj_files, source.events, source.heartbeat).await;
                connected.store(false, Ordering::SeqCst);
            }
            Err(err) => {
                warn!(error = %err, "failed to open remote event source");
            }
        }
        tokio::time::sleep(config.reconnect_backoff).await;
    }
}

async fn ingest_until_disconnected(
    obj_files: &Arc<ObjFiles>,
    mut events: mpsc::Receiver<RemoteEvent>,
    mut heartbeat: mpsc::Receiver<HeartbeatSignal>,
) {
    let mut workers = PerKindWorkers::spawn(obj_files.clone());

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => workers.dispatch(event),
                    None => break,
                }
            }
            signal = heartbeat.recv() => {
                match signal {
                    Some(HeartbeatSignal::Disconnected) | None => break,
                    Some(HeartbeatSignal::Tick) | Some(HeartbeatSignal::Skip) => {}
                }
            }
        }
    }

    workers.shutdown().await;
}

/// One worker task per event kind, so ingestion concurrency is bounded to
/// one in-flight fold per kind (spec section 4.9).
struct PerKindWorkers {
    obj_changed: mpsc::UnboundedSender<RemoteEvent>,
    obj_removed: mpsc::UnboundedSender<RemoteEvent>,
    version_archived: mpsc::UnboundedSender<RemoteEvent>,
    arch_version_removed: mpsc::UnboundedSender<RemoteEvent>,
    handles: Vec<JoinHandle<()>>,
}

impl PerKindWorkers {
    fn spawn(obj_files: Arc<ObjFiles>) -> Self {
        let (obj_changed, h1) = spawn_worker(obj_files.clone());
        let (obj_removed, h2) = spawn_worker(obj_files.clone());
        let (version_archived, h3) = spawn_worker(obj_files.clone());
        let (arch_version_removed, h4) = spawn_worker(obj_files);
        Self {
            obj_changed,
            obj_removed,
            version_archived,
            arch_version_removed,
            handles: vec![h1, h2, h3, h4],
        }
    }

    fn dispatch(&self, event: RemoteEvent) {
        let sender = match event.kind {
            RemoteEventKind::ObjChanged => &self.obj_changed,
            RemoteEventKind::ObjRemoved => &self.obj_removed,
            RemoteEventKind::ObjVersionArchived => &self.version_archived,
            RemoteEventKind::ObjArchivedVersionRemoved => &self.arch_version_removed,
        };
        let _ = sender.send(event);
    }

    async fn shutdown(self) {
        drop(self.obj_changed);
        drop(self.obj_removed);
        drop(self.version_archived);
        drop(self.arch_version_removed);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

fn spawn_worker(
    obj_files: Arc<ObjFiles>,
) -> (mpsc::UnboundedSender<RemoteEvent>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<RemoteEvent>();
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(err) = fold_event(&obj_files, event).await {
                warn!(error = %err, "failed to fold remote event");
            }
        }
    });
    (tx, handle)
}

#[instrument(skip(obj_files, event), fields(obj_id = %event.obj_id, kind = ?event.kind))]
async fn fold_event(obj_files: &Arc<ObjFiles>, event: RemoteEvent) -> crate::error::Result<()> {
    let obj_id = event.obj_id.clone();
    match event.kind {
        RemoteEventKind::ObjChanged => {
            let obj = match obj_files.find_obj(&obj_id)? {
                Some(obj) => obj,
                None => obj_files.make_by_downloading_current_version(obj_id.clone()).await?,
            };
            if let Some(new_version) = event.new_version {
                obj.record_remote_change(new_version)?;
            }
        }
        RemoteEventKind::ObjRemoved => {
            if let Some(obj) = obj_files.find_obj(&obj_id)? {
                obj.record_remote_removal()?;
            }
        }
        RemoteEventKind::ObjVersionArchived => {
            if let (Some(obj), Some(archived_version)) =
                (obj_files.find_obj(&obj_id)?, event.archived_version)
            {
                obj.record_version_archival(archived_version)?;
            }
        }
        RemoteEventKind::ObjArchivedVersionRemoved => {
            if let (Some(obj), Some(removed)) =
                (obj_files.find_obj(&obj_id)?, event.removed_arch_version)
            {
                obj.record_arch_version_removal(removed)?;
            }
        }
    }
    obj_files.schedule_gc(obj_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj_id::ObjId;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::ports::{
        ByteRange, EventSourceHandle, RemoteCurrentVersion, UploadOutcome, UploadSessionId,
    };

    #[derive(Default)]
    struct NullRemote {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl RemoteStorage for NullRemote {
        async fn get_current_obj_version(&self, _obj_id: &ObjId) -> crate::error::Result<RemoteCurrentVersion> {
            unimplemented!()
        }
        async fn download_range(
            &self,
            _obj_id: &ObjId,
            _version: u64,
            _range: ByteRange,
        ) -> crate::error::Result<Bytes> {
            unimplemented!()
        }
        async fn begin_upload(
            &self,
            _obj_id: &ObjId,
            _is_first_version: bool,
            _base_version: Option<u64>,
            _header: &[u8],
        ) -> crate::error::Result<crate::ports::UploadSession> {
            unimplemented!()
        }
        async fn continue_upload(&self, _session: &UploadSessionId, _bytes: Bytes) -> crate::error::Result<()> {
            unimplemented!()
        }
        async fn finalize_upload(&self, _session: &UploadSessionId) -> crate::error::Result<UploadOutcome> {
            unimplemented!()
        }
        async fn request_removal(&self, _obj_id: &ObjId) -> crate::error::Result<()> {
            unimplemented!()
        }
        async fn open_event_source(&self) -> crate::error::Result<EventSourceHandle> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Err(crate::error::StoreError::Transient("no server in this test".into()))
        }
    }

    #[tokio::test]
    async fn reconnects_on_open_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::builder()
            .reconnect_backoff(Duration::from_millis(5))
            .build();
        let remote = Arc::new(NullRemote::default());
        let obj_files = Arc::new(ObjFiles::new(dir.path(), remote.clone(), &config));

        let events = RemoteEvents::start(obj_files, remote.clone(), config);
        tokio::time::sleep(Duration::from_millis(30)).await;
        events.stop();

        assert!(remote.opened.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn folds_remote_change_for_known_object() {
        use crate::obj_status::ObjStatus;

        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::default();
        let remote = Arc::new(NullRemote::default());
        let obj_files = Arc::new(ObjFiles::new(dir.path(), remote.clone(), &config));

        let obj_id = ObjId::parse("obj-A").unwrap();
        let folder = obj_files.folders().get_folder_access_for(&obj_id);
        std::fs::create_dir_all(&folder).unwrap();
        let mut status = ObjStatus::make_new(obj_id.clone());
        status.set_local_current_version(1, None);
        status.record_upload_completion(1, 7);
        status.write_to(&folder.join("status.json")).unwrap();

        fold_event(
            &obj_files,
            RemoteEvent {
                kind: RemoteEventKind::ObjChanged,
                obj_id: obj_id.clone(),
                new_version: Some(8),
                archived_version: None,
                removed_arch_version: None,
            },
        )
        .await
        .unwrap();

        let obj = obj_files.find_obj(&obj_id).unwrap().unwrap();
        assert_eq!(obj.sync_status().remote, Some(8));
    }
}
