//! Upward broadcast of remote-origin changes to file-system consumers.
//!
//! Mirrors the `on_progress`/`on_error` callback style of `SyncManagerOptions`:
//! a small set of typed events pushed through a broadcast channel rather than
//! a single polymorphic callback, since consumers here (ASMail's inbox index,
//! a future filesystem adapter) care about different event kinds.

use tokio::sync::broadcast;

use crate::obj_id::ObjId;
use crate::obj_status::SyncStatus;

#[derive(Debug, Clone)]
pub enum NodeEventKind {
    RemoteChange { new_remote_version: u64 },
    RemoteRemoval,
    RemoteVersionArchival { archived_version: u64 },
    RemoteArchVersionRemoval { removed_arch_version: u64 },
}

#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub obj_id: ObjId,
    pub kind: NodeEventKind,
    pub sync_status: SyncStatus,
}

/// Bounded fan-out bus. Each `RemoteEvents` ingestion step sends one event
/// after its `recordRemote*` call completes; slow subscribers lag rather
/// than block ingestion (the default `tokio::sync::broadcast` semantics).
#[derive(Clone)]
pub struct NodeEventBus {
    sender: broadcast::Sender<NodeEvent>,
}

impl NodeEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.sender.subscribe()
    }

    /// Broadcast an event; no-op (and not an error) if there are no subscribers.
    pub fn publish(&self, event: NodeEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for NodeEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj_status::SyncState;

    fn status() -> SyncStatus {
        SyncStatus {
            state: SyncState::Behind,
            local: None,
            synced: None,
            remote: Some(8),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = NodeEventBus::default();
        let mut rx = bus.subscribe();
        let obj_id = ObjId::parse("obj-A").unwrap();

        bus.publish(NodeEvent {
            obj_id: obj_id.clone(),
            kind: NodeEventKind::RemoteChange {
                new_remote_version: 8,
            },
            sync_status: status(),
        });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.obj_id, obj_id);
        assert!(matches!(
            received.kind,
            NodeEventKind::RemoteChange {
                new_remote_version: 8
            }
        ));
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = NodeEventBus::default();
        bus.publish(NodeEvent {
            obj_id: ObjId::parse("obj-A").unwrap(),
            kind: NodeEventKind::RemoteRemoval,
            sync_status: status(),
        });
    }
}
