//! Store-wide tunables: cache sizes/TTLs, back-off, and concurrency limits.
//!
//! Mirrors the shape of `SyncManagerOptions` from the document-store sync
//! layer: a plain options struct with a sensible `Default`, constructed once
//! and threaded through the components that need it.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long an open `ObjOnDisk` handle stays cached on a `SyncedObj`
    /// before eviction (default 60s, per spec section 4.6).
    pub version_handle_ttl: Duration,
    /// How long a `SyncedObj` stays cached in `ObjFiles` (default 60s).
    pub synced_obj_ttl: Duration,
    /// Max number of object folders kept in `ObjFolders`'s recent tier
    /// before demotion to the deeper tier is attempted.
    pub recent_tier_capacity: u64,
    /// Back-off between `RemoteEvents` reconnect attempts (default 5s).
    pub reconnect_backoff: Duration,
    /// Max concurrent downloads the task runtime will admit.
    pub download_concurrency: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            version_handle_ttl: Duration::from_secs(60),
            synced_obj_ttl: Duration::from_secs(60),
            recent_tier_capacity: 4096,
            reconnect_backoff: Duration::from_secs(5),
            download_concurrency: 8,
        }
    }
}

impl StoreConfig {
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoreConfigBuilder {
    inner: Option<StoreConfig>,
}

impl StoreConfigBuilder {
    fn base(&mut self) -> &mut StoreConfig {
        self.inner.get_or_insert_with(StoreConfig::default)
    }

    pub fn version_handle_ttl(mut self, ttl: Duration) -> Self {
        self.base().version_handle_ttl = ttl;
        self
    }

    pub fn synced_obj_ttl(mut self, ttl: Duration) -> Self {
        self.base().synced_obj_ttl = ttl;
        self
    }

    pub fn recent_tier_capacity(mut self, capacity: u64) -> Self {
        self.base().recent_tier_capacity = capacity;
        self
    }

    pub fn reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.base().reconnect_backoff = backoff;
        self
    }

    pub fn download_concurrency(mut self, n: usize) -> Self {
        self.base().download_concurrency = n;
        self
    }

    pub fn build(mut self) -> StoreConfig {
        self.base().clone()
    }
}
