//! In-process IPC provider.

use super::{
    data_key, mutex_key, partition_prefix, IpcProvider, IpcType, MutexPolicy, MutexToken,
};
use crate::config::IpcConfig;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

static GLOBAL_SEGMENT: OnceLock<Arc<MemorySegment>> = OnceLock::new();

#[derive(Debug, Clone)]
struct SegmentEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl SegmentEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

/// Key/value segment shared by every [`MemoryIpcProvider`] attached to it.
#[derive(Debug, Default)]
pub struct MemorySegment {
    entries: DashMap<String, SegmentEntry>,
}

impl MemorySegment {
    /// Empty segment.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide segment.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_SEGMENT.get_or_init(|| Arc::new(Self::new())))
    }

    /// Insert `key` unless a live entry exists.
    fn add(&self, key: String, value: &str, expires_at: Option<Instant>) -> bool {
        let entry = SegmentEntry {
            value: value.to_string(),
            expires_at,
        };
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(Instant::now()) {
                    return false;
                }
                occupied.insert(entry);
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                true
            }
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    fn set(&self, key: String, value: &str) {
        self.entries.insert(
            key,
            SegmentEntry {
                value: value.to_string(),
                expires_at: None,
            },
        );
    }

    /// Remove `key` only while it still holds `value`.
    fn remove_if_value(&self, key: &str, value: &str) -> bool {
        self.entries
            .remove_if(key, |_, entry| entry.value == value)
            .is_some()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let live = entry.is_live(now);
            if !live {
                removed += 1;
            }
            live
        });
        removed
    }

    fn remove_prefix(&self, prefix: &str) {
        self.entries.retain(|key, _| !key.starts_with(prefix));
    }
}

/// IPC provider over an in-process [`MemorySegment`].
///
/// Only coordinates tasks of one process. Never goes down.
#[derive(Debug, Clone)]
pub struct MemoryIpcProvider {
    segment: Arc<MemorySegment>,
    prefix: String,
    policy: MutexPolicy,
}

impl MemoryIpcProvider {
    /// Provider attached to the process-wide segment.
    pub fn new(config: &IpcConfig) -> Self {
        Self::with_segment(config, MemorySegment::global())
    }

    /// Provider attached to a private segment.
    pub fn with_segment(config: &IpcConfig, segment: Arc<MemorySegment>) -> Self {
        Self {
            segment,
            prefix: config.prefix.clone(),
            policy: MutexPolicy::from_config(config),
        }
    }

    /// Override the mutex wait policy.
    pub fn with_policy(mut self, policy: MutexPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl IpcProvider for MemoryIpcProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn is_active(&self) -> bool {
        true
    }

    async fn block_mutex(&self, ipc_type: IpcType) -> Option<MutexToken> {
        let key = mutex_key(&self.prefix, ipc_type);
        let token = MutexToken::new();
        let segment = &self.segment;
        let value = token.as_str();
        let ttl = self.policy.timeout;

        let acquired = self
            .policy
            .spin(ipc_type, move || {
                let acquired = segment.add(key.clone(), value, Some(Instant::now() + ttl));
                async move { acquired }
            })
            .await;
        acquired.then_some(token)
    }

    async fn release_mutex(&self, ipc_type: IpcType, token: &MutexToken) -> bool {
        let key = mutex_key(&self.prefix, ipc_type);
        if !self.segment.remove_if_value(&key, token.as_str()) {
            tracing::debug!(%ipc_type, "Mutex not held by this token, nothing to release");
        }
        true
    }

    async fn has_data(&self, ipc_type: IpcType, id: u32) -> bool {
        self.segment
            .get(&data_key(&self.prefix, ipc_type, id))
            .is_some()
    }

    async fn get_data(&self, ipc_type: IpcType, id: u32) -> Option<String> {
        self.segment.get(&data_key(&self.prefix, ipc_type, id))
    }

    async fn set_data(&self, ipc_type: IpcType, id: u32, data: &str) -> bool {
        self.segment
            .set(data_key(&self.prefix, ipc_type, id), data);
        true
    }

    async fn clean(&self, ipc_type: IpcType) -> bool {
        self.segment
            .remove_prefix(&partition_prefix(&self.prefix, ipc_type));
        true
    }

    async fn purge_expired(&self) -> u64 {
        self.segment.purge_expired() as u64
    }
}
