//! Persistence seam.
//!
//! The engine never talks to a database directly. Hosts plug a
//! [`SubjectDataStore`] into the engine; [`MemoryDataStore`] is the reference
//! implementation used by tests and embedded setups.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use pex_core::{ImmutableSubjectData, Result, SubjectIdentity};

/// Durable storage for persistent subject data.
#[async_trait]
pub trait SubjectDataStore: Send + Sync {
    /// Stored data for `identity`, `None` if the subject was never persisted.
    async fn load(&self, identity: &SubjectIdentity) -> Result<Option<ImmutableSubjectData>>;

    /// Replace the stored data for `identity`.
    async fn persist(&self, identity: &SubjectIdentity, data: &ImmutableSubjectData) -> Result<()>;
}

/// In-memory store keeping each subject as serialized JSON.
#[derive(Default)]
pub struct MemoryDataStore {
    entries: DashMap<SubjectIdentity, String>,
    persists: AtomicU64,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed `identity` with `data` without going through an engine.
    pub fn insert(&self, identity: SubjectIdentity, data: &ImmutableSubjectData) -> Result<()> {
        let json = serde_json::to_string(data)?;
        self.entries.insert(identity, json);
        Ok(())
    }

    /// Serialized form currently stored for `identity`.
    pub fn raw(&self, identity: &SubjectIdentity) -> Option<String> {
        self.entries.get(identity).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of successful `persist` calls so far.
    pub fn persist_count(&self) -> u64 {
        self.persists.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SubjectDataStore for MemoryDataStore {
    async fn load(&self, identity: &SubjectIdentity) -> Result<Option<ImmutableSubjectData>> {
        let Some(json) = self.raw(identity) else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&json)?))
    }

    async fn persist(&self, identity: &SubjectIdentity, data: &ImmutableSubjectData) -> Result<()> {
        let json = serde_json::to_string(data)?;
        self.entries.insert(identity.clone(), json);
        self.persists.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pex_core::{ContextSet, PermissionNode};

    fn sample() -> ImmutableSubjectData {
        ImmutableSubjectData::new()
            .update_segment(&ContextSet::of("world", "nether").unwrap(), |s| {
                s.with_permission(PermissionNode::new("build").unwrap(), -1)
            })
            .update_segment(&ContextSet::empty(), |s| s.with_option("prefix", Some("[A]")))
    }

    #[tokio::test]
    async fn load_missing_is_none() {
        let store = MemoryDataStore::new();
        let id: SubjectIdentity = "user:nobody".parse().unwrap();
        assert!(store.load(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persist_then_load_round_trips() {
        let store = MemoryDataStore::new();
        let id: SubjectIdentity = "user:alice".parse().unwrap();
        store.persist(&id, &sample()).await.unwrap();
        assert_eq!(store.load(&id).await.unwrap(), Some(sample()));
        assert_eq!(store.persist_count(), 1);
        assert!(store.raw(&id).unwrap().contains("nether"));
    }

    #[tokio::test]
    async fn corrupt_entry_surfaces_as_error() {
        let store = MemoryDataStore::new();
        let id: SubjectIdentity = "user:broken".parse().unwrap();
        store.entries.insert(id.clone(), "{not json".to_string());
        assert!(store.load(&id).await.is_err());
    }
}
