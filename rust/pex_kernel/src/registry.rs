//! Subject registry: interning, loading and eviction of subject references.
//!
//! Equal identities always map to the same [`SubjectRef`] while it is
//! registered, so every update to a subject goes through one cell.
//!
//! ```text
//!   SubjectRegistry
//!   ├── user:alice  → SubjectRef { persistent, transient, listeners }
//!   ├── group:admin → SubjectRef { ... }
//!   └── ...
//! ```

use std::sync::Arc;

use ahash::AHashSet;
use dashmap::DashMap;
use tracing::info;

use pex_core::resolve::{SubjectGraph, SubjectSnapshot};
use pex_core::{Result, SubjectIdentity};

use crate::engine::Shared;
use crate::subject::SubjectRef;

pub struct SubjectRegistry {
    subjects: DashMap<SubjectIdentity, SubjectRef>,
    shared: Arc<Shared>,
}

impl SubjectRegistry {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            subjects: DashMap::new(),
            shared,
        }
    }

    /// Interned reference for `identity`, created empty and unloaded if absent.
    /// Its data is read from the store by [`load`](Self::load) or by the
    /// first persistent update, whichever comes first.
    pub fn get_or_create(&self, identity: &SubjectIdentity) -> SubjectRef {
        if let Some(existing) = self.subjects.get(identity) {
            return existing.value().clone();
        }
        self.subjects
            .entry(identity.clone())
            .or_insert_with(|| SubjectRef::new(identity.clone(), Arc::clone(&self.shared)))
            .value()
            .clone()
    }

    /// Reference for `identity` if it is registered, without loading.
    pub fn get_cached(&self, identity: &SubjectIdentity) -> Option<SubjectRef> {
        self.subjects.get(identity).map(|entry| entry.value().clone())
    }

    /// Reference for `identity`, reading its data from the store on first use.
    pub async fn load(&self, identity: &SubjectIdentity) -> Result<SubjectRef> {
        let subject = self.get_or_create(identity);
        subject.ensure_loaded().await?;
        Ok(subject)
    }

    /// Load `identity` and every subject reachable through declared parents
    /// in any context. Async checks call this so the synchronous resolve that
    /// follows sees the whole inheritance graph.
    pub async fn load_closure(&self, identity: &SubjectIdentity) -> Result<()> {
        let mut seen = AHashSet::new();
        let mut pending = vec![identity.clone()];
        while let Some(next) = pending.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            let subject = self.load(&next).await?;
            let snapshot = subject.snapshot();
            for data in [&snapshot.transient, &snapshot.persistent] {
                for (_, segment) in data.iter() {
                    for parent in segment.parents().unwrap_or_default() {
                        if !seen.contains(parent) {
                            pending.push(parent.clone());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Drop `identity` from the registry. Cached results depending on it are
    /// invalidated; the next access loads it again from the store. Handles
    /// still held elsewhere reject further updates with `Evicted`.
    pub fn evict(&self, identity: &SubjectIdentity) -> Option<SubjectRef> {
        let (_, removed) = self.subjects.remove(identity)?;
        removed.mark_evicted();
        self.shared.cache.remove(identity);
        info!(subject = %identity, "evicted subject");
        Some(removed)
    }

    pub fn contains(&self, identity: &SubjectIdentity) -> bool {
        self.subjects.contains_key(identity)
    }

    pub fn identities(&self) -> Vec<SubjectIdentity> {
        self.subjects.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }
}

/// Registry view used for one resolve rooted at `root`. Each visit registers
/// `root` as a dependent of the visited subject before reading its data.
pub(crate) struct TrackedGraph<'a> {
    pub(crate) registry: &'a SubjectRegistry,
    pub(crate) root: &'a SubjectIdentity,
}

impl SubjectGraph for TrackedGraph<'_> {
    fn snapshot(&self, subject: &SubjectIdentity) -> SubjectSnapshot {
        self.registry
            .shared
            .cache
            .register_dependent(subject, self.root);
        self.registry
            .get_cached(subject)
            .map(|subject| subject.snapshot())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::store::MemoryDataStore;
    use pex_core::{ContextSet, ImmutableSubjectData};

    fn registry_with(store: Arc<MemoryDataStore>) -> SubjectRegistry {
        SubjectRegistry::new(Arc::new(Shared::new(EngineConfig::default(), store)))
    }

    fn id(raw: &str) -> SubjectIdentity {
        raw.parse().unwrap()
    }

    #[test]
    fn equal_identities_are_interned() {
        let registry = registry_with(Arc::new(MemoryDataStore::new()));
        let a = registry.get_or_create(&id("user:a"));
        let b = registry.get_or_create(&"user:a".parse().unwrap());
        assert!(a.same_subject(&b));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn load_reads_store_once() {
        let store = Arc::new(MemoryDataStore::new());
        let data = ImmutableSubjectData::new()
            .update_segment(&ContextSet::empty(), |s| s.with_option("prefix", Some("[A]")));
        store.insert(id("user:a"), &data).unwrap();

        let registry = registry_with(store.clone());
        let subject = registry.load(&id("user:a")).await.unwrap();
        assert!(subject.is_loaded());
        assert_eq!(*subject.data(), data);

        // a later store change is not picked up by an already loaded subject
        store.insert(id("user:a"), &ImmutableSubjectData::new()).unwrap();
        let again = registry.load(&id("user:a")).await.unwrap();
        assert!(again.same_subject(&subject));
        assert_eq!(*again.data(), data);
    }

    #[tokio::test]
    async fn missing_subject_loads_empty() {
        let registry = registry_with(Arc::new(MemoryDataStore::new()));
        let subject = registry.load(&id("user:new")).await.unwrap();
        assert!(subject.is_loaded());
        assert!(subject.data().is_empty());
    }

    #[tokio::test]
    async fn closure_follows_parents_in_every_context() {
        let store = Arc::new(MemoryDataStore::new());
        let user = ImmutableSubjectData::new()
            .update_segment(&ContextSet::of("world", "w").unwrap(), |s| s.plus_parent(id("group:a")));
        let group = ImmutableSubjectData::new()
            .update_segment(&ContextSet::empty(), |s| s.plus_parent(id("group:b")).plus_parent(id("user:u")));
        store.insert(id("user:u"), &user).unwrap();
        store.insert(id("group:a"), &group).unwrap();

        let registry = registry_with(store);
        registry.load_closure(&id("user:u")).await.unwrap();
        for subject in ["user:u", "group:a", "group:b"] {
            assert!(registry.get_cached(&id(subject)).unwrap().is_loaded(), "{subject}");
        }
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn evict_forgets_reference() {
        let registry = registry_with(Arc::new(MemoryDataStore::new()));
        let first = registry.load(&id("user:a")).await.unwrap();
        assert!(registry.evict(&id("user:a")).is_some());
        assert!(!registry.contains(&id("user:a")));
        assert!(registry.evict(&id("user:a")).is_none());
        let second = registry.load(&id("user:a")).await.unwrap();
        assert!(!first.same_subject(&second));
    }
}
