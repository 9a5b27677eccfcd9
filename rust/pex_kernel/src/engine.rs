//! `PermissionEngine`, the facade hosts talk to.
//!
//! Reads are synchronous and served from the resolution cache when possible;
//! on a miss the resolver walks the registry's subjects directly. Subjects
//! that were never loaded resolve as empty, so hosts either load subjects up
//! front or use the async [`check`](PermissionEngine::check) family, which
//! loads the inheritance closure first.

use std::sync::Arc;

use tracing::debug;

use pex_core::context::ExactMatcher;
use pex_core::resolve::Resolver;
use pex_core::{
    ContextMatcher, ContextSet, Query, Resolution, ResolvedPermission, Result, SubjectIdentity,
};

use crate::cache::{CacheStats, ResolutionCache};
use crate::config::EngineConfig;
use crate::registry::{SubjectRegistry, TrackedGraph};
use crate::store::SubjectDataStore;
use crate::subject::{ListenerId, ListenerSet, SubjectChange, SubjectRef};

/// State shared by the engine and every subject it hands out.
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<dyn SubjectDataStore>,
    pub(crate) cache: ResolutionCache,
    pub(crate) listeners: ListenerSet,
}

impl Shared {
    pub(crate) fn new(config: EngineConfig, store: Arc<dyn SubjectDataStore>) -> Self {
        let cache = ResolutionCache::new(config.cache_enabled)
            .with_max_values_per_subject(config.cache_max_values_per_subject);
        Self {
            config,
            store,
            cache,
            listeners: ListenerSet::default(),
        }
    }
}

pub struct PermissionEngine {
    shared: Arc<Shared>,
    registry: SubjectRegistry,
    matcher: Arc<dyn ContextMatcher>,
}

impl PermissionEngine {
    /// Engine matching context values by equality.
    pub fn new(config: EngineConfig, store: Arc<dyn SubjectDataStore>) -> Result<Self> {
        Self::with_matcher(config, store, Arc::new(ExactMatcher))
    }

    /// Engine matching context values through `matcher`, typically a
    /// [`ContextRegistry`](pex_core::context::ContextRegistry).
    pub fn with_matcher(
        config: EngineConfig,
        store: Arc<dyn SubjectDataStore>,
        matcher: Arc<dyn ContextMatcher>,
    ) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared::new(config, store));
        let registry = SubjectRegistry::new(Arc::clone(&shared));
        Ok(Self {
            shared,
            registry,
            matcher,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &SubjectRegistry {
        &self.registry
    }

    /// Loaded reference for `identity`.
    pub async fn subject(&self, identity: &SubjectIdentity) -> Result<SubjectRef> {
        self.registry.load(identity).await
    }

    // ------------------------------------------------------------------
    // Synchronous resolution
    // ------------------------------------------------------------------

    pub fn resolve(&self, subject: &SubjectIdentity, requested: &ContextSet, query: &Query) -> Resolution {
        let cache = &self.shared.cache;
        if let Some(hit) = cache.get(subject, requested, query) {
            return hit;
        }
        let generation = cache.begin(subject);
        let result = self.compute(subject, requested, query);
        cache.insert(subject, generation, requested.clone(), query.clone(), result.clone());
        result
    }

    fn compute(&self, subject: &SubjectIdentity, requested: &ContextSet, query: &Query) -> Resolution {
        let graph = TrackedGraph {
            registry: &self.registry,
            root: subject,
        };
        let config = &self.shared.config;
        Resolver::new(&graph, self.matcher.as_ref())
            .with_max_depth(config.max_resolution_depth)
            .with_cycle_logging(config.log_cycles)
            .resolve(subject, requested, query)
    }

    pub fn permission(&self, subject: &SubjectIdentity, requested: &ContextSet, node: &str) -> ResolvedPermission {
        self.resolve(subject, requested, &Query::permission(node))
            .into_permission()
            .unwrap_or_default()
    }

    /// `true` only for an explicit grant; undefined counts as not granted.
    pub fn has_permission(&self, subject: &SubjectIdentity, requested: &ContextSet, node: &str) -> bool {
        self.permission(subject, requested, node).is_granted()
    }

    pub fn option(&self, subject: &SubjectIdentity, requested: &ContextSet, key: &str) -> Option<String> {
        self.resolve(subject, requested, &Query::option(key))
            .into_option()
            .flatten()
    }

    pub fn parents(&self, subject: &SubjectIdentity, requested: &ContextSet) -> Vec<SubjectIdentity> {
        self.resolve(subject, requested, &Query::Parents)
            .into_parents()
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Loading resolution
    // ------------------------------------------------------------------

    /// Load the inheritance closure of `subject`, then resolve `node`.
    pub async fn check(
        &self,
        subject: &SubjectIdentity,
        requested: &ContextSet,
        node: &str,
    ) -> Result<ResolvedPermission> {
        self.registry.load_closure(subject).await?;
        Ok(self.permission(subject, requested, node))
    }

    pub async fn check_option(
        &self,
        subject: &SubjectIdentity,
        requested: &ContextSet,
        key: &str,
    ) -> Result<Option<String>> {
        self.registry.load_closure(subject).await?;
        Ok(self.option(subject, requested, key))
    }

    // ------------------------------------------------------------------
    // Listeners and housekeeping
    // ------------------------------------------------------------------

    /// Listen for effective updates of any subject handed out by this engine.
    pub fn on_change(&self, listener: impl Fn(&SubjectChange) + Send + Sync + 'static) -> ListenerId {
        self.shared.listeners.add(Arc::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    pub fn evict(&self, identity: &SubjectIdentity) -> Option<SubjectRef> {
        self.registry.evict(identity)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.shared.cache.clear();
    }

    /// Drop cache bookkeeping for subjects the registry no longer holds,
    /// such as parents that never existed. Results that inherited from them
    /// are invalidated. Returns how many subjects were dropped.
    pub fn prune_cache(&self) -> usize {
        let pruned = self.shared.cache.retain(|subject| self.registry.contains(subject));
        if pruned > 0 {
            debug!(pruned, "pruned cache entries of unregistered subjects");
        }
        pruned
    }
}
