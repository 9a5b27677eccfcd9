//! Resolution cache with dependency-tracked invalidation.
//!
//! Results are memoized per subject and keyed by (requested contexts, query).
//! Every resolve registers its root as a dependent of each subject it visits,
//! so invalidating a subject also drops the results of everything that
//! inherited from it.
//!
//! Each subject entry carries a generation counter. A resolve records the
//! root's generation before it starts and only inserts its result if the
//! generation is unchanged, which keeps a resolve that raced an update from
//! installing a stale value.
//!
//! Growth is bounded per subject: once a subject holds
//! `max_values_per_subject` results, a tenth of them is dropped before the
//! next insert. Entries for subjects that are no longer registered (including
//! parents that never existed) are dropped by [`ResolutionCache::retain`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::trace;

use pex_core::{ContextSet, Query, Resolution, SubjectIdentity};

type CacheKey = (ContextSet, Query);

/// Cached results kept per subject when nothing else is configured.
pub const DEFAULT_MAX_VALUES_PER_SUBJECT: usize = 4096;

#[derive(Default)]
struct EntryState {
    generation: u64,
    values: AHashMap<CacheKey, Resolution>,
    /// Roots whose cached results depend on this subject.
    dependents: AHashSet<SubjectIdentity>,
}

#[derive(Default)]
struct SubjectEntry {
    state: RwLock<EntryState>,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub cached_values: usize,
}

pub struct ResolutionCache {
    enabled: bool,
    max_values_per_subject: usize,
    entries: DashMap<SubjectIdentity, Arc<SubjectEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl ResolutionCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            max_values_per_subject: DEFAULT_MAX_VALUES_PER_SUBJECT,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn with_max_values_per_subject(mut self, max: usize) -> Self {
        self.max_values_per_subject = max.max(1);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn entry(&self, subject: &SubjectIdentity) -> Arc<SubjectEntry> {
        if let Some(entry) = self.entries.get(subject) {
            return Arc::clone(entry.value());
        }
        Arc::clone(self.entries.entry(subject.clone()).or_default().value())
    }

    /// Cached result, counting the hit or miss.
    pub fn get(&self, subject: &SubjectIdentity, requested: &ContextSet, query: &Query) -> Option<Resolution> {
        if !self.enabled {
            return None;
        }
        let found = self.entries.get(subject).and_then(|entry| {
            entry
                .state
                .read()
                .values
                .get(&(requested.clone(), query.clone()))
                .cloned()
        });
        match found {
            Some(hit) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(subject = %subject, ?query, "resolution cache hit");
                Some(hit)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Generation of `subject` to pass to [`insert`](Self::insert) once the
    /// computation finishes.
    pub fn begin(&self, subject: &SubjectIdentity) -> u64 {
        self.entry(subject).state.read().generation
    }

    /// Record that results cached for `root` depend on `visited`. Must be
    /// called before `visited`'s data is read.
    pub fn register_dependent(&self, visited: &SubjectIdentity, root: &SubjectIdentity) {
        if !self.enabled || visited == root {
            return;
        }
        let entry = self.entry(visited);
        let mut state = entry.state.write();
        if !state.dependents.contains(root) {
            state.dependents.insert(root.clone());
        }
    }

    /// Store `value` unless `subject` was invalidated since `generation`.
    pub fn insert(
        &self,
        subject: &SubjectIdentity,
        generation: u64,
        requested: ContextSet,
        query: Query,
        value: Resolution,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        let entry = self.entry(subject);
        let mut state = entry.state.write();
        if state.generation != generation {
            trace!(subject = %subject, "discarding result computed before an invalidation");
            return false;
        }
        let key = (requested, query);
        if state.values.len() >= self.max_values_per_subject && !state.values.contains_key(&key) {
            let to_remove = (self.max_values_per_subject / 10).max(1);
            let victims: Vec<CacheKey> = state.values.keys().take(to_remove).cloned().collect();
            for victim in &victims {
                state.values.remove(victim);
            }
            trace!(subject = %subject, dropped = victims.len(), "per-subject cache full, dropping results");
        }
        state.values.insert(key, value);
        true
    }

    /// Drop everything cached for `subject` and, transitively, for every
    /// subject whose results depend on it.
    pub fn invalidate(&self, subject: &SubjectIdentity) {
        let mut pending = vec![subject.clone()];
        let mut seen = AHashSet::new();
        while let Some(current) = pending.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            let Some(entry) = self.entries.get(&current).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            let dependents = {
                let mut state = entry.state.write();
                state.generation += 1;
                state.values.clear();
                std::mem::take(&mut state.dependents)
            };
            self.invalidations.fetch_add(1, Ordering::Relaxed);
            pending.extend(dependents);
        }
    }

    /// Forget `subject` entirely, invalidating its dependents first.
    pub fn remove(&self, subject: &SubjectIdentity) {
        self.invalidate(subject);
        self.entries.remove(subject);
    }

    /// Remove the entries of every subject `keep` rejects, invalidating their
    /// dependents first. Returns how many subjects were dropped.
    pub fn retain(&self, keep: impl Fn(&SubjectIdentity) -> bool) -> usize {
        let doomed: Vec<SubjectIdentity> = self
            .entries
            .iter()
            .filter(|entry| !keep(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for subject in &doomed {
            self.remove(subject);
        }
        doomed.len()
    }

    pub fn clear(&self) {
        for entry in self.entries.iter() {
            let mut state = entry.value().state.write();
            state.generation += 1;
            state.values.clear();
            state.dependents.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let cached_values = self
            .entries
            .iter()
            .map(|entry| entry.value().state.read().values.len())
            .sum();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            cached_values,
        }
    }
}
