//! Subject references and the update protocol.
//!
//! A [`SubjectRef`] owns the live data of one subject: a persistent and a
//! transient snapshot, each held in a cell that is only ever replaced
//! wholesale. Updates are optimistic:
//!
//! 1. read the current snapshot and apply the transform
//! 2. compare-and-swap against the snapshot that was read (pointer identity)
//! 3. on conflict, retry from a fresh read, up to `max_update_retries`
//!
//! After a successful swap the resolution cache is invalidated before the
//! update's future can complete. Listener delivery and persistence run on a
//! spawned task, so dropping the future does not cancel them.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use pex_core::resolve::SubjectSnapshot;
use pex_core::{
    Change, ContextSet, DataLayer, ImmutableSubjectData, PermissionNode, PexError, Result, Segment,
    SubjectIdentity,
};

use crate::engine::Shared;

// ============================================================================
// Listeners
// ============================================================================

/// Handle returned when registering a listener, used to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// What listeners receive after every effective update.
#[derive(Debug, Clone)]
pub struct SubjectChange {
    pub subject: SubjectIdentity,
    pub layer: DataLayer,
    pub change: Change<Arc<ImmutableSubjectData>>,
}

pub type Listener = Arc<dyn Fn(&SubjectChange) + Send + Sync>;

#[derive(Default)]
pub(crate) struct ListenerSet {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ListenerId, Listener)>>,
}

impl ListenerSet {
    pub(crate) fn add(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Call every listener outside the lock so listeners may (un)register.
    /// A panicking listener is logged and skipped; the rest still run.
    pub(crate) fn notify(&self, event: &SubjectChange) {
        let snapshot: Vec<Listener> = self
            .entries
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| listener(event)));
            if delivered.is_err() {
                warn!(subject = %event.subject, layer = ?event.layer, "change listener panicked");
            }
        }
    }
}

// ============================================================================
// Data cell
// ============================================================================

/// Both data layers of one subject. Readers clone an `Arc` under a short read
/// lock; writers swap only if the cell still holds what they read.
#[derive(Default)]
pub(crate) struct DataCell {
    persistent: RwLock<Arc<ImmutableSubjectData>>,
    transient: RwLock<Arc<ImmutableSubjectData>>,
}

impl DataCell {
    fn slot(&self, layer: DataLayer) -> &RwLock<Arc<ImmutableSubjectData>> {
        match layer {
            DataLayer::Persistent => &self.persistent,
            DataLayer::Transient => &self.transient,
        }
    }

    pub(crate) fn get(&self, layer: DataLayer) -> Arc<ImmutableSubjectData> {
        Arc::clone(&self.slot(layer).read())
    }

    pub(crate) fn compare_and_swap(
        &self,
        layer: DataLayer,
        expected: &Arc<ImmutableSubjectData>,
        next: Arc<ImmutableSubjectData>,
    ) -> bool {
        let mut slot = self.slot(layer).write();
        if !Arc::ptr_eq(&slot, expected) {
            return false;
        }
        *slot = next;
        true
    }
}

// ============================================================================
// SubjectRef
// ============================================================================

struct SubjectInner {
    identity: SubjectIdentity,
    cell: DataCell,
    loaded: AtomicBool,
    evicted: AtomicBool,
    listeners: ListenerSet,
    /// Serializes persistence so the store never sees an older snapshot
    /// after a newer one.
    persist_lock: tokio::sync::Mutex<()>,
    shared: Arc<Shared>,
}

/// Shared handle to one subject's live data. Cheap to clone; clones refer to
/// the same cell.
#[derive(Clone)]
pub struct SubjectRef {
    inner: Arc<SubjectInner>,
}

impl std::fmt::Debug for SubjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubjectRef")
            .field("identity", &self.inner.identity)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl SubjectRef {
    pub(crate) fn new(identity: SubjectIdentity, shared: Arc<Shared>) -> Self {
        Self {
            inner: Arc::new(SubjectInner {
                identity,
                cell: DataCell::default(),
                loaded: AtomicBool::new(false),
                evicted: AtomicBool::new(false),
                listeners: ListenerSet::default(),
                persist_lock: tokio::sync::Mutex::new(()),
                shared,
            }),
        }
    }

    pub fn identity(&self) -> &SubjectIdentity {
        &self.inner.identity
    }

    /// Whether both handles point at the same cell.
    pub fn same_subject(&self, other: &SubjectRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Current persistent data.
    pub fn data(&self) -> Arc<ImmutableSubjectData> {
        self.inner.cell.get(DataLayer::Persistent)
    }

    /// Current transient data.
    pub fn transient_data(&self) -> Arc<ImmutableSubjectData> {
        self.inner.cell.get(DataLayer::Transient)
    }

    pub fn data_in(&self, layer: DataLayer) -> Arc<ImmutableSubjectData> {
        self.inner.cell.get(layer)
    }

    pub fn snapshot(&self) -> SubjectSnapshot {
        SubjectSnapshot::new(self.data(), self.transient_data())
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.loaded.load(Ordering::Acquire)
    }

    /// Install data read from the store, unless an update got there first.
    pub(crate) fn install_loaded(&self, data: ImmutableSubjectData) -> bool {
        let current = self.inner.cell.get(DataLayer::Persistent);
        let installed = !self.is_loaded()
            && current.is_empty()
            && self
                .inner
                .cell
                .compare_and_swap(DataLayer::Persistent, &current, Arc::new(data));
        self.inner.loaded.store(true, Ordering::Release);
        if installed {
            self.inner.shared.cache.invalidate(&self.inner.identity);
        }
        installed
    }

    pub(crate) fn mark_loaded(&self) {
        self.inner.loaded.store(true, Ordering::Release);
    }

    /// Read stored data into the cell on first use. Later calls return
    /// immediately.
    pub(crate) async fn ensure_loaded(&self) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }
        let identity = &self.inner.identity;
        match self.inner.shared.store.load(identity).await? {
            Some(data) => {
                let segments = data.len();
                if self.install_loaded(data) {
                    debug!(subject = %identity, segments, "loaded subject data");
                }
            }
            None => {
                debug!(subject = %identity, "no stored data, starting empty");
                self.mark_loaded();
            }
        }
        Ok(())
    }

    /// Whether the registry dropped this reference. Evicted references stay
    /// readable but reject updates, since resolution no longer sees them.
    pub fn is_evicted(&self) -> bool {
        self.inner.evicted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_evicted(&self) {
        self.inner.evicted.store(true, Ordering::Release);
    }

    /// Listen for effective updates of this subject.
    pub fn on_update(&self, listener: impl Fn(&SubjectChange) + Send + Sync + 'static) -> ListenerId {
        self.inner.listeners.add(Arc::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    // ------------------------------------------------------------------
    // Update protocol
    // ------------------------------------------------------------------

    /// Replace persistent data with `transform(current)`.
    pub async fn update<F>(&self, transform: F) -> Result<Change<Arc<ImmutableSubjectData>>>
    where
        F: FnMut(&ImmutableSubjectData) -> ImmutableSubjectData,
    {
        self.update_in(DataLayer::Persistent, transform).await
    }

    /// Replace transient data with `transform(current)`. Never persisted.
    pub async fn update_transient<F>(&self, transform: F) -> Result<Change<Arc<ImmutableSubjectData>>>
    where
        F: FnMut(&ImmutableSubjectData) -> ImmutableSubjectData,
    {
        self.update_in(DataLayer::Transient, transform).await
    }

    /// Apply `transform` to the persistent segment stored for `contexts`.
    pub async fn update_segment<F>(
        &self,
        contexts: &ContextSet,
        transform: F,
    ) -> Result<Change<Arc<ImmutableSubjectData>>>
    where
        F: FnMut(&Segment) -> Segment,
    {
        self.update_segment_in(DataLayer::Persistent, contexts, transform)
            .await
    }

    pub async fn update_transient_segment<F>(
        &self,
        contexts: &ContextSet,
        transform: F,
    ) -> Result<Change<Arc<ImmutableSubjectData>>>
    where
        F: FnMut(&Segment) -> Segment,
    {
        self.update_segment_in(DataLayer::Transient, contexts, transform)
            .await
    }

    pub async fn update_segment_in<F>(
        &self,
        layer: DataLayer,
        contexts: &ContextSet,
        mut transform: F,
    ) -> Result<Change<Arc<ImmutableSubjectData>>>
    where
        F: FnMut(&Segment) -> Segment,
    {
        self.update_in(layer, |data| data.update_segment(contexts, &mut transform))
            .await
    }

    /// Core of every update: CAS loop, invalidation, then fan-out and
    /// persistence on a spawned task.
    ///
    /// A persistent update on a reference that was never loaded reads the
    /// store first, so the swap builds on the stored data instead of
    /// overwriting it.
    pub async fn update_in<F>(
        &self,
        layer: DataLayer,
        mut transform: F,
    ) -> Result<Change<Arc<ImmutableSubjectData>>>
    where
        F: FnMut(&ImmutableSubjectData) -> ImmutableSubjectData,
    {
        let identity = &self.inner.identity;
        let max_attempts = self.inner.shared.config.max_update_retries.max(1);
        if layer == DataLayer::Persistent {
            self.ensure_loaded().await?;
        }

        let mut attempts = 0;
        let change = loop {
            if attempts == max_attempts {
                warn!(subject = %identity, attempts, "update gave up after repeated conflicts");
                return Err(PexError::ConflictExhausted {
                    subject: identity.to_string(),
                    attempts,
                });
            }
            attempts += 1;
            if self.is_evicted() {
                return Err(PexError::Evicted(identity.to_string()));
            }

            let current = self.inner.cell.get(layer);
            let next = transform(current.as_ref());
            if next == *current {
                return Ok(Change::new(Arc::clone(&current), current));
            }
            let next = Arc::new(next);
            if self
                .inner
                .cell
                .compare_and_swap(layer, &current, Arc::clone(&next))
            {
                break Change::new(current, next);
            }
            trace!(subject = %identity, attempt = attempts, "compare-and-swap lost, retrying");
        };

        self.inner.shared.cache.invalidate(identity);

        let event = SubjectChange {
            subject: identity.clone(),
            layer,
            change,
        };
        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        tokio::spawn(async move {
            this.inner.listeners.notify(&event);
            this.inner.shared.listeners.notify(&event);
            let persisted = match event.layer {
                DataLayer::Persistent => this.persist_latest().await,
                DataLayer::Transient => Ok(()),
            };
            let _ = tx.send(persisted.map(|()| event.change));
        });

        rx.await.map_err(|_| PexError::NotificationDropped)?
    }

    /// Write the newest persistent snapshot. Runs under the per-subject
    /// persist lock, so a slow write cannot overtake a later one.
    async fn persist_latest(&self) -> Result<()> {
        let _guard = self.inner.persist_lock.lock().await;
        let latest = self.data();
        self.inner
            .shared
            .store
            .persist(&self.inner.identity, &latest)
            .await
            .map_err(|e| {
                warn!(subject = %self.inner.identity, error = %e, "persisting subject data failed");
                match e {
                    PexError::Store(_) => e,
                    other => PexError::Store(other.to_string()),
                }
            })
    }

    // ------------------------------------------------------------------
    // Convenience mutators (persistent layer)
    // ------------------------------------------------------------------

    /// Set `node` to `value` in the segment for `contexts`; `0` clears it.
    pub async fn set_permission(
        &self,
        contexts: &ContextSet,
        node: &str,
        value: i32,
    ) -> Result<Change<Arc<ImmutableSubjectData>>> {
        let node = PermissionNode::new(node)?;
        self.update_segment(contexts, |s| s.with_permission(node.clone(), value))
            .await
    }

    pub async fn set_option(
        &self,
        contexts: &ContextSet,
        key: &str,
        value: Option<&str>,
    ) -> Result<Change<Arc<ImmutableSubjectData>>> {
        self.update_segment(contexts, |s| s.with_option(key, value))
            .await
    }

    pub async fn add_parent(
        &self,
        contexts: &ContextSet,
        parent: SubjectIdentity,
    ) -> Result<Change<Arc<ImmutableSubjectData>>> {
        self.update_segment(contexts, |s| s.plus_parent(parent.clone()))
            .await
    }

    pub async fn remove_parent(
        &self,
        contexts: &ContextSet,
        parent: &SubjectIdentity,
    ) -> Result<Change<Arc<ImmutableSubjectData>>> {
        self.update_segment(contexts, |s| s.minus_parent(parent))
            .await
    }

    pub async fn clear_permissions(
        &self,
        contexts: &ContextSet,
    ) -> Result<Change<Arc<ImmutableSubjectData>>> {
        self.update_segment(contexts, Segment::without_permissions)
            .await
    }

    pub async fn clear_options(
        &self,
        contexts: &ContextSet,
    ) -> Result<Change<Arc<ImmutableSubjectData>>> {
        self.update_segment(contexts, Segment::without_options)
            .await
    }

    pub async fn clear_parents(
        &self,
        contexts: &ContextSet,
    ) -> Result<Change<Arc<ImmutableSubjectData>>> {
        self.update_segment(contexts, Segment::without_parents)
            .await
    }

    #[cfg(test)]
    pub(crate) fn cell(&self) -> &DataCell {
        &self.inner.cell
    }
}
