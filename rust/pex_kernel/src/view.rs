//! Per-layer data view shaped like a host permission plugin's subject data.
//!
//! Accessors read the exact segment for a context set, with no inheritance
//! or context matching. Exact-segment parent lists are cached per context
//! set; every cache entry remembers the snapshot it was computed from and an
//! update listener clears the cache whenever the viewed layer changes.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use pex_core::{
    ContextSet, DataLayer, ImmutableSubjectData, PermissionNode, Result, Segment, SubjectIdentity,
    Tristate,
};

use crate::subject::{ListenerId, SubjectRef};

type ParentsCache = AHashMap<ContextSet, (Arc<ImmutableSubjectData>, Arc<[SubjectIdentity]>)>;

pub struct SubjectDataView {
    subject: SubjectRef,
    layer: DataLayer,
    parents: Arc<Mutex<ParentsCache>>,
    listener: ListenerId,
}

impl SubjectDataView {
    pub fn new(subject: SubjectRef, layer: DataLayer) -> Self {
        let parents: Arc<Mutex<ParentsCache>> = Arc::default();
        let cache = Arc::clone(&parents);
        let listener = subject.on_update(move |event| {
            if event.layer == layer {
                cache.lock().clear();
            }
        });
        Self {
            subject,
            layer,
            parents,
            listener,
        }
    }

    pub fn persistent(subject: SubjectRef) -> Self {
        Self::new(subject, DataLayer::Persistent)
    }

    pub fn transient(subject: SubjectRef) -> Self {
        Self::new(subject, DataLayer::Transient)
    }

    pub fn subject(&self) -> &SubjectRef {
        &self.subject
    }

    pub fn is_transient(&self) -> bool {
        self.layer == DataLayer::Transient
    }

    fn data(&self) -> Arc<ImmutableSubjectData> {
        self.subject.data_in(self.layer)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn all_options(&self) -> BTreeMap<ContextSet, BTreeMap<String, String>> {
        self.data().map_segment_values(|s| s.options().clone())
    }

    pub fn options(&self, contexts: &ContextSet) -> BTreeMap<String, String> {
        self.data()
            .segment_or_none(contexts)
            .map(|s| s.options().clone())
            .unwrap_or_default()
    }

    pub fn all_permissions(&self) -> BTreeMap<ContextSet, BTreeMap<String, bool>> {
        self.data().map_segment_values(permissions_as_bools)
    }

    pub fn permissions(&self, contexts: &ContextSet) -> BTreeMap<String, bool> {
        self.data()
            .segment_or_none(contexts)
            .map(permissions_as_bools)
            .unwrap_or_default()
    }

    pub fn all_parents(&self) -> BTreeMap<ContextSet, Vec<SubjectIdentity>> {
        self.data()
            .map_segment_values(|s| s.parents().unwrap_or_default().to_vec())
            .into_iter()
            .filter(|(_, parents)| !parents.is_empty())
            .collect()
    }

    /// Parents declared by exactly `contexts`.
    pub fn parents(&self, contexts: &ContextSet) -> Arc<[SubjectIdentity]> {
        let data = self.data();
        let mut cache = self.parents.lock();
        if let Some((tag, parents)) = cache.get(contexts) {
            if Arc::ptr_eq(tag, &data) {
                return Arc::clone(parents);
            }
        }
        let parents: Arc<[SubjectIdentity]> = data
            .segment_or_none(contexts)
            .and_then(Segment::parents)
            .unwrap_or_default()
            .into();
        cache.insert(contexts.clone(), (Arc::clone(&data), Arc::clone(&parents)));
        parents
    }

    pub fn active_contexts(&self) -> Vec<ContextSet> {
        self.data().active_contexts()
    }

    // ------------------------------------------------------------------
    // Writes; each returns whether the data changed
    // ------------------------------------------------------------------

    async fn update_segment(
        &self,
        contexts: &ContextSet,
        transform: impl FnMut(&Segment) -> Segment,
    ) -> Result<bool> {
        let change = self
            .subject
            .update_segment_in(self.layer, contexts, transform)
            .await?;
        Ok(change.changed())
    }

    async fn update_all(&self, mut transform: impl FnMut(&Segment) -> Segment) -> Result<bool> {
        let change = self
            .subject
            .update_in(self.layer, |data| data.with_segments(|_, s| transform(s)))
            .await?;
        Ok(change.changed())
    }

    pub async fn set_option(&self, contexts: &ContextSet, key: &str, value: Option<&str>) -> Result<bool> {
        self.update_segment(contexts, |s| s.with_option(key, value)).await
    }

    pub async fn clear_options_in(&self, contexts: &ContextSet) -> Result<bool> {
        self.update_segment(contexts, Segment::without_options).await
    }

    pub async fn clear_options(&self) -> Result<bool> {
        self.update_all(Segment::without_options).await
    }

    pub async fn set_permission(&self, contexts: &ContextSet, node: &str, value: Tristate) -> Result<bool> {
        let node = PermissionNode::new(node)?;
        self.update_segment(contexts, |s| s.with_permission(node.clone(), value.to_value()))
            .await
    }

    pub async fn clear_permissions_in(&self, contexts: &ContextSet) -> Result<bool> {
        self.update_segment(contexts, Segment::without_permissions).await
    }

    pub async fn clear_permissions(&self) -> Result<bool> {
        self.update_all(Segment::without_permissions).await
    }

    pub async fn add_parent(&self, contexts: &ContextSet, parent: SubjectIdentity) -> Result<bool> {
        self.update_segment(contexts, |s| s.plus_parent(parent.clone())).await
    }

    pub async fn remove_parent(&self, contexts: &ContextSet, parent: &SubjectIdentity) -> Result<bool> {
        self.update_segment(contexts, |s| s.minus_parent(parent)).await
    }

    pub async fn clear_parents_in(&self, contexts: &ContextSet) -> Result<bool> {
        self.update_segment(contexts, Segment::without_parents).await
    }

    pub async fn clear_parents(&self) -> Result<bool> {
        self.update_all(Segment::without_parents).await
    }
}

impl Drop for SubjectDataView {
    fn drop(&mut self) {
        self.subject.remove_listener(self.listener);
    }
}

fn permissions_as_bools(segment: &Segment) -> BTreeMap<String, bool> {
    segment
        .permissions()
        .iter()
        .map(|(node, value)| (node.to_string(), *value > 0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::PermissionEngine;
    use crate::store::MemoryDataStore;

    fn id(raw: &str) -> SubjectIdentity {
        raw.parse().unwrap()
    }

    async fn alice() -> (PermissionEngine, SubjectRef) {
        let engine = PermissionEngine::new(EngineConfig::default(), Arc::new(MemoryDataStore::new())).unwrap();
        let subject = engine.subject(&id("user:alice")).await.unwrap();
        (engine, subject)
    }

    #[tokio::test]
    async fn parents_cache_follows_updates() {
        let (_engine, subject) = alice().await;
        let view = SubjectDataView::persistent(subject.clone());
        let global = ContextSet::empty();

        assert!(view.parents(&global).is_empty());
        assert!(view.add_parent(&global, id("group:a")).await.unwrap());
        assert_eq!(&*view.parents(&global), &[id("group:a")]);

        // updates made around the view are seen too
        subject.add_parent(&global, id("group:b")).await.unwrap();
        assert_eq!(&*view.parents(&global), &[id("group:a"), id("group:b")]);

        assert!(view.remove_parent(&global, &id("group:a")).await.unwrap());
        assert!(!view.remove_parent(&global, &id("group:a")).await.unwrap());
        assert_eq!(&*view.parents(&global), &[id("group:b")]);
    }

    #[tokio::test]
    async fn setters_report_changes() {
        let (_engine, subject) = alice().await;
        let view = SubjectDataView::persistent(subject);
        let nether = ContextSet::of("world", "nether").unwrap();

        assert!(view.set_permission(&nether, "Build.*", Tristate::False).await.unwrap());
        assert!(!view.set_permission(&nether, "build", Tristate::False).await.unwrap());
        assert_eq!(view.permissions(&nether).get("build"), Some(&false));
        assert!(view.set_option(&ContextSet::empty(), "prefix", Some("[A]")).await.unwrap());
        assert_eq!(view.all_options()[&ContextSet::empty()]["prefix"], "[A]");

        assert!(view.clear_permissions().await.unwrap());
        assert!(view.permissions(&nether).is_empty());
        assert!(view.clear_options_in(&ContextSet::empty()).await.unwrap());
        assert!(view.active_contexts().is_empty());
    }

    #[tokio::test]
    async fn transient_view_leaves_persistent_data_alone() {
        let (_engine, subject) = alice().await;
        let view = SubjectDataView::transient(subject.clone());
        assert!(view.is_transient());
        view.set_permission(&ContextSet::empty(), "fly", Tristate::True).await.unwrap();
        assert!(subject.data().is_empty());
        assert_eq!(
            view.all_permissions()[&ContextSet::empty()].get("fly"),
            Some(&true)
        );
    }

    #[tokio::test]
    async fn dropping_view_unregisters_listener() {
        let (_engine, subject) = alice().await;
        let view = SubjectDataView::persistent(subject.clone());
        assert_eq!(subject.listener_count(), 1);
        drop(view);
        assert_eq!(subject.listener_count(), 0);
    }

    #[tokio::test]
    async fn clear_parents_everywhere() {
        let (_engine, subject) = alice().await;
        let view = SubjectDataView::persistent(subject);
        let world = ContextSet::of("world", "w").unwrap();
        view.add_parent(&ContextSet::empty(), id("group:a")).await.unwrap();
        view.add_parent(&world, id("group:b")).await.unwrap();
        assert_eq!(view.all_parents().len(), 2);
        assert!(view.clear_parents_in(&world).await.unwrap());
        assert_eq!(view.all_parents().len(), 1);
        assert!(view.clear_parents().await.unwrap());
        assert!(view.all_parents().is_empty());
    }
}
