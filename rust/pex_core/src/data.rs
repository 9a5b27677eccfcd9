//! Per-subject data snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::context::ContextSet;
use crate::error::{PexError, Result};
use crate::segment::Segment;

/// Immutable mapping from context set to segment for one subject.
///
/// Entries keep their creation order, which is the last-resort tie-break
/// during resolution. Updating an existing entry keeps its position; an
/// update that empties a segment removes the entry. Every "mutation" returns
/// a new instance sharing unchanged segments with the old one.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<SegmentEntry>", into = "Vec<SegmentEntry>")]
pub struct ImmutableSubjectData {
    entries: Vec<(ContextSet, Arc<Segment>)>,
    index: AHashMap<ContextSet, usize>,
}

/// Which of a subject's two data layers a snapshot belongs to.
///
/// Transient data lives only in memory and takes precedence over persistent
/// data during resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataLayer {
    Transient,
    Persistent,
}

/// Wire shape of one entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentEntry {
    pub contexts: ContextSet,
    pub segment: Segment,
}

impl ImmutableSubjectData {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_entries(entries: Vec<(ContextSet, Arc<Segment>)>) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, (contexts, _))| (contexts.clone(), i))
            .collect();
        Self { entries, index }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in creation order.
    pub fn iter(&self) -> impl Iterator<Item = (&ContextSet, &Segment)> {
        self.entries.iter().map(|(c, s)| (c, s.as_ref()))
    }

    /// Segment stored for exactly `contexts`, if any.
    pub fn segment_or_none(&self, contexts: &ContextSet) -> Option<&Segment> {
        self.index
            .get(contexts)
            .map(|&i| self.entries[i].1.as_ref())
    }

    /// Segment stored for exactly `contexts`, or an empty one.
    pub fn segment(&self, contexts: &ContextSet) -> Segment {
        self.segment_or_none(contexts).cloned().unwrap_or_default()
    }

    /// Replace the segment for `contexts`. An empty segment removes the entry.
    pub fn with_segment(&self, contexts: ContextSet, segment: Segment) -> Self {
        match (self.index.get(&contexts).copied(), segment.is_empty()) {
            (Some(i), false) => {
                if *self.entries[i].1 == segment {
                    return self.clone();
                }
                let mut next = self.clone();
                next.entries[i].1 = Arc::new(segment);
                next
            }
            (Some(i), true) => {
                let mut entries = self.entries.clone();
                entries.remove(i);
                Self::from_entries(entries)
            }
            (None, false) => {
                let mut next = self.clone();
                next.index.insert(contexts.clone(), next.entries.len());
                next.entries.push((contexts, Arc::new(segment)));
                next
            }
            (None, true) => self.clone(),
        }
    }

    /// Apply `f` to the segment for `contexts` (empty if absent).
    pub fn update_segment(&self, contexts: &ContextSet, f: impl FnOnce(&Segment) -> Segment) -> Self {
        let current = self.segment(contexts);
        self.with_segment(contexts.clone(), f(&current))
    }

    /// Apply `f` to every segment, dropping those it empties.
    pub fn with_segments(&self, mut f: impl FnMut(&ContextSet, &Segment) -> Segment) -> Self {
        let entries = self
            .entries
            .iter()
            .filter_map(|(contexts, segment)| {
                let next = f(contexts, segment);
                if next.is_empty() {
                    None
                } else if next == **segment {
                    Some((contexts.clone(), Arc::clone(segment)))
                } else {
                    Some((contexts.clone(), Arc::new(next)))
                }
            })
            .collect();
        Self::from_entries(entries)
    }

    /// Project every segment, keyed by its context set.
    pub fn map_segment_values<T>(&self, mut f: impl FnMut(&Segment) -> T) -> BTreeMap<ContextSet, T> {
        self.entries
            .iter()
            .map(|(contexts, segment)| (contexts.clone(), f(segment)))
            .collect()
    }

    /// Context sets holding at least one defined value, in creation order.
    pub fn active_contexts(&self) -> Vec<ContextSet> {
        self.entries
            .iter()
            .filter(|(_, segment)| segment.has_values())
            .map(|(contexts, _)| contexts.clone())
            .collect()
    }
}

impl PartialEq for ImmutableSubjectData {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for ImmutableSubjectData {}

impl std::fmt::Debug for ImmutableSubjectData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(c, s)| (c, s.as_ref())))
            .finish()
    }
}

impl TryFrom<Vec<SegmentEntry>> for ImmutableSubjectData {
    type Error = PexError;

    fn try_from(wire: Vec<SegmentEntry>) -> Result<Self> {
        let mut entries: Vec<(ContextSet, Arc<Segment>)> = Vec::with_capacity(wire.len());
        let mut index = AHashMap::with_capacity(wire.len());
        for SegmentEntry { contexts, segment } in wire {
            if index.contains_key(&contexts) {
                return Err(PexError::DuplicateContextSet(contexts.to_string()));
            }
            if segment.is_empty() {
                continue;
            }
            index.insert(contexts.clone(), entries.len());
            entries.push((contexts, Arc::new(segment)));
        }
        Ok(Self { entries, index })
    }
}

impl From<ImmutableSubjectData> for Vec<SegmentEntry> {
    fn from(data: ImmutableSubjectData) -> Self {
        data.entries
            .into_iter()
            .map(|(contexts, segment)| SegmentEntry {
                contexts,
                segment: Arc::unwrap_or_clone(segment),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SubjectIdentity;
    use crate::node::PermissionNode;

    fn ctx(pairs: &[(&str, &str)]) -> ContextSet {
        ContextSet::new(pairs.iter().copied()).unwrap()
    }

    fn node(raw: &str) -> PermissionNode {
        PermissionNode::new(raw).unwrap()
    }

    #[test]
    fn update_keeps_creation_order() {
        let data = ImmutableSubjectData::new()
            .update_segment(&ctx(&[("world", "a")]), |s| s.with_permission(node("x"), 1))
            .update_segment(&ContextSet::empty(), |s| s.with_permission(node("y"), 1))
            .update_segment(&ctx(&[("world", "a")]), |s| s.with_permission(node("z"), 1));

        let order: Vec<&ContextSet> = data.iter().map(|(c, _)| c).collect();
        assert_eq!(order, vec![&ctx(&[("world", "a")]), &ContextSet::empty()]);
        assert_eq!(data.segment(&ctx(&[("world", "a")])).permissions().len(), 2);
    }

    #[test]
    fn emptied_segment_is_removed() {
        let data = ImmutableSubjectData::new()
            .update_segment(&ContextSet::empty(), |s| s.with_option("a", Some("1")))
            .update_segment(&ctx(&[("world", "a")]), |s| s.with_option("b", Some("2")));
        let cleared = data.update_segment(&ContextSet::empty(), |s| s.without_options());
        assert_eq!(cleared.len(), 1);
        assert!(cleared.segment_or_none(&ContextSet::empty()).is_none());
        assert_eq!(
            cleared.segment(&ctx(&[("world", "a")])).option("b"),
            Some("2")
        );
        // the original snapshot is untouched
        assert_eq!(data.len(), 2);
    }

    #[test]
    fn with_segments_applies_everywhere() {
        let data = ImmutableSubjectData::new()
            .update_segment(&ContextSet::empty(), |s| {
                s.with_permission(node("a"), 1).with_option("o", Some("v"))
            })
            .update_segment(&ctx(&[("world", "a")]), |s| s.with_permission(node("b"), 1));
        let stripped = data.with_segments(|_, s| s.without_permissions());
        assert_eq!(stripped.len(), 1);
        assert_eq!(stripped.active_contexts(), vec![ContextSet::empty()]);
    }

    #[test]
    fn active_contexts_skip_weight_only_segments() {
        let data = ImmutableSubjectData::new()
            .update_segment(&ContextSet::empty(), |s| s.with_weight(4))
            .update_segment(&ctx(&[("world", "a")]), |s| {
                s.plus_parent(SubjectIdentity::new("group", "g").unwrap())
            });
        assert_eq!(data.len(), 2);
        assert_eq!(data.active_contexts(), vec![ctx(&[("world", "a")])]);
    }

    #[test]
    fn map_segment_values_projects() {
        let data = ImmutableSubjectData::new()
            .update_segment(&ContextSet::empty(), |s| s.with_option("a", Some("1")));
        let options = data.map_segment_values(|s| s.options().clone());
        assert_eq!(options[&ContextSet::empty()]["a"], "1");
    }

    #[test]
    fn serde_round_trip_preserves_order() {
        let data = ImmutableSubjectData::new()
            .update_segment(&ctx(&[("world", "b")]), |s| s.with_permission(node("x"), -1))
            .update_segment(&ctx(&[("world", "a")]), |s| s.with_weight(2).with_permission(node("x"), 1));
        let json = serde_json::to_string(&data).unwrap();
        let back: ImmutableSubjectData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, data);
        assert_eq!(
            back.iter().map(|(c, _)| c.clone()).collect::<Vec<_>>(),
            vec![ctx(&[("world", "b")]), ctx(&[("world", "a")])]
        );
    }

    #[test]
    fn duplicate_context_sets_are_rejected() {
        let json = r#"[
            {"contexts":[{"key":"world","value":"a"}],"segment":{"weight":1}},
            {"contexts":[{"key":"world","value":"a"}],"segment":{"weight":2}}
        ]"#;
        let err = serde_json::from_str::<ImmutableSubjectData>(json).unwrap_err();
        assert!(err.to_string().contains("duplicate segment"));
    }
}
