//! Resolution engine computing effective values across the inheritance graph.
//!
//! A resolve starts at one subject and a requested context set. The segments
//! of that subject that match the request are ordered by precedence; the first
//! one defining the queried value decides. Otherwise the walk descends into
//! the parents declared by the highest-precedence segment that declares any,
//! depth-first in list order, with the request unchanged.
//!
//! The graph is reached through [`SubjectGraph`], which hands out one
//! consistent snapshot per visited subject. The runtime crate implements it on
//! top of its subject registry and uses the visits to track cache
//! dependencies.

use std::cmp::Reverse;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use tracing::{debug, warn};

use crate::context::{ContextMatcher, ContextSet};
use crate::data::{DataLayer, ImmutableSubjectData};
use crate::identity::SubjectIdentity;
use crate::node::{normalize_query, PermissionNode};
use crate::segment::{Segment, Tristate};

/// Maximum inheritance depth when nothing else is configured.
pub const DEFAULT_MAX_DEPTH: u32 = 50;

// ============================================================================
// Graph capability
// ============================================================================

/// Both data layers of one subject, as captured at one instant.
#[derive(Debug, Clone, Default)]
pub struct SubjectSnapshot {
    pub persistent: Arc<ImmutableSubjectData>,
    pub transient: Arc<ImmutableSubjectData>,
}

impl SubjectSnapshot {
    pub fn new(persistent: Arc<ImmutableSubjectData>, transient: Arc<ImmutableSubjectData>) -> Self {
        Self {
            persistent,
            transient,
        }
    }

    /// Snapshot with only persistent data.
    pub fn persistent(data: ImmutableSubjectData) -> Self {
        Self {
            persistent: Arc::new(data),
            transient: Arc::default(),
        }
    }

    pub fn layer(&self, layer: DataLayer) -> &Arc<ImmutableSubjectData> {
        match layer {
            DataLayer::Transient => &self.transient,
            DataLayer::Persistent => &self.persistent,
        }
    }
}

/// Source of subject snapshots for a resolve.
///
/// Unknown subjects must come back as an empty snapshot; resolution never
/// fails because of a missing subject.
pub trait SubjectGraph {
    fn snapshot(&self, subject: &SubjectIdentity) -> SubjectSnapshot;
}

impl<G: SubjectGraph + ?Sized> SubjectGraph for &G {
    fn snapshot(&self, subject: &SubjectIdentity) -> SubjectSnapshot {
        (**self).snapshot(subject)
    }
}

// ============================================================================
// Queries and results
// ============================================================================

/// What a resolve computes. Permission nodes are normalized on construction
/// so equal queries hash equally in caches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Query {
    Permission(String),
    Option(String),
    Parents,
}

impl Query {
    pub fn permission(node: &str) -> Self {
        Query::Permission(normalize_query(node))
    }

    pub fn option(key: &str) -> Self {
        Query::Option(key.to_string())
    }
}

/// Where a permission value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionOrigin {
    pub subject: SubjectIdentity,
    pub contexts: ContextSet,
    pub node: PermissionNode,
    pub layer: DataLayer,
}

/// Effective permission value. `0` means undefined, which is distinct from
/// a deny; callers choose their own default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPermission {
    pub value: i32,
    pub origin: Option<PermissionOrigin>,
}

impl ResolvedPermission {
    pub fn undefined() -> Self {
        Self::default()
    }

    pub fn tristate(&self) -> Tristate {
        Tristate::from_value(self.value)
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.tristate().as_bool()
    }

    pub fn is_granted(&self) -> bool {
        self.value > 0
    }

    pub fn is_denied(&self) -> bool {
        self.value < 0
    }

    pub fn is_undefined(&self) -> bool {
        self.value == 0
    }
}

/// Result of [`Resolver::resolve`], one variant per [`Query`] kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Permission(ResolvedPermission),
    Option(Option<String>),
    Parents(Vec<SubjectIdentity>),
}

impl Resolution {
    pub fn into_permission(self) -> Option<ResolvedPermission> {
        match self {
            Resolution::Permission(p) => Some(p),
            _ => None,
        }
    }

    pub fn into_option(self) -> Option<Option<String>> {
        match self {
            Resolution::Option(o) => Some(o),
            _ => None,
        }
    }

    pub fn into_parents(self) -> Option<Vec<SubjectIdentity>> {
        match self {
            Resolution::Parents(p) => Some(p),
            _ => None,
        }
    }
}

// ============================================================================
// Segment matching
// ============================================================================

/// A segment of one subject that matched a request.
#[derive(Debug, Clone, Copy)]
pub struct MatchedSegment<'a> {
    pub layer: DataLayer,
    pub contexts: &'a ContextSet,
    pub segment: &'a Segment,
    /// Creation index inside its layer.
    pub position: usize,
}

/// Matching segments of `snapshot` in precedence order: transient before
/// persistent, then specificity descending, weight descending and creation
/// order ascending. Fallback segments are only considered when no other
/// segment in either layer matches.
pub fn matching_segments<'a>(
    snapshot: &'a SubjectSnapshot,
    requested: &ContextSet,
    matcher: &dyn ContextMatcher,
) -> Vec<MatchedSegment<'a>> {
    let mut primary = Vec::new();
    let mut fallback = Vec::new();

    for layer in [DataLayer::Transient, DataLayer::Persistent] {
        for (position, (contexts, segment)) in snapshot.layer(layer).iter().enumerate() {
            if !contexts.is_matched_by(requested, matcher) {
                continue;
            }
            let matched = MatchedSegment {
                layer,
                contexts,
                segment,
                position,
            };
            if segment.is_fallback() {
                fallback.push(matched);
            } else {
                primary.push(matched);
            }
        }
    }

    let mut matched = if primary.is_empty() { fallback } else { primary };
    matched.sort_by_key(|m| {
        (
            m.layer,
            Reverse(m.contexts.specificity()),
            Reverse(m.segment.weight()),
            m.position,
        )
    });
    matched
}

// ============================================================================
// Resolver
// ============================================================================

/// Walks a [`SubjectGraph`] to compute effective values.
pub struct Resolver<'a, G: ?Sized> {
    graph: &'a G,
    matcher: &'a dyn ContextMatcher,
    max_depth: u32,
    log_cycles: bool,
}

impl<'a, G: SubjectGraph + ?Sized> Resolver<'a, G> {
    pub fn new(graph: &'a G, matcher: &'a dyn ContextMatcher) -> Self {
        Self {
            graph,
            matcher,
            max_depth: DEFAULT_MAX_DEPTH,
            log_cycles: true,
        }
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_cycle_logging(mut self, log_cycles: bool) -> Self {
        self.log_cycles = log_cycles;
        self
    }

    pub fn resolve(&self, subject: &SubjectIdentity, requested: &ContextSet, query: &Query) -> Resolution {
        match query {
            Query::Permission(node) => Resolution::Permission(self.permission(subject, requested, node)),
            Query::Option(key) => Resolution::Option(self.option(subject, requested, key)),
            Query::Parents => Resolution::Parents(self.parents(subject, requested)),
        }
    }

    /// Effective value of `node` for `subject` under `requested`.
    pub fn permission(
        &self,
        subject: &SubjectIdentity,
        requested: &ContextSet,
        node: &str,
    ) -> ResolvedPermission {
        let node = normalize_query(node);
        let mut find = |owner: &SubjectIdentity, matched: &MatchedSegment<'_>| {
            let (hit, value) = matched.segment.lookup_permission(&node)?;
            Some(ResolvedPermission {
                value,
                origin: Some(PermissionOrigin {
                    subject: owner.clone(),
                    contexts: matched.contexts.clone(),
                    node: hit.clone(),
                    layer: matched.layer,
                }),
            })
        };
        self.walk(subject, requested, 0, &mut WalkState::default(), &mut find)
            .unwrap_or_default()
    }

    /// Effective value of option `key`, `None` when no subject defines it.
    pub fn option(&self, subject: &SubjectIdentity, requested: &ContextSet, key: &str) -> Option<String> {
        let mut find = |_: &SubjectIdentity, matched: &MatchedSegment<'_>| {
            matched.segment.option(key).map(str::to_string)
        };
        self.walk(subject, requested, 0, &mut WalkState::default(), &mut find)
    }

    /// Direct parents of `subject` under `requested`: the ordered union over
    /// every matching segment, without grandparents.
    pub fn parents(&self, subject: &SubjectIdentity, requested: &ContextSet) -> Vec<SubjectIdentity> {
        let snapshot = self.graph.snapshot(subject);
        let mut seen = AHashSet::new();
        let mut out = Vec::new();
        for matched in matching_segments(&snapshot, requested, self.matcher) {
            for parent in matched.segment.parents().unwrap_or_default() {
                if seen.insert(parent.clone()) {
                    out.push(parent.clone());
                }
            }
        }
        out
    }

    fn walk<T>(
        &self,
        subject: &SubjectIdentity,
        requested: &ContextSet,
        depth: u32,
        state: &mut WalkState,
        find: &mut dyn FnMut(&SubjectIdentity, &MatchedSegment<'_>) -> Option<T>,
    ) -> Option<T> {
        if depth > self.max_depth {
            warn!(
                subject = %subject,
                max_depth = self.max_depth,
                "inheritance depth limit reached, ignoring deeper parents"
            );
            state.truncated = true;
            return None;
        }
        if state.exhausted.get(subject).is_some_and(|&shallowest| depth >= shallowest) {
            return None;
        }

        let truncated_before = std::mem::take(&mut state.truncated);
        let result = self.search(subject, requested, depth, state, find);
        if result.is_none() {
            let reach = if state.truncated { depth } else { 0 };
            state.exhausted.insert(subject.clone(), reach);
        }
        state.truncated |= truncated_before;
        result
    }

    fn search<T>(
        &self,
        subject: &SubjectIdentity,
        requested: &ContextSet,
        depth: u32,
        state: &mut WalkState,
        find: &mut dyn FnMut(&SubjectIdentity, &MatchedSegment<'_>) -> Option<T>,
    ) -> Option<T> {
        let snapshot = self.graph.snapshot(subject);
        let matched = matching_segments(&snapshot, requested, self.matcher);

        for segment in &matched {
            if let Some(found) = find(subject, segment) {
                return Some(found);
            }
        }

        let parents = matched.iter().find_map(|m| m.segment.parents())?;
        if parents.is_empty() {
            return None;
        }

        state.path.insert(subject.clone());
        let mut result = None;
        for parent in parents {
            if state.path.contains(parent) {
                if self.log_cycles {
                    debug!(subject = %subject, parent = %parent, "inheritance cycle, skipping edge");
                }
                continue;
            }
            if let Some(found) = self.walk(parent, requested, depth + 1, state, find) {
                result = Some(found);
                break;
            }
        }
        state.path.remove(subject);
        result
    }
}

/// Bookkeeping for one walk.
///
/// A hit ends the whole walk, so a subject whose subtree came back empty
/// stays empty for the rest of it. `exhausted` maps such a subject to the
/// shallowest depth it was searched from: `0` when nothing was cut by the
/// depth limit, so it is never searched again, otherwise only a shallower
/// route searches it again since only that can reach further.
#[derive(Default)]
struct WalkState {
    path: AHashSet<SubjectIdentity>,
    exhausted: AHashMap<SubjectIdentity, u32>,
    truncated: bool,
}
