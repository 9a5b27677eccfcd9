//! Context-scoped bags of permissions, options and parents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::identity::SubjectIdentity;
use crate::node::{lookup_chain, PermissionNode};

/// Three-valued permission state as hosts usually expose it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tristate {
    True,
    False,
    Undefined,
}

impl Tristate {
    /// Stored integer for this state: `1`, `-1` or `0`.
    pub fn to_value(self) -> i32 {
        match self {
            Tristate::True => 1,
            Tristate::False => -1,
            Tristate::Undefined => 0,
        }
    }

    /// Only the sign of a stored value matters.
    pub fn from_value(value: i32) -> Self {
        match value.signum() {
            1 => Tristate::True,
            -1 => Tristate::False,
            _ => Tristate::Undefined,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Tristate::True => Some(true),
            Tristate::False => Some(false),
            Tristate::Undefined => None,
        }
    }
}

impl From<bool> for Tristate {
    fn from(value: bool) -> Self {
        if value {
            Tristate::True
        } else {
            Tristate::False
        }
    }
}

/// Immutable record of everything one subject defines under one context set.
///
/// Every transform returns a new segment; nothing mutates in place.
/// Permission values: `> 0` granted (magnitude is the grant weight), `< 0`
/// denied. Zero means unset and is never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SegmentRepr")]
pub struct Segment {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    permissions: BTreeMap<PermissionNode, i32>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    options: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parents: Option<Vec<SubjectIdentity>>,
    #[serde(skip_serializing_if = "is_zero")]
    weight: i32,
    #[serde(skip_serializing_if = "is_false")]
    fallback: bool,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Wire shape; normalized on the way in so hand-edited data cannot smuggle
/// zero-valued permissions or duplicate parents past the transforms.
#[derive(Default, Deserialize)]
#[serde(default)]
struct SegmentRepr {
    permissions: BTreeMap<PermissionNode, i32>,
    options: BTreeMap<String, String>,
    parents: Option<Vec<SubjectIdentity>>,
    weight: i32,
    fallback: bool,
}

impl From<SegmentRepr> for Segment {
    fn from(repr: SegmentRepr) -> Self {
        let mut permissions = repr.permissions;
        permissions.retain(|_, v| *v != 0);
        Segment {
            permissions,
            options: repr.options,
            parents: repr.parents.map(dedup_parents),
            weight: repr.weight,
            fallback: repr.fallback,
        }
    }
}

fn dedup_parents(parents: Vec<SubjectIdentity>) -> Vec<SubjectIdentity> {
    let mut out: Vec<SubjectIdentity> = Vec::with_capacity(parents.len());
    for parent in parents {
        if !out.contains(&parent) {
            out.push(parent);
        }
    }
    out
}

impl Segment {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn permissions(&self) -> &BTreeMap<PermissionNode, i32> {
        &self.permissions
    }

    /// Exact stored value for `node`, `0` when unset.
    pub fn permission(&self, node: &str) -> i32 {
        self.permissions.get(node).copied().unwrap_or(0)
    }

    /// Most specific stored entry covering `node` (already normalized).
    pub fn lookup_permission(&self, node: &str) -> Option<(&PermissionNode, i32)> {
        lookup_chain(node).find_map(|candidate| {
            self.permissions
                .get_key_value(candidate)
                .map(|(k, v)| (k, *v))
        })
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Declared parents. `Some(&[])` explicitly declares "no parents".
    pub fn parents(&self) -> Option<&[SubjectIdentity]> {
        self.parents.as_deref()
    }

    pub fn weight(&self) -> i32 {
        self.weight
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// At least one permission, option or declared parent list.
    pub fn has_values(&self) -> bool {
        !self.permissions.is_empty() || !self.options.is_empty() || self.parents.is_some()
    }

    /// Identical to a freshly created segment; such segments are dropped
    /// from subject data.
    pub fn is_empty(&self) -> bool {
        !self.has_values() && self.weight == 0 && !self.fallback
    }

    // ------------------------------------------------------------------
    // Transforms
    // ------------------------------------------------------------------

    /// Set `node` to `value`; `0` clears it.
    pub fn with_permission(&self, node: PermissionNode, value: i32) -> Self {
        let mut next = self.clone();
        if value == 0 {
            next.permissions.remove(node.as_str());
        } else {
            next.permissions.insert(node, value);
        }
        next
    }

    pub fn with_permissions(&self, permissions: BTreeMap<PermissionNode, i32>) -> Self {
        let mut next = self.clone();
        next.permissions = permissions;
        next.permissions.retain(|_, v| *v != 0);
        next
    }

    pub fn without_permissions(&self) -> Self {
        let mut next = self.clone();
        next.permissions.clear();
        next
    }

    /// Set an option; `None` clears it.
    pub fn with_option(&self, key: &str, value: Option<&str>) -> Self {
        let mut next = self.clone();
        match value {
            Some(value) => {
                next.options.insert(key.to_string(), value.to_string());
            }
            None => {
                next.options.remove(key);
            }
        }
        next
    }

    pub fn with_options(&self, options: BTreeMap<String, String>) -> Self {
        let mut next = self.clone();
        next.options = options;
        next
    }

    pub fn without_options(&self) -> Self {
        let mut next = self.clone();
        next.options.clear();
        next
    }

    /// Append `parent` unless already present.
    pub fn plus_parent(&self, parent: SubjectIdentity) -> Self {
        let mut next = self.clone();
        let parents = next.parents.get_or_insert_with(Vec::new);
        if !parents.contains(&parent) {
            parents.push(parent);
        }
        next
    }

    /// Remove `parent`; a list emptied this way stops declaring parents.
    pub fn minus_parent(&self, parent: &SubjectIdentity) -> Self {
        let mut next = self.clone();
        if let Some(parents) = next.parents.as_mut() {
            parents.retain(|p| p != parent);
            if parents.is_empty() {
                next.parents = None;
            }
        }
        next
    }

    /// Replace the parent list. An empty list still declares parents and so
    /// blocks inheritance from lower-precedence segments.
    pub fn with_parents(&self, parents: Vec<SubjectIdentity>) -> Self {
        let mut next = self.clone();
        next.parents = Some(dedup_parents(parents));
        next
    }

    pub fn without_parents(&self) -> Self {
        let mut next = self.clone();
        next.parents = None;
        next
    }

    pub fn with_weight(&self, weight: i32) -> Self {
        let mut next = self.clone();
        next.weight = weight;
        next
    }

    pub fn with_fallback(&self, fallback: bool) -> Self {
        let mut next = self.clone();
        next.fallback = fallback;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(raw: &str) -> PermissionNode {
        PermissionNode::new(raw).unwrap()
    }

    fn subject(raw: &str) -> SubjectIdentity {
        raw.parse().unwrap()
    }

    #[test]
    fn zero_clears_permission() {
        let seg = Segment::new().with_permission(node("foo"), 1);
        assert_eq!(seg.permission("foo"), 1);
        let cleared = seg.with_permission(node("foo"), 0);
        assert_eq!(cleared.permission("foo"), 0);
        assert!(cleared.is_empty());
        // original untouched
        assert_eq!(seg.permission("foo"), 1);
    }

    #[test]
    fn lookup_prefers_most_specific_entry() {
        let seg = Segment::new()
            .with_permission(node("cmd.*"), 1)
            .with_permission(node("cmd.kick"), -1);
        assert_eq!(seg.lookup_permission("cmd.kick").map(|(_, v)| v), Some(-1));
        assert_eq!(seg.lookup_permission("cmd.ban").map(|(_, v)| v), Some(1));
        assert_eq!(seg.lookup_permission("chat").map(|(_, v)| v), None);

        let root = Segment::new().with_permission(node("*"), 2);
        let (hit, value) = root.lookup_permission("anything.at.all").unwrap();
        assert_eq!((hit.as_str(), value), ("*", 2));
    }

    #[test]
    fn options_set_and_clear() {
        let seg = Segment::new().with_option("prefix", Some("[A]"));
        assert_eq!(seg.option("prefix"), Some("[A]"));
        assert_eq!(seg.with_option("prefix", None).option("prefix"), None);
        assert!(seg.without_options().is_empty());
    }

    #[test]
    fn parent_transforms_keep_order_and_uniqueness() {
        let seg = Segment::new()
            .plus_parent(subject("group:a"))
            .plus_parent(subject("group:b"))
            .plus_parent(subject("group:a"));
        assert_eq!(
            seg.parents().unwrap(),
            &[subject("group:a"), subject("group:b")]
        );

        let removed = seg
            .minus_parent(&subject("group:a"))
            .minus_parent(&subject("group:b"));
        assert_eq!(removed.parents(), None);

        let blocked = Segment::new().with_parents(vec![]);
        assert_eq!(blocked.parents(), Some(&[][..]));
        assert!(blocked.has_values());
    }

    #[test]
    fn weight_alone_is_not_a_value() {
        let seg = Segment::new().with_weight(5);
        assert!(!seg.has_values());
        assert!(!seg.is_empty());
    }

    #[test]
    fn tristate_round_trips_through_values() {
        for state in [Tristate::True, Tristate::False, Tristate::Undefined] {
            assert_eq!(Tristate::from_value(state.to_value()), state);
        }
        assert_eq!(Tristate::from_value(42), Tristate::True);
        assert_eq!(Tristate::from(false).as_bool(), Some(false));
    }

    #[test]
    fn deserialization_normalizes() {
        let seg: Segment = serde_json::from_str(
            r#"{"permissions":{"CMD.*":1,"chat":0},"parents":["group:a","group:a"],"weight":3}"#,
        )
        .unwrap();
        assert_eq!(seg.permission("cmd"), 1);
        assert_eq!(seg.permissions().len(), 1);
        assert_eq!(seg.parents().unwrap().len(), 1);
        assert_eq!(seg.weight(), 3);

        let json = serde_json::to_string(&seg).unwrap();
        let back: Segment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, seg);
    }

    #[test]
    fn malformed_node_in_wire_data_is_rejected() {
        let bad = serde_json::from_str::<Segment>(r#"{"permissions":{"a..b":1}}"#);
        assert!(bad.is_err());
    }
}
