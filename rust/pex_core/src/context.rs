//! Context pairs and context sets.
//!
//! A [`ContextSet`] describes the environment a check happens in (world,
//! server, game mode, ...). It is kept sorted and deduplicated so equality,
//! ordering and hashing are structural, which lets it serve directly as a
//! cache key. Cloning is a reference-count bump.

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{PexError, Result};

/// One `key=value` pair.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Context {
    pub key: String,
    pub value: String,
}

impl Context {
    /// Build a validated pair. Keys and values must be non-empty and keys may
    /// not contain whitespace.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let context = Self {
            key: key.into(),
            value: value.into(),
        };
        context.validate()?;
        Ok(context)
    }

    fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(PexError::MalformedContextSet(format!(
                "empty key (value '{}')",
                self.value
            )));
        }
        if self.key.chars().any(char::is_whitespace) {
            return Err(PexError::MalformedContextSet(format!(
                "key '{}' contains whitespace",
                self.key
            )));
        }
        if self.value.is_empty() {
            return Err(PexError::MalformedContextSet(format!(
                "empty value for key '{}'",
                self.key
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Immutable, sorted set of context pairs. A key may repeat with different
/// values. The empty set is the global context.
#[derive(Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<Context>", into = "Vec<Context>")]
pub struct ContextSet {
    pairs: Arc<[Context]>,
}

impl Default for ContextSet {
    fn default() -> Self {
        Self {
            pairs: Arc::from(Vec::new()),
        }
    }
}

impl ContextSet {
    /// The global context.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from `(key, value)` pairs in any order.
    pub fn new<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let contexts = pairs
            .into_iter()
            .map(|(k, v)| Context::new(k, v))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_sorted(contexts))
    }

    /// Single-pair set.
    pub fn of(key: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        Ok(Self::from_sorted(vec![Context::new(key, value)?]))
    }

    fn from_sorted(mut contexts: Vec<Context>) -> Self {
        contexts.sort();
        contexts.dedup();
        Self {
            pairs: contexts.into(),
        }
    }

    /// A copy of this set with one more pair.
    pub fn with(&self, key: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let mut contexts = self.pairs.to_vec();
        contexts.push(Context::new(key, value)?);
        Ok(Self::from_sorted(contexts))
    }

    /// Number of pairs; larger sets are more specific.
    pub fn specificity(&self) -> usize {
        self.pairs.len()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Context> {
        self.pairs.iter()
    }

    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.values(key).any(|v| v == value)
    }

    /// All values recorded for `key`.
    pub fn values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.with_key(key).iter().map(|c| c.value.as_str())
    }

    fn with_key(&self, key: &str) -> &[Context] {
        let start = self.pairs.partition_point(|c| c.key.as_str() < key);
        let end = start + self.pairs[start..].partition_point(|c| c.key == key);
        &self.pairs[start..end]
    }

    /// Whether a segment scoped to `self` applies when `active` is requested:
    /// every pair of `self` must be matched by a pair of `active` with the
    /// same key. The empty set matches everything.
    pub fn is_matched_by(&self, active: &ContextSet, matcher: &dyn ContextMatcher) -> bool {
        self.pairs.iter().all(|owned| {
            active
                .with_key(&owned.key)
                .iter()
                .any(|candidate| matcher.matches(owned, candidate))
        })
    }
}

impl TryFrom<Vec<Context>> for ContextSet {
    type Error = PexError;

    fn try_from(contexts: Vec<Context>) -> Result<Self> {
        for context in &contexts {
            context.validate()?;
        }
        Ok(Self::from_sorted(contexts))
    }
}

impl From<ContextSet> for Vec<Context> {
    fn from(set: ContextSet) -> Self {
        set.pairs.to_vec()
    }
}

impl fmt::Display for ContextSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, context) in self.pairs.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{context}")?;
        }
        f.write_str("}")
    }
}

impl fmt::Debug for ContextSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextSet{self}")
    }
}

// ============================================================================
// Matching
// ============================================================================

/// Decides whether an owned context pair is satisfied by an active pair with
/// the same key.
pub trait ContextMatcher: Send + Sync {
    fn matches(&self, owned: &Context, active: &Context) -> bool;
}

/// Plain value equality.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatcher;

impl ContextMatcher for ExactMatcher {
    fn matches(&self, owned: &Context, active: &Context) -> bool {
        owned.value == active.value
    }
}

/// A host-specific context kind, e.g. `world` or `server`.
///
/// `E` is the host's event type from which the current values are read.
pub trait ContextDefinition<E>: Send + Sync {
    /// Context key this definition owns.
    fn name(&self) -> &str;

    /// Whether a segment value `owned` applies when `active` is current.
    fn matches(&self, owned: &str, active: &str) -> bool {
        owned == active
    }

    /// Push the values of this context that are current for `event`.
    fn accumulate_current(&self, event: &E, sink: &mut dyn FnMut(String));
}

/// Definition backed by a closure returning at most one current value.
pub struct SimpleContextDefinition<F> {
    name: String,
    current: F,
}

impl<F> SimpleContextDefinition<F> {
    pub fn new(name: impl Into<String>, current: F) -> Self {
        Self {
            name: name.into(),
            current,
        }
    }
}

impl<E, F> ContextDefinition<E> for SimpleContextDefinition<F>
where
    F: Fn(&E) -> Option<String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn accumulate_current(&self, event: &E, sink: &mut dyn FnMut(String)) {
        if let Some(value) = (self.current)(event) {
            sink(value);
        }
    }
}

/// Registry of context definitions keyed by context name.
///
/// Keys without a registered definition fall back to exact matching.
pub struct ContextRegistry<E: 'static> {
    definitions: AHashMap<String, Arc<dyn ContextDefinition<E>>>,
}

impl<E: 'static> Default for ContextRegistry<E> {
    fn default() -> Self {
        Self {
            definitions: AHashMap::new(),
        }
    }
}

impl<E: 'static> ContextRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition, returning the one it replaced.
    pub fn register(
        &mut self,
        definition: Arc<dyn ContextDefinition<E>>,
    ) -> Option<Arc<dyn ContextDefinition<E>>> {
        self.definitions
            .insert(definition.name().to_string(), definition)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ContextDefinition<E>>> {
        self.definitions.get(name)
    }

    /// Collect the contexts active for `event` from every definition.
    /// Values a definition reports that are not valid contexts are skipped.
    pub fn accumulate_current_contexts(&self, event: &E) -> ContextSet {
        let mut contexts = Vec::new();
        for (name, definition) in &self.definitions {
            definition.accumulate_current(event, &mut |value| {
                match Context::new(name.clone(), value) {
                    Ok(context) => contexts.push(context),
                    Err(e) => tracing::debug!("skipping current context: {}", e),
                }
            });
        }
        ContextSet::from_sorted(contexts)
    }
}

impl<E: 'static> ContextMatcher for ContextRegistry<E> {
    fn matches(&self, owned: &Context, active: &Context) -> bool {
        match self.definitions.get(&owned.key) {
            Some(definition) => definition.matches(&owned.value, &active.value),
            None => owned.value == active.value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(pairs: &[(&str, &str)]) -> ContextSet {
        ContextSet::new(pairs.iter().copied()).unwrap()
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let a = set(&[("world", "nether"), ("server", "lobby")]);
        let b = set(&[("server", "lobby"), ("world", "nether")]);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "{server=lobby, world=nether}");
    }

    #[test]
    fn repeated_keys_are_kept() {
        let s = set(&[("server", "a"), ("server", "b"), ("server", "a")]);
        assert_eq!(s.len(), 2);
        assert_eq!(s.values("server").collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn empty_set_matches_everything() {
        let requested = set(&[("world", "nether")]);
        assert!(ContextSet::empty().is_matched_by(&requested, &ExactMatcher));
        assert!(ContextSet::empty().is_matched_by(&ContextSet::empty(), &ExactMatcher));
    }

    #[test]
    fn subset_matching() {
        let requested = set(&[("world", "nether"), ("server", "lobby")]);
        assert!(set(&[("world", "nether")]).is_matched_by(&requested, &ExactMatcher));
        assert!(!set(&[("world", "end")]).is_matched_by(&requested, &ExactMatcher));
        assert!(!set(&[("world", "nether"), ("mode", "creative")])
            .is_matched_by(&requested, &ExactMatcher));
    }

    #[test]
    fn malformed_pairs_are_rejected() {
        assert!(matches!(
            ContextSet::new([("", "x")]),
            Err(PexError::MalformedContextSet(_))
        ));
        assert!(matches!(
            ContextSet::new([("world", "")]),
            Err(PexError::MalformedContextSet(_))
        ));
        assert!(matches!(
            ContextSet::new([("my world", "x")]),
            Err(PexError::MalformedContextSet(_))
        ));
    }

    #[test]
    fn deserialization_validates_and_sorts() {
        let parsed: ContextSet =
            serde_json::from_str(r#"[{"key":"world","value":"a"},{"key":"server","value":"b"}]"#)
                .unwrap();
        assert_eq!(parsed, set(&[("server", "b"), ("world", "a")]));

        let bad = serde_json::from_str::<ContextSet>(r#"[{"key":"","value":"a"}]"#);
        assert!(bad.is_err());
    }

    struct Event {
        world: &'static str,
    }

    struct PrefixWorlds;

    impl ContextDefinition<Event> for PrefixWorlds {
        fn name(&self) -> &str {
            "world"
        }

        fn matches(&self, owned: &str, active: &str) -> bool {
            active.starts_with(owned)
        }

        fn accumulate_current(&self, event: &Event, sink: &mut dyn FnMut(String)) {
            sink(event.world.to_string());
        }
    }

    #[test]
    fn registry_accumulates_and_matches() {
        let mut registry: ContextRegistry<Event> = ContextRegistry::new();
        registry.register(Arc::new(PrefixWorlds));
        registry.register(Arc::new(SimpleContextDefinition::new(
            "mode",
            |_: &Event| Some("survival".to_string()),
        )));

        let current = registry.accumulate_current_contexts(&Event {
            world: "nether_2",
        });
        assert_eq!(current, set(&[("mode", "survival"), ("world", "nether_2")]));

        assert!(set(&[("world", "nether")]).is_matched_by(&current, &registry));
        assert!(!set(&[("mode", "creative")]).is_matched_by(&current, &registry));
    }

    proptest! {
        #[test]
        fn equality_is_order_independent(
            mut pairs in proptest::collection::vec(("[a-c]{1,2}", "[x-z]{1,2}"), 0..6)
        ) {
            let forward = ContextSet::new(pairs.clone()).unwrap();
            pairs.reverse();
            let backward = ContextSet::new(pairs).unwrap();
            prop_assert_eq!(&forward, &backward);
            let json = serde_json::to_string(&forward).unwrap();
            let parsed: ContextSet = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(parsed, forward);
        }
    }
}
