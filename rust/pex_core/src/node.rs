//! Permission nodes.
//!
//! Nodes are dot-separated and case-insensitive. A trailing `.*` is the same
//! grant as the node without it (`cmd.*` ≡ `cmd`), and `*` alone is the root
//! wildcard. Looking up `a.b.c` inside one segment tries `a.b.c`, `a.b`, `a`
//! and finally `*`, so a grant on a prefix covers every node below it.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PexError, Result};

/// Root wildcard node.
pub const WILDCARD: &str = "*";

/// A validated, normalized permission node as stored in segments.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PermissionNode(String);

impl PermissionNode {
    pub fn new(raw: &str) -> Result<Self> {
        let lowered = raw.to_lowercase();
        validate(&lowered)?;
        Ok(Self(strip_wildcard_suffix(&lowered).to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl TryFrom<String> for PermissionNode {
    type Error = PexError;

    fn try_from(raw: String) -> Result<Self> {
        Self::new(&raw)
    }
}

impl From<PermissionNode> for String {
    fn from(node: PermissionNode) -> Self {
        node.0
    }
}

impl AsRef<str> for PermissionNode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for PermissionNode {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PermissionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate(node: &str) -> Result<()> {
    let malformed = |reason: &str| PexError::MalformedPermissionNode(format!("'{node}': {reason}"));

    if node.is_empty() {
        return Err(malformed("empty node"));
    }
    if node.chars().any(char::is_whitespace) {
        return Err(malformed("contains whitespace"));
    }
    let components: Vec<&str> = node.split('.').collect();
    let last = components.len() - 1;
    for (i, component) in components.iter().enumerate() {
        if component.is_empty() {
            return Err(malformed("empty component"));
        }
        if component.contains('*') && (*component != WILDCARD || i != last) {
            return Err(malformed("'*' is only allowed as the final component"));
        }
    }
    Ok(())
}

fn strip_wildcard_suffix(node: &str) -> &str {
    node.strip_suffix(".*").unwrap_or(node)
}

/// Normalize a node used in a query. Never fails: anything a caller asks for
/// is looked up as-is after lowercasing and wildcard-suffix stripping.
pub fn normalize_query(raw: &str) -> String {
    strip_wildcard_suffix(&raw.to_lowercase()).to_string()
}

/// Nodes consulted, most specific first, when looking up `node` in a segment.
pub fn lookup_chain(node: &str) -> LookupChain<'_> {
    LookupChain {
        remaining: Some(node),
        wildcard_done: node == WILDCARD,
    }
}

/// Iterator returned by [`lookup_chain`].
pub struct LookupChain<'a> {
    remaining: Option<&'a str>,
    wildcard_done: bool,
}

impl<'a> Iterator for LookupChain<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if let Some(current) = self.remaining {
            self.remaining = current.rfind('.').map(|pos| &current[..pos]);
            if current.is_empty() {
                return self.next();
            }
            return Some(current);
        }
        if !self.wildcard_done {
            self.wildcard_done = true;
            return Some(WILDCARD);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_wildcard_suffix() {
        assert_eq!(PermissionNode::new("Cmd.Kick").unwrap().as_str(), "cmd.kick");
        assert_eq!(PermissionNode::new("cmd.*").unwrap().as_str(), "cmd");
        assert_eq!(PermissionNode::new("*").unwrap().as_str(), "*");
    }

    #[test]
    fn rejects_malformed_nodes() {
        for bad in ["", "a..b", ".a", "a.", "a b", "a.*.b", "cmd*", "a.b*"] {
            assert!(
                matches!(
                    PermissionNode::new(bad),
                    Err(PexError::MalformedPermissionNode(_))
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn chain_walks_prefixes_then_root() {
        let chain: Vec<&str> = lookup_chain("a.b.c").collect();
        assert_eq!(chain, vec!["a.b.c", "a.b", "a", "*"]);
        let root: Vec<&str> = lookup_chain("*").collect();
        assert_eq!(root, vec!["*"]);
    }

    #[test]
    fn query_normalization_is_lenient() {
        assert_eq!(normalize_query("CMD.Kick.*"), "cmd.kick");
        assert_eq!(normalize_query("weird node"), "weird node");
    }
}
