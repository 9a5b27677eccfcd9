//! Subject identities.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{PexError, Result};

/// Stable identity of a subject: a type (`user`, `group`, ...) and an
/// identifier unique within that type. Cheap to clone.
#[derive(Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectIdentity {
    subject_type: Arc<str>,
    identifier: Arc<str>,
}

impl SubjectIdentity {
    pub fn new(subject_type: &str, identifier: &str) -> Result<Self> {
        if subject_type.is_empty() || subject_type.contains(':') {
            return Err(PexError::MalformedSubjectIdentity(format!(
                "invalid subject type '{subject_type}'"
            )));
        }
        if identifier.is_empty() {
            return Err(PexError::MalformedSubjectIdentity(format!(
                "empty identifier for type '{subject_type}'"
            )));
        }
        Ok(Self {
            subject_type: Arc::from(subject_type),
            identifier: Arc::from(identifier),
        })
    }

    pub fn subject_type(&self) -> &str {
        &self.subject_type
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

impl FromStr for SubjectIdentity {
    type Err = PexError;

    /// Parses `type:identifier`; the identifier may itself contain `:`.
    fn from_str(s: &str) -> Result<Self> {
        let (subject_type, identifier) = s
            .split_once(':')
            .ok_or_else(|| PexError::MalformedSubjectIdentity(s.to_string()))?;
        Self::new(subject_type, identifier)
    }
}

impl TryFrom<String> for SubjectIdentity {
    type Error = PexError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<SubjectIdentity> for String {
    fn from(identity: SubjectIdentity) -> Self {
        identity.to_string()
    }
}

impl fmt::Display for SubjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subject_type, self.identifier)
    }
}

impl fmt::Debug for SubjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubjectIdentity({self})")
    }
}
