//! `pex_core`: portable permission resolution core.
//!
//! Everything in this crate is synchronous and free of I/O. Subject data is
//! modelled as immutable snapshots so the runtime crate can swap them
//! atomically and readers never need a lock.
//!
//! Modules:
//! - `context`: context pairs, context sets and pluggable context matching
//! - `node`: permission node validation and wildcard lookup
//! - `identity`: subject identities (`type:identifier`)
//! - `segment`: context-scoped bags of permissions, options and parents
//! - `data`: per-subject snapshot mapping context sets to segments
//! - `change`: before/after pair produced by every update
//! - `resolve`: inheritance graph walk computing effective values
//! - `error`: error type shared by the whole workspace

pub mod change;
pub mod context;
pub mod data;
pub mod error;
pub mod identity;
pub mod node;
pub mod resolve;
pub mod segment;

pub use change::Change;
pub use context::{Context, ContextMatcher, ContextSet, ExactMatcher};
pub use data::{DataLayer, ImmutableSubjectData};
pub use error::{PexError, Result};
pub use identity::SubjectIdentity;
pub use node::PermissionNode;
pub use resolve::{
    PermissionOrigin, Query, Resolution, ResolvedPermission, Resolver, SubjectGraph, SubjectSnapshot,
};
pub use segment::{Segment, Tristate};
