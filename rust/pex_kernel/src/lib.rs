//! `pex_kernel`: runtime half of the permission engine.
//!
//! Wraps the pure resolution core from `pex_core` with everything that needs
//! shared state or an async runtime:
//!
//! - `config`: engine tunables (JSON + `PEX_*` environment overrides)
//! - `logging`: tracing-subscriber setup for hosts and tests
//! - `store`: async persistence seam and the in-memory reference store
//! - `subject`: CAS data cells, listeners and the update protocol
//! - `registry`: identity interning, loading and eviction
//! - `cache`: resolution memoization with transitive invalidation
//! - `engine`: `PermissionEngine`, the facade hosts talk to
//! - `view`: per-layer data view with cached exact-segment parents
//!
//! Updates spawn onto the ambient tokio runtime, so they must be awaited from
//! inside one. Resolution itself is synchronous and lock-light.

pub mod cache;
pub mod config;
pub mod engine;
pub mod logging;
pub mod registry;
pub mod store;
pub mod subject;
pub mod view;

pub use pex_core::{
    Change, ContextSet, DataLayer, ImmutableSubjectData, PermissionNode, PexError, Query,
    Resolution, ResolvedPermission, Result, Segment, SubjectIdentity, Tristate,
};

pub use cache::{CacheStats, ResolutionCache};
pub use config::{parse_engine_config, EngineConfig};
pub use engine::PermissionEngine;
pub use registry::SubjectRegistry;
pub use store::{MemoryDataStore, SubjectDataStore};
pub use subject::{ListenerId, SubjectChange, SubjectRef};
pub use view::SubjectDataView;
