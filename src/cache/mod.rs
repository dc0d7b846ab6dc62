//! Tessera fragment cache
//!
//! Caches rendered fragments together with the content they were built from,
//! and discards them when that content changes:
//!
//! - **Scopes**: a render pass opens any number of scopes; every entity or
//!   saved query touched while they are open is recorded on all of them.
//! - **Invalidation**: changes delete fragments by entity id, by entity type,
//!   or by re-running the saved queries they depend on in a deferred job.
//! - **Expiry**: expired rows are swept at most once per throttle window.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! query_caching_enabled = true
//! default_cache_duration_seconds = 0
//! sweep_throttle_seconds = 86400
//! # ... see config.rs for all options
//! ```

mod config;
mod fragments;
mod invalidation;
mod lock;
mod path;
mod requery;
mod scope;
mod store;
mod sweeper;

pub use config::CacheConfig;
pub use fragments::{FragmentCache, RenderPass, ScopeWrite, SkipReason, WriteOutcome, WriteTx};
pub use invalidation::{ClearTarget, InvalidationEngine, InvalidationPass, PassState};
pub use path::RequestPath;
pub use requery::{ConservativeResolver, MemoryRequeryQueue, RequeryCoordinator};
pub use scope::{ScopeDeps, ScopeTracker};
pub use store::{MemoryFragmentStore, MemoryTx};
pub use sweeper::ExpirySweeper;
