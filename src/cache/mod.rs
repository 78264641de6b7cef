//! Nested cache scopes.
//!
//! `remember()` calls can nest to any depth. Each miss opens a scope; the
//! tags, lifetime and enabled flag declared inside it travel to every
//! enclosing scope, and a cache hit replays the stored metadata so an outer
//! entry is invalidated and expires exactly as if the inner value had been
//! generated fresh.
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `cachescope.toml`:
//!
//! ```toml
//! [cache]
//! enabled = true
//! default_lifetime_seconds = 86400
//! max_entries = 25000
//! # ... see config.rs for all options
//! ```

pub mod backend;
mod config;
mod constraints;
pub mod context;
pub mod current;
mod entry;
mod error;
mod facade;
mod keys;
mod lock;
mod scope;
mod store;
mod tags;
mod tracker;
mod trigger;

pub use backend::{CacheBackend, MemoryBackend, StoredRow};
pub use config::{CacheConfig, ExpiryColumns};
pub use constraints::{
    ConstraintBuilder, PageCacheResolver, PageConstraint, RecordSource, RecordTimes,
    StaticRecordSource, StoredPageResolver,
};
pub use context::{RequestContext, RequestOutcome, with_request};
pub use entry::CacheEntry;
pub use error::CacheError;
pub use facade::{CacheFacade, CacheSwitch, RememberOptions};
pub use keys::{CacheEnvironment, KeyPart, cache_key};
pub use scope::{CacheOptions, ScopeHandle, ScopeStack};
pub use store::EntryLimitedStore;
pub use tags::{CacheTagged, RecordTag, TagSource};
pub use tracker::{CacheOutcome, MetricsReport, MetricsTracker, TraceNode};
pub use trigger::CacheTrigger;

pub(crate) use facade::{
    METRIC_GENERATE_MS, METRIC_REMEMBER_BYPASS, METRIC_REMEMBER_HIT, METRIC_REMEMBER_MISS,
};
pub(crate) use store::{METRIC_STORE_EVICT, METRIC_STORE_WRITE};
