//! Persistence backends for cache entries.
//!
//! A backend stores opaque blobs keyed by identifier, keeps a tag index for
//! bulk invalidation, and exposes the row count plus expiry-ordered deletion
//! needed by [`EntryLimitedStore`](super::EntryLimitedStore).

mod memory;

use std::collections::BTreeSet;

use async_trait::async_trait;
use time::OffsetDateTime;

use super::error::CacheError;

pub use memory::MemoryBackend;

/// One persisted cache row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub content: Vec<u8>,
    pub expires: OffsetDateTime,
    pub lifetime: u64,
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetch a row that has not yet expired at `now`.
    async fn get(&self, identifier: &str, now: OffsetDateTime)
    -> Result<Option<StoredRow>, CacheError>;

    /// Insert or replace a row and its tag associations.
    async fn set(
        &self,
        identifier: &str,
        row: StoredRow,
        tags: &BTreeSet<String>,
    ) -> Result<(), CacheError>;

    /// Remove a row; returns whether it existed.
    async fn remove(&self, identifier: &str) -> Result<bool, CacheError>;

    async fn flush(&self) -> Result<(), CacheError>;

    /// Remove every row carrying any of `tags`; returns the number removed.
    async fn flush_by_tags(&self, tags: &[String]) -> Result<u64, CacheError>;

    /// Remove rows that expired before `now`.
    async fn collect_garbage(&self, now: OffsetDateTime) -> Result<u64, CacheError>;

    async fn count(&self) -> Result<u64, CacheError>;

    /// Remove up to `limit` rows with the earliest expiry, ties ordered by
    /// identifier. Returns the number removed.
    async fn delete_oldest(&self, limit: u64) -> Result<u64, CacheError>;
}
