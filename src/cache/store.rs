//! Size-capped cache store.
//!
//! Wraps a [`CacheBackend`] with the entry codec and an entry cap. The cap is
//! checked on the first write of the store's lifetime only; when the backend
//! holds `max_entries` rows or more, the earliest-expiring half (bounded per
//! pass) is removed before the write goes through.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::backend::{CacheBackend, StoredRow};
use super::config::CacheConfig;
use super::entry::{self, CacheEntry};
use super::error::CacheError;

pub(crate) const METRIC_STORE_WRITE: &str = "cachescope_store_write_total";
pub(crate) const METRIC_STORE_EVICT: &str = "cachescope_store_evict_total";

pub struct EntryLimitedStore {
    backend: Arc<dyn CacheBackend>,
    max_entries: u64,
    max_deletions_per_pass: u64,
    compress: bool,
    limit_checked: AtomicBool,
}

impl EntryLimitedStore {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self {
            backend,
            max_entries: config.max_entries,
            max_deletions_per_pass: config.max_deletions_per_pass,
            compress: config.compress,
            limit_checked: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Load an unexpired entry. Rows that no longer decode are dropped and
    /// reported as missing.
    pub async fn get(&self, identifier: &str) -> Result<Option<CacheEntry>, CacheError> {
        let Some(row) = self
            .backend
            .get(identifier, OffsetDateTime::now_utc())
            .await?
        else {
            return Ok(None);
        };

        match entry::decode(&row.content) {
            Ok(entry) => Ok(Some(entry)),
            Err(error) => {
                warn!(
                    identifier,
                    error = %error,
                    "Dropping cache row that no longer decodes"
                );
                self.backend.remove(identifier).await?;
                Ok(None)
            }
        }
    }

    pub async fn set(&self, identifier: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        self.enforce_entry_limit().await;

        let row = StoredRow {
            content: entry::encode(entry, self.compress)?,
            expires: entry.expires_at(),
            lifetime: entry.lifetime,
        };
        self.backend.set(identifier, row, &entry.tags).await?;
        counter!(METRIC_STORE_WRITE).increment(1);
        debug!(
            identifier,
            lifetime = entry.lifetime,
            tags = entry.tags.len(),
            "Cache entry written"
        );
        Ok(())
    }

    pub async fn remove(&self, identifier: &str) -> Result<bool, CacheError> {
        self.backend.remove(identifier).await
    }

    pub async fn flush(&self) -> Result<(), CacheError> {
        self.backend.flush().await?;
        info!("Cache flushed");
        Ok(())
    }

    pub async fn flush_by_tag(&self, tag: &str) -> Result<u64, CacheError> {
        self.flush_by_tags(&[tag.to_string()]).await
    }

    pub async fn flush_by_tags(&self, tags: &[String]) -> Result<u64, CacheError> {
        if tags.is_empty() {
            return Ok(0);
        }
        let removed = self.backend.flush_by_tags(tags).await?;
        info!(tags = ?tags, removed, "Cache entries flushed by tag");
        Ok(removed)
    }

    pub async fn collect_garbage(&self) -> Result<u64, CacheError> {
        let removed = self
            .backend
            .collect_garbage(OffsetDateTime::now_utc())
            .await?;
        info!(removed, "Expired cache entries collected");
        Ok(removed)
    }

    pub async fn count(&self) -> Result<u64, CacheError> {
        self.backend.count().await
    }

    async fn enforce_entry_limit(&self) {
        if self.limit_checked.swap(true, Ordering::SeqCst) {
            return;
        }

        let count = match self.backend.count().await {
            Ok(count) => count,
            Err(error) => {
                warn!(error = %error, "Entry limit check skipped: count failed");
                return;
            }
        };
        if count < self.max_entries {
            return;
        }

        let limit = count.div_ceil(2).min(self.max_deletions_per_pass);
        match self.backend.delete_oldest(limit).await {
            Ok(removed) => {
                counter!(METRIC_STORE_EVICT).increment(removed);
                info!(
                    count,
                    max_entries = self.max_entries,
                    removed,
                    "Evicted oldest cache entries"
                );
            }
            Err(error) => {
                warn!(error = %error, count, "Eviction of oldest cache entries failed");
            }
        }
    }
}
