//! Cache trigger service.
//!
//! Translates content changes into tag invalidations. Nothing in the cache
//! listens for record changes itself; write paths call the trigger after a
//! successful save.
//!
//! Invalidation runs even while caching is disabled: entries persist across
//! restarts, so a change made with the cache switched off must still evict
//! what was stored before.

use std::sync::Arc;

use tracing::{debug, info};

use super::error::CacheError;
use super::store::EntryLimitedStore;
use super::tags::TagSource;

/// Cache trigger for invalidating entries after writes.
///
/// # Usage
///
/// ```ignore
/// // After a successful content element update:
/// trigger.record_changed("tt_content", uid).await?;
/// ```
pub struct CacheTrigger {
    store: Arc<EntryLimitedStore>,
}

impl CacheTrigger {
    pub fn new(store: Arc<EntryLimitedStore>) -> Self {
        Self { store }
    }

    /// Flush every entry tagged with the record `{table}_{uid}`.
    pub async fn record_changed(&self, table: &str, uid: u64) -> Result<u64, CacheError> {
        self.tags_changed([TagSource::record(table, uid)]).await
    }

    /// Flush every entry carrying any of `tags`.
    pub async fn tags_changed<I, T>(&self, tags: I) -> Result<u64, CacheError>
    where
        I: IntoIterator<Item = T>,
        T: Into<TagSource>,
    {
        let tags: Vec<String> = tags.into_iter().map(|tag| tag.into().into_tag()).collect();
        debug!(tags = ?tags, "Cache trigger invalidating tags");
        self.store.flush_by_tags(&tags).await
    }

    pub async fn flush_all(&self) -> Result<(), CacheError> {
        info!("Flushing all cache entries");
        self.store.flush().await
    }
}
