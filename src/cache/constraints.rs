//! Record-derived lifetime and tag constraints.
//!
//! After a generator has run, each `{table}_{uid}` tag of its scope is checked
//! against the record it names: a visibility boundary in the future caps the
//! scope's lifetime, and tags naming a page additionally pull in that page's
//! own cached tags and remaining lifetime. The pass only ever adds tags and
//! shortens lifetimes.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::config::{CacheConfig, ExpiryColumns};
use super::context;
use super::error::CacheError;
use super::keys::{self, CacheEnvironment, KeyPart};
use super::lock::{rw_read, rw_write};
use super::scope::ScopeHandle;
use super::store::EntryLimitedStore;
use super::tags::RecordTag;

/// Visibility window of a record. `None` means the column is unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordTimes {
    pub starttime: Option<OffsetDateTime>,
    pub endtime: Option<OffsetDateTime>,
}

impl RecordTimes {
    /// Seconds until the record's visibility next changes, if it still will.
    pub fn lifetime_ceiling(&self, now: OffsetDateTime) -> Option<u64> {
        [self.starttime, self.endtime]
            .into_iter()
            .flatten()
            .filter(|boundary| *boundary > now)
            .map(|boundary| u64::try_from((boundary - now).whole_seconds()).unwrap_or(0))
            .min()
    }
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Load the visibility window of one record, `None` if it does not exist.
    async fn record_times(
        &self,
        table: &str,
        uid: u64,
        columns: &ExpiryColumns,
    ) -> Result<Option<RecordTimes>, CacheError>;
}

/// Cache metadata a page was last stored with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageConstraint {
    pub tags: BTreeSet<String>,
    pub lifetime: u64,
}

#[async_trait]
pub trait PageCacheResolver: Send + Sync {
    async fn resolve_page(
        &self,
        uid: u64,
        environment: &CacheEnvironment,
    ) -> Result<Option<PageConstraint>, CacheError>;
}

/// Reads the entry a page was stored under (key parts `["page", uid]`)
/// without replaying it into any scope.
pub struct StoredPageResolver {
    store: Arc<EntryLimitedStore>,
    key_prefix: String,
}

impl StoredPageResolver {
    pub fn new(store: Arc<EntryLimitedStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn key_parts(uid: u64) -> Vec<KeyPart> {
        vec![KeyPart::from("page"), KeyPart::from(uid)]
    }
}

#[async_trait]
impl PageCacheResolver for StoredPageResolver {
    async fn resolve_page(
        &self,
        uid: u64,
        environment: &CacheEnvironment,
    ) -> Result<Option<PageConstraint>, CacheError> {
        let key = keys::cache_key(&self.key_prefix, environment, &Self::key_parts(uid), None);
        let Some(entry) = self.store.get(&key).await? else {
            return Ok(None);
        };
        Ok(Some(PageConstraint {
            lifetime: entry.remaining_lifetime(OffsetDateTime::now_utc()),
            tags: entry.tags,
        }))
    }
}

/// In-memory [`RecordSource`] for tests and fixtures.
#[derive(Default)]
pub struct StaticRecordSource {
    records: RwLock<HashMap<(String, u64), RecordTimes>>,
}

impl StaticRecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, table: impl Into<String>, uid: u64, times: RecordTimes) {
        rw_write(&self.records, "cache::constraints", "insert").insert((table.into(), uid), times);
    }
}

#[async_trait]
impl RecordSource for StaticRecordSource {
    async fn record_times(
        &self,
        table: &str,
        uid: u64,
        _columns: &ExpiryColumns,
    ) -> Result<Option<RecordTimes>, CacheError> {
        Ok(rw_read(&self.records, "cache::constraints", "record_times")
            .get(&(table.to_string(), uid))
            .copied())
    }
}

/// Per-request memo of constraint lookups.
#[derive(Debug, Default)]
pub(crate) struct ConstraintMemo {
    ignored: HashSet<String>,
    records: HashMap<String, RecordTimes>,
    pages: HashMap<u64, Option<PageConstraint>>,
    resolving: HashSet<u64>,
}

pub struct ConstraintBuilder {
    config: CacheConfig,
    records: Arc<dyn RecordSource>,
    pages: Option<Arc<dyn PageCacheResolver>>,
}

impl ConstraintBuilder {
    pub fn new(config: CacheConfig, records: Arc<dyn RecordSource>) -> Self {
        Self {
            config,
            records,
            pages: None,
        }
    }

    pub fn with_page_resolver(mut self, pages: Arc<dyn PageCacheResolver>) -> Self {
        self.pages = Some(pages);
        self
    }

    /// Tighten the scope behind `handle` using the records its tags name.
    ///
    /// Lookup failures are logged and skipped; they can only leave the
    /// scope less constrained.
    pub async fn apply(&self, handle: ScopeHandle) {
        let Some(tags) = context::with_state("constraints", |state| state.scopes.tags(handle))
        else {
            return;
        };

        for tag in &tags {
            let ignored = context::with_state("constraints", |state| {
                state.memo.ignored.contains(tag)
            });
            if ignored != Some(false) {
                continue;
            }

            let Some(record) = RecordTag::parse(tag) else {
                self.ignore(tag);
                continue;
            };
            let is_page = self.config.is_page_table(record.table);
            let columns = self.config.expiry_columns(record.table);
            if columns.is_none() && !is_page {
                self.ignore(tag);
                continue;
            }

            if let Some(columns) = columns {
                self.apply_record_times(handle, tag, &record, columns).await;
            }
            if is_page {
                self.apply_page(handle, record.uid).await;
            }
        }
    }

    fn ignore(&self, tag: &str) {
        context::with_state("constraints", |state| {
            state.memo.ignored.insert(tag.to_string());
        });
    }

    async fn apply_record_times(
        &self,
        handle: ScopeHandle,
        tag: &str,
        record: &RecordTag<'_>,
        columns: &ExpiryColumns,
    ) {
        let memoized = context::with_state("constraints", |state| {
            state.memo.records.get(tag).copied()
        })
        .flatten();

        let times = match memoized {
            Some(times) => times,
            None => match self
                .records
                .record_times(record.table, record.uid, columns)
                .await
            {
                Ok(Some(times)) => {
                    context::with_state("constraints", |state| {
                        state.memo.records.insert(tag.to_string(), times);
                    });
                    times
                }
                Ok(None) if self.config.is_page_table(record.table) => {
                    // Page tags still need the page pass; remember the miss only.
                    context::with_state("constraints", |state| {
                        state.memo.records.insert(tag.to_string(), RecordTimes::default());
                    });
                    return;
                }
                Ok(None) => {
                    self.ignore(tag);
                    return;
                }
                Err(error) => {
                    warn!(
                        tag,
                        error = %error,
                        "Record constraint lookup failed; lifetime left unconstrained"
                    );
                    return;
                }
            },
        };

        if let Some(ceiling) = times.lifetime_ceiling(OffsetDateTime::now_utc()) {
            debug!(tag, ceiling, "Record visibility caps cache lifetime");
            context::with_state("constraints", |state| {
                state.scopes.tighten_lifetime(handle, ceiling);
            });
        }
    }

    async fn apply_page(&self, handle: ScopeHandle, uid: u64) {
        let Some(pages) = &self.pages else {
            return;
        };

        // (memoized result, already being resolved, environment)
        let Some((memoized, busy, environment)) = context::with_state("constraints", |state| {
            (
                state.memo.pages.get(&uid).cloned(),
                state.memo.resolving.contains(&uid),
                state.context.environment.clone(),
            )
        }) else {
            return;
        };
        if busy {
            debug!(page = uid, "Skipping page constraint already being resolved");
            return;
        }

        let constraint = match memoized {
            Some(constraint) => constraint,
            None => {
                context::with_state("constraints", |state| {
                    state.memo.resolving.insert(uid);
                });
                let resolved = pages.resolve_page(uid, &environment).await;
                context::with_state("constraints", |state| {
                    state.memo.resolving.remove(&uid);
                });
                match resolved {
                    Ok(constraint) => {
                        context::with_state("constraints", |state| {
                            state.memo.pages.insert(uid, constraint.clone());
                        });
                        constraint
                    }
                    Err(error) => {
                        warn!(
                            page = uid,
                            error = %error,
                            "Page constraint lookup failed; lifetime left unconstrained"
                        );
                        return;
                    }
                }
            }
        };

        if let Some(constraint) = constraint {
            context::with_state("constraints", |state| {
                state.scopes.add_tags(handle, constraint.tags.iter().cloned());
                state.scopes.tighten_lifetime(handle, constraint.lifetime);
            });
        }
    }
}
