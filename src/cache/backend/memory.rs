use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use time::OffsetDateTime;

use super::{CacheBackend, StoredRow};
use crate::cache::error::CacheError;
use crate::cache::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::backend::memory";

#[derive(Default)]
struct Tables {
    entries: HashMap<String, (StoredRow, BTreeSet<String>)>,
    tag_index: HashMap<String, HashSet<String>>,
}

impl Tables {
    fn remove(&mut self, identifier: &str) -> bool {
        let Some((_, tags)) = self.entries.remove(identifier) else {
            return false;
        };
        for tag in tags {
            if let Some(identifiers) = self.tag_index.get_mut(&tag) {
                identifiers.remove(identifier);
                if identifiers.is_empty() {
                    self.tag_index.remove(&tag);
                }
            }
        }
        true
    }
}

/// In-process backend for tests and single-node development setups.
#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<Tables>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags associated with a stored row, expired or not.
    pub fn tags_of(&self, identifier: &str) -> Option<BTreeSet<String>> {
        rw_read(&self.tables, SOURCE, "tags_of")
            .entries
            .get(identifier)
            .map(|(_, tags)| tags.clone())
    }

    /// Whether a row exists, expired or not.
    pub fn contains(&self, identifier: &str) -> bool {
        rw_read(&self.tables, SOURCE, "contains")
            .entries
            .contains_key(identifier)
    }

    /// Identifiers of all stored rows, sorted.
    pub fn identifiers(&self) -> Vec<String> {
        let mut identifiers: Vec<String> = rw_read(&self.tables, SOURCE, "identifiers")
            .entries
            .keys()
            .cloned()
            .collect();
        identifiers.sort();
        identifiers
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(
        &self,
        identifier: &str,
        now: OffsetDateTime,
    ) -> Result<Option<StoredRow>, CacheError> {
        Ok(rw_read(&self.tables, SOURCE, "get")
            .entries
            .get(identifier)
            .filter(|(row, _)| row.expires > now)
            .map(|(row, _)| row.clone()))
    }

    async fn set(
        &self,
        identifier: &str,
        row: StoredRow,
        tags: &BTreeSet<String>,
    ) -> Result<(), CacheError> {
        let mut tables = rw_write(&self.tables, SOURCE, "set");
        tables.remove(identifier);
        for tag in tags {
            tables
                .tag_index
                .entry(tag.clone())
                .or_default()
                .insert(identifier.to_string());
        }
        tables
            .entries
            .insert(identifier.to_string(), (row, tags.clone()));
        Ok(())
    }

    async fn remove(&self, identifier: &str) -> Result<bool, CacheError> {
        Ok(rw_write(&self.tables, SOURCE, "remove").remove(identifier))
    }

    async fn flush(&self) -> Result<(), CacheError> {
        *rw_write(&self.tables, SOURCE, "flush") = Tables::default();
        Ok(())
    }

    async fn flush_by_tags(&self, tags: &[String]) -> Result<u64, CacheError> {
        let mut tables = rw_write(&self.tables, SOURCE, "flush_by_tags");
        let affected: HashSet<String> = tags
            .iter()
            .filter_map(|tag| tables.tag_index.get(tag))
            .flat_map(|identifiers| identifiers.iter().cloned())
            .collect();
        let mut removed = 0;
        for identifier in affected {
            if tables.remove(&identifier) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn collect_garbage(&self, now: OffsetDateTime) -> Result<u64, CacheError> {
        let mut tables = rw_write(&self.tables, SOURCE, "collect_garbage");
        let expired: Vec<String> = tables
            .entries
            .iter()
            .filter(|(_, (row, _))| row.expires <= now)
            .map(|(identifier, _)| identifier.clone())
            .collect();
        for identifier in &expired {
            tables.remove(identifier);
        }
        Ok(expired.len() as u64)
    }

    async fn count(&self) -> Result<u64, CacheError> {
        Ok(rw_read(&self.tables, SOURCE, "count").entries.len() as u64)
    }

    async fn delete_oldest(&self, limit: u64) -> Result<u64, CacheError> {
        let mut tables = rw_write(&self.tables, SOURCE, "delete_oldest");
        let mut candidates: Vec<(OffsetDateTime, String)> = tables
            .entries
            .iter()
            .map(|(identifier, (row, _))| (row.expires, identifier.clone()))
            .collect();
        candidates.sort();

        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let mut removed = 0;
        for (_, identifier) in candidates.into_iter().take(limit) {
            if tables.remove(&identifier) {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
