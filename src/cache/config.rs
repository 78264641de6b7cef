//! Cache configuration.
//!
//! Runtime view of the `[cache]` section of `cachescope.toml`.

use std::collections::BTreeMap;

use serde::Deserialize;

pub(crate) const DEFAULT_LIFETIME_SECS: u64 = 86_400;
pub(crate) const DEFAULT_MAX_ENTRIES: u64 = 25_000;
pub(crate) const DEFAULT_MAX_DELETIONS_PER_PASS: u64 = 1_000;
pub(crate) const DEFAULT_KEY_PREFIX: &str = "cs";
pub(crate) const DEFAULT_PAGE_TABLE: &str = "pages";

/// Visibility window columns of a record table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExpiryColumns {
    /// Column holding the unix time a record becomes visible.
    #[serde(default)]
    pub start: Option<String>,
    /// Column holding the unix time a record stops being visible.
    #[serde(default)]
    pub end: Option<String>,
}

impl ExpiryColumns {
    pub fn new(start: Option<&str>, end: Option<&str>) -> Self {
        Self {
            start: start.map(str::to_string),
            end: end.map(str::to_string),
        }
    }
}

/// Tables whose records carry `starttime`/`endtime` out of the box.
pub(crate) fn default_expiry_tables() -> BTreeMap<String, ExpiryColumns> {
    ["pages", "tt_content"]
        .into_iter()
        .map(|table| {
            (
                table.to_string(),
                ExpiryColumns::new(Some("starttime"), Some("endtime")),
            )
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// When false every `remember()` call runs its generator uncached.
    pub enabled: bool,
    /// Lifetime of scopes that never declared one.
    pub default_lifetime: u64,
    pub max_entries: u64,
    pub max_deletions_per_pass: u64,
    /// lz4-compress stored entries.
    pub compress: bool,
    pub key_prefix: String,
    pub page_table: String,
    pub expiry_tables: BTreeMap<String, ExpiryColumns>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_lifetime: DEFAULT_LIFETIME_SECS,
            max_entries: DEFAULT_MAX_ENTRIES,
            max_deletions_per_pass: DEFAULT_MAX_DELETIONS_PER_PASS,
            compress: true,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            page_table: DEFAULT_PAGE_TABLE.to_string(),
            expiry_tables: default_expiry_tables(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            default_lifetime: settings.default_lifetime.get(),
            max_entries: settings.max_entries.get(),
            max_deletions_per_pass: settings.max_deletions_per_pass.get(),
            compress: settings.compress,
            key_prefix: settings.key_prefix.clone(),
            page_table: settings.page_table.clone(),
            expiry_tables: settings.expiry_tables.clone(),
        }
    }
}

impl CacheConfig {
    pub fn expiry_columns(&self, table: &str) -> Option<&ExpiryColumns> {
        self.expiry_tables
            .get(table)
            .filter(|columns| columns.start.is_some() || columns.end.is_some())
    }

    pub fn is_page_table(&self, table: &str) -> bool {
        self.page_table == table
    }
}
