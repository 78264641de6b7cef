//! Cache tag sources.
//!
//! Everything that can invalidate a cache entry is expressed as a string tag.
//! Callers hand in a [`TagSource`] and [`TagSource::into_tag`] is the single
//! place where it becomes that string.

use std::fmt;

/// Implemented by domain objects that know their own invalidation tag.
pub trait CacheTagged {
    fn cache_tag(&self) -> String;
}

/// The closed set of things that can be turned into a cache tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TagSource {
    /// A database record, tagged as `{table}_{uid}`.
    Record { table: String, uid: u64 },
    /// A literal tag.
    Text(String),
    /// A tag obtained from a [`CacheTagged`] object.
    Keyed(String),
}

impl TagSource {
    pub fn record(table: impl Into<String>, uid: u64) -> Self {
        Self::Record {
            table: table.into(),
            uid,
        }
    }

    pub fn object<T: CacheTagged + ?Sized>(object: &T) -> Self {
        Self::Keyed(object.cache_tag())
    }

    /// Resolve into the tag string stored alongside cache entries.
    pub fn into_tag(self) -> String {
        let raw = match self {
            Self::Record { table, uid } => format!("{table}_{uid}"),
            Self::Text(text) | Self::Keyed(text) => text,
        };
        sanitize(&raw)
    }
}

impl From<&str> for TagSource {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for TagSource {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<(&str, u64)> for TagSource {
    fn from((table, uid): (&str, u64)) -> Self {
        Self::record(table, uid)
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '%' | '&' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// A tag that names a single database record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordTag<'a> {
    pub table: &'a str,
    pub uid: u64,
}

impl<'a> RecordTag<'a> {
    /// Split `{table}_{uid}` on the last underscore.
    pub fn parse(tag: &'a str) -> Option<Self> {
        let (table, uid) = tag.rsplit_once('_')?;
        if table.is_empty() || uid.is_empty() || !uid.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let uid = uid.parse().ok()?;
        Some(Self { table, uid })
    }
}

impl fmt::Display for RecordTag<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.table, self.uid)
    }
}
