//! Cache key derivation.
//!
//! A store key combines the caller's key parts with a base key derived from
//! the request environment, so two requests that differ in language, site,
//! login state, user groups or request type never share an entry.

use std::fmt;

use sha2::{Digest, Sha256};
use url::form_urlencoded;

/// Request properties that change what a generator produces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CacheEnvironment {
    pub language: String,
    pub site: String,
    pub backend_user: bool,
    pub frontend_groups: Vec<u64>,
    pub request_type: String,
}

impl CacheEnvironment {
    pub fn new(language: impl Into<String>, site: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            site: site.into(),
            ..Default::default()
        }
    }

    pub fn with_backend_user(mut self, logged_in: bool) -> Self {
        self.backend_user = logged_in;
        self
    }

    pub fn with_frontend_groups(mut self, groups: impl IntoIterator<Item = u64>) -> Self {
        self.frontend_groups = groups.into_iter().collect();
        self
    }

    pub fn with_request_type(mut self, request_type: impl Into<String>) -> Self {
        self.request_type = request_type.into();
        self
    }

    /// Hex digest identifying this environment.
    pub fn base_key(&self) -> String {
        let mut groups = self.frontend_groups.clone();
        groups.sort_unstable();
        groups.dedup();
        let groups: Vec<String> = groups.iter().map(u64::to_string).collect();
        let groups = groups.join(",");

        let mut hasher = Sha256::new();
        for field in [
            self.language.as_str(),
            self.site.as_str(),
            if self.backend_user { "be:1" } else { "be:0" },
            groups.as_str(),
            self.request_type.as_str(),
        ] {
            push_field(&mut hasher, field);
        }
        hex::encode(hasher.finalize())
    }
}

/// One component of a `remember()` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    Text(String),
    /// Varies the key by the whole current query string.
    Query,
    /// Varies the key by a single query parameter.
    QueryParam(String),
}

const QUERY_MARKER: &str = "@query";

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        if value == QUERY_MARKER {
            return Self::Query;
        }
        match value.strip_prefix("@query:") {
            Some(name) if !name.is_empty() => Self::QueryParam(name.to_string()),
            _ => Self::Text(value.to_string()),
        }
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<u64> for KeyPart {
    fn from(value: u64) -> Self {
        Self::Text(value.to_string())
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Query => f.write_str(QUERY_MARKER),
            Self::QueryParam(name) => write!(f, "{QUERY_MARKER}:{name}"),
        }
    }
}

/// Replace query markers by a digest of the matching query data.
pub fn resolve_parts(parts: &[KeyPart], query: Option<&str>) -> Vec<String> {
    let query = query.unwrap_or("");
    parts
        .iter()
        .map(|part| match part {
            KeyPart::Text(text) => text.clone(),
            KeyPart::Query => format!("{QUERY_MARKER}={}", digest(query)),
            KeyPart::QueryParam(name) => {
                let value = form_urlencoded::parse(query.as_bytes())
                    .find(|(key, _)| key == name)
                    .map(|(_, value)| value.into_owned())
                    .unwrap_or_default();
                format!("{QUERY_MARKER}:{name}={}", digest(&value))
            }
        })
        .collect()
}

/// Store identifier for the given parts under `environment`.
pub fn cache_key(
    prefix: &str,
    environment: &CacheEnvironment,
    parts: &[KeyPart],
    query: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    push_field(&mut hasher, &environment.base_key());
    for part in resolve_parts(parts, query) {
        push_field(&mut hasher, &part);
    }
    format!("{prefix}_{}", hex::encode(hasher.finalize()))
}

/// Human readable label used in traces and logs.
pub fn label(parts: &[KeyPart]) -> String {
    let rendered: Vec<String> = parts.iter().map(KeyPart::to_string).collect();
    rendered.join("/")
}

fn push_field(hasher: &mut Sha256, field: &str) {
    hasher.update((field.len() as u64).to_le_bytes());
    hasher.update(field.as_bytes());
}

fn digest(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}
