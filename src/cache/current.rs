//! Ambient access to the innermost open cache scope.
//!
//! Generators call these instead of touching the cache directly, so whatever
//! they declare reaches every enclosing `remember()` call. Outside a request
//! every function is a no-op.

use std::collections::BTreeSet;

use super::context::with_state;
use super::tags::TagSource;

pub fn add_tags<I, T>(tags: I)
where
    I: IntoIterator<Item = T>,
    T: Into<TagSource>,
{
    let tags: Vec<String> = tags.into_iter().map(|tag| tag.into().into_tag()).collect();
    with_state("add_tags", |state| {
        if let Some(current) = state.scopes.current() {
            state.scopes.add_tags(current, tags);
        }
    });
}

pub fn add_tag(tag: impl Into<TagSource>) {
    add_tags([tag.into()]);
}

/// Declare how long the value being generated stays fresh. Enclosing scopes
/// are shortened to match; `None` clears only the innermost scope's value.
pub fn set_lifetime(seconds: Option<u64>) {
    with_state("set_lifetime", |state| {
        if let Some(current) = state.scopes.current() {
            state.scopes.set_lifetime(current, seconds);
        }
    });
}

/// Disabling also disables every enclosing scope.
pub fn set_enabled(enabled: bool) {
    with_state("set_enabled", |state| {
        if let Some(current) = state.scopes.current() {
            state.scopes.set_enabled(current, enabled);
        }
    });
}

pub fn tags() -> BTreeSet<String> {
    with_state("tags", |state| {
        state
            .scopes
            .current()
            .map(|current| state.scopes.tags(current))
    })
    .flatten()
    .unwrap_or_default()
}

pub fn lifetime() -> Option<u64> {
    with_state("lifetime", |state| {
        state
            .scopes
            .current()
            .and_then(|current| state.scopes.lifetime(current))
    })
    .flatten()
}

pub fn is_enabled() -> bool {
    with_state("is_enabled", |state| {
        state
            .scopes
            .current()
            .map(|current| state.scopes.is_enabled(current))
    })
    .flatten()
    .unwrap_or(true)
}
