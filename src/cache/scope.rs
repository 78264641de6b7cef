//! Nested cache scopes.
//!
//! Every `remember()` miss opens a scope that collects the tags, lifetime and
//! enabled flag of the value being generated. Open scopes form a strict stack:
//! a scope's parent is the frame below it, its open child the frame above it.
//! Lifetime and enabled changes are pushed to every ancestor the moment they
//! happen; tags travel to the parent when a scope closes.

use std::collections::BTreeSet;

use time::OffsetDateTime;
use tracing::warn;

use super::entry::expiry;

/// The final options of a closed scope, ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    pub tags: BTreeSet<String>,
    /// Seconds the generated value stays fresh.
    pub lifetime: u64,
    pub enabled: bool,
}

impl CacheOptions {
    pub fn expires_at(&self, now: OffsetDateTime) -> OffsetDateTime {
        expiry(now, self.lifetime)
    }

    /// `Cache-Control` value for a response built from these options.
    pub fn cache_control(&self) -> String {
        if self.enabled && self.lifetime > 0 {
            format!("max-age={}, public", self.lifetime)
        } else {
            "no-store".to_string()
        }
    }
}

/// Addresses one open frame of a [`ScopeStack`].
///
/// Handles carry the frame id so that a handle outliving its frame is
/// recognised instead of silently addressing a newer frame at the same depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeHandle {
    depth: usize,
    id: u64,
}

impl ScopeHandle {
    pub fn depth(&self) -> usize {
        self.depth
    }
}

#[derive(Debug)]
struct Frame {
    id: u64,
    tags: BTreeSet<String>,
    lifetime: Option<u64>,
    enabled: bool,
    /// `(lifetime, enabled)` of every ancestor when this frame was opened.
    ancestors_at_open: Vec<(Option<u64>, bool)>,
}

#[derive(Debug, Default)]
pub struct ScopeStack {
    frames: Vec<Frame>,
    next_id: u64,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new scope as the child of the innermost open one.
    pub fn open(&mut self) -> ScopeHandle {
        let id = self.next_id;
        self.next_id += 1;
        let ancestors_at_open = self
            .frames
            .iter()
            .map(|frame| (frame.lifetime, frame.enabled))
            .collect();
        self.frames.push(Frame {
            id,
            tags: BTreeSet::new(),
            lifetime: None,
            enabled: true,
            ancestors_at_open,
        });
        ScopeHandle {
            depth: self.frames.len() - 1,
            id,
        }
    }

    /// The innermost open scope.
    pub fn current(&self) -> Option<ScopeHandle> {
        self.frames.last().map(|frame| ScopeHandle {
            depth: self.frames.len() - 1,
            id: frame.id,
        })
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn index(&self, handle: ScopeHandle, op: &'static str) -> Option<usize> {
        match self.frames.get(handle.depth) {
            Some(frame) if frame.id == handle.id => Some(handle.depth),
            _ => {
                warn!(
                    op,
                    depth = handle.depth,
                    scope_id = handle.id,
                    open_scopes = self.frames.len(),
                    "Ignoring operation on a scope that is no longer open"
                );
                None
            }
        }
    }

    pub fn add_tags<I>(&mut self, handle: ScopeHandle, tags: I)
    where
        I: IntoIterator<Item = String>,
    {
        if let Some(index) = self.index(handle, "add_tags") {
            self.frames[index].tags.extend(tags);
        }
    }

    /// Tags of the scope including those of its still-open descendants.
    pub fn tags(&self, handle: ScopeHandle) -> BTreeSet<String> {
        let Some(index) = self.index(handle, "tags") else {
            return BTreeSet::new();
        };
        self.frames[index..]
            .iter()
            .flat_map(|frame| frame.tags.iter().cloned())
            .collect()
    }

    pub fn lifetime(&self, handle: ScopeHandle) -> Option<u64> {
        self.index(handle, "lifetime")
            .and_then(|index| self.frames[index].lifetime)
    }

    pub fn is_enabled(&self, handle: ScopeHandle) -> bool {
        self.index(handle, "is_enabled")
            .is_some_and(|index| self.frames[index].enabled)
    }

    /// Set the scope's own lifetime and shorten every ancestor to at most the
    /// same value. `None` clears the scope's own value and leaves ancestors.
    pub fn set_lifetime(&mut self, handle: ScopeHandle, seconds: Option<u64>) {
        let Some(index) = self.index(handle, "set_lifetime") else {
            return;
        };
        self.frames[index].lifetime = seconds;
        if let Some(seconds) = seconds {
            for frame in &mut self.frames[..index] {
                frame.lifetime = Some(tighter(frame.lifetime, seconds));
            }
        }
    }

    /// Shorten the scope and all its ancestors to at most `seconds`.
    pub fn tighten_lifetime(&mut self, handle: ScopeHandle, seconds: u64) {
        let Some(index) = self.index(handle, "tighten_lifetime") else {
            return;
        };
        for frame in &mut self.frames[..=index] {
            frame.lifetime = Some(tighter(frame.lifetime, seconds));
        }
    }

    /// Disabling a scope disables every ancestor; enabling only touches the scope.
    pub fn set_enabled(&mut self, handle: ScopeHandle, enabled: bool) {
        let Some(index) = self.index(handle, "set_enabled") else {
            return;
        };
        if enabled {
            self.frames[index].enabled = true;
        } else {
            for frame in &mut self.frames[..=index] {
                frame.enabled = false;
            }
        }
    }

    /// Close the scope, closing any still-open children first.
    ///
    /// Tags are merged into the parent; an unset lifetime becomes
    /// `default_lifetime`.
    pub fn close(&mut self, handle: ScopeHandle, default_lifetime: u64) -> Option<CacheOptions> {
        let index = self.index(handle, "close")?;
        let mut closed = None;
        while self.frames.len() > index {
            closed = self.close_top(default_lifetime);
        }
        closed
    }

    fn close_top(&mut self, default_lifetime: u64) -> Option<CacheOptions> {
        let frame = self.frames.pop()?;
        if let Some(parent) = self.frames.last_mut() {
            parent.tags.extend(frame.tags.iter().cloned());
        }
        Some(CacheOptions {
            tags: frame.tags,
            lifetime: frame.lifetime.unwrap_or(default_lifetime),
            enabled: frame.enabled,
        })
    }

    /// Drop the scope and its descendants without merging anything, putting
    /// every ancestor back into the state it had when the scope was opened.
    pub fn abandon(&mut self, handle: ScopeHandle) {
        let Some(index) = self.index(handle, "abandon") else {
            return;
        };
        let snapshot = std::mem::take(&mut self.frames[index].ancestors_at_open);
        for (frame, (lifetime, enabled)) in self.frames[..index].iter_mut().zip(snapshot) {
            frame.lifetime = lifetime;
            frame.enabled = enabled;
        }
        self.frames.truncate(index);
    }
}

fn tighter(current: Option<u64>, candidate: u64) -> u64 {
    current.map_or(candidate, |current| current.min(candidate))
}
