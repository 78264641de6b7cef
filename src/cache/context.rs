//! Request-scoped cache state.
//!
//! Uses `tokio::task_local!` so the open scope stack, the trace and the
//! constraint memo belong to exactly one request. [`with_request`] installs a
//! fresh state with an always-open root scope; when the request future
//! completes, the root scope's aggregated metadata is handed back so the
//! outer response layer can decide how long the response may be cached.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::future::Future;

use tracing::warn;

use super::constraints::ConstraintMemo;
use super::keys::CacheEnvironment;
use super::scope::{CacheOptions, ScopeHandle, ScopeStack};
use super::tracker::{CacheOutcome, MetricsReport, MetricsTracker};

tokio::task_local! {
    static REQUEST: RefCell<RequestState>;
}

/// Inputs of the current request that influence cache keys.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub environment: CacheEnvironment,
    /// Raw query string, consulted by `@query` key parts.
    pub query: Option<String>,
}

impl RequestContext {
    pub fn new(environment: CacheEnvironment) -> Self {
        Self {
            environment,
            query: None,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }
}

/// Cache metadata aggregated over a whole request.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub tags: BTreeSet<String>,
    pub lifetime: Option<u64>,
    pub enabled: bool,
    pub trace: MetricsReport,
}

impl RequestOutcome {
    pub fn options(&self, default_lifetime: u64) -> CacheOptions {
        CacheOptions {
            tags: self.tags.clone(),
            lifetime: self.lifetime.unwrap_or(default_lifetime),
            enabled: self.enabled,
        }
    }
}

pub(crate) struct RequestState {
    pub(crate) context: RequestContext,
    pub(crate) scopes: ScopeStack,
    pub(crate) tracker: MetricsTracker,
    pub(crate) memo: ConstraintMemo,
    root: ScopeHandle,
}

impl RequestState {
    fn new(context: RequestContext) -> Self {
        let mut scopes = ScopeStack::new();
        let root = scopes.open();
        Self {
            context,
            scopes,
            tracker: MetricsTracker::new(),
            memo: ConstraintMemo::default(),
            root,
        }
    }

    fn finish(&mut self) -> RequestOutcome {
        let outcome = RequestOutcome {
            tags: self.scopes.tags(self.root),
            lifetime: self.scopes.lifetime(self.root),
            enabled: self.scopes.is_enabled(self.root),
            trace: self.tracker.report(),
        };
        self.scopes.close(self.root, 0);
        outcome
    }
}

/// Run `f` as one request with its own, initially empty, scope stack.
///
/// Returns the future's output with the metadata every nested `remember()`
/// call contributed.
pub async fn with_request<F, R>(context: RequestContext, f: F) -> (R, RequestOutcome)
where
    F: Future<Output = R>,
{
    let state = RefCell::new(RequestState::new(context));
    REQUEST
        .scope(state, async move {
            let result = f.await;
            let outcome = REQUEST.with(|state| state.borrow_mut().finish());
            (result, outcome)
        })
        .await
}

pub(crate) fn is_active() -> bool {
    REQUEST.try_with(|_| ()).is_ok()
}

/// Apply `f` to the request state, if one is installed.
pub(crate) fn with_state<R>(op: &'static str, f: impl FnOnce(&mut RequestState) -> R) -> Option<R> {
    REQUEST
        .try_with(|cell| match cell.try_borrow_mut() {
            Ok(mut state) => Some(f(&mut state)),
            Err(_) => {
                warn!(op, "Cache request state is already borrowed");
                None
            }
        })
        .ok()
        .flatten()
}

/// A scope opened for one `remember()` miss.
///
/// Dropping it without calling [`OpenScope::close`] abandons the scope, so a
/// failed or cancelled generator leaves the stack exactly as it found it.
pub(crate) struct OpenScope {
    handle: ScopeHandle,
    trace_depth: usize,
    armed: bool,
}

impl OpenScope {
    pub(crate) fn open(label: String) -> Option<Self> {
        with_state("open_scope", |state| Self {
            handle: state.scopes.open(),
            trace_depth: state.tracker.begin(label),
            armed: true,
        })
    }

    pub(crate) fn handle(&self) -> ScopeHandle {
        self.handle
    }

    /// Close the scope, returning its options and the trace depth that must
    /// be finished with [`finish_trace`].
    pub(crate) fn close(mut self, default_lifetime: u64) -> (Option<CacheOptions>, usize) {
        self.armed = false;
        let handle = self.handle;
        let options = with_state("close_scope", |state| {
            state.scopes.close(handle, default_lifetime)
        })
        .flatten();
        (options, self.trace_depth)
    }
}

impl Drop for OpenScope {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let handle = self.handle;
        let depth = self.trace_depth;
        with_state("abandon_scope", |state| {
            state.scopes.abandon(handle);
            state
                .tracker
                .finish(depth, CacheOutcome::Failed, BTreeSet::new(), None);
        });
    }
}

pub(crate) fn finish_trace(depth: usize, outcome: CacheOutcome, options: &CacheOptions) {
    with_state("finish_trace", |state| {
        state.tracker.finish(
            depth,
            outcome,
            options.tags.clone(),
            Some(options.lifetime),
        );
    });
}

pub(crate) fn trace_leaf(label: String, outcome: CacheOutcome, tags: BTreeSet<String>, lifetime: Option<u64>) {
    with_state("trace_leaf", |state| {
        state.tracker.leaf(label, outcome, tags, lifetime);
    });
}

/// Feed a cached entry's metadata into the innermost open scope, exactly as
/// if the value had been generated there.
pub(crate) fn replay(tags: &BTreeSet<String>, remaining_lifetime: u64) {
    with_state("replay", |state| {
        if let Some(current) = state.scopes.current() {
            state.scopes.add_tags(current, tags.iter().cloned());
            state.scopes.tighten_lifetime(current, remaining_lifetime);
        }
    });
}
