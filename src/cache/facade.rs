//! The `remember()` entry point.
//!
//! Looks a value up by key; on a hit its stored tags and remaining lifetime
//! are replayed into the enclosing scope, on a miss the generator runs inside
//! a fresh scope whose final options decide whether and for how long the
//! result is stored.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::config::CacheConfig;
use super::constraints::{ConstraintBuilder, RecordSource, StoredPageResolver};
use super::context::{self, OpenScope, RequestContext, with_request};
use super::entry::CacheEntry;
use super::error::CacheError;
use super::keys::{self, KeyPart};
use super::scope::CacheOptions;
use super::store::EntryLimitedStore;
use super::tags::TagSource;
use super::tracker::CacheOutcome;

pub(crate) const METRIC_REMEMBER_HIT: &str = "cachescope_remember_hit_total";
pub(crate) const METRIC_REMEMBER_MISS: &str = "cachescope_remember_miss_total";
pub(crate) const METRIC_REMEMBER_BYPASS: &str = "cachescope_remember_bypass_total";
pub(crate) const METRIC_GENERATE_MS: &str = "cachescope_generate_ms";

/// Whether a single `remember()` call may use the cache at all.
pub enum CacheSwitch {
    Always(bool),
    /// Evaluated once, when the call starts.
    When(Box<dyn FnOnce() -> bool + Send>),
}

impl CacheSwitch {
    fn resolve(self) -> bool {
        match self {
            Self::Always(enabled) => enabled,
            Self::When(predicate) => predicate(),
        }
    }
}

impl Default for CacheSwitch {
    fn default() -> Self {
        Self::Always(true)
    }
}

type Freeze<T> = Box<dyn FnOnce(&T) -> T + Send>;
type Warmup<T> = Box<dyn FnOnce(T) -> T + Send>;

/// Per-call options of [`CacheFacade::remember`].
pub struct RememberOptions<T> {
    ttl: Option<u64>,
    enabled: CacheSwitch,
    tags: Vec<TagSource>,
    on_freeze: Option<Freeze<T>>,
    on_warmup: Option<Warmup<T>>,
}

impl<T> Default for RememberOptions<T> {
    fn default() -> Self {
        Self {
            ttl: None,
            enabled: CacheSwitch::default(),
            tags: Vec::new(),
            on_freeze: None,
            on_warmup: None,
        }
    }
}

impl<T> RememberOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial lifetime of the scope; shortens enclosing scopes like
    /// [`current::set_lifetime`](super::current::set_lifetime).
    pub fn ttl(mut self, seconds: u64) -> Self {
        self.ttl = Some(seconds);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = CacheSwitch::Always(enabled);
        self
    }

    pub fn enabled_when(mut self, predicate: impl FnOnce() -> bool + Send + 'static) -> Self {
        self.enabled = CacheSwitch::When(Box::new(predicate));
        self
    }

    pub fn tag(mut self, tag: impl Into<TagSource>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TagSource>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Map a freshly generated value to the form that is persisted.
    pub fn on_freeze(mut self, freeze: impl FnOnce(&T) -> T + Send + 'static) -> Self {
        self.on_freeze = Some(Box::new(freeze));
        self
    }

    /// Map a value restored from the cache before it is returned.
    pub fn on_warmup(mut self, warmup: impl FnOnce(T) -> T + Send + 'static) -> Self {
        self.on_warmup = Some(Box::new(warmup));
        self
    }
}

pub struct CacheFacade {
    config: CacheConfig,
    store: Arc<EntryLimitedStore>,
    constraints: ConstraintBuilder,
}

impl CacheFacade {
    /// Build a facade whose constraint pass reads record times from
    /// `records` and page metadata from the store itself.
    pub fn new(
        config: CacheConfig,
        store: Arc<EntryLimitedStore>,
        records: Arc<dyn RecordSource>,
    ) -> Self {
        let pages = StoredPageResolver::new(store.clone(), config.key_prefix.clone());
        let constraints =
            ConstraintBuilder::new(config.clone(), records).with_page_resolver(Arc::new(pages));
        Self {
            config,
            store,
            constraints,
        }
    }

    pub fn with_constraints(mut self, constraints: ConstraintBuilder) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EntryLimitedStore> {
        &self.store
    }

    /// The key a `remember()` call with `parts` uses in the current request.
    pub fn key_for(&self, parts: &[KeyPart]) -> String {
        let (environment, query) = context::with_state("key_for", |state| {
            (
                state.context.environment.clone(),
                state.context.query.clone(),
            )
        })
        .unwrap_or_default();
        keys::cache_key(&self.config.key_prefix, &environment, parts, query.as_deref())
    }

    /// Return the cached value for `parts`, or run `generator` and cache what
    /// it produces.
    ///
    /// Generator errors are returned unchanged and nothing is stored. Called
    /// outside [`with_request`], the call runs in a throwaway request.
    ///
    /// Calls within one request must nest or run one after another. Futures
    /// of the same request polled concurrently (`join!`, `select!`) share one
    /// scope stack: tags declared by one generator can land on a sibling's
    /// scope, and a scope closed out of order is returned uncached with a
    /// warning. Run concurrent work in separate [`with_request`] calls.
    pub async fn remember<T, E, F, Fut>(
        &self,
        parts: &[KeyPart],
        options: RememberOptions<T>,
        generator: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if context::is_active() {
            return self.remember_in_request(parts, options, generator).await;
        }
        let (result, _) = with_request(
            RequestContext::default(),
            self.remember_in_request(parts, options, generator),
        )
        .await;
        result
    }

    async fn remember_in_request<T, E, F, Fut>(
        &self,
        parts: &[KeyPart],
        options: RememberOptions<T>,
        generator: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let label = keys::label(parts);
        let RememberOptions {
            ttl,
            enabled,
            tags,
            on_freeze,
            on_warmup,
        } = options;

        if !self.config.enabled || !enabled.resolve() {
            counter!(METRIC_REMEMBER_BYPASS).increment(1);
            debug!(cache = %label, outcome = "bypass", "Cache bypassed");
            context::trace_leaf(label, CacheOutcome::Bypass, BTreeSet::new(), None);
            return generator().await;
        }

        let key = self.key_for(parts);

        if let Some(entry) = self.store.get(&key).await? {
            let remaining = entry.remaining_lifetime(OffsetDateTime::now_utc());
            match serde_json::from_value::<T>(entry.content) {
                Ok(value) => {
                    context::replay(&entry.tags, remaining);
                    counter!(METRIC_REMEMBER_HIT).increment(1);
                    debug!(
                        cache = %label,
                        key = %key,
                        outcome = "hit",
                        tags = entry.tags.len(),
                        lifetime = remaining,
                        "Cache hit"
                    );
                    context::trace_leaf(label, CacheOutcome::Hit, entry.tags, Some(remaining));
                    return Ok(match on_warmup {
                        Some(warmup) => warmup(value),
                        None => value,
                    });
                }
                Err(error) => {
                    warn!(
                        cache = %label,
                        key = %key,
                        error = %error,
                        "Cached payload no longer matches its type; regenerating"
                    );
                }
            }
        }

        counter!(METRIC_REMEMBER_MISS).increment(1);
        let Some(scope) = OpenScope::open(label.clone()) else {
            warn!(cache = %label, "Cache scope unavailable; generating uncached");
            return generator().await;
        };

        let handle = scope.handle();
        let initial_tags: Vec<String> = tags.into_iter().map(TagSource::into_tag).collect();
        context::with_state("remember", |state| {
            state.scopes.add_tags(handle, initial_tags);
            if ttl.is_some() {
                state.scopes.set_lifetime(handle, ttl);
            }
        });

        let started_at = Instant::now();
        // Dropping `scope` on error abandons it together with its tags.
        let value = generator().await?;
        histogram!(METRIC_GENERATE_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

        self.constraints.apply(handle).await;
        let (options, trace_depth) = scope.close(self.config.default_lifetime);
        let Some(options) = options else {
            warn!(cache = %label, "Cache scope closed out of order; value not stored");
            return Ok(value);
        };

        if !options.enabled || options.lifetime == 0 {
            debug!(
                cache = %label,
                outcome = "no_cache",
                enabled = options.enabled,
                lifetime = options.lifetime,
                "Generated value not cacheable"
            );
            context::finish_trace(trace_depth, CacheOutcome::NoCache, &options);
            return Ok(value);
        }

        let written = self.write(&key, &value, &options, on_freeze).await;
        let outcome = if written.is_ok() {
            CacheOutcome::New
        } else {
            CacheOutcome::Failed
        };
        context::finish_trace(trace_depth, outcome, &options);
        written?;

        debug!(
            cache = %label,
            key = %key,
            outcome = "new",
            tags = options.tags.len(),
            lifetime = options.lifetime,
            "Cache entry generated"
        );
        Ok(value)
    }

    async fn write<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        options: &CacheOptions,
        on_freeze: Option<Freeze<T>>,
    ) -> Result<(), CacheError> {
        let content = match on_freeze {
            Some(freeze) => serde_json::to_value(freeze(value))?,
            None => serde_json::to_value(value)?,
        };
        let entry = CacheEntry {
            tags: options.tags.clone(),
            lifetime: options.lifetime,
            generated_at: OffsetDateTime::now_utc(),
            content,
        };
        self.store.set(key, &entry).await
    }

    pub async fn flush_by_tag(&self, tag: impl Into<TagSource>) -> Result<u64, CacheError> {
        self.store.flush_by_tag(&tag.into().into_tag()).await
    }

    pub async fn flush_by_tags(&self, tags: &[String]) -> Result<u64, CacheError> {
        self.store.flush_by_tags(tags).await
    }

    pub async fn flush(&self) -> Result<(), CacheError> {
        self.store.flush().await
    }

    pub async fn collect_garbage(&self) -> Result<u64, CacheError> {
        self.store.collect_garbage().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::MemoryBackend;
    use crate::cache::constraints::StaticRecordSource;
    use crate::cache::current;

    fn facade(config: CacheConfig) -> CacheFacade {
        let store = Arc::new(EntryLimitedStore::new(Arc::new(MemoryBackend::new()), &config));
        CacheFacade::new(config, store, Arc::new(StaticRecordSource::new()))
    }

    fn parts(values: &[&str]) -> Vec<KeyPart> {
        values.iter().map(|value| KeyPart::from(*value)).collect()
    }

    #[tokio::test]
    async fn second_call_is_served_from_the_store() {
        let cache = facade(CacheConfig::default());
        let key = parts(&["greeting"]);

        let first: Result<String, CacheError> = cache
            .remember(&key, RememberOptions::new(), || async { Ok("hello".to_string()) })
            .await;
        let second: Result<String, CacheError> = cache
            .remember(&key, RememberOptions::new(), || async {
                Ok("regenerated".to_string())
            })
            .await;

        assert_eq!(first.expect("first"), "hello");
        assert_eq!(second.expect("second"), "hello");
    }

    #[tokio::test]
    async fn globally_disabled_cache_always_generates() {
        let cache = facade(CacheConfig {
            enabled: false,
            ..Default::default()
        });
        let key = parts(&["counter"]);

        for expected in [1_u32, 2] {
            let value: Result<u32, CacheError> = cache
                .remember(&key, RememberOptions::new(), || async move { Ok(expected) })
                .await;
            assert_eq!(value.expect("value"), expected);
        }
        assert_eq!(cache.store().count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn predicate_can_bypass_the_cache() {
        let cache = facade(CacheConfig::default());
        let value: Result<u32, CacheError> = cache
            .remember(
                &parts(&["predicate"]),
                RememberOptions::new().enabled_when(|| false),
                || async { Ok(5) },
            )
            .await;

        assert_eq!(value.expect("value"), 5);
        assert_eq!(cache.store().count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn freeze_and_warmup_transform_the_stored_value() {
        let cache = facade(CacheConfig::default());
        let key = parts(&["list"]);

        let fresh: Result<Vec<u32>, CacheError> = cache
            .remember(
                &key,
                RememberOptions::new().on_freeze(|value: &Vec<u32>| value[..1].to_vec()),
                || async { Ok(vec![1, 2, 3]) },
            )
            .await;
        let restored: Result<Vec<u32>, CacheError> = cache
            .remember(
                &key,
                RememberOptions::new().on_warmup(|mut value: Vec<u32>| {
                    value.push(9);
                    value
                }),
                || async { Ok(Vec::new()) },
            )
            .await;

        assert_eq!(fresh.expect("fresh"), vec![1, 2, 3]);
        assert_eq!(restored.expect("restored"), vec![1, 9]);
    }

    #[tokio::test]
    async fn mismatched_payload_is_regenerated() {
        let cache = facade(CacheConfig::default());
        let key = parts(&["shape"]);

        let text: Result<String, CacheError> = cache
            .remember(&key, RememberOptions::new(), || async { Ok("text".to_string()) })
            .await;
        text.expect("text");

        let number: Result<u32, CacheError> = cache
            .remember(&key, RememberOptions::new(), || async { Ok(42) })
            .await;
        assert_eq!(number.expect("number"), 42);
    }

    #[tokio::test]
    async fn zero_lifetime_is_not_stored() {
        let cache = facade(CacheConfig::default());
        let value: Result<u32, CacheError> = cache
            .remember(&parts(&["instant"]), RememberOptions::new(), || async {
                current::set_lifetime(Some(0));
                Ok(1)
            })
            .await;

        assert_eq!(value.expect("value"), 1);
        assert_eq!(cache.store().count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn static_options_seed_the_scope() {
        let cache = facade(CacheConfig::default());
        let key = parts(&["seeded"]);
        let value: Result<u32, CacheError> = cache
            .remember(
                &key,
                RememberOptions::new().ttl(30).tag(("tt_content", 5_u64)),
                || async { Ok(1) },
            )
            .await;
        value.expect("value");

        let entry = cache
            .store()
            .get(&cache.key_for(&key))
            .await
            .expect("get")
            .expect("entry stored");
        assert_eq!(entry.lifetime, 30);
        assert!(entry.tags.contains("tt_content_5"));
    }
}
