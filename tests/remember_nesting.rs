use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use cachescope::cache::{
    CacheConfig, CacheEntry, CacheEnvironment, CacheError, CacheFacade, CacheTrigger,
    EntryLimitedStore, KeyPart, MemoryBackend, RecordTimes, RememberOptions, RequestContext,
    StaticRecordSource, StoredPageResolver, current, with_request,
};
use serde_json::json;
use time::{Duration, OffsetDateTime};

#[derive(Debug)]
enum RenderError {
    Cache(CacheError),
    Broken(&'static str),
}

impl From<CacheError> for RenderError {
    fn from(err: CacheError) -> Self {
        Self::Cache(err)
    }
}

struct Harness {
    backend: Arc<MemoryBackend>,
    records: Arc<StaticRecordSource>,
    cache: CacheFacade,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    fn with_config(config: CacheConfig) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let records = Arc::new(StaticRecordSource::new());
        let store = Arc::new(EntryLimitedStore::new(backend.clone(), &config));
        let cache = CacheFacade::new(config, store, records.clone());
        Self {
            backend,
            records,
            cache,
        }
    }

    async fn stored(&self, context: RequestContext, parts: &[KeyPart]) -> Option<CacheEntry> {
        let (key, _) = with_request(context, async { self.cache.key_for(parts) }).await;
        self.cache.store().get(&key).await.expect("store get")
    }
}

fn parts(values: &[&str]) -> Vec<KeyPart> {
    values.iter().map(|value| KeyPart::from(*value)).collect()
}

fn english() -> RequestContext {
    RequestContext::new(CacheEnvironment::new("en", "main"))
}

#[tokio::test]
async fn innermost_tags_reach_the_outermost_entry() {
    let harness = Harness::new();
    let cache = &harness.cache;

    let (value, outcome) = with_request(english(), async move {
        cache
            .remember(&parts(&["outer"]), RememberOptions::new(), move || async move {
                cache
                    .remember(&parts(&["middle"]), RememberOptions::new(), move || async move {
                        cache
                            .remember(&parts(&["inner"]), RememberOptions::new(), || async {
                                current::add_tag("x");
                                Ok::<u32, CacheError>(3)
                            })
                            .await
                    })
                    .await
            })
            .await
    })
    .await;

    assert_eq!(value.expect("value"), 3);
    assert!(outcome.tags.contains("x"));
    for level in ["outer", "middle", "inner"] {
        let entry = harness
            .stored(english(), &parts(&[level]))
            .await
            .unwrap_or_else(|| panic!("{level} stored"));
        assert!(entry.tags.contains("x"), "{level} is missing the tag");
    }
}

#[tokio::test]
async fn shorter_inner_lifetime_wins() {
    let harness = Harness::new();
    let cache = &harness.cache;

    let (value, outcome) = with_request(english(), async move {
        cache
            .remember(&parts(&["outer"]), RememberOptions::new(), move || async move {
                current::set_lifetime(Some(1000));
                cache
                    .remember(&parts(&["inner"]), RememberOptions::new(), || async {
                        current::set_lifetime(Some(50));
                        Ok::<u32, CacheError>(1)
                    })
                    .await
            })
            .await
    })
    .await;

    value.expect("value");
    let outer = harness
        .stored(english(), &parts(&["outer"]))
        .await
        .expect("outer stored");
    assert_eq!(outer.lifetime, 50);
    assert_eq!(outcome.lifetime, Some(50));
    assert_eq!(outcome.options(86_400).cache_control(), "max-age=50, public");
}

#[tokio::test]
async fn disabled_inner_scope_prevents_every_write() {
    let harness = Harness::new();
    let cache = &harness.cache;

    let (value, outcome) = with_request(english(), async move {
        cache
            .remember(&parts(&["outer"]), RememberOptions::new(), move || async move {
                cache
                    .remember(&parts(&["inner"]), RememberOptions::new(), || async {
                        current::set_enabled(false);
                        Ok::<String, CacheError>("personalised".to_string())
                    })
                    .await
            })
            .await
    })
    .await;

    assert_eq!(value.expect("value"), "personalised");
    assert!(harness.backend.identifiers().is_empty());
    assert!(!outcome.enabled);
    assert_eq!(outcome.options(86_400).cache_control(), "no-store");
}

#[tokio::test]
async fn cache_hits_replay_their_tags_into_the_parent() {
    let harness = Harness::new();
    let cache = &harness.cache;
    let inner_runs = Arc::new(AtomicUsize::new(0));

    let inner = |runs: Arc<AtomicUsize>| async move {
        cache
            .remember(&parts(&["inner"]), RememberOptions::new(), move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                current::add_tag("a");
                current::set_lifetime(Some(600));
                Ok::<u32, CacheError>(7)
            })
            .await
    };

    let (primed, _) = with_request(english(), inner(inner_runs.clone())).await;
    primed.expect("primed");

    let runs = inner_runs.clone();
    let (value, outcome) = with_request(english(), async move {
        cache
            .remember(&parts(&["outer"]), RememberOptions::new(), move || inner(runs))
            .await
    })
    .await;

    assert_eq!(value.expect("value"), 7);
    assert_eq!(inner_runs.load(Ordering::SeqCst), 1);

    let outer = harness
        .stored(english(), &parts(&["outer"]))
        .await
        .expect("outer stored");
    assert!(outer.tags.contains("a"));
    assert!(outer.lifetime <= 600 && outer.lifetime >= 595, "lifetime {}", outer.lifetime);

    let trace = outcome.trace.to_string();
    assert!(trace.starts_with("NEW outer"), "trace was {trace}");
    assert!(trace.contains("\n  HIT inner"), "trace was {trace}");
}

#[tokio::test]
async fn failed_generators_leave_the_stack_untouched() {
    let harness = Harness::new();
    let cache = &harness.cache;

    let (value, outcome) = with_request(english(), async move {
        cache
            .remember(&parts(&["outer"]), RememberOptions::new(), move || async move {
                current::add_tag("keep");
                current::set_lifetime(Some(300));
                let before = (current::tags(), current::lifetime(), current::is_enabled());

                let failed = cache
                    .remember(&parts(&["inner"]), RememberOptions::new(), || async {
                        current::add_tag("discard");
                        current::set_lifetime(Some(5));
                        current::set_enabled(false);
                        Err::<u32, RenderError>(RenderError::Broken("template missing"))
                    })
                    .await;
                assert!(matches!(failed, Err(RenderError::Broken("template missing"))));

                let after = (current::tags(), current::lifetime(), current::is_enabled());
                assert_eq!(before, after);
                Ok::<u32, RenderError>(1)
            })
            .await
    })
    .await;

    assert_eq!(value.expect("outer succeeds"), 1);
    assert!(harness.stored(english(), &parts(&["inner"])).await.is_none());

    let outer = harness
        .stored(english(), &parts(&["outer"]))
        .await
        .expect("outer stored");
    assert_eq!(outer.lifetime, 300);
    assert_eq!(outer.tags, BTreeSet::from(["keep".to_string()]));
    assert!(outcome.trace.to_string().contains("FAILED inner"));
}

#[tokio::test]
async fn generator_errors_reach_the_caller_unchanged() {
    let harness = Harness::new();

    let result = harness
        .cache
        .remember(&parts(&["broken"]), RememberOptions::new(), || async {
            Err::<u32, RenderError>(RenderError::Broken("boom"))
        })
        .await;

    assert!(matches!(result, Err(RenderError::Broken("boom"))));
    assert!(harness.backend.identifiers().is_empty());
}

#[tokio::test]
async fn environment_changes_the_key() {
    let harness = Harness::new();
    let cache = &harness.cache;
    let runs = Arc::new(AtomicUsize::new(0));

    for language in ["en", "de"] {
        let context = RequestContext::new(CacheEnvironment::new(language, "main"));
        let runs = runs.clone();
        let (value, _) = with_request(context, async move {
            cache
                .remember(&parts(&["menu"]), RememberOptions::new(), move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok::<String, CacheError>(format!("menu-{language}"))
                })
                .await
        })
        .await;
        assert_eq!(value.expect("value"), format!("menu-{language}"));
    }

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(harness.backend.identifiers().len(), 2);
}

#[tokio::test]
async fn query_marker_varies_by_the_named_parameter() {
    let harness = Harness::new();
    let cache = &harness.cache;
    let key_parts = parts(&["news", "@query:page"]);

    let mut keys = Vec::new();
    for query in ["page=2&sort=asc", "sort=desc&page=2", "page=3"] {
        let context = english().with_query(query);
        let (key, _) = with_request(context, async { cache.key_for(&key_parts) }).await;
        keys.push(key);
    }

    assert_eq!(keys[0], keys[1]);
    assert_ne!(keys[0], keys[2]);
}

#[tokio::test]
async fn bypassed_calls_still_contribute_to_the_enclosing_scope() {
    let harness = Harness::new();
    let cache = &harness.cache;

    let (value, outcome) = with_request(english(), async move {
        cache
            .remember(&parts(&["outer"]), RememberOptions::new(), move || async move {
                cache
                    .remember(
                        &parts(&["live"]),
                        RememberOptions::new().enabled(false),
                        || async {
                            current::add_tag("b");
                            Ok::<u32, CacheError>(2)
                        },
                    )
                    .await
            })
            .await
    })
    .await;

    assert_eq!(value.expect("value"), 2);
    assert_eq!(harness.backend.identifiers().len(), 1);
    let outer = harness
        .stored(english(), &parts(&["outer"]))
        .await
        .expect("outer stored");
    assert!(outer.tags.contains("b"));
    assert!(outcome.trace.to_string().contains("BYPASS live"));
}

#[tokio::test]
async fn unbounded_lifetimes_are_stored_without_overflow() {
    let harness = Harness::new();
    let cache = &harness.cache;

    let (value, outcome) = with_request(english(), async move {
        cache
            .remember(&parts(&["forever"]), RememberOptions::new(), || async {
                current::set_lifetime(Some(u64::MAX));
                Ok::<u32, CacheError>(1)
            })
            .await
    })
    .await;

    assert_eq!(value.expect("value"), 1);
    assert_eq!(outcome.lifetime, Some(u64::MAX));
    let entry = harness
        .stored(english(), &parts(&["forever"]))
        .await
        .expect("entry stored");
    assert_eq!(entry.lifetime, u64::MAX);

    let ttl: Result<u32, CacheError> = cache
        .remember(&parts(&["ttl"]), RememberOptions::new().ttl(u64::MAX), || async {
            Ok(2)
        })
        .await;
    assert_eq!(ttl.expect("ttl value"), 2);
}

#[tokio::test]
async fn huge_default_lifetime_does_not_overflow() {
    let harness = Harness::with_config(CacheConfig {
        default_lifetime: 400 * 365 * 86_400 * 100,
        ..Default::default()
    });

    let value: Result<u32, CacheError> = harness
        .cache
        .remember(&parts(&["plain"]), RememberOptions::new(), || async { Ok(3) })
        .await;

    assert_eq!(value.expect("value"), 3);
    assert_eq!(harness.backend.identifiers().len(), 1);
}

#[tokio::test]
async fn invalidation_while_disabled_is_honoured_after_reenabling() {
    let harness = Harness::new();
    let cache = &harness.cache;
    let page = |title: &'static str| async move {
        cache
            .remember(&parts(&["page", "1"]), RememberOptions::new(), move || async move {
                current::add_tag(("pages", 1_u64));
                Ok::<String, CacheError>(title.to_string())
            })
            .await
    };

    assert_eq!(page("old title").await.expect("first render"), "old title");

    // The editor saves while caching is switched off.
    let disabled = CacheConfig {
        enabled: false,
        ..Default::default()
    };
    let store = Arc::new(EntryLimitedStore::new(harness.backend.clone(), &disabled));
    let trigger = CacheTrigger::new(store);
    assert_eq!(trigger.record_changed("pages", 1).await.expect("flush"), 1);

    assert_eq!(page("new title").await.expect("second render"), "new title");
}

#[tokio::test]
async fn record_end_times_cap_the_stored_lifetime() {
    let harness = Harness::new();
    let cache = &harness.cache;
    harness.records.insert(
        "tt_content",
        5,
        RecordTimes {
            starttime: None,
            endtime: Some(OffsetDateTime::now_utc() + Duration::seconds(120)),
        },
    );

    let (value, _) = with_request(english(), async move {
        cache
            .remember(&parts(&["content", "5"]), RememberOptions::new(), || async {
                current::add_tag(("tt_content", 5_u64));
                Ok::<u32, CacheError>(5)
            })
            .await
    })
    .await;

    value.expect("value");
    let entry = harness
        .stored(english(), &parts(&["content", "5"]))
        .await
        .expect("entry stored");
    assert!(
        (115..=120).contains(&entry.lifetime),
        "lifetime {}",
        entry.lifetime
    );
}

#[tokio::test]
async fn referenced_pages_pass_their_metadata_to_the_outer_entry() {
    let harness = Harness::new();
    let cache = &harness.cache;

    let page_key = StoredPageResolver::key_parts(9);
    let (key, _) = with_request(english(), async { cache.key_for(&page_key) }).await;
    cache
        .store()
        .set(
            &key,
            &CacheEntry {
                tags: BTreeSet::from(["pages_9".to_string(), "menu".to_string()]),
                lifetime: 300,
                generated_at: OffsetDateTime::now_utc(),
                content: json!("<nav>"),
            },
        )
        .await
        .expect("seed page");

    let (value, _) = with_request(english(), async move {
        cache
            .remember(&parts(&["layout"]), RememberOptions::new(), move || async move {
                cache
                    .remember(&parts(&["link"]), RememberOptions::new(), || async {
                        current::add_tag(("pages", 9_u64));
                        Ok::<String, CacheError>("<a>".to_string())
                    })
                    .await
            })
            .await
    })
    .await;

    value.expect("value");
    let outer = harness
        .stored(english(), &parts(&["layout"]))
        .await
        .expect("outer stored");
    assert!(outer.tags.contains("menu"));
    assert!(
        (295..=300).contains(&outer.lifetime),
        "lifetime {}",
        outer.lifetime
    );
}
