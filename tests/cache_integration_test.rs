//! End-to-end tests for the learning cache: seeding, paraphrase and
//! reverse resolution, invalidation, cross-environment keys, and legacy
//! migration.

use selector_memory::cache::keys::{extract_url_pattern, EnhancedCacheKey};
use selector_memory::cache::SqliteStore;
use selector_memory::config::MemoryConfig;
use selector_memory::context::SystemContext;
use selector_memory::normalizer::normalize_intent;
use selector_memory::normalizer::similarity::OperationType;
use selector_memory::scenario::{NewScenario, Step, StepAction};
use selector_memory::LookupSource;

async fn system() -> std::sync::Arc<SystemContext> {
    let config = MemoryConfig::rooted_at("/tmp/selector-memory-it");
    SystemContext::initialize_in_memory(config).await.unwrap()
}

fn steps_for(url: &str) -> Vec<Step> {
    vec![
        Step {
            action: StepAction::Navigate,
            target: Some(url.to_string()),
            value: None,
            selector: None,
            timeout: None,
            description: "open the app".to_string(),
        },
        Step {
            action: StepAction::Click,
            target: None,
            value: None,
            selector: Some("button#add".to_string()),
            timeout: None,
            description: "click add".to_string(),
        },
    ]
}

#[tokio::test]
async fn test_paraphrases_normalize_identically() {
    let a = normalize_intent("Click the Add Todo button");
    let b = normalize_intent("press add todo");
    assert_eq!(a.normalized, b.normalized);
    assert_eq!(a.hash, b.hash);

    let first = normalize_intent("Click first Submit");
    let last = normalize_intent("Click last Submit");
    assert_ne!(first.normalized, last.normalized);
}

#[tokio::test]
async fn test_seed_then_paraphrase_lookup() {
    let ctx = system().await;
    ctx.cache
        .set(
            "Click Add Todo button",
            "http://x/",
            "button[data-testid='add-todo']",
        )
        .await
        .unwrap();

    let hit = ctx
        .cache
        .get("press Add Todo button", "http://x/")
        .await
        .unwrap()
        .expect("paraphrase should resolve");
    assert_eq!(hit.selector, "button[data-testid='add-todo']");
    assert_eq!(hit.source, LookupSource::Normalized);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_reverse_lookup_carries_penalty() {
    let ctx = system().await;
    let selector = "button#new-task";
    for phrase in ["add todo", "add task", "create todo"] {
        ctx.cache.set(phrase, "http://x/", selector).await.unwrap();
    }

    let hit = ctx
        .cache
        .get("create a new task", "http://x/")
        .await
        .unwrap()
        .expect("semantic overlap should resolve");
    assert_eq!(hit.selector, selector);
    assert_eq!(hit.source, LookupSource::Reverse);
    // winning mapping was stored at 0.5, reverse applies the 10% penalty
    assert!((hit.confidence - 0.45).abs() < 1e-9);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_invalidate_blocks_every_tier_until_relearned() {
    let ctx = system().await;
    let selector = "button#add";
    ctx.cache
        .set("Click Add Todo button", "http://x/", selector)
        .await
        .unwrap();

    ctx.cache.invalidate(selector, "http://x/").await.unwrap();
    for phrase in [
        "Click Add Todo button", // exact
        "press add todo",        // normalized
        "create a new todo",     // reverse
    ] {
        assert!(
            ctx.cache.get(phrase, "http://x/").await.unwrap().is_none(),
            "{phrase} should miss after invalidation"
        );
    }

    ctx.cache
        .set("Click Add Todo button", "http://x/", selector)
        .await
        .unwrap();
    assert!(ctx
        .cache
        .get("Click Add Todo button", "http://x/")
        .await
        .unwrap()
        .is_some());
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_url_pattern_and_cross_env_admission() {
    assert_eq!(
        extract_url_pattern("https://app.example.com/todos/8f1e2a3b-1c2d-4e5f-8a9b-0c1d2e3f4a5b/edit"),
        "*.example.com/todos/*/edit"
    );

    let local = EnhancedCacheKey::build(
        "todo smoke",
        "http://localhost:3000/",
        None,
        &steps_for("http://localhost:3000/"),
        None,
    );
    let staging = EnhancedCacheKey::build(
        "todo smoke",
        "https://staging.example.com/",
        None,
        &steps_for("https://staging.example.com/"),
        None,
    );
    assert!(local.similarity(&staging) >= 0.75);
    assert!(local.admits(&staging, OperationType::CacheLookup));
}

#[tokio::test]
async fn test_scenario_save_list_round_trip() {
    let ctx = system().await;
    let saved = ctx
        .scenarios
        .save(NewScenario {
            name: "todo-smoke".to_string(),
            description: Some("smoke test".to_string()),
            steps: steps_for("http://localhost:3000/"),
            tags: vec!["smoke".to_string()],
            profile: None,
            url: "http://localhost:3000/".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(saved.success_rate, 1.0);
    assert_eq!(saved.total_runs, 0);

    let listed = ctx.scenarios.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, saved.name);
    assert_eq!(listed[0].steps, saved.steps);
    assert_eq!(listed[0].pattern_hash, saved.pattern_hash);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_variation_bound_holds_after_cleanup() {
    let config = {
        let mut c = MemoryConfig::rooted_at("/tmp/selector-memory-it-var");
        c.cache.max_variations_per_selector = 3;
        c
    };
    let ctx = SystemContext::initialize_in_memory(config).await.unwrap();

    let phrases = [
        "add todo",
        "create todo entry",
        "insert new todo",
        "new todo row",
        "make todo",
    ];
    for phrase in phrases {
        ctx.cache.set(phrase, "http://x/", "#add").await.unwrap();
    }

    ctx.cache.cleanup_pass().await.unwrap();
    let stats = ctx.cache.stats().await.unwrap();
    assert!(stats.input_mappings <= 3);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_legacy_migration_through_startup() {
    let dir = tempfile::tempdir().unwrap();
    let config = MemoryConfig::rooted_at(dir.path());

    // seed a legacy single-table layout where the database will live
    {
        let store = SqliteStore::open(&config.database_path()).unwrap();
        store
            .query(|conn| {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS cache (
                         cache_key TEXT PRIMARY KEY,
                         cache_type TEXT,
                         data TEXT,
                         url TEXT,
                         created_at INTEGER,
                         accessed_at INTEGER,
                         ttl INTEGER,
                         profile TEXT
                     );
                     INSERT INTO cache VALUES
                         ('0123456789abcdef0123456789abcdef', 'selector',
                          'button#legacy', 'http://x/', 1, 2, NULL, NULL);",
                )
            })
            .await
            .unwrap();
    }

    let ctx = SystemContext::initialize(config).await.unwrap();
    let stats = ctx.cache.stats().await.unwrap();
    assert_eq!(stats.selector_records, 1);
    ctx.shutdown().await;
}
