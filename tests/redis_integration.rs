//! Integration tests against a real Redis.
//!
//! Redis runs in a container via testcontainers; the source and configuration
//! tables live in a temporary SQLite file.
//!
//! # Running Tests
//! ```bash
//! # Requires Docker
//! cargo test --test redis_integration -- --ignored
//! ```

use serde_json::{json, Value};
use tempfile::TempDir;

use chunk_cache_sync::storage::redis::RedisCacheStore;
use chunk_cache_sync::storage::sql::{connect_pool, SqlSourceStore, SqlTargetCatalog};
use chunk_cache_sync::{
    ApplyAction, CacheStore, CacheSyncConfig, CacheSyncService, CacheTarget, ChangeEvent, Record,
    TargetOutcome,
};

use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

// =============================================================================
// Container Helpers
// =============================================================================

fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

fn sqlite_url(dir: &TempDir) -> String {
    format!("sqlite://{}?mode=rwc", dir.path().join("source.db").display())
}

fn rec(value: Value) -> Record {
    value.as_object().cloned().expect("object literal")
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_store_basic_operations() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let url = format!("redis://127.0.0.1:{}", redis.get_host_port_ipv4(6379));

    let store = RedisCacheStore::new(&url).await.expect("connect");
    store.ping().await.expect("ping");

    store.set("p:t:chunk:0", r#"[{"id":"a"}]"#, Some(60)).await.unwrap();
    store.set("p:t:chunk:1", r#"[{"id":"b"}]"#, None).await.unwrap();
    store.set("p:other:x", "{}", None).await.unwrap();

    assert_eq!(store.get("p:t:chunk:0").await.unwrap().as_deref(), Some(r#"[{"id":"a"}]"#));
    assert!(store.exists("p:t:chunk:1").await.unwrap());

    let mut keys = store.scan_keys("p:t:chunk:*").await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["p:t:chunk:0", "p:t:chunk:1"]);

    assert_eq!(store.delete_many(&keys).await.unwrap(), 2);
    assert_eq!(store.delete("p:t:chunk:0").await.unwrap(), 0);
    assert!(store.get("p:other:x").await.unwrap().is_some());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn full_stack_bulk_and_events() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let redis_url = format!("redis://127.0.0.1:{}", redis.get_host_port_ipv4(6379));
    let dir = TempDir::new().unwrap();
    let sql_url = sqlite_url(&dir);

    // Seed the source table and the configuration row.
    let pool = connect_pool(&sql_url).await.unwrap();
    let source = SqlSourceStore::from_pool(pool.clone(), true);
    source.create_table("orders").await.unwrap();
    for i in 0..7 {
        source
            .upsert("orders", &rec(json!({"id": format!("o{}", i), "total": i * 10})))
            .await
            .unwrap();
    }
    let catalog = SqlTargetCatalog::new(pool, "cache_sync_configs", true).unwrap();
    catalog.init_schema().await.unwrap();
    catalog.save(&CacheTarget::new("shop", "orders", 3)).await.unwrap();

    let config = CacheSyncConfig {
        redis_url: Some(redis_url.clone()),
        sql_url: Some(sql_url),
        ..Default::default()
    };
    let service = CacheSyncService::connect(config).await.expect("connect");
    assert!(service.health().await.healthy);

    let outcome = service.bulk_cache("shop", "orders", 3, 0).await.unwrap();
    assert_eq!(outcome.stats.total_scanned, 7);
    assert_eq!(outcome.stats.cache_keys.len(), 3);

    let event = ChangeEvent::remove("orders", rec(json!({"id": {"S": "o0"}}))).unwrap();
    let disposition = service.handle_event(event).await.unwrap();
    match &disposition.outcomes[0] {
        TargetOutcome::Applied(result) => {
            assert!(result.success);
            assert_eq!(result.action, ApplyAction::Removed);
        }
        other => panic!("expected applied outcome, got {:?}", other),
    }

    let redis = RedisCacheStore::new(&redis_url).await.unwrap();
    let raw = redis.get("shop:orders:chunk:0").await.unwrap().unwrap();
    let items: Vec<Record> = serde_json::from_str(&raw).unwrap();
    let ids: Vec<&str> = items.iter().map(|r| r["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["o1", "o2"]);
}
