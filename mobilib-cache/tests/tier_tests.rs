use std::sync::Arc;
use std::time::Duration;

use mobilib_cache::{CacheMaster, ExistenceIndex, InMemoryExistenceIndex, IndexRecord};
use mobilib_core::{from_millis, to_millis, CacheError, Clock};
use mobilib_test_utils::assertions::{assert_ids, assert_incomplete, assert_source_error};
use mobilib_test_utils::fixtures::{manual_clock, master_with, test_config, users, START_MILLIS};
use mobilib_test_utils::{MockSource, SourceCall, User};

const WINDOW_MS: i64 = 60_000;

#[tokio::test]
async fn memory_hits_short_circuit_other_tiers() {
    let master = master_with(MockSource::new(), test_config(), manual_clock());

    master.put_many(users(&["1", "2"])).await.unwrap();
    let result = master.get(["1", "2"]).await;

    assert_ids(&result, &["1", "2"]);
    assert!(master.source().calls().is_empty());
    assert_eq!(master.stats().memory_hits, 2);
}

#[tokio::test]
async fn put_does_not_write_caller_database() {
    let master = master_with(MockSource::new(), test_config(), manual_clock());

    master.put(User::new("1", "ada")).await.unwrap();

    assert_eq!(master.source().database_len(), 0);
    assert!(master.index().get("user#1").await.unwrap().is_some());
}

#[tokio::test]
async fn fresh_index_record_resolves_from_database() {
    let clock = manual_clock();
    let source = MockSource::new().with_database(users(&["5"]));
    let master = master_with(source, test_config(), Arc::clone(&clock));

    let written = from_millis(START_MILLIS - 1_000);
    master
        .index()
        .upsert(IndexRecord::new("user#5", written))
        .await
        .unwrap();

    let result = master.get(["5"]).await;

    assert_ids(&result, &["5"]);
    assert_eq!(
        master.source().calls(),
        vec![SourceCall::FetchDatabase(vec!["5".to_string()])]
    );
    assert!(master.memory().contains_key("5"));
    assert_eq!(master.stats().database_hits, 1);
}

#[tokio::test]
async fn database_hit_keeps_index_timestamp_in_memory() {
    let clock = manual_clock();
    let source = MockSource::new().with_database(users(&["5"]));
    let master = master_with(source, test_config(), Arc::clone(&clock));

    // written 59s ago: one more second and the memory copy must expire
    let written = from_millis(START_MILLIS - (WINDOW_MS - 1_000));
    master
        .index()
        .upsert(IndexRecord::new("user#5", written))
        .await
        .unwrap();
    master.get(["5"]).await.unwrap();
    assert!(master.memory().contains_key("5"));

    clock.advance(Duration::from_millis(1_000));
    assert!(!master.memory().contains_key("5"));
}

#[tokio::test]
async fn freshness_boundary_decides_database_or_server() {
    let clock = manual_clock();
    let source = MockSource::new()
        .with_database(users(&["old", "new"]))
        .with_server(users(&["old"]));
    let master = master_with(source, test_config(), Arc::clone(&clock));

    let now = to_millis(clock.now());
    master
        .index()
        .upsert_many(vec![
            IndexRecord::new("user#old", from_millis(now - WINDOW_MS - 1)),
            IndexRecord::new("user#new", from_millis(now - WINDOW_MS + 1)),
        ])
        .await
        .unwrap();

    assert_ids(&master.get(["new"]).await, &["new"]);
    assert!(master.source().server_fetches().is_empty());

    assert_ids(&master.get(["old"]).await, &["old"]);
    assert_eq!(master.source().database_fetches(), vec![vec!["new".to_string()]]);
    assert_eq!(master.source().server_fetches(), vec![vec!["old".to_string()]]);
}

#[tokio::test]
async fn server_fetch_writes_through_every_tier() {
    let source = MockSource::new().with_server(users(&["9"]));
    let master = master_with(source, test_config(), manual_clock());

    assert_ids(&master.get(["9"]).await, &["9"]);

    assert!(master.memory().contains_key("9"));
    assert!(master.index().get("user#9").await.unwrap().is_some());
    assert_eq!(master.source().stores(), vec![vec!["9".to_string()]]);
    assert!(master.source().database_get("9").is_some());

    master.source().clear_calls();
    assert_ids(&master.get(["9"]).await, &["9"]);
    assert!(master.source().calls().is_empty());
}

#[tokio::test]
async fn tiers_combine_into_request_order() {
    let clock = manual_clock();
    let source = MockSource::new()
        .with_database(users(&["db"]))
        .with_server(users(&["net"]));
    let master = master_with(source, test_config(), Arc::clone(&clock));

    master.put(User::new("mem", "cached")).await.unwrap();
    master
        .index()
        .upsert(IndexRecord::new("user#db", clock.now()))
        .await
        .unwrap();

    assert_ids(&master.get(["net", "db", "mem"]).await, &["net", "db", "mem"]);
    assert_eq!(master.source().server_fetches(), vec![vec!["net".to_string()]]);

    let stats = master.stats();
    assert_eq!((stats.memory_hits, stats.database_hits, stats.server_fetches), (1, 1, 1));
}

#[tokio::test]
async fn partial_server_result_fails_whole_get() {
    let source = MockSource::new().with_server(users(&["1"]));
    let master = master_with(source, test_config(), manual_clock());

    let result = master.get(["1", "2"]).await;

    assert_incomplete(&result, &["2"]);
    // what did arrive is still cached
    assert!(master.memory().contains_key("1"));
    assert_eq!(master.stats().failed_gets, 1);
}

#[tokio::test]
async fn server_failure_without_fallback_is_reported() {
    let source = MockSource::new().with_database(users(&["9"]));
    source.set_server_failure(true);
    let master = master_with(source, test_config(), manual_clock());

    let result = master.get(["9"]).await;

    assert_source_error(&result);
    assert!(master.source().database_fetches().is_empty());
    assert_eq!(master.stats().server_failures, 1);
}

#[tokio::test]
async fn server_failure_falls_back_to_stale_database_rows() {
    let source = MockSource::new().with_database(users(&["9"]));
    source.set_server_failure(true);
    let master = master_with(source, test_config().with_fallback(true), manual_clock());

    assert_ids(&master.get(["9"]).await, &["9"]);
    assert_eq!(master.source().database_fetches(), vec![vec!["9".to_string()]]);
    assert_eq!(master.stats().fallback_hits, 1);
}

#[tokio::test]
async fn fallback_without_rows_fails() {
    let source = MockSource::new();
    source.set_server_failure(true);
    let master = master_with(source, test_config().with_fallback(true), manual_clock());

    assert_incomplete(&master.get(["9"]).await, &["9"]);
}

#[tokio::test]
async fn database_errors_count_as_missing_rows() {
    let clock = manual_clock();
    let source = MockSource::new()
        .with_database(users(&["5"]))
        .with_server(users(&["5"]));
    source.set_database_failure(true);
    let master = master_with(source, test_config(), Arc::clone(&clock));
    master
        .index()
        .upsert(IndexRecord::new("user#5", clock.now()))
        .await
        .unwrap();

    assert_ids(&master.get(["5"]).await, &["5"]);
    assert_eq!(master.source().server_fetches(), vec![vec!["5".to_string()]]);
}

#[tokio::test]
async fn store_failure_does_not_fail_get() {
    let source = MockSource::new().with_server(users(&["9"]));
    source.set_store_failure(true);
    let master = master_with(source, test_config(), manual_clock());

    assert_ids(&master.get(["9"]).await, &["9"]);
    assert!(master.memory().contains_key("9"));
}

#[tokio::test]
async fn get_one_reports_not_found() {
    let master = master_with(MockSource::new(), test_config(), manual_clock());
    master.put(User::new("1", "ada")).await.unwrap();

    assert_eq!(master.get_one("1").await.unwrap().name, "ada");
    assert!(master.get_one("2").await.is_err());
}

#[tokio::test]
async fn delete_evicts_without_touching_database() {
    let source = MockSource::new().with_database(users(&["1", "2"]));
    let master = master_with(source, test_config(), manual_clock());
    master.put_many(users(&["1", "2"])).await.unwrap();

    assert_eq!(master.delete("1").await.unwrap(), 1);

    assert!(!master.memory().contains_key("1"));
    assert!(master.memory().contains_key("2"));
    assert!(master.index().get("user#1").await.unwrap().is_none());
    assert_eq!(master.source().database_len(), 2);
    assert!(master.source().calls().is_empty());
}

#[tokio::test]
async fn clear_only_drops_own_namespace() {
    let index: Arc<dyn ExistenceIndex> = Arc::new(InMemoryExistenceIndex::new());
    let users_master: CacheMaster<User, MockSource> =
        CacheMaster::builder(MockSource::new(), Arc::clone(&index))
            .config(test_config().with_namespace("user"))
            .build()
            .unwrap();
    let admins_master: CacheMaster<User, MockSource> =
        CacheMaster::builder(MockSource::new(), Arc::clone(&index))
            .config(test_config().with_namespace("admin"))
            .build()
            .unwrap();

    users_master.put_many(users(&["1", "2"])).await.unwrap();
    admins_master.put(User::new("1", "root")).await.unwrap();

    assert_eq!(users_master.clear().await.unwrap(), 2);

    assert!(users_master.memory().is_empty());
    assert!(index.get("admin#1").await.unwrap().is_some());
    assert_ids(&admins_master.get(["1"]).await, &["1"]);
    assert!(admins_master.source().calls().is_empty());
}

#[tokio::test]
async fn nested_namespace_is_rejected() {
    let index: Arc<dyn ExistenceIndex> = Arc::new(InMemoryExistenceIndex::new());
    let users_master: CacheMaster<User, MockSource> =
        CacheMaster::builder(MockSource::new(), Arc::clone(&index))
            .config(test_config().with_namespace("user"))
            .build()
            .unwrap();

    let vip = CacheMaster::<User, MockSource>::builder(MockSource::new(), Arc::clone(&index))
        .config(test_config().with_namespace("user#vip"))
        .build();
    assert!(matches!(vip, Err(CacheError::Config(_))));

    // the closest legal sibling keeps its records through the other's clear
    let vip_master: CacheMaster<User, MockSource> =
        CacheMaster::builder(MockSource::new(), Arc::clone(&index))
            .config(test_config().with_namespace("user_vip"))
            .build()
            .unwrap();
    users_master.put(User::new("1", "ada")).await.unwrap();
    vip_master.put(User::new("1", "vip")).await.unwrap();

    assert_eq!(users_master.clear().await.unwrap(), 1);
    assert!(index.get("user_vip#1").await.unwrap().is_some());
    assert_eq!(index.get_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn expired_memory_entry_falls_through() {
    let clock = manual_clock();
    let source = MockSource::new().with_server(users(&["1"]));
    let master = master_with(source, test_config(), Arc::clone(&clock));

    master.put(User::new("1", "ada")).await.unwrap();
    clock.advance(Duration::from_millis(WINDOW_MS as u64));

    assert_ids(&master.get(["1"]).await, &["1"]);
    assert_eq!(master.source().server_fetches(), vec![vec!["1".to_string()]]);
}
