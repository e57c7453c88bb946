//! Memoized reads stay coherent with writes that go through the runner.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use hearth_settings::{Capacity, HearthSettings, Millis};
use hearth_storage::{
    BatchedMemoizedAccessor, ErrorKind, EvictionPolicy, MemoizedAccessor, Record, SimpleTxn, SqlStore,
    StorageMetrics, record,
};
use rusqlite::types::Value;

fn settings() -> HearthSettings {
    let mut settings = HearthSettings::default();
    settings.database.path = ":memory:".into();
    settings.database.pool_size = 4;
    settings.transactions.retry_base_delay = Millis(1);
    settings
}

async fn profiles_store() -> SqlStore {
    let store = SqlStore::open(&settings(), StorageMetrics::shared()).unwrap();
    let _ = store
        .execute(
            "create_profiles",
            "CREATE TABLE profiles (user_id TEXT PRIMARY KEY, displayname TEXT)",
            vec![],
        )
        .await
        .unwrap();
    store
        .insert_many(
            "seed_profiles",
            "profiles",
            vec![
                record([("user_id", "@alice:hs".to_owned()), ("displayname", "Alice".to_owned())]),
                record([("user_id", "@bob:hs".to_owned()), ("displayname", "Bob".to_owned())]),
            ],
        )
        .await
        .unwrap();
    store
}

fn displayname_accessor(
    store: &SqlStore,
    fetches: &Arc<AtomicUsize>,
) -> MemoizedAccessor<String, Option<Value>> {
    let reader = store.clone();
    let fetches = Arc::clone(fetches);
    store.memoized(
        "get_displayname",
        EvictionPolicy::Lru,
        move |user_id: String, ()| {
            let reader = reader.clone();
            let _ = fetches.fetch_add(1, Ordering::SeqCst);
            async move {
                reader
                    .select_one_onecol(
                        "get_displayname",
                        "profiles",
                        record([("user_id", user_id)]),
                        "displayname",
                        true,
                    )
                    .await
            }
        },
    )
}

async fn set_displayname(
    store: &SqlStore,
    cache: &MemoizedAccessor<String, Option<Value>>,
    user_id: &str,
    name: &str,
) {
    let cache = cache.clone();
    let user_id = user_id.to_owned();
    let name = name.to_owned();
    store
        .runner()
        .run_interaction("set_displayname", move |txn| {
            SimpleTxn::update_one(
                txn,
                "profiles",
                &record([("user_id", user_id.clone())]),
                &record([("displayname", name.clone())]),
            )?;
            let cache = cache.clone();
            let user_id = user_id.clone();
            txn.call_after(move || cache.invalidate(&user_id));
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn write_path_invalidates_after_commit() {
    let store = profiles_store().await;
    let fetches = Arc::new(AtomicUsize::new(0));
    let names = displayname_accessor(&store, &fetches);

    let alice = "@alice:hs".to_owned();
    assert_eq!(names.get(alice.clone(), ()).await.unwrap(), Some(Value::Text("Alice".into())));
    assert_eq!(names.get(alice.clone(), ()).await.unwrap(), Some(Value::Text("Alice".into())));
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    let before = names.sequence();
    set_displayname(&store, &names, &alice, "Alice Liddell").await;
    assert_eq!(names.sequence(), before + 1);
    assert!(names.peek(&alice).is_none());

    assert_eq!(
        names.get(alice.clone(), ()).await.unwrap(),
        Some(Value::Text("Alice Liddell".into()))
    );
    assert_eq!(fetches.load(Ordering::SeqCst), 2);

    let snap = store.metrics().snapshot();
    assert_eq!(snap.caches["get_displayname"].hits, 1);
    assert_eq!(snap.caches["get_displayname"].misses, 2);
}

#[tokio::test]
async fn failed_write_leaves_cache_alone() {
    let store = profiles_store().await;
    let fetches = Arc::new(AtomicUsize::new(0));
    let names = displayname_accessor(&store, &fetches);
    let bob = "@bob:hs".to_owned();
    let _ = names.get(bob.clone(), ()).await.unwrap();
    let before = names.sequence();

    let cache = names.clone();
    let key = bob.clone();
    let err = store
        .runner()
        .run_interaction("set_displayname", move |txn| {
            let cache = cache.clone();
            let key = key.clone();
            txn.call_after(move || cache.invalidate(&key));
            SimpleTxn::update_one(
                txn,
                "profiles",
                &record([("user_id", "@nobody:hs".to_owned())]),
                &record([("displayname", "x".to_owned())]),
            )
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(names.sequence(), before);
    assert_eq!(names.peek(&bob), Some(Some(Value::Text("Bob".into()))));
}

#[tokio::test]
async fn batched_reads_share_the_single_key_cache() {
    let store = profiles_store().await;
    let fetches = Arc::new(AtomicUsize::new(0));
    let names = displayname_accessor(&store, &fetches);

    let reader = store.clone();
    let batches = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&batches);
    let many = BatchedMemoizedAccessor::new(&names, move |ids: Vec<String>, ()| {
        let reader = reader.clone();
        let _ = counted.fetch_add(1, Ordering::SeqCst);
        async move {
            let rows = reader
                .select_list("get_displaynames", "profiles", Record::new(), &["user_id", "displayname"])
                .await?;
            let found: HashMap<String, Option<Value>> = rows
                .into_iter()
                .filter_map(|row| match row.get("user_id") {
                    Some(Value::Text(id)) if ids.contains(id) => {
                        Some((id.clone(), row.get("displayname").cloned()))
                    }
                    _ => None,
                })
                .collect();
            Ok(found)
        }
    });

    let alice = "@alice:hs".to_owned();
    let bob = "@bob:hs".to_owned();
    let _ = names.get(alice.clone(), ()).await.unwrap();

    let got = many.get_many([alice.clone(), bob.clone(), bob.clone()], ()).await.unwrap();
    assert_eq!(got.len(), 2);
    assert_eq!(got[&bob], Some(Value::Text("Bob".into())));
    assert_eq!(batches.load(Ordering::SeqCst), 1);

    // The batch populated the single-key cache.
    assert_eq!(names.peek(&bob), Some(Some(Value::Text("Bob".into()))));

    let missing = many.get_many(["@carol:hs".to_owned()], ()).await.unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::NotFound);
    assert!(names.peek(&"@carol:hs".to_owned()).is_none());
}

#[tokio::test]
async fn insertion_order_capacity_two() {
    let mut settings = settings();
    let _ = settings
        .caches
        .per_cache
        .insert("numbers".into(), Capacity(2));
    let store = SqlStore::open(&settings, StorageMetrics::shared()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let numbers = store.memoized("numbers", EvictionPolicy::InsertionOrder, move |key: &'static str, ()| {
        let _ = counted.fetch_add(1, Ordering::SeqCst);
        async move { Ok(key.len()) }
    });

    numbers.prefill("a", 1);
    numbers.prefill("b", 2);
    numbers.prefill("c", 3);

    assert!(numbers.peek(&"a").is_none());
    assert_eq!(numbers.get("c", ()).await.unwrap(), 3);
    assert_eq!(numbers.len(), 2);
    // "a" misses and is fetched.
    assert_eq!(numbers.get("a", ()).await.unwrap(), 1);
    assert_eq!(store.metrics().cache("numbers").misses.get(), 1);
}
