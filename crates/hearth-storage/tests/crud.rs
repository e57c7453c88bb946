//! CRUD helpers end to end through a file-backed store.

use assert_matches::assert_matches;
use hearth_settings::{HearthSettings, Millis};
use hearth_storage::{ErrorKind, Record, SqlStore, StorageError, StorageMetrics, record};
use rusqlite::types::Value;
use tempfile::TempDir;

async fn open_store() -> (SqlStore, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = HearthSettings::default();
    settings.database.path = dir.path().join("homeserver.db").to_string_lossy().into_owned();
    settings.database.pool_size = 2;
    settings.transactions.retry_base_delay = Millis(1);

    let store = SqlStore::open(&settings, StorageMetrics::shared()).unwrap();
    store
        .runner()
        .run_with_connection("create_tables", |conn| {
            conn.execute_batch(
                "CREATE TABLE room_memberships (
                     id INTEGER PRIMARY KEY,
                     room_id TEXT NOT NULL,
                     user_id TEXT NOT NULL,
                     membership TEXT NOT NULL,
                     joined_at INTEGER
                 );",
            )?;
            Ok(())
        })
        .await
        .unwrap();
    (store, dir)
}

fn text(s: &str) -> Value {
    Value::Text(s.to_owned())
}

fn membership(id: i64, room: &str, user: &str) -> Record {
    record([
        ("id", Value::Integer(id)),
        ("room_id", text(room)),
        ("user_id", text(user)),
        ("membership", text("join")),
    ])
}

#[tokio::test]
async fn upsert_inserts_defaults_only_when_absent() {
    let (store, _dir) = open_store().await;
    let key = record([("room_id", text("!r:hs")), ("user_id", text("@a:hs"))]);

    let inserted = store
        .upsert(
            "update_membership",
            "room_memberships",
            key.clone(),
            record([("membership", text("invite"))]),
            record([("joined_at", Value::Integer(100))]),
            None,
        )
        .await
        .unwrap();
    assert!(inserted);

    let inserted = store
        .upsert(
            "update_membership",
            "room_memberships",
            key.clone(),
            record([("membership", text("join"))]),
            record([("joined_at", Value::Integer(999))]),
            Some(true),
        )
        .await
        .unwrap();
    assert!(!inserted);

    let row = store
        .select_one(
            "get_membership",
            "room_memberships",
            key,
            &["membership", "joined_at"],
            false,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row["membership"], text("join"));
    assert_eq!(row["joined_at"], Value::Integer(100));
}

#[tokio::test]
async fn select_one_not_found_and_duplicates() {
    let (store, _dir) = open_store().await;
    let by_room = record([("room_id", text("!r:hs"))]);

    let err = store
        .select_one("get_member", "room_memberships", by_room.clone(), &["user_id"], false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    store
        .insert_many(
            "store_members",
            "room_memberships",
            vec![membership(1, "!r:hs", "@a:hs"), membership(2, "!r:hs", "@b:hs")],
        )
        .await
        .unwrap();

    let err = store
        .select_one("get_member", "room_memberships", by_room, &["user_id"], true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Consistency);
    assert_matches!(err.root(), StorageError::Consistency(_));
}

#[tokio::test]
async fn delete_one_rolls_back_when_more_than_one_row_matches() {
    let (store, _dir) = open_store().await;
    store
        .insert_many(
            "store_members",
            "room_memberships",
            vec![membership(1, "!r:hs", "@a:hs"), membership(2, "!r:hs", "@b:hs")],
        )
        .await
        .unwrap();

    let err = store
        .delete_one("forget_room", "room_memberships", record([("room_id", text("!r:hs"))]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Consistency);

    let left = store
        .select_list("list", "room_memberships", Record::new(), &["id"])
        .await
        .unwrap();
    assert_eq!(left.len(), 2);

    let deleted = store
        .delete("forget_room", "room_memberships", record([("room_id", text("!r:hs"))]))
        .await
        .unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(store.max_id("max_id", "room_memberships").await.unwrap(), 0);
}

#[tokio::test]
async fn insert_many_with_mixed_columns_writes_nothing() {
    let (store, _dir) = open_store().await;
    let mut odd = membership(2, "!r:hs", "@b:hs");
    let _ = odd.insert("joined_at".into(), Value::Integer(5));

    let err = store
        .insert_many(
            "store_members",
            "room_memberships",
            vec![membership(1, "!r:hs", "@a:hs"), odd],
        )
        .await
        .unwrap_err();
    assert_matches!(err.root(), StorageError::InvalidArgument(_));
    assert_eq!(store.metrics().outcomes().retries.get(), 0);

    let ids = store
        .select_onecol("ids", "room_memberships", Record::new(), "id")
        .await
        .unwrap();
    assert!(ids.is_empty());
}

#[tokio::test]
async fn select_update_one_swaps_atomically() {
    let (store, _dir) = open_store().await;
    store
        .insert("store_member", "room_memberships", membership(7, "!r:hs", "@a:hs"))
        .await
        .unwrap();

    let previous = store
        .select_update_one(
            "leave_room",
            "room_memberships",
            record([("id", 7)]),
            record([("membership", text("leave"))]),
            &["membership"],
            false,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(previous["membership"], text("join"));

    store
        .update_one(
            "rejoin",
            "room_memberships",
            record([("id", 7)]),
            record([("membership", text("join"))]),
        )
        .await
        .unwrap();
    assert_eq!(store.max_id("max_id", "room_memberships").await.unwrap(), 7);

    let statements = store.metrics().snapshot().statements;
    assert!(statements.contains_key("UPDATE"));
    assert!(statements.contains_key("SELECT"));
}
