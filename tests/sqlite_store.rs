// Integration tests for the SQLite-backed store

mod common;

use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;

use common::{add_profile, row_id, setup_logging};
use parley::store::{make_row, ChangeKind, EventFilter, Filter, Join, Query, RemoteStore, Table};
use parley::sync::conversations::{create_or_get, fetch_conversations};
use parley::sync::messages::{list_messages, send_message, NewMessage};
use parley::sync::receipts::{mark_read, status_of, StatusPolicy};
use parley::{DeliveryStatus, SqliteStore, StoreError};

#[tokio::test]
async fn test_rows_survive_reopen() {
    setup_logging();
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("parley.db");

    let ann = {
        let store = SqliteStore::open(&path).unwrap();
        add_profile(&store, "ann", "Ann").await
    };

    let store = SqliteStore::open(&path).unwrap();
    let rows = store
        .query(&Query::table(Table::Profiles).filter(Filter::eq("id", ann.to_string())))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["full_name"], json!("Ann"));
    assert_eq!(rows[0]["is_online"], json!(false));
}

#[tokio::test]
async fn test_filters_order_and_limit() {
    setup_logging();
    let store = SqliteStore::open_in_memory().unwrap();
    for (name, online) in [("cy", true), ("al", false), ("bo", true)] {
        store
            .insert(
                Table::Profiles,
                make_row([
                    ("username", json!(name)),
                    ("full_name", json!(name.to_uppercase())),
                    ("is_online", json!(online)),
                ]),
            )
            .await
            .unwrap();
    }

    let online = store
        .query(
            &Query::table(Table::Profiles)
                .filter(Filter::eq("is_online", true))
                .order_by("username", true),
        )
        .await
        .unwrap();
    let names: Vec<_> = online.iter().map(|r| r["username"].clone()).collect();
    assert_eq!(names, vec![json!("bo"), json!("cy")]);

    let first = store
        .query(&Query::table(Table::Profiles).order_by("username", false).limit(1))
        .await
        .unwrap();
    assert_eq!(first[0]["username"], json!("cy"));

    let none = store
        .query(&Query::table(Table::Profiles).filter(Filter::in_list::<String>("username", Vec::new())))
        .await
        .unwrap();
    assert!(none.is_empty());

    let nulls = store
        .query(&Query::table(Table::Profiles).filter(Filter::is_null("last_seen")))
        .await
        .unwrap();
    assert_eq!(nulls.len(), 3);
}

#[tokio::test]
async fn test_unique_status_key_and_events() {
    setup_logging();
    let store = SqliteStore::open_in_memory().unwrap();
    let mut sub = store.subscribe(Table::MessageStatus, EventFilter::All, None);
    let status = make_row([("message_id", json!("m")), ("user_id", json!("u"))]);

    store.insert(Table::MessageStatus, status.clone()).await.unwrap();
    let err = store.insert(Table::MessageStatus, status).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }));

    let updated = store
        .update(
            Table::MessageStatus,
            &[Filter::eq("message_id", "m")],
            make_row([("status", json!("read"))]),
        )
        .await
        .unwrap();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0]["status"], json!("read"));

    let kinds: Vec<ChangeKind> = std::iter::from_fn(|| sub.events.try_recv().ok()).map(|e| e.kind).collect();
    assert_eq!(kinds, vec![ChangeKind::Insert, ChangeKind::Update]);

    store.unsubscribe(sub.id);
    assert_eq!(store.subscriber_count(), 0);
}

#[tokio::test]
async fn test_joins_and_distinct_on() {
    setup_logging();
    let store = SqliteStore::open_in_memory().unwrap();
    let author = add_profile(&store, "ann", "Ann").await;
    for (conversation, content, at) in [
        ("c1", "old", "2024-01-01T00:00:01.000000Z"),
        ("c1", "new", "2024-01-01T00:00:03.000000Z"),
        ("c2", "only", "2024-01-01T00:00:02.000000Z"),
    ] {
        store
            .insert(
                Table::Messages,
                make_row([
                    ("conversation_id", json!(conversation)),
                    ("sender_id", json!(author.to_string())),
                    ("content", json!(content)),
                    ("created_at", json!(at)),
                ]),
            )
            .await
            .unwrap();
    }

    let latest = store
        .query(
            &Query::table(Table::Messages)
                .order_by("created_at", false)
                .distinct_on("conversation_id")
                .join(Join::one("sender", Table::Profiles, "sender_id", "id")),
        )
        .await
        .unwrap();

    assert_eq!(latest.len(), 2);
    assert_eq!(latest[0]["content"], json!("new"));
    assert_eq!(latest[1]["content"], json!("only"));
    assert_eq!(latest[0]["sender"]["username"], json!("ann"));
    assert_eq!(row_id(latest[0]["sender"].as_object().unwrap()), author);
}

#[tokio::test]
async fn test_chat_flow_on_sqlite() {
    setup_logging();
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("chat.db")).unwrap());
    let alice = add_profile(&*store, "alice", "Alice").await;
    let bob = add_profile(&*store, "bob", "Bob").await;

    let conversation = create_or_get(&*store, alice, bob).await.unwrap();
    assert_eq!(create_or_get(&*store, bob, alice).await.unwrap().id, conversation.id);

    let sent = send_message(&*store, alice, conversation.id, NewMessage::text("hi"))
        .await
        .unwrap();
    mark_read(&*store, StatusPolicy::Monotonic, sent.id(), bob).await.unwrap();
    assert_eq!(status_of(&*store, sent.id(), bob).await.unwrap(), DeliveryStatus::Read);

    let timeline = list_messages(&*store, conversation.id).await.unwrap();
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].status_for(bob), DeliveryStatus::Read);
    assert_eq!(timeline[0].sender.as_ref().map(|p| p.username.as_str()), Some("alice"));

    let summaries = fetch_conversations(&*store, bob).await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].participants.len(), 2);
    assert_eq!(
        summaries[0].last_message.as_ref().map(|m| m.message.content.as_str()),
        Some("hi")
    );
}
