use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::*;
use crate::command::{AggregateFlags, FindParams, IndexOptions, IndexSpec, MapReduceParams, UpdateParams};
use crate::connection::MemoryConnection;
use crate::error::ConnectionError;
use crate::operation::QueryStatus;
use crate::read_preference::ReadMode;
use mongodb::bson::{doc, Bson};
use tokio::sync::oneshot;

fn setup_with(config: Config) -> (Client, MemoryConnection, Collection) {
    let server = MemoryConnection::new();
    let client = Client::with_connection(Arc::new(server.clone()), config).unwrap();
    let collection = client.database("shop").unwrap().collection("orders").unwrap();
    (client, server, collection)
}

fn setup() -> (Client, MemoryConnection, Collection) {
    setup_with(Config::default())
}

/// Callback that forwards its result to a channel.
fn capture<T: Send + 'static>() -> (
    impl FnOnce(Result<T>, &Query) + Send + 'static,
    oneshot::Receiver<Result<T>>,
) {
    let (tx, rx) = oneshot::channel();
    let callback = move |result: Result<T>, _: &Query| {
        let _ = tx.send(result);
    };
    (callback, rx)
}

async fn insert_all(collection: &Collection, documents: Vec<Document>) -> WriteReply {
    let (callback, rx) = capture();
    collection.insert(documents, callback).unwrap();
    rx.await.unwrap().unwrap()
}

#[tokio::test]
async fn test_find_command_field_order() {
    let (_client, _server, collection) = setup();
    let params = FindParams::new(doc! { "status": "active" })
        .fields(["sku", "qty"])
        .skip(5)
        .limit(10)
        .sort(doc! { "qty": -1 });
    let (callback, rx) = capture();
    let query = collection.find(params, callback).unwrap();

    let keys: Vec<&str> = query.command().keys().map(String::as_str).collect();
    assert_eq!(keys, ["find", "filter", "projection", "skip", "limit", "sort"]);
    assert_eq!(query.operation(), "find");
    assert_eq!(query.command().get_document("projection").unwrap(), &doc! { "sku": 1, "qty": 1 });
    assert!(rx.await.unwrap().unwrap().is_empty());
}

#[tokio::test]
async fn test_callback_fires_exactly_once_on_success_and_failure() {
    let (_client, server, collection) = setup();
    let calls = Arc::new(AtomicUsize::new(0));

    let seen = calls.clone();
    let ok = collection
        .count(doc! {}, None, move |result, query| {
            assert_eq!(result.unwrap(), 0);
            assert_eq!(query.status(), QueryStatus::Completed);
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(ok.wait().await, QueryStatus::Completed);

    server.fail_next(CollectionError::command(13, "not authorized"));
    let seen = calls.clone();
    let failed = collection
        .count(doc! {}, None, move |result, _| {
            assert_eq!(result.unwrap_err().code(), Some(13));
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(failed.wait().await, QueryStatus::Failed);
    assert_eq!(failed.failure().and_then(|e| e.code()), Some(13));
    assert!(failed.completed_at().is_some());

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalid_arguments_fail_synchronously_without_callback() {
    let (_client, server, collection) = setup();
    let calls = Arc::new(AtomicUsize::new(0));

    let seen = calls.clone();
    let err = collection
        .insert(Vec::new(), move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap_err();
    assert!(matches!(err, CollectionError::InvalidArgument(_)));

    let seen = calls.clone();
    let err = collection
        .find(FindParams::new(doc! {}).limit(-1), move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap_err();
    assert!(matches!(err, CollectionError::InvalidArgument(_)));

    let seen = calls.clone();
    let err = collection
        .create_index(IndexSpec::new(doc! {}), move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap_err();
    assert!(matches!(err, CollectionError::InvalidArgument(_)));

    tokio::task::yield_now().await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(server.commands().is_empty());
}

#[tokio::test]
async fn test_count_matching_criteria() {
    let (_client, _server, collection) = setup();
    insert_all(
        &collection,
        vec![
            doc! { "status": "active" },
            doc! { "status": "inactive" },
            doc! { "status": "active" },
            doc! { "status": "pending" },
            doc! { "status": "active" },
        ],
    )
    .await;

    let (callback, rx) = capture();
    collection
        .count(doc! { "status": "active" }, None, callback)
        .unwrap();
    assert_eq!(rx.await.unwrap().unwrap(), 3);
}

#[tokio::test]
async fn test_unique_sparse_index_rejects_duplicates() {
    let (_client, server, collection) = setup();
    let spec = IndexSpec::new(doc! { "email": 1 }).options(IndexOptions::UNIQUE | IndexOptions::SPARSE);
    let (callback, rx) = capture();
    let query = collection.create_index(spec, callback).unwrap();
    rx.await.unwrap().unwrap();
    assert_eq!(
        query.command().get_array("indexes").unwrap()[0],
        Bson::Document(doc! { "key": { "email": 1 }, "name": "email_1", "unique": true, "sparse": true })
    );

    let reply = insert_all(
        &collection,
        vec![doc! { "email": "a@example.com" }, doc! { "name": "anonymous" }, doc! { "name": "guest" }],
    )
    .await;
    assert_eq!(reply.n, 3);
    assert_eq!(reply.inserted_ids.len(), 3);

    let (callback, rx) = capture();
    collection
        .insert(vec![doc! { "email": "a@example.com" }], callback)
        .unwrap();
    let err = rx.await.unwrap().unwrap_err();
    assert!(matches!(err, CollectionError::Command(_)));
    assert!(err.is_duplicate_key());
    assert_eq!(server.documents("shop", "orders").len(), 3);
}

#[tokio::test]
async fn test_insert_assigns_ids_before_building_command() {
    let (_client, server, collection) = setup();
    let (callback, rx) = capture();
    let query = collection
        .insert(vec![doc! { "sku": "a" }, doc! { "_id": 9, "sku": "b" }], callback)
        .unwrap();

    let sent = query.command().get_array("documents").unwrap();
    let Bson::Document(first) = &sent[0] else {
        panic!("expected a document");
    };
    assert!(matches!(first.get("_id"), Some(Bson::ObjectId(_))));

    let reply = rx.await.unwrap().unwrap();
    assert_eq!(reply.inserted_ids[0], first.get("_id").cloned().unwrap());
    assert_eq!(reply.inserted_ids[1], Bson::Int32(9));
    assert_eq!(server.documents("shop", "orders")[0], first.clone());
}

#[tokio::test]
async fn test_cursor_close_mid_iteration() {
    let (_client, server, collection) = setup();
    insert_all(&collection, (0..10).map(|i| doc! { "i": i }).collect()).await;

    let mut cursor = collection
        .cursor(doc! {}, &[], 0, 0, doc! { "i": 1 })
        .unwrap()
        .batch_size(3);
    assert_eq!(cursor.next().await.unwrap().unwrap().get_i32("i").unwrap(), 0);
    assert!(cursor.cursor_id().is_some());

    cursor.close().await.unwrap();
    assert!(server.command_names().contains(&"killCursors".to_string()));
    assert!(cursor.next().await.unwrap().is_none());
    assert_eq!(server.open_cursors(), 0);
}

#[tokio::test]
async fn test_cursor_yields_all_documents_across_batch_sizes() {
    const N: i32 = 12;
    for batch_size in [1_u32, (N / 2) as u32, N as u32, (2 * N) as u32] {
        let (_client, _server, collection) = setup();
        insert_all(&collection, (0..N).map(|i| doc! { "i": i }).collect()).await;

        let mut cursor = collection
            .cursor(doc! {}, &["i"], 0, 0, doc! { "i": 1 })
            .unwrap()
            .batch_size(batch_size);
        let order: Vec<i32> = cursor
            .collect_all()
            .await
            .unwrap()
            .iter()
            .map(|d| d.get_i32("i").unwrap())
            .collect();
        assert_eq!(order, (0..N).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn test_read_preference_resolution() {
    let (_client, _server, collection) = setup();
    let collection = collection.with_read_preference(ReadPreference::secondary());

    let (callback, _rx) = capture::<i64>();
    let defaulted = collection.count(doc! {}, None, callback).unwrap();
    assert_eq!(defaulted.read_preference().mode, ReadMode::Secondary);

    let (callback, _rx) = capture::<i64>();
    let nearest = ReadPreference::nearest();
    let overridden = collection.count(doc! {}, Some(&nearest), callback).unwrap();
    assert_eq!(overridden.read_preference().mode, ReadMode::Nearest);

    let (callback, _rx) = capture::<WriteReply>();
    let write = collection.remove(doc! {}, callback).unwrap();
    assert_eq!(write.read_preference().mode, ReadMode::Primary);

    let mut plain = collection.clone();
    plain.set_read_preference(None);
    let (callback, _rx) = capture::<Document>();
    let stats = plain.stats(callback).unwrap();
    assert_eq!(stats.read_preference().mode, ReadMode::Primary);
}

#[tokio::test]
async fn test_configured_default_read_preference() {
    let mut config = Config::default();
    config.read_preference = Some(ReadPreference::nearest());
    let (_client, _server, collection) = setup_with(config);
    assert_eq!(collection.read_preference().map(|rp| rp.mode), Some(ReadMode::Nearest));
}

#[tokio::test]
async fn test_update_save_and_remove() {
    let (_client, server, collection) = setup();
    insert_all(
        &collection,
        vec![doc! { "_id": 1, "qty": 1 }, doc! { "_id": 2, "qty": 5 }],
    )
    .await;

    let (callback, rx) = capture();
    collection
        .update(
            UpdateParams::new(doc! { "qty": { "$lt": 10 } }, doc! { "$inc": { "qty": 1 } }).multi(true),
            callback,
        )
        .unwrap();
    let reply = rx.await.unwrap().unwrap();
    assert_eq!((reply.n, reply.n_modified), (2, 2));

    let (callback, rx) = capture();
    collection.save(doc! { "_id": 3, "qty": 0 }, callback).unwrap();
    let reply = rx.await.unwrap().unwrap();
    assert_eq!(reply.upserted.len(), 1);
    assert_eq!(reply.upserted[0].id, Bson::Int32(3));

    let (callback, rx) = capture();
    collection.save(doc! { "_id": 1, "qty": 100 }, callback).unwrap();
    let reply = rx.await.unwrap().unwrap();
    assert_eq!(reply.n_modified, 1);
    assert!(server
        .documents("shop", "orders")
        .contains(&doc! { "_id": 1, "qty": 100 }));

    let (callback, rx) = capture();
    collection.save(doc! { "qty": 7 }, callback).unwrap();
    assert_eq!(rx.await.unwrap().unwrap().inserted_ids.len(), 1);

    let (callback, rx) = capture();
    collection.remove(doc! { "qty": { "$gte": 7 } }, callback).unwrap();
    assert_eq!(rx.await.unwrap().unwrap().n, 2);
    assert_eq!(server.documents("shop", "orders").len(), 2);
}

#[tokio::test]
async fn test_index_management() {
    let (_client, _server, collection) = setup();
    insert_all(&collection, vec![doc! { "a": 1, "b": 2 }]).await;

    let (callback, rx) = capture();
    let query = collection
        .create_index(IndexSpec::new(doc! { "a": 1, "b": -1 }), callback)
        .unwrap();
    rx.await.unwrap().unwrap();
    assert_eq!(query.operation(), "createIndex");

    let (callback, rx) = capture();
    collection.index_list(callback).unwrap();
    let names: Vec<String> = rx
        .await
        .unwrap()
        .unwrap()
        .iter()
        .map(|d| d.get_str("name").unwrap().to_string())
        .collect();
    assert_eq!(names, ["_id_", "a_1_b_-1"]);

    let (callback, rx) = capture();
    collection.drop_index("a_1_b_-1", callback).unwrap();
    rx.await.unwrap().unwrap();

    let (callback, rx) = capture();
    collection.drop_index("a_1_b_-1", callback).unwrap();
    assert_eq!(rx.await.unwrap().unwrap_err().code(), Some(27));
}

#[tokio::test]
async fn test_aggregate_outputs() {
    let (_client, _server, collection) = setup();
    insert_all(&collection, (0..5).map(|i| doc! { "i": i }).collect()).await;

    let flags = AggregateFlags {
        batch_size: Some(2),
        ..AggregateFlags::default()
    };
    let (callback, rx) = capture();
    collection
        .aggregate(
            vec![doc! { "$match": { "i": { "$gte": 2 } } }, doc! { "$sort": { "i": -1 } }],
            flags,
            doc! {},
            None,
            callback,
        )
        .unwrap();
    let mut cursor = rx.await.unwrap().unwrap().into_cursor().unwrap();
    assert_eq!(cursor.buffered(), 2);
    let order: Vec<i32> = cursor
        .collect_all()
        .await
        .unwrap()
        .iter()
        .map(|d| d.get_i32("i").unwrap())
        .collect();
    assert_eq!(order, [4, 3, 2]);

    let explain = AggregateFlags {
        explain: true,
        ..AggregateFlags::default()
    };
    let (callback, rx) = capture();
    collection
        .aggregate(vec![doc! { "$limit": 1 }], explain, doc! {}, None, callback)
        .unwrap();
    let reply = rx.await.unwrap().unwrap().into_reply().unwrap();
    assert!(reply.contains_key("stages"));

    let (callback, _rx) = capture::<AggregateOutput>();
    let err = collection
        .aggregate(vec![doc! { "i": 1 }], AggregateFlags::default(), doc! {}, None, callback)
        .unwrap_err();
    assert!(matches!(err, CollectionError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_rename_stats_drop_and_commands() {
    let (client, server, collection) = setup();
    insert_all(&collection, vec![doc! { "a": 1 }, doc! { "a": 2 }]).await;

    let (callback, rx) = capture();
    let stats = collection.stats(callback).unwrap();
    assert_eq!(stats.command(), &doc! { "collStats": "orders" });
    assert_eq!(rx.await.unwrap().unwrap().get_i64("count").unwrap(), 2);

    let (callback, rx) = capture();
    let rename = collection.rename("shop", "archive", callback).unwrap();
    rx.await.unwrap().unwrap();
    assert_eq!(server.commands().last().map(|(db, _)| db.as_str()), Some("admin"));
    assert_eq!(rename.command().get_str("to").unwrap(), "shop.archive");

    let archive = client.database("shop").unwrap().collection("archive").unwrap();
    let (callback, rx) = capture();
    archive.drop(callback).unwrap();
    rx.await.unwrap().unwrap();

    let (callback, rx) = capture();
    collection.drop(callback).unwrap();
    assert_eq!(rx.await.unwrap().unwrap_err().code(), Some(26));

    let (callback, rx) = capture();
    collection.command_simple(doc! { "ping": 1 }, None, callback).unwrap();
    assert_eq!(rx.await.unwrap().unwrap().get_f64("ok").unwrap(), 1.0);

    let (callback, rx) = capture();
    collection
        .map_reduce(MapReduceParams::new("function() {}", "function(k, v) {}"), None, callback)
        .unwrap();
    assert_eq!(rx.await.unwrap().unwrap_err().code(), Some(115));
}

#[tokio::test]
async fn test_shutdown_fails_pending_and_later_operations() {
    let (client, server, collection) = setup();
    server.set_latency(Some(Duration::from_secs(30)));

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let pending = collection
        .count(doc! {}, None, move |result, _| {
            assert!(result.unwrap_err().is_closed());
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let cursor_collection = collection.clone();

    client.shutdown().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(pending.status(), QueryStatus::Failed);
    assert!(client.is_shut_down());

    let (callback, rx) = capture();
    let late = collection.count(doc! {}, None, callback).unwrap();
    assert!(rx.await.unwrap().unwrap_err().is_closed());
    assert_eq!(late.status(), QueryStatus::Failed);

    assert!(cursor_collection
        .cursor(doc! {}, &[], 0, 0, doc! {})
        .unwrap_err()
        .is_closed());

    client.shutdown().await;
}

#[tokio::test]
async fn test_open_cursor_reports_teardown_once() {
    let (client, _server, collection) = setup();
    insert_all(&collection, (0..4).map(|i| doc! { "i": i }).collect()).await;
    let mut cursor = collection.cursor(doc! {}, &[], 0, 0, doc! {}).unwrap().batch_size(1);
    cursor.next().await.unwrap();

    client.shutdown().await;
    assert!(cursor.next().await.unwrap_err().is_closed());
    assert!(cursor.next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_dropped_client_fails_inline() {
    let (client, server, collection) = setup();
    drop(client);

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let query = collection
        .count(doc! {}, None, move |result, _| {
            assert!(result.unwrap_err().is_closed());
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(query.status(), QueryStatus::Failed);
    assert!(collection.client().is_none());
    assert!(server.commands().is_empty());
}

#[tokio::test]
async fn test_attach_comment() {
    let mut config = Config::default();
    config.operation.attach_comment = true;
    config.operation.client_id = "tester".to_string();
    let (_client, _server, collection) = setup_with(config);

    let (callback, rx) = capture();
    let query = collection.count(doc! {}, None, callback).unwrap();
    let comment = query.command().get_str("comment").unwrap();
    assert_eq!(comment, format!("mongo-collection-tester-{}", query.id()));
    rx.await.unwrap().unwrap();
}

#[test]
fn test_client_requires_runtime() {
    let err = Client::with_connection(Arc::new(MemoryConnection::new()), Config::default()).unwrap_err();
    assert!(matches!(err, CollectionError::Connection(ConnectionError::NoRuntime)));
}

#[tokio::test]
async fn test_names() {
    let (client, _server, collection) = setup();
    assert_eq!(collection.name(), "orders");
    assert_eq!(collection.absolute_name(), "shop.orders");
    assert_eq!(collection.database().name(), "shop");
    assert!(client.database("bad.name").is_err());
    assert!(collection.database().collection("").is_err());
    assert!(collection.database().collection("$cmd").is_err());
}
