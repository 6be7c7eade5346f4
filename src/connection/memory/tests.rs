use super::*;
use crate::connection::{BatchHints, CursorReply};

fn run(server: &MemoryConnection, database: &str, command: Document) -> Result<Document> {
    let rp = ReadPreference::primary();
    tokio_test::block_on(server.submit_command(database, command, &rp))
}

fn seeded(n: i32) -> MemoryConnection {
    let server = MemoryConnection::new();
    let docs: Vec<Document> = (0..n).map(|i| doc! { "_id": i, "v": i }).collect();
    run(&server, "db", doc! { "insert": "c", "documents": docs }).unwrap();
    server
}

#[test]
fn test_insert_assigns_ids_and_counts() {
    let server = MemoryConnection::new();
    let reply = run(
        &server,
        "db",
        doc! { "insert": "c", "documents": [ { "a": 1 }, { "a": 2 } ] },
    )
    .unwrap();
    assert_eq!(reply.get_i32("n").unwrap(), 2);

    let stored = server.documents("db", "c");
    assert_eq!(stored.len(), 2);
    assert!(matches!(stored[0].get("_id"), Some(Bson::ObjectId(_))));
    assert_eq!(stored[0].keys().next().map(String::as_str), Some("_id"));
}

#[test]
fn test_duplicate_id_reports_write_error() {
    let server = seeded(1);
    let reply = run(
        &server,
        "db",
        doc! { "insert": "c", "documents": [ { "_id": 5 }, { "_id": 0 }, { "_id": 6 } ] },
    )
    .unwrap();
    assert_eq!(reply.get_i32("n").unwrap(), 1);

    let errors = reply.get_array("writeErrors").unwrap();
    let Bson::Document(first) = &errors[0] else {
        panic!("write error should be a document");
    };
    assert_eq!(first.get_i32("code").unwrap(), 11000);
    assert_eq!(first.get_i32("index").unwrap(), 1);
    assert!(first.get_str("errmsg").unwrap().contains("index: _id_"));
}

#[test]
fn test_find_batches_and_get_more() {
    let server = seeded(5);
    let reply = run(&server, "db", doc! { "find": "c", "batchSize": 2 }).unwrap();
    let first = CursorReply::parse(&reply, "firstBatch").unwrap();
    assert_eq!(first.documents.len(), 2);
    assert_ne!(first.id, 0);
    assert_eq!(server.open_cursors(), 1);

    let more = run(
        &server,
        "db",
        doc! { "getMore": first.id, "collection": "c", "batchSize": 10 },
    )
    .unwrap();
    let next = CursorReply::parse(&more, "nextBatch").unwrap();
    assert_eq!(next.documents.len(), 3);
    assert_eq!(next.id, 0);
    assert_eq!(server.open_cursors(), 0);

    let gone = run(&server, "db", doc! { "getMore": first.id, "collection": "c" });
    assert_eq!(gone.unwrap_err().code(), Some(43));
}

#[test]
fn test_find_filter_sort_skip_limit_projection() {
    let server = seeded(6);
    let reply = run(
        &server,
        "db",
        doc! {
            "find": "c",
            "filter": { "v": { "$gte": 1 } },
            "sort": { "v": -1 },
            "projection": { "v": 1, "_id": 0 },
            "skip": 1,
            "limit": 2,
        },
    )
    .unwrap();
    let batch = CursorReply::parse(&reply, "firstBatch").unwrap();
    assert_eq!(batch.documents, vec![doc! { "v": 4 }, doc! { "v": 3 }]);
    assert_eq!(batch.id, 0);
}

#[test]
fn test_kill_cursors() {
    let server = seeded(3);
    let reply = run(&server, "db", doc! { "find": "c", "batchSize": 1 }).unwrap();
    let id = CursorReply::parse(&reply, "firstBatch").unwrap().id;

    let killed = run(
        &server,
        "db",
        doc! { "killCursors": "c", "cursors": [id, 999_i64] },
    )
    .unwrap();
    assert_eq!(killed.get_array("cursorsKilled").unwrap(), &vec![Bson::Int64(id)]);
    assert_eq!(killed.get_array("cursorsNotFound").unwrap(), &vec![Bson::Int64(999)]);
    assert_eq!(server.open_cursors(), 0);
}

#[test]
fn test_update_multi_and_upsert() {
    let server = seeded(4);
    let reply = run(
        &server,
        "db",
        doc! { "update": "c", "updates": [
            { "q": { "v": { "$lt": 2 } }, "u": { "$set": { "low": true } }, "multi": true },
            { "q": { "_id": 42 }, "u": { "$set": { "v": 42 } }, "upsert": true },
        ] },
    )
    .unwrap();
    assert_eq!(reply.get_i32("n").unwrap(), 3);
    assert_eq!(reply.get_i32("nModified").unwrap(), 2);

    let upserted = reply.get_array("upserted").unwrap();
    assert_eq!(upserted[0], Bson::Document(doc! { "index": 1, "_id": 42 }));
    assert!(server
        .documents("db", "c")
        .contains(&doc! { "_id": 42, "v": 42 }));
}

#[test]
fn test_delete_one_and_all() {
    let server = seeded(4);
    let one = run(
        &server,
        "db",
        doc! { "delete": "c", "deletes": [ { "q": {}, "limit": 1 } ] },
    )
    .unwrap();
    assert_eq!(one.get_i32("n").unwrap(), 1);

    let rest = run(
        &server,
        "db",
        doc! { "delete": "c", "deletes": [ { "q": {}, "limit": 0 } ] },
    )
    .unwrap();
    assert_eq!(rest.get_i32("n").unwrap(), 3);
    assert!(server.documents("db", "c").is_empty());
}

#[test]
fn test_unique_sparse_index() {
    let server = MemoryConnection::new();
    run(
        &server,
        "db",
        doc! { "createIndexes": "c", "indexes": [
            { "key": { "email": 1 }, "name": "email_1", "unique": true, "sparse": true },
        ] },
    )
    .unwrap();

    let reply = run(
        &server,
        "db",
        doc! { "insert": "c", "documents": [
            { "email": "a@x" }, { "name": "no email" }, { "name": "also none" },
        ] },
    )
    .unwrap();
    assert_eq!(reply.get_i32("n").unwrap(), 3);
    assert!(!reply.contains_key("writeErrors"));

    let dup = run(
        &server,
        "db",
        doc! { "insert": "c", "documents": [ { "email": "a@x" } ] },
    )
    .unwrap();
    assert!(dup.contains_key("writeErrors"));
}

#[test]
fn test_create_index_on_existing_duplicates_fails() {
    let server = MemoryConnection::new();
    run(
        &server,
        "db",
        doc! { "insert": "c", "documents": [ { "k": 1 }, { "k": 1 } ] },
    )
    .unwrap();
    let err = run(
        &server,
        "db",
        doc! { "createIndexes": "c", "indexes": [ { "key": { "k": 1 }, "name": "k_1", "unique": true } ] },
    )
    .unwrap_err();
    assert!(err.is_duplicate_key());
}

#[test]
fn test_index_listing_and_dropping() {
    let server = seeded(1);
    run(
        &server,
        "db",
        doc! { "createIndexes": "c", "indexes": [ { "key": { "v": -1 }, "name": "v_-1" } ] },
    )
    .unwrap();

    let listed = run(&server, "db", doc! { "listIndexes": "c", "cursor": {} }).unwrap();
    let names: Vec<String> = CursorReply::parse(&listed, "firstBatch")
        .unwrap()
        .documents
        .iter()
        .map(|d| d.get_str("name").unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["_id_", "v_-1"]);

    run(&server, "db", doc! { "dropIndexes": "c", "index": "v_-1" }).unwrap();
    let missing = run(&server, "db", doc! { "dropIndexes": "c", "index": "v_-1" });
    assert_eq!(missing.unwrap_err().code(), Some(27));
}

#[test]
fn test_aggregate_pipeline() {
    let server = seeded(10);
    let reply = run(
        &server,
        "db",
        doc! {
            "aggregate": "c",
            "pipeline": [ { "$match": { "v": { "$gte": 5 } } }, { "$count": "total" } ],
            "cursor": {},
        },
    )
    .unwrap();
    let batch = CursorReply::parse(&reply, "firstBatch").unwrap();
    assert_eq!(batch.documents, vec![doc! { "total": 5 }]);

    let inline = run(
        &server,
        "db",
        doc! { "aggregate": "c", "pipeline": [ { "$limit": 2 } ] },
    )
    .unwrap();
    assert_eq!(inline.get_array("result").unwrap().len(), 2);

    let unknown = run(
        &server,
        "db",
        doc! { "aggregate": "c", "pipeline": [ { "$bogus": {} } ], "cursor": {} },
    );
    assert_eq!(unknown.unwrap_err().code(), Some(40324));
}

#[test]
fn test_rename_and_drop() {
    let server = seeded(2);
    let wrong_db = run(
        &server,
        "db",
        doc! { "renameCollection": "db.c", "to": "db.d" },
    );
    assert_eq!(wrong_db.unwrap_err().code(), Some(13));

    run(
        &server,
        "admin",
        doc! { "renameCollection": "db.c", "to": "db.d", "dropTarget": false },
    )
    .unwrap();
    assert!(server.documents("db", "c").is_empty());
    assert_eq!(server.documents("db", "d").len(), 2);

    let dropped = run(&server, "db", doc! { "drop": "d" }).unwrap();
    assert_eq!(dropped.get_i32("nIndexesWas").unwrap(), 1);
    let again = run(&server, "db", doc! { "drop": "d" });
    assert_eq!(again.unwrap_err().code(), Some(26));
}

#[test]
fn test_stats_and_unknown_commands() {
    let server = seeded(3);
    let stats = run(&server, "db", doc! { "collStats": "c" }).unwrap();
    assert_eq!(stats.get_str("ns").unwrap(), "db.c");
    assert_eq!(stats.get_i64("count").unwrap(), 3);

    assert_eq!(
        run(&server, "db", doc! { "mapReduce": "c" }).unwrap_err().code(),
        Some(115)
    );
    assert_eq!(
        run(&server, "db", doc! { "frobnicate": 1 }).unwrap_err().code(),
        Some(59)
    );
}

#[test]
fn test_hooks() {
    let server = MemoryConnection::new();
    server.fail_next(CollectionError::command(2, "boom"));
    assert!(run(&server, "db", doc! { "ping": 1 }).is_err());
    assert!(run(&server, "db", doc! { "ping": 1 }).is_ok());
    assert_eq!(server.command_names(), vec!["ping", "ping"]);
}

#[test]
fn test_provided_cursor_methods() {
    let server = seeded(5);
    tokio_test::block_on(async {
        let ns = Namespace::new("db", "c").unwrap();
        let rp = ReadPreference::primary();
        let (handle, first) = server
            .open_cursor(&ns, doc! { "find": "c" }, BatchHints { batch_size: 2 }, &rp)
            .await
            .unwrap();
        assert_eq!(first.documents.len(), 2);
        assert!(first.more_available);

        let second = server
            .fetch_more(&handle, BatchHints { batch_size: 2 })
            .await
            .unwrap();
        assert_eq!(second.documents.len(), 2);

        server.close_cursor(&handle).await.unwrap();
        assert_eq!(server.open_cursors(), 0);
        assert_eq!(
            server.command_names(),
            vec!["insert", "find", "getMore", "killCursors"]
        );
    });
}
