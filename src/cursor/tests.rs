use super::*;
use crate::connection::MemoryConnection;
use futures::StreamExt;
use mongodb::bson::doc;
use serde::Deserialize;
use std::time::Duration;

async fn seeded(n: i32) -> MemoryConnection {
    let server = MemoryConnection::new();
    let docs: Vec<Document> = (0..n).map(|i| doc! { "_id": i, "n": i }).collect();
    server
        .submit_command(
            "db",
            doc! { "insert": "items", "documents": docs },
            &ReadPreference::primary(),
        )
        .await
        .unwrap();
    server
}

fn context(server: &MemoryConnection, batch_size: u32) -> CursorContext {
    CursorContext {
        connection: Arc::new(server.clone()),
        runtime: Handle::current(),
        teardown: CancellationToken::new(),
        tracker: TaskTracker::new(),
        batch_size,
        max_batch_size: 1000,
    }
}

fn find_cursor(context: CursorContext) -> Cursor {
    Cursor::lazy(
        context,
        Namespace::new("db", "items").unwrap(),
        doc! { "find": "items", "filter": {}, "sort": { "n": 1 } },
        ReadPreference::primary(),
    )
}

fn count_named(server: &MemoryConnection, name: &str) -> usize {
    server.command_names().iter().filter(|n| *n == name).count()
}

#[tokio::test]
async fn test_yields_every_document_for_any_batch_size() {
    const N: i32 = 10;
    for batch_size in [1_u32, 5, 10, 20] {
        let server = seeded(N).await;
        let mut cursor = find_cursor(context(&server, batch_size));

        let mut seen = Vec::new();
        while let Some(document) = cursor.next().await.unwrap() {
            assert!(cursor.buffered() < batch_size as usize);
            seen.push(document.get_i32("n").unwrap());
        }

        assert_eq!(seen, (0..N).collect::<Vec<_>>(), "batch size {batch_size}");
        assert!(cursor.is_exhausted());
        assert_eq!(cursor.documents_returned(), N as u64);
        let expected_get_mores = (N as usize).div_ceil(batch_size as usize) - 1;
        assert_eq!(count_named(&server, "getMore"), expected_get_mores);
        assert_eq!(server.open_cursors(), 0);
        assert!(cursor.next().await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_find_cursor_is_lazy() {
    let server = seeded(3).await;
    let mut cursor = find_cursor(context(&server, 2));
    assert_eq!(count_named(&server, "find"), 0);
    assert_eq!(cursor.cursor_id(), None);

    cursor.next().await.unwrap();
    assert_eq!(count_named(&server, "find"), 1);
    assert!(cursor.cursor_id().is_some());
}

#[tokio::test]
async fn test_close_mid_iteration() {
    let server = seeded(6).await;
    let mut cursor = find_cursor(context(&server, 2));
    cursor.next().await.unwrap();
    assert_eq!(server.open_cursors(), 1);

    cursor.close().await.unwrap();
    cursor.close().await.unwrap();
    assert_eq!(count_named(&server, "killCursors"), 1);
    assert_eq!(server.open_cursors(), 0);
    assert!(cursor.next().await.unwrap().is_none());
    assert!(cursor.is_exhausted());
}

#[tokio::test]
async fn test_fetch_failure_is_reported_once() {
    let server = seeded(4).await;
    let context = context(&server, 2);
    let tracker = context.tracker.clone();
    let mut cursor = find_cursor(context);
    cursor.next().await.unwrap();
    cursor.next().await.unwrap();

    server.fail_next(CollectionError::decode("truncated reply"));
    assert!(matches!(
        cursor.next().await,
        Err(CollectionError::Decode(_))
    ));
    assert!(cursor.next().await.unwrap().is_none());
    assert!(cursor.is_exhausted());

    cursor.close().await.unwrap();
    drop(cursor);
    tracker.close();
    tracker.wait().await;
    assert_eq!(count_named(&server, "killCursors"), 1);
    assert_eq!(server.open_cursors(), 0);
}

#[tokio::test]
async fn test_lost_cursor_is_not_killed() {
    let server = seeded(4).await;
    let context = context(&server, 2);
    let tracker = context.tracker.clone();
    let mut cursor = find_cursor(context);
    cursor.next().await.unwrap();
    cursor.next().await.unwrap();

    server.fail_next(CollectionError::command(43, "cursor id not found"));
    assert_eq!(cursor.next().await.unwrap_err().code(), Some(43));
    assert!(cursor.next().await.unwrap().is_none());

    drop(cursor);
    tracker.close();
    tracker.wait().await;
    assert_eq!(count_named(&server, "killCursors"), 0);
}

#[tokio::test]
async fn test_abandoned_fetch_keeps_position() {
    let server = seeded(6).await;
    let mut cursor = find_cursor(context(&server, 2));
    let first: Vec<Document> = vec![
        cursor.next().await.unwrap().unwrap(),
        cursor.next().await.unwrap().unwrap(),
    ];
    assert_eq!(first.len(), 2);

    server.set_latency(Some(Duration::from_millis(200)));
    let abandoned = tokio::time::timeout(Duration::from_millis(10), cursor.next()).await;
    assert!(abandoned.is_err());
    assert!(cursor.cursor_id().is_some());

    server.set_latency(None);
    let rest: Vec<i32> = cursor
        .collect_all()
        .await
        .unwrap()
        .iter()
        .map(|d| d.get_i32("n").unwrap())
        .collect();
    assert_eq!(rest, [2, 3, 4, 5]);
    assert_eq!(cursor.documents_returned(), 6);
    assert_eq!(server.open_cursors(), 0);
}

#[tokio::test]
async fn test_abandoned_open_retries() {
    let server = seeded(3).await;
    server.set_latency(Some(Duration::from_millis(200)));
    let mut cursor = find_cursor(context(&server, 2));
    let abandoned = tokio::time::timeout(Duration::from_millis(10), cursor.next()).await;
    assert!(abandoned.is_err());

    server.set_latency(None);
    assert_eq!(cursor.collect_all().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_teardown_reports_closed_once() {
    let server = seeded(4).await;
    let context = context(&server, 2);
    let teardown = context.teardown.clone();
    let mut cursor = find_cursor(context);
    cursor.next().await.unwrap();

    teardown.cancel();
    assert!(cursor.next().await.unwrap_err().is_closed());
    assert!(cursor.next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_teardown_after_exhaustion_is_silent() {
    let server = seeded(2).await;
    let context = context(&server, 5);
    let teardown = context.teardown.clone();
    let mut cursor = find_cursor(context);
    assert_eq!(cursor.collect_all().await.unwrap().len(), 2);

    teardown.cancel();
    assert!(cursor.next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_drop_releases_server_cursor() {
    let server = seeded(5).await;
    let context = context(&server, 2);
    let tracker = context.tracker.clone();
    let mut cursor = find_cursor(context);
    cursor.next().await.unwrap();
    assert_eq!(server.open_cursors(), 1);

    drop(cursor);
    tracker.close();
    tracker.wait().await;
    assert_eq!(count_named(&server, "killCursors"), 1);
    assert_eq!(server.open_cursors(), 0);
}

#[tokio::test]
async fn test_batch_size_is_clamped() {
    let server = seeded(1).await;
    let mut cursor = find_cursor(context(&server, 101));
    cursor.set_batch_size(0);
    assert_eq!(cursor.current_batch_size(), 1);
    let cursor = cursor.batch_size(5000);
    assert_eq!(cursor.current_batch_size(), 1000);
}

#[derive(Debug, Deserialize, PartialEq)]
struct Item {
    #[serde(rename = "_id")]
    id: i32,
    n: i32,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct Wrong {
    missing: String,
}

#[tokio::test]
async fn test_next_as_decodes() {
    let server = seeded(2).await;
    let mut cursor = find_cursor(context(&server, 10));
    assert_eq!(
        cursor.next_as::<Item>().await.unwrap(),
        Some(Item { id: 0, n: 0 })
    );
    assert!(matches!(
        cursor.next_as::<Wrong>().await,
        Err(CollectionError::Decode(_))
    ));
}

#[tokio::test]
async fn test_into_stream() {
    let server = seeded(7).await;
    let cursor = find_cursor(context(&server, 3));
    let documents: Vec<Result<Document>> = cursor.into_stream().collect().await;
    assert_eq!(documents.len(), 7);
    assert!(documents.iter().all(|d| d.is_ok()));
}

#[tokio::test]
async fn test_from_reply() {
    let server = seeded(5).await;
    let reply = server
        .submit_command(
            "db",
            doc! { "aggregate": "items", "pipeline": [ { "$sort": { "n": -1 } } ], "cursor": { "batchSize": 2_i64 } },
            &ReadPreference::primary(),
        )
        .await
        .unwrap();

    let mut cursor = Cursor::from_reply(
        context(&server, 2),
        Namespace::new("db", "items").unwrap(),
        &reply,
        ReadPreference::primary(),
    )
    .unwrap();
    assert_eq!(cursor.buffered(), 2);

    let all = cursor.collect_all().await.unwrap();
    let order: Vec<i32> = all.iter().map(|d| d.get_i32("n").unwrap()).collect();
    assert_eq!(order, vec![4, 3, 2, 1, 0]);
}
