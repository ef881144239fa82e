//! Buffering, Triggers and Shutdown Tests
//!
//! Tests for:
//! - Capacity trigger boundary (L and L-1 rows)
//! - Age trigger with a paused clock
//! - Flush-all and stop semantics, including writes queued behind a stop
//! - Backpressure and handle-side rejections
//! - No loss, duplication or reordering under concurrent producers

mod common;

use std::time::Duration;

use common::{eventually, RecordingStore};
use tablebuffer::{row, BufferConfig, DestinationConfig, Error, Row, TableBuffer};

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(5);

fn events(capacity: usize) -> BufferConfig {
    BufferConfig::new(vec![DestinationConfig::new("events", ["id", "name"])])
        .with_capacity(capacity)
        .with_max_age(Duration::from_secs(3600))
}

fn ids(rows: &[Row]) -> Vec<i64> {
    rows.iter()
        .map(|r| match r.values()[0] {
            tablebuffer::Value::Integer(id) => id,
            ref other => panic!("unexpected id cell {:?}", other),
        })
        .collect()
}

/// Capacity L: L-1 rows never flush, the L-th row flushes exactly L rows.
#[tokio::test]
async fn capacity_boundary_triggers_exactly_one_flush() {
    let store = RecordingStore::new();
    let buffer = TableBuffer::start(store.clone(), events(5)).await.unwrap();

    for id in 0..4_i64 {
        buffer.write("events", row![id, "x"]).await.unwrap();
    }
    // Inspect is queued behind the writes, so all four have been appended.
    assert_eq!(buffer.buffered_rows().await.unwrap()["events"], 4);
    assert!(store.commits().is_empty());

    buffer.write("events", row![4_i64, "x"]).await.unwrap();
    assert_eq!(buffer.buffered_rows().await.unwrap()["events"], 0);

    let rows = eventually(WAIT, POLL, || {
        let rows = store.committed_rows("events");
        (rows.len() == 5).then_some(rows)
    })
    .await;
    assert_eq!(ids(&rows), vec![0, 1, 2, 3, 4]);
    assert_eq!(store.commits().len(), 1);

    buffer.shutdown().await;
    assert_eq!(store.commits().len(), 1, "empty buffer must not flush on stop");
}

/// "events", capacity 3, workers 2: A, B, C flush as one batch split across
/// chunks, both chunks commit and the buffer is empty afterwards.
#[tokio::test]
async fn full_buffer_is_sharded_across_workers() {
    let store = RecordingStore::new();
    let buffer = TableBuffer::start(store.clone(), events(3).with_workers(2))
        .await
        .unwrap();

    buffer.write("events", row![1_i64, "A"]).await.unwrap();
    buffer.write("events", row![2_i64, "B"]).await.unwrap();
    buffer.write("events", row![3_i64, "C"]).await.unwrap();

    assert_eq!(buffer.buffered_rows().await.unwrap()["events"], 0);

    let commits = eventually(WAIT, POLL, || {
        let commits = store.commits();
        (commits.iter().map(|c| c.rows.len()).sum::<usize>() == 3).then_some(commits)
    })
    .await;

    let mut sizes: Vec<usize> = commits.iter().map(|c| c.rows.len()).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![1, 2]);

    let mut all = ids(&store.committed_rows("events"));
    all.sort_unstable();
    assert_eq!(all, vec![1, 2, 3]);

    buffer.shutdown().await;
    assert_eq!(store.commits().len(), 2);
}

/// Max age 100 ms, capacity 1000: a single row is flushed by the timer once it
/// is older than the max age.
#[tokio::test(start_paused = true)]
async fn aged_buffer_is_flushed_by_tick() {
    let store = RecordingStore::new();
    let config = events(1000)
        .with_max_age(Duration::from_millis(100))
        .with_tick_interval(Duration::from_millis(50));
    let buffer = TableBuffer::start(store.clone(), config).await.unwrap();

    buffer.write("events", row![1_i64, "A"]).await.unwrap();

    tokio::time::sleep(Duration::from_millis(90)).await;
    assert_eq!(buffer.buffered_rows().await.unwrap()["events"], 1);

    tokio::time::sleep(Duration::from_millis(70)).await;
    assert_eq!(buffer.buffered_rows().await.unwrap()["events"], 0);

    let rows = eventually(WAIT, POLL, || {
        let rows = store.committed_rows("events");
        (!rows.is_empty()).then_some(rows)
    })
    .await;
    assert_eq!(rows, vec![row![1_i64, "A"]]);

    buffer.shutdown().await;
}

/// Buffers with nothing in them never flush on the timer.
#[tokio::test(start_paused = true)]
async fn empty_buffers_do_not_flush_on_tick() {
    let store = RecordingStore::new();
    let config = events(10).with_max_age(Duration::from_millis(20));
    let buffer = TableBuffer::start(store.clone(), config).await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(buffer.metrics().flushes, 0);

    buffer.shutdown().await;
    assert!(store.commits().is_empty());
}

#[tokio::test]
async fn flush_all_flushes_every_nonempty_destination() {
    let store = RecordingStore::new();
    let config = BufferConfig::new(vec![
        DestinationConfig::new("events", ["id", "name"]),
        DestinationConfig::new("audit", ["id", "action"]),
        DestinationConfig::new("idle", ["id"]),
    ])
    .with_max_age(Duration::from_secs(3600));
    let buffer = TableBuffer::start(store.clone(), config).await.unwrap();

    buffer.write("events", row![1_i64, "a"]).await.unwrap();
    buffer.write("audit", row![2_i64, "login"]).await.unwrap();
    buffer.flush_all().await.unwrap();

    let lengths = buffer.buffered_rows().await.unwrap();
    assert!(lengths.values().all(|&n| n == 0), "{:?}", lengths);

    eventually(WAIT, POLL, || (store.commits().len() == 2).then_some(())).await;
    assert_eq!(store.committed_rows("events"), vec![row![1_i64, "a"]]);
    assert_eq!(store.committed_rows("audit"), vec![row![2_i64, "login"]]);
    assert!(store.committed_rows("idle").is_empty());

    buffer.shutdown().await;
}

/// Shutdown flushes partial buffers and waits for their commits.
#[tokio::test]
async fn shutdown_flushes_and_waits_for_commits() {
    let store = RecordingStore::new().with_commit_delay(Duration::from_millis(50));
    let buffer = TableBuffer::start(store.clone(), events(100).with_workers(4))
        .await
        .unwrap();

    for id in 0..42_i64 {
        buffer.write("events", row![id, "x"]).await.unwrap();
    }
    buffer.shutdown().await;

    // No polling: shutdown only returns after every commit finished.
    let mut all = ids(&store.committed_rows("events"));
    all.sort_unstable();
    assert_eq!(all, (0..42).collect::<Vec<_>>());
    assert_eq!(store.commits().len(), 4);
}

/// Flushes dispatched before the stop are awaited too.
#[tokio::test]
async fn shutdown_waits_for_earlier_flushes() {
    let store = RecordingStore::new().with_commit_delay(Duration::from_millis(100));
    let buffer = TableBuffer::start(store.clone(), events(2)).await.unwrap();

    buffer.write("events", row![1_i64, "x"]).await.unwrap();
    buffer.write("events", row![2_i64, "x"]).await.unwrap();
    buffer.shutdown().await;

    assert_eq!(ids(&store.committed_rows("events")), vec![1, 2]);
}

#[tokio::test]
async fn writes_after_stop_are_rejected() {
    let store = RecordingStore::new();
    let buffer = TableBuffer::start(store.clone(), events(10)).await.unwrap();
    let handle = buffer.handle();

    handle.write("events", row![1_i64, "x"]).await.unwrap();
    handle.stop().await.unwrap();
    buffer.join().await;

    assert!(matches!(
        handle.write("events", row![2_i64, "x"]).await,
        Err(Error::Stopped)
    ));
    assert!(matches!(handle.flush_all().await, Err(Error::Stopped)));
    assert!(matches!(handle.stop().await, Err(Error::Stopped)));
    assert_eq!(ids(&store.committed_rows("events")), vec![1]);
}

/// A write accepted while the stop command is still queued lands in the final
/// flush instead of being dropped.
#[tokio::test]
async fn writes_queued_behind_stop_are_flushed() {
    let store = RecordingStore::new();
    let buffer = TableBuffer::start(store.clone(), events(10)).await.unwrap();
    let handle = buffer.handle();

    handle.write("events", row![1_i64, "a"]).await.unwrap();
    handle.stop().await.unwrap();
    let accepted = handle.try_write("events", row![2_i64, "b"]);
    buffer.join().await;

    let committed = ids(&store.committed_rows("events"));
    match accepted {
        Ok(()) => {
            assert_eq!(committed, vec![1, 2]);
            assert_eq!(handle.metrics().rows_accepted, 2);
        }
        Err(e) => {
            assert!(matches!(e, Error::Stopped), "unexpected error {:?}", e);
            assert_eq!(committed, vec![1]);
        }
    }
    assert_eq!(handle.metrics().rows_committed as usize, committed.len());
}

/// Dropping the last handle stops the loop with a final flush.
#[tokio::test]
async fn dropping_all_handles_flushes() {
    let store = RecordingStore::new();
    let buffer = TableBuffer::start(store.clone(), events(10)).await.unwrap();
    buffer.write("events", row![9_i64, "x"]).await.unwrap();
    drop(buffer);

    eventually(WAIT, POLL, || {
        (store.committed_rows("events") == vec![row![9_i64, "x"]]).then_some(())
    })
    .await;
}

#[tokio::test]
async fn unknown_destination_is_rejected() {
    let store = RecordingStore::new();
    let buffer = TableBuffer::start(store.clone(), events(10)).await.unwrap();

    let err = buffer.write("nonexistent", row![1_i64]).await.unwrap_err();
    assert!(matches!(err, Error::UnknownDestination(ref name) if name == "nonexistent"));
    assert_eq!(err.to_string(), "unknown destination 'nonexistent'");

    assert!(matches!(
        buffer.try_write("nonexistent", row![1_i64]),
        Err(Error::UnknownDestination(_))
    ));

    buffer.shutdown().await;
    assert!(store.commits().is_empty());
}

/// With a channel of one slot and the loop not yet scheduled, the second
/// `try_write` finds the channel full.
#[tokio::test]
async fn try_write_reports_saturation() {
    let store = RecordingStore::new();
    let buffer = TableBuffer::start(store.clone(), events(10).with_channel_capacity(1))
        .await
        .unwrap();

    buffer.try_write("events", row![1_i64, "x"]).unwrap();
    let err = buffer.try_write("events", row![2_i64, "x"]).unwrap_err();
    assert!(matches!(err, Error::Saturated));

    // The rejected row was not queued.
    buffer.shutdown().await;
    assert_eq!(ids(&store.committed_rows("events")), vec![1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_write_from_sync_thread() {
    let store = RecordingStore::new();
    let buffer = TableBuffer::start(store.clone(), events(1000)).await.unwrap();
    let handle = buffer.handle();

    std::thread::spawn(move || {
        for id in 0..100_i64 {
            handle.blocking_write("events", row![id, "sync"]).unwrap();
        }
    })
    .join()
    .unwrap();

    buffer.shutdown().await;
    assert_eq!(ids(&store.committed_rows("events")), (0..100).collect::<Vec<_>>());
}

/// Every accepted row is committed exactly once, and each producer's rows stay
/// in production order within every chunk.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_lose_and_duplicate_nothing() {
    const PRODUCERS: i64 = 8;
    const PER_PRODUCER: i64 = 500;

    let store = RecordingStore::new();
    let config = BufferConfig::new(vec![DestinationConfig::new("events", ["producer", "seq"])])
        .with_capacity(97)
        .with_workers(3)
        .with_max_age(Duration::from_millis(20))
        .with_channel_capacity(16);
    let buffer = TableBuffer::start(store.clone(), config).await.unwrap();

    let mut tasks = Vec::new();
    for producer in 0..PRODUCERS {
        let handle = buffer.handle();
        tasks.push(tokio::spawn(async move {
            for seq in 0..PER_PRODUCER {
                handle.write("events", row![producer, seq]).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    buffer.shutdown().await;

    let commits = store.commits();
    let total: usize = commits.iter().map(|c| c.rows.len()).sum();
    assert_eq!(total as i64, PRODUCERS * PER_PRODUCER);

    let mut seen = std::collections::HashSet::new();
    for commit in &commits {
        let mut last = std::collections::HashMap::new();
        for row in &commit.rows {
            let (producer, seq) = match row.values() {
                [tablebuffer::Value::Integer(p), tablebuffer::Value::Integer(s)] => (*p, *s),
                other => panic!("unexpected row {:?}", other),
            };
            assert!(seen.insert((producer, seq)), "duplicate row {producer}/{seq}");
            if let Some(prev) = last.insert(producer, seq) {
                assert!(prev < seq, "producer {producer} reordered: {prev} before {seq}");
            }
        }
    }
}

#[tokio::test]
async fn metrics_track_rows_and_flushes() {
    let store = RecordingStore::new();
    let buffer = TableBuffer::start(store.clone(), events(4).with_workers(2))
        .await
        .unwrap();
    let handle = buffer.handle();

    for id in 0..10_i64 {
        handle.write("events", row![id, "x"]).await.unwrap();
    }
    buffer.shutdown().await;

    let snapshot = handle.metrics();
    assert_eq!(snapshot.rows_accepted, 10);
    // Two size flushes of 4 and a shutdown flush of 2.
    assert_eq!(snapshot.flushes, 3);
    assert_eq!(snapshot.rows_committed, 10);
    assert_eq!(snapshot.chunks_committed, 5);
    assert_eq!(snapshot.rows_lost, 0);
}
