mod common;

use std::collections::HashMap;
use std::time::Duration;

use blink_store_lib::{EventStore, SyncAction};
use common::{count, eventually, open_read_only, temp_config};

#[tokio::test]
async fn forty_nine_blinks_wait_for_the_fiftieth() {
    let (_dir, config) = temp_config();
    let db_path = config.db_path.clone();
    let store = EventStore::open(config).unwrap();
    let session = store.auto_create_session().await.unwrap();

    let mut expected_total = 0u64;
    for i in 0..49u32 {
        let count = i % 4 + 1;
        expected_total += u64::from(count);
        store.log_blink(count, 10.0 + f64::from(i % 7), Some(0.25));
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    let conn = open_read_only(&db_path);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM blink_events"), 0);

    store.log_blink(5, 31.5, None);
    expected_total += 5;

    eventually(Duration::from_secs(5), Duration::from_millis(20), || {
        (count(&conn, "SELECT COUNT(*) FROM blink_events") == 50).then_some(())
    })
    .await;

    let stored = store.get_current_session().await.unwrap().unwrap();
    assert_eq!(stored.id, session.id);
    assert_eq!(stored.total_blinks, expected_total);
    assert_eq!(stored.max_blink_rate, 31.5);

    let stats = store.ingest_stats();
    assert_eq!(stats.committed, 50);
    assert_eq!(stats.flushes, 1);
    store.close().await.unwrap();
}

#[tokio::test]
async fn lone_event_commits_after_the_latency_bound() {
    let (_dir, mut config) = temp_config();
    config.max_flush_latency_ms = 100;
    let db_path = config.db_path.clone();
    let store = EventStore::open(config).unwrap();

    store.log_blink(2, 14.0, None);

    let conn = open_read_only(&db_path);
    eventually(Duration::from_secs(3), Duration::from_millis(20), || {
        (count(&conn, "SELECT COUNT(*) FROM blink_events") == 1).then_some(())
    })
    .await;
    // the event started a session on its own
    assert!(store.current_session_id().is_some());
    store.close().await.unwrap();
}

#[tokio::test]
async fn concurrent_producers_lose_and_duplicate_nothing() {
    let (_dir, config) = temp_config();
    let store = EventStore::open(config).unwrap();
    let session = store.auto_create_session().await.unwrap();

    let producers: Vec<_> = (0..4u32)
        .map(|producer| {
            let queue = store.ingest();
            std::thread::spawn(move || {
                for seq in 0..250u32 {
                    queue.log_blink(seq, f64::from(producer), None);
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    store.flush().await.unwrap();

    let blinks = store.get_blink_events(session.id).await.unwrap();
    assert_eq!(blinks.len(), 1000);

    let mut by_producer: HashMap<u64, Vec<(i64, u32)>> = HashMap::new();
    for blink in &blinks {
        by_producer
            .entry(blink.blink_rate as u64)
            .or_default()
            .push((blink.id, blink.blink_count));
    }
    for (_, mut rows) in by_producer {
        rows.sort_by_key(|(id, _)| *id);
        let seqs: Vec<u32> = rows.into_iter().map(|(_, seq)| seq).collect();
        assert_eq!(seqs, (0..250).collect::<Vec<_>>());
    }

    let stats = store.ingest_stats();
    assert_eq!(stats.enqueued, 1000);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.committed, 1000);
    store.close().await.unwrap();
}

#[tokio::test]
async fn each_committed_record_has_one_insert_intent() {
    let (_dir, config) = temp_config();
    let store = EventStore::open(config).unwrap();
    let session = store.auto_create_session().await.unwrap();

    for i in 0..3 {
        store.log_blink(1, 12.0 + f64::from(i), None);
    }
    store.log_performance(8.5, 55.0, Some(70));
    store.log_performance(9.0, 56.0, None);
    assert_eq!(store.flush().await.unwrap(), 5);

    let intents = store.pending_sync_intents(100).await.unwrap();
    let blink_ids: Vec<i64> = store
        .get_blink_events(session.id)
        .await
        .unwrap()
        .iter()
        .map(|b| b.id)
        .collect();
    for id in &blink_ids {
        let matching: Vec<_> = intents
            .iter()
            .filter(|i| i.table_name == "blink_events" && i.record_id == *id)
            .collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].action, SyncAction::Insert);
        assert_eq!(matching[0].payload["id"], *id);
    }
    let samples = intents
        .iter()
        .filter(|i| i.table_name == "performance_samples")
        .count();
    assert_eq!(samples, 2);
    assert!(intents
        .iter()
        .any(|i| i.table_name == "sessions" && i.record_id == session.id));

    let ids: Vec<i64> = intents.iter().map(|i| i.id).collect();
    assert_eq!(store.mark_sync_intents_consumed(&ids).await.unwrap(), ids.len());
    assert_eq!(store.mark_sync_intents_consumed(&ids).await.unwrap(), 0);
    assert!(store.pending_sync_intents(100).await.unwrap().is_empty());
    assert_eq!(store.pending_sync_intent_count().await.unwrap(), 0);
    store.close().await.unwrap();
}

#[tokio::test]
async fn explicit_flush_on_empty_buffer_is_zero() {
    let (_dir, config) = temp_config();
    let store = EventStore::open(config).unwrap();
    assert_eq!(store.flush().await.unwrap(), 0);
    assert!(store.database_size().unwrap() > 0);
    assert_eq!(store.close().await.unwrap(), 0);
}
