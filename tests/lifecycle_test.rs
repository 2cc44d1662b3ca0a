mod common;

use blink_store_lib::{EventStore, UserIdentity};
use common::{count, open_read_only, open_read_write, temp_config};

const OPEN_SESSIONS: &str = "SELECT COUNT(*) FROM sessions WHERE end_time IS NULL";

#[tokio::test]
async fn auto_create_returns_the_active_session() {
    let (_dir, config) = temp_config();
    let store = EventStore::open(config).unwrap();

    let first = store.auto_create_session().await.unwrap();
    let again = store.auto_create_session().await.unwrap();
    assert_eq!(first.id, again.id);
    assert_eq!(store.current_session_id(), Some(first.id));
    assert!(first.is_open());

    let ended = store.end_current_session().await.unwrap().unwrap();
    assert_eq!(ended.id, first.id);
    assert!(ended.end_time.is_some());
    assert!(store.end_current_session().await.unwrap().is_none());
    assert!(store.get_current_session().await.unwrap().is_none());

    let next = store.auto_create_session().await.unwrap();
    assert!(next.id > first.id);
    store.close().await.unwrap();
}

#[tokio::test]
async fn events_stay_with_the_session_current_at_enqueue() {
    let (_dir, config) = temp_config();
    let db_path = config.db_path.clone();
    let store = EventStore::open(config).unwrap();
    let first = store.auto_create_session().await.unwrap();

    for _ in 0..3 {
        store.log_blink(2, 15.0, None);
    }
    // no explicit flush: ending the session must pick these up first
    let ended = store.end_current_session().await.unwrap().unwrap();
    assert_eq!(ended.total_blinks, 6);

    store.log_blink(1, 11.0, None);
    store.log_blink(1, 13.0, None);
    store.flush().await.unwrap();

    let second = store.get_current_session().await.unwrap().unwrap();
    assert_ne!(second.id, first.id);
    assert_eq!(second.total_blinks, 2);
    assert_eq!(store.get_blink_events(first.id).await.unwrap().len(), 3);

    let conn = open_read_only(&db_path);
    assert_eq!(count(&conn, OPEN_SESSIONS), 1);
    store.close().await.unwrap();
}

#[tokio::test]
async fn unfinished_session_is_closed_at_next_start() {
    let (_dir, config) = temp_config();
    let db_path = config.db_path.clone();

    let store = EventStore::open(config.clone()).unwrap();
    let session = store.auto_create_session().await.unwrap();
    for rate in [12.0, 18.0, 9.0] {
        store.log_blink(1, rate, None);
    }
    store.flush().await.unwrap();
    let last_event = store
        .get_blink_events(session.id)
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.timestamp)
        .max()
        .unwrap();
    // close without ending the session, like a process that never got to
    store.close().await.unwrap();

    let conn = open_read_write(&db_path);
    assert_eq!(count(&conn, OPEN_SESSIONS), 1);
    drop(conn);

    let store = EventStore::open(config).unwrap();
    let report = store.startup_report().unwrap();
    assert_eq!(report.reconciled.len(), 1);
    let reconciled = &report.reconciled[0];
    assert_eq!(reconciled.id, session.id);
    assert_eq!(reconciled.end_time, Some(last_event));
    assert_eq!(reconciled.total_blinks, 3);
    assert_eq!(reconciled.max_blink_rate, 18.0);
    assert_eq!(store.current_session_id(), None);

    let intents = store.pending_sync_intents(100).await.unwrap();
    assert!(intents
        .iter()
        .any(|i| i.table_name == "sessions" && i.record_id == session.id && i.payload["endTime"].is_string()));

    let conn = open_read_only(&db_path);
    assert_eq!(count(&conn, OPEN_SESSIONS), 0);
    store.close().await.unwrap();
}

#[tokio::test]
async fn stats_summarize_blinks_and_performance() {
    let (_dir, config) = temp_config();
    let store = EventStore::open(config).unwrap();
    let session = store.auto_create_session().await.unwrap();

    store.log_blink(3, 10.0, Some(0.3));
    store.log_blink(5, 20.0, Some(0.2));
    store.log_performance(10.0, 40.0, Some(80));
    store.log_performance(20.0, 60.0, Some(60));
    store.flush().await.unwrap();

    let stats = store.get_session_stats(session.id).await.unwrap().unwrap();
    assert_eq!(stats.blinks.event_count, 2);
    assert_eq!(stats.blinks.total_blinks, 8);
    assert_eq!(stats.blinks.avg_rate, Some(15.0));
    assert_eq!(stats.blinks.max_rate, Some(20.0));
    assert_eq!(stats.performance.sample_count, 2);
    assert_eq!(stats.performance.avg_cpu, Some(15.0));
    assert_eq!(stats.performance.avg_memory, Some(50.0));
    assert_eq!(stats.performance.avg_battery, Some(70.0));
    assert!(stats.duration_minutes >= 0.0);

    assert!(store.get_session_stats(session.id + 100).await.unwrap().is_none());
    store.close().await.unwrap();
}

#[tokio::test]
async fn recent_sessions_and_sync_marking() {
    let (_dir, config) = temp_config();
    let store = EventStore::open(config).unwrap();

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(store.auto_create_session().await.unwrap().id);
        store.end_current_session().await.unwrap();
    }

    let recent = store.get_recent_sessions(2, None).await.unwrap();
    assert_eq!(
        recent.iter().map(|s| s.id).collect::<Vec<_>>(),
        vec![ids[2], ids[1]]
    );

    let synced = store
        .mark_session_synced(ids[0], "cloud-abc")
        .await
        .unwrap()
        .unwrap();
    assert!(synced.is_synced);
    assert_eq!(synced.cloud_session_id.as_deref(), Some("cloud-abc"));
    assert!(store.mark_session_synced(9999, "nope").await.unwrap().is_none());
    store.close().await.unwrap();
}

#[tokio::test]
async fn recent_sessions_are_scoped_to_the_signed_in_user() {
    let (_dir, mut config) = temp_config();

    let mut ids = Vec::new();
    for user in ["alice", "bob", "alice"] {
        config.user = Some(UserIdentity {
            id: user.to_string(),
            email: None,
        });
        let store = EventStore::open(config.clone()).unwrap();
        ids.push(store.auto_create_session().await.unwrap().id);
        store.end_current_session().await.unwrap();
        store.close().await.unwrap();
    }

    let store = EventStore::open(config).unwrap();
    let mine = store.get_user_sessions(10).await.unwrap();
    assert_eq!(
        mine.iter().map(|s| s.id).collect::<Vec<_>>(),
        vec![ids[2], ids[0]]
    );
    assert!(mine.iter().all(|s| s.user_id.as_deref() == Some("alice")));

    let bobs = store.get_recent_sessions(10, Some("bob")).await.unwrap();
    assert_eq!(bobs.iter().map(|s| s.id).collect::<Vec<_>>(), vec![ids[1]]);
    assert_eq!(store.get_recent_sessions(10, None).await.unwrap().len(), 3);
    store.close().await.unwrap();
}
