mod common;

use common::MemoryStore;
use futures::FutureExt;
use intentsync::{
    SyncError,
    db::{
        DbState, NewFeedback, NewInteraction, NewUploadedModel, OpenOutcome, SyncedDatabase,
        interactions,
    },
    scheduler::{ScheduleConfig, SyncOutcome, SyncScheduler},
    storage::{GuardedStore, RemoteStore},
};
use std::{sync::Arc, time::Duration};

const DB_KEY: &str = "intentsync.db";

fn interaction(n: usize) -> NewInteraction {
    NewInteraction {
        session_id: format!("session-{}", n % 3),
        text: format!("utterance {n}"),
        predicted_intent: if n % 2 == 0 { "greeting" } else { "billing" }.to_string(),
        confidence: 0.5 + (n as f64) / 100.0,
        model_version: None,
        feedback: None,
    }
}

async fn record(db: &SyncedDatabase, new: NewInteraction) -> Result<i64, SyncError> {
    db.execute(|conn| {
        async move {
            interactions::record_interaction(conn, new)
                .await
                .map_err(SyncError::from)
        }
        .boxed()
    })
    .await
}

async fn count(db: &SyncedDatabase) -> i64 {
    db.execute(|conn| {
        async move {
            interactions::count_interactions(conn)
                .await
                .map_err(SyncError::from)
        }
        .boxed()
    })
    .await
    .unwrap()
}

fn memory_db(store: Arc<dyn RemoteStore>) -> SyncedDatabase {
    SyncedDatabase::new(store, DB_KEY, None)
}

#[tokio::test]
async fn fresh_open_then_flush_round_trips() {
    let store = Arc::new(MemoryStore::default());
    let db = memory_db(store.clone());
    assert_eq!(db.state(), DbState::Uninitialized);
    assert_eq!(db.open().await.unwrap(), OpenOutcome::Fresh);
    assert_eq!(db.state(), DbState::Ready);

    for n in 0..3 {
        record(&db, interaction(n)).await.unwrap();
    }
    assert_eq!(db.flush().await.unwrap(), SyncOutcome::Uploaded);
    assert!(store.raw(DB_KEY).is_some());

    let reopened = memory_db(store.clone());
    match reopened.open().await.unwrap() {
        OpenOutcome::Remote { content_hash } => {
            assert_eq!(Some(content_hash), db.remote_hash());
        }
        other => panic!("expected remote open, got {other:?}"),
    }
    assert_eq!(count(&reopened).await, 3);

    let rows = reopened
        .execute(|conn| {
            async move {
                interactions::list_interactions(conn, 10)
                    .await
                    .map_err(SyncError::from)
            }
            .boxed()
        })
        .await
        .unwrap();
    assert_eq!(rows[0].text, "utterance 2");
    assert_eq!(rows[2].predicted_intent, "greeting");
}

#[tokio::test]
async fn remote_snapshot_with_ten_rows_is_materialized() {
    let store = Arc::new(MemoryStore::default());
    let seed = memory_db(store.clone());
    seed.open().await.unwrap();
    for n in 0..10 {
        record(&seed, interaction(n)).await.unwrap();
    }
    seed.flush().await.unwrap();

    let db = memory_db(store.clone());
    assert!(matches!(
        db.open().await.unwrap(),
        OpenOutcome::Remote { .. }
    ));
    assert_eq!(count(&db).await, 10);

    // Nothing changed since the open, so there is nothing to upload.
    assert_eq!(db.flush().await.unwrap(), SyncOutcome::Unchanged);
    assert_eq!(store.puts(), 1);
}

#[tokio::test]
async fn repeated_flush_of_identical_state_writes_once() {
    let memory = Arc::new(MemoryStore::default());
    let store: Arc<dyn RemoteStore> =
        Arc::new(GuardedStore::new(memory.clone(), Duration::from_secs(5)));
    let db = memory_db(store);
    db.open().await.unwrap();
    record(&db, interaction(1)).await.unwrap();

    assert_eq!(db.flush().await.unwrap(), SyncOutcome::Uploaded);
    assert_eq!(db.flush().await.unwrap(), SyncOutcome::Unchanged);
    assert_eq!(db.flush().await.unwrap(), SyncOutcome::Unchanged);
    assert_eq!(memory.puts(), 1);
}

#[tokio::test]
async fn concurrent_transactions_are_all_applied() {
    let store = Arc::new(MemoryStore::default());
    let db = Arc::new(memory_db(store));
    db.open().await.unwrap();

    let mut tasks = Vec::new();
    for worker in 0..4 {
        let db = db.clone();
        tasks.push(tokio::spawn(async move {
            for n in 0..25 {
                record(&db, interaction(worker * 100 + n)).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(count(&db).await, 100);
}

#[tokio::test]
async fn failed_transaction_rolls_back() {
    let db = memory_db(Arc::new(MemoryStore::default()));
    db.open().await.unwrap();

    let err = db
        .execute(|conn| {
            async move {
                interactions::record_interaction(conn, interaction(1)).await?;
                Err::<(), _>(SyncError::Config("abort".to_string()))
            }
            .boxed()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
    assert_eq!(count(&db).await, 0);
}

#[tokio::test]
async fn unreachable_remote_degrades_to_local_copy() {
    let store = Arc::new(MemoryStore::default());
    store.go_offline(true);

    let db = memory_db(store.clone());
    assert!(matches!(
        db.open().await.unwrap(),
        OpenOutcome::LocalFallback { .. }
    ));
    record(&db, interaction(1)).await.unwrap();
    assert!(db.flush().await.unwrap().is_fallback());
    assert_eq!(db.state(), DbState::Ready);

    store.go_offline(false);
    assert_eq!(db.flush().await.unwrap(), SyncOutcome::Uploaded);
}

#[tokio::test]
async fn unreadable_remote_snapshot_is_overwritten_by_flush() {
    let store = Arc::new(MemoryStore::default());
    let db = memory_db(store.clone());
    db.open().await.unwrap();
    record(&db, interaction(1)).await.unwrap();

    store.insert(DB_KEY, vec![0xff, 0xfe, 0x00, 0x01]);
    assert_eq!(db.flush().await.unwrap(), SyncOutcome::Uploaded);
    assert_eq!(db.flush().await.unwrap(), SyncOutcome::Unchanged);

    let reopened = memory_db(store.clone());
    assert!(matches!(
        reopened.open().await.unwrap(),
        OpenOutcome::Remote { .. }
    ));
    assert_eq!(count(&reopened).await, 1);
}

#[tokio::test]
async fn unreadable_remote_snapshot_degrades_open() {
    for garbage in [
        vec![0xff, 0xfe, 0x00, 0x01],
        b"-- intentsync snapshot v1\n-- captured_at: 2026-10-19T00:00:00+00:00\n\
          -- content_hash: 00\nSELECT 1;\n"
            .to_vec(),
        b"INSERT INTO missing_table VALUES (1);\n".to_vec(),
    ] {
        let store = Arc::new(MemoryStore::default());
        store.insert(DB_KEY, garbage);

        let db = memory_db(store.clone());
        assert!(matches!(
            db.open().await.unwrap(),
            OpenOutcome::LocalFallback { .. }
        ));
        assert_eq!(db.state(), DbState::Ready);
        record(&db, interaction(1)).await.unwrap();
        assert_eq!(count(&db).await, 1);

        assert_eq!(db.flush().await.unwrap(), SyncOutcome::Uploaded);
        let reopened = memory_db(store.clone());
        reopened.open().await.unwrap();
        assert_eq!(count(&reopened).await, 1);
    }
}

#[tokio::test]
async fn scheduled_flush_recovers_after_network_failure() {
    let store = Arc::new(MemoryStore::default());
    let db = Arc::new(memory_db(store.clone()));
    db.open().await.unwrap();
    store.reject_writes(true);

    let scheduler = SyncScheduler::spawn(
        db.clone(),
        ScheduleConfig {
            interval: Duration::from_millis(20),
            backoff_factor: 2.0,
            backoff_ceiling: Duration::from_millis(80),
        },
    );

    record(&db, interaction(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.puts(), 0);

    // Foreground writes keep working while sync is failing.
    record(&db, interaction(2)).await.unwrap();
    assert_eq!(count(&db).await, 2);

    store.reject_writes(false);
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.puts() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("flush after recovery");
    scheduler.shutdown().await;

    let reopened = memory_db(store.clone());
    reopened.open().await.unwrap();
    assert_eq!(count(&reopened).await, 2);
}

#[tokio::test]
async fn newer_remote_snapshot_wins_conflict() {
    let store = Arc::new(MemoryStore::default());
    let first = memory_db(store.clone());
    let second = memory_db(store.clone());
    first.open().await.unwrap();
    second.open().await.unwrap();

    for n in 0..2 {
        record(&second, interaction(n)).await.unwrap();
    }
    assert_eq!(second.flush().await.unwrap(), SyncOutcome::Uploaded);

    record(&first, interaction(9)).await.unwrap();
    assert_eq!(first.flush().await.unwrap(), SyncOutcome::RemoteWon);
    assert_eq!(count(&first).await, 2);
    assert_eq!(first.remote_hash(), second.remote_hash());
}

#[tokio::test]
async fn close_flushes_and_rejects_later_work() {
    let store = Arc::new(MemoryStore::default());
    let dir = tempfile::tempdir().unwrap();
    let db = SyncedDatabase::new(store.clone(), DB_KEY, Some(dir.path().join("working.db")));
    db.open().await.unwrap();
    record(&db, interaction(1)).await.unwrap();

    assert_eq!(db.close().await.unwrap(), SyncOutcome::Uploaded);
    assert_eq!(db.state(), DbState::Closed);
    assert!(matches!(
        record(&db, interaction(2)).await,
        Err(SyncError::Closed)
    ));

    let other = memory_db(store);
    other.open().await.unwrap();
    assert_eq!(count(&other).await, 1);
}

#[tokio::test]
async fn feedback_stats_and_uploaded_models() {
    let db = memory_db(Arc::new(MemoryStore::default()));
    db.open().await.unwrap();

    let mut with_feedback = interaction(0);
    with_feedback.feedback = Some(NewFeedback {
        is_correct: false,
        correct_intent: Some("billing".to_string()),
    });
    record(&db, with_feedback).await.unwrap();
    let mut confirmed = interaction(2);
    confirmed.feedback = Some(NewFeedback {
        is_correct: true,
        correct_intent: None,
    });
    record(&db, confirmed).await.unwrap();
    record(&db, interaction(1)).await.unwrap();

    let stats = db
        .execute(|conn| {
            async move {
                interactions::interaction_stats(conn)
                    .await
                    .map_err(SyncError::from)
            }
            .boxed()
        })
        .await
        .unwrap();
    assert_eq!(stats.len(), 2);
    let greeting = stats.iter().find(|s| s.intent == "greeting").unwrap();
    assert_eq!((greeting.total, greeting.correct, greeting.incorrect), (2, 1, 1));

    let upload = NewUploadedModel {
        name: "support-v2".to_string(),
        uploader: Some("alice".to_string()),
        artifact_sha256: "ab".repeat(32),
        size_bytes: 1024,
        accuracy: Some(0.91),
    };
    let (first_id, second_id) = db
        .execute(move |conn| {
            async move {
                let a = interactions::record_uploaded_model(conn, upload.clone()).await?;
                let b = interactions::record_uploaded_model(conn, upload).await?;
                Ok::<_, SyncError>((a, b))
            }
            .boxed()
        })
        .await
        .unwrap();
    assert_eq!(first_id, second_id);

    let (changed, pending) = db
        .execute(move |conn| {
            async move {
                let changed =
                    interactions::mark_incorporated(conn, &[first_id], "1.0.20261019.1").await?;
                let pending = interactions::pending_uploaded_models(conn).await?;
                Ok::<_, SyncError>((changed, pending))
            }
            .boxed()
        })
        .await
        .unwrap();
    assert_eq!(changed, 1);
    assert!(pending.is_empty());
}
