mod common;

use common::*;
use realtime_personalization::error::Error;
use realtime_personalization::model::{ActionType, UserPreferenceData};
use realtime_personalization::preference::{preference_key, PreferenceVectorCalculator};
use realtime_personalization::store::{DocumentStore, FastStore};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn catalog() -> Arc<FaultyDocumentStore> {
    let store = Arc::new(FaultyDocumentStore::new());
    let catalog = [
        ("p1", vec![1.0, 0.0, 0.0, 0.0]),
        ("p2", vec![0.0, 1.0, 0.0, 0.0]),
        ("p3", vec![0.0, 0.0, 1.0, 0.0]),
        ("p4", vec![0.0, 0.0, 0.0, 1.0]),
        ("wide", vec![1.0, 0.0, 0.0, 0.0, 0.0]),
    ];
    for (id, vector) in catalog {
        store.index(PRODUCTS, id, product(id, "general", vector, 3)).await.unwrap();
    }
    store
}

async fn stored(fast: &FaultyFastStore, user: &str) -> Option<UserPreferenceData> {
    let raw = fast.inner.get(&preference_key(user)).await.unwrap()?;
    Some(serde_json::from_slice(&raw).unwrap())
}

#[tokio::test]
async fn concurrent_updates_for_one_user_are_not_lost() {
    let documents = catalog().await;
    let fast = Arc::new(FaultyFastStore::new());
    // Widen the read-modify-write window.
    fast.slow_reads(Duration::from_millis(5));
    let repo = repository(fast.clone(), documents.clone(), Duration::from_secs(1));
    let updater = updater(documents.clone(), repo);

    let n = 20;
    let mut tasks = Vec::new();
    for i in 0..n {
        let updater = updater.clone();
        tasks.push(tokio::spawn(async move {
            let e = event(&format!("t{}", i), "u1", "p1", ActionType::Click);
            updater.update_preference(&e).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let data = stored(&fast, "u1").await.unwrap();
    assert_eq!(data.action_count, n);
    assert_eq!(updater.stats().success, n);
}

#[tokio::test]
async fn batch_applies_user_events_in_order_with_one_write() {
    let documents = catalog().await;
    let fast = Arc::new(FaultyFastStore::new());
    let repo = repository(fast.clone(), documents.clone(), Duration::from_secs(1));
    let updater = updater(documents.clone(), repo.clone());

    let events = vec![
        event("t1", "u1", "p1", ActionType::View),
        event("t2", "u2", "p3", ActionType::Purchase),
        event("t3", "u1", "p2", ActionType::Purchase),
        event("t4", "u1", "p4", ActionType::Click),
    ];
    updater.update_preferences_batch(&events).await.unwrap();

    let calc = PreferenceVectorCalculator::new(DIM);
    let step1 = calc.update(None, &[1.0, 0.0, 0.0, 0.0], ActionType::View).unwrap();
    let step2 = calc.update(Some(&step1), &[0.0, 1.0, 0.0, 0.0], ActionType::Purchase).unwrap();
    let step3 = calc.update(Some(&step2), &[0.0, 0.0, 0.0, 1.0], ActionType::Click).unwrap();

    let u1 = stored(&fast, "u1").await.unwrap();
    assert_eq!(u1.vector, step3);
    assert_eq!(u1.action_count, 3);

    let u2 = stored(&fast, "u2").await.unwrap();
    assert_eq!(u2.vector, vec![0.0, 0.0, 1.0, 0.0]);
    assert_eq!(u2.action_count, 1);

    repo.shutdown(Duration::from_secs(1)).await;
    assert_eq!(documents.inner.count(PREFERENCES), 2);
}

#[tokio::test]
async fn missing_or_malformed_product_vectors_are_skipped() {
    let documents = catalog().await;
    let fast = Arc::new(FaultyFastStore::new());
    let repo = repository(fast.clone(), documents.clone(), Duration::from_secs(1));
    let updater = updater(documents.clone(), repo);

    updater
        .update_preference(&event("t1", "u1", "ghost", ActionType::Purchase))
        .await
        .unwrap();
    updater
        .update_preference(&event("t2", "u1", "wide", ActionType::Purchase))
        .await
        .unwrap();

    assert!(stored(&fast, "u1").await.is_none());
    assert_eq!(updater.stats().skipped, 2);
}

#[tokio::test]
async fn stored_vector_of_wrong_dimension_rejects_update() {
    let documents = catalog().await;
    let fast = Arc::new(FaultyFastStore::new());
    let repo = repository(fast.clone(), documents.clone(), Duration::from_secs(1));
    let updater = updater(documents.clone(), repo.clone());

    let legacy = UserPreferenceData {
        vector: vec![0.6, 0.8, 0.0],
        action_count: 4,
        updated_at: 0,
    };
    repo.put("u1", &legacy).await.unwrap();

    let err = updater
        .update_preference(&event("t1", "u1", "p1", ActionType::View))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DimensionMismatch { expected: 4, actual: 3 }));
    assert_eq!(stored(&fast, "u1").await.unwrap(), legacy);
    assert_eq!(updater.stats().failed, 1);
}

#[tokio::test]
async fn fast_store_miss_falls_back_and_keeps_action_count() {
    let documents = catalog().await;
    let fast = Arc::new(FaultyFastStore::new());
    let repo = repository(fast.clone(), documents.clone(), Duration::from_secs(1));
    let updater = updater(documents.clone(), repo.clone());

    for i in 0..3 {
        updater
            .update_preference(&event(&format!("t{}", i), "u1", "p1", ActionType::View))
            .await
            .unwrap();
    }
    repo.shutdown(Duration::from_secs(1)).await;
    fast.inner.delete(&preference_key("u1")).await.unwrap();

    let restored = repo.get("u1").await.unwrap().unwrap();
    assert_eq!(restored.action_count, 3);
    assert!(stored(&fast, "u1").await.is_some());

    updater
        .update_preference(&event("t9", "u1", "p2", ActionType::View))
        .await
        .unwrap();
    assert_eq!(stored(&fast, "u1").await.unwrap().action_count, 4);
}

#[tokio::test]
async fn slow_fast_store_read_is_treated_as_miss() {
    let documents = catalog().await;
    let fast = Arc::new(FaultyFastStore::new());
    let repo = repository(fast.clone(), documents.clone(), Duration::from_millis(50));

    let data = UserPreferenceData {
        vector: vec![1.0, 0.0, 0.0, 0.0],
        action_count: 9,
        updated_at: 1,
    };
    repo.put("u1", &data).await.unwrap();
    repo.shutdown(Duration::from_secs(1)).await;

    fast.slow_reads(Duration::from_millis(300));
    let start = Instant::now();
    let found = repo.get("u1").await.unwrap();
    assert_eq!(found, Some(data));
    assert!(start.elapsed() < Duration::from_millis(250));
    assert_eq!(fast.reads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn different_users_update_concurrently() {
    let documents = catalog().await;
    let fast = Arc::new(FaultyFastStore::new());
    fast.slow_reads(Duration::from_millis(200));
    let repo = repository(fast.clone(), documents.clone(), Duration::from_secs(1));
    let updater = updater(documents.clone(), repo);

    let alice = event("t1", "alice", "p1", ActionType::Click);
    let bob = event("t2", "bob", "p2", ActionType::Click);
    let start = Instant::now();
    let a = updater.update_preference(&alice);
    let b = updater.update_preference(&bob);
    let (ra, rb) = tokio::join!(a, b);
    ra.unwrap();
    rb.unwrap();
    let different_users = start.elapsed();

    let first = event("t3", "carol", "p1", ActionType::Click);
    let second = event("t4", "carol", "p2", ActionType::Click);
    let start = Instant::now();
    let a = updater.update_preference(&first);
    let b = updater.update_preference(&second);
    let (ra, rb) = tokio::join!(a, b);
    ra.unwrap();
    rb.unwrap();
    let same_user = start.elapsed();

    assert!(different_users < Duration::from_millis(380), "took {:?}", different_users);
    assert!(same_user >= Duration::from_millis(400), "took {:?}", same_user);
    assert_eq!(stored(&fast, "carol").await.unwrap().action_count, 2);
}

#[tokio::test]
async fn idle_user_locks_are_swept() {
    let documents = catalog().await;
    let fast = Arc::new(FaultyFastStore::new());
    let repo = repository(fast.clone(), documents.clone(), Duration::from_secs(1));
    let updater = updater(documents.clone(), repo);

    for user in ["a", "b", "c"] {
        updater
            .update_preference(&event("t", user, "p1", ActionType::View))
            .await
            .unwrap();
    }
    assert_eq!(updater.sweep_idle_locks(), 3);
    assert_eq!(updater.sweep_idle_locks(), 0);
}

fn preference(count: u64) -> UserPreferenceData {
    UserPreferenceData {
        vector: vec![1.0, 0.0, 0.0, 0.0],
        action_count: count,
        updated_at: count as i64,
    }
}

#[tokio::test]
async fn restore_from_backup_does_not_clobber_newer_write() {
    let documents = catalog().await;
    let fast = Arc::new(FaultyFastStore::new());
    let repo = repository(fast.clone(), documents.clone(), Duration::from_secs(1));

    repo.put("u1", &preference(1)).await.unwrap();
    repo.shutdown(Duration::from_secs(1)).await;
    fast.inner.delete(&preference_key("u1")).await.unwrap();

    documents.slow_gets(Duration::from_millis(150));
    let reader = tokio::spawn({
        let repo = repo.clone();
        async move { repo.get("u1").await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    repo.put("u1", &preference(2)).await.unwrap();

    let restored = reader.await.unwrap().unwrap().unwrap();
    assert_eq!(restored.action_count, 1);
    assert_eq!(stored(&fast, "u1").await.unwrap().action_count, 2);
}

#[tokio::test]
async fn slow_backup_cannot_overwrite_newer_backup() {
    let documents = catalog().await;
    let fast = Arc::new(FaultyFastStore::new());
    let repo = repository(fast.clone(), documents.clone(), Duration::from_secs(1));

    documents.delay_next_index(Duration::from_millis(200));
    repo.put("u1", &preference(1)).await.unwrap();
    // Let the first backup start its slow write before the second put.
    tokio::time::sleep(Duration::from_millis(20)).await;
    repo.put("u1", &preference(2)).await.unwrap();

    assert_eq!(repo.shutdown(Duration::from_secs(2)).await, 0);
    let backup = repo.get_backup("u1").await.unwrap().unwrap();
    assert_eq!(backup.action_count, 2);
}

#[tokio::test]
async fn queued_backups_collapse_to_newest() {
    let documents = catalog().await;
    let fast = Arc::new(FaultyFastStore::new());
    let repo = repository(fast.clone(), documents.clone(), Duration::from_secs(1));

    for count in 1..=5 {
        repo.put("u1", &preference(count)).await.unwrap();
    }
    repo.shutdown(Duration::from_secs(1)).await;

    assert_eq!(repo.get_backup("u1").await.unwrap().unwrap().action_count, 5);
    assert_eq!(repo.sweep_idle_locks(), 1);
}

#[tokio::test]
async fn shutdown_abandons_hung_backups() {
    let documents = catalog().await;
    let fast = Arc::new(FaultyFastStore::new());
    let repo = repository(fast.clone(), documents.clone(), Duration::from_secs(1));

    documents.delay_next_index(Duration::from_secs(3600));
    repo.put("u1", &preference(1)).await.unwrap();

    let start = Instant::now();
    assert_eq!(repo.shutdown(Duration::from_millis(50)).await, 1);
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(repo.pending_backups(), 0);
    assert!(repo.get_backup("u1").await.unwrap().is_none());
    assert_eq!(stored(&fast, "u1").await.unwrap().action_count, 1);
}
