//! Session lifecycle

use crate::support::{aggregator, weak, CountingTier};
use std::sync::Arc;
use std::time::Duration;
use vstore::config::AggregatorConfig;
use vstore::model::{ContentHash, PathSet, Tier};
use vstore::session::SessionStatus;
use vstore::store::{ContentStore, MemoryTier, PinOutcome};
use vstore::VstoreError;

#[tokio::test]
async fn close_releases_pins() {
    let local = Arc::new(MemoryTier::new(Tier::Local));
    let remote = Arc::new(MemoryTier::new(Tier::Remote));
    let hash = remote.put(b"artifact").await.unwrap();
    let (cache, _) = aggregator(local.clone(), remote, AggregatorConfig::default());

    let session = cache.open_session();
    assert_eq!(session.pin_to_cas(hash).await.unwrap(), PinOutcome::Pinned);
    assert_eq!(session.pin_to_cas(hash).await.unwrap(), PinOutcome::Pinned);
    assert_eq!(session.pinned_count(), 2);
    assert_eq!(local.pin_count(&hash), 2);

    session.close().await.unwrap();
    assert_eq!(session.status(), SessionStatus::Closed);
    assert_eq!(local.pin_count(&hash), 0);

    // Closing again is harmless
    session.close().await.unwrap();
}

#[tokio::test]
async fn closed_session_rejects_operations() {
    let (cache, _) = aggregator(
        Arc::new(MemoryTier::new(Tier::Local)),
        Arc::new(MemoryTier::new(Tier::Remote)),
        AggregatorConfig::default(),
    );
    let session = cache.open_session();
    session.close().await.unwrap();

    let err = session.get_cache_entries(weak("main.c")).await.unwrap_err();
    assert!(matches!(err, VstoreError::SessionClosed));
    let err = session.put(b"bytes").await.unwrap_err();
    assert!(matches!(err, VstoreError::SessionClosed));
}

#[tokio::test]
async fn session_outliving_aggregator_is_closed() {
    let (cache, _) = aggregator(
        Arc::new(MemoryTier::new(Tier::Local)),
        Arc::new(MemoryTier::new(Tier::Remote)),
        AggregatorConfig::default(),
    );
    let session = cache.open_session();
    drop(cache);

    let err = session.get_content(ContentHash::of(b"x")).await.unwrap_err();
    assert!(matches!(err, VstoreError::SessionClosed));
}

#[tokio::test]
async fn cancel_interrupts_outstanding_lookup() {
    let remote = Arc::new(CountingTier::slow(Tier::Remote, Duration::from_secs(2)));
    let (cache, _) = aggregator(
        Arc::new(MemoryTier::new(Tier::Local)),
        remote,
        AggregatorConfig::default(),
    );
    let session = cache.open_session();

    let (result, ()) = tokio::join!(session.get_cache_entries(weak("main.c")), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.cancel();
    });

    assert!(matches!(result, Err(VstoreError::Cancelled)));
    assert_eq!(session.status(), SessionStatus::Cancelled);

    let err = session.put(b"bytes").await.unwrap_err();
    assert!(matches!(err, VstoreError::Cancelled));
}

#[tokio::test]
async fn sessions_are_independent() {
    let (cache, _) = aggregator(
        Arc::new(MemoryTier::new(Tier::Local)),
        Arc::new(MemoryTier::new(Tier::Remote)),
        AggregatorConfig::default(),
    );
    let first = cache.open_session();
    let second = cache.open_session();
    assert_ne!(first.id(), second.id());

    first.cancel();
    let hash = second.put(b"still open").await.unwrap();
    assert_eq!(second.get_content(hash).await.unwrap().as_deref(), Some(&b"still open"[..]));
}

#[tokio::test]
async fn path_sets_round_trip_through_session() {
    let (cache, _) = aggregator(
        Arc::new(MemoryTier::new(Tier::Local)),
        Arc::new(MemoryTier::new(Tier::Remote)),
        AggregatorConfig::default(),
    );
    let session = cache.open_session();
    let path_set = PathSet::new(["src/b.rs", "src/a.rs", "src/a.rs"]);

    let hash = session.put_path_set(&path_set).await.unwrap();
    assert_eq!(hash, path_set.hash());
    let loaded = session.get_path_set(hash).await.unwrap().unwrap();
    assert_eq!(loaded.paths(), ["src/a.rs", "src/b.rs"]);
}
