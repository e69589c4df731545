//! Aggregator behavior across both tiers

use crate::support::{aggregator, entry_in, strong, weak, CountingTier, FailingTier};
use futures_util::future::join_all;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use vstore::config::{AggregatorConfig, WritePolicy};
use vstore::model::{CacheEntry, ContentHash, Determinism, Tier};
use vstore::store::{read_all, ContentStore, FingerprintStore, MemoryTier, PinOutcome};
use vstore::{VerticalAggregator, VstoreError};

fn memory_tiers() -> (Arc<MemoryTier>, Arc<MemoryTier>) {
    (
        Arc::new(MemoryTier::new(Tier::Local)),
        Arc::new(MemoryTier::new(Tier::Remote)),
    )
}

#[tokio::test]
async fn remote_hit_is_backfilled_into_local() {
    let (local, remote) = memory_tiers();
    let fp = strong("main.c", "v1");
    let entry = entry_in(remote.as_ref(), "main.o", Determinism::Deterministic).await;
    remote.add_or_get(&fp, entry.clone()).await.unwrap();

    let (cache, sink) = aggregator(local.clone(), remote.clone(), AggregatorConfig::default());
    let lookup = cache.get_cache_entries(fp.weak).await.unwrap();
    assert_eq!(lookup.source, Some(Tier::Remote));
    assert_eq!(lookup.entry(&fp), Some(&entry));

    cache.flush().await;
    assert_eq!(local.get_cache_entry(&fp).await.unwrap(), Some(entry.clone()));
    for hash in entry.referenced_content() {
        assert_eq!(local.pin(&hash).await.unwrap(), PinOutcome::Pinned);
    }
    assert_eq!(sink.count("entry_backfilled"), 1);
    assert_eq!(sink.count("content_backfilled"), 2);
}

#[tokio::test]
async fn awaited_backfill_completes_before_return() {
    let (local, remote) = memory_tiers();
    let fp = strong("main.c", "v1");
    let entry = entry_in(remote.as_ref(), "main.o", Determinism::Deterministic).await;
    remote.add_or_get(&fp, entry.clone()).await.unwrap();

    let config = AggregatorConfig {
        await_backfill: true,
        ..Default::default()
    };
    let (cache, _) = aggregator(local.clone(), remote, config);
    cache.get_cache_entry(fp).await.unwrap();

    assert_eq!(cache.background_tasks(), 0);
    for hash in entry.referenced_content() {
        assert_eq!(local.pin(&hash).await.unwrap(), PinOutcome::Pinned);
    }
}

#[tokio::test]
async fn local_hit_skips_remote_queries() {
    let local = Arc::new(MemoryTier::new(Tier::Local));
    let remote = Arc::new(CountingTier::new(Tier::Remote));
    let fp = strong("main.c", "v1");
    let entry = entry_in(local.as_ref(), "main.o", Determinism::Deterministic).await;
    local.add_or_get(&fp, entry.clone()).await.unwrap();

    let config = AggregatorConfig {
        verify_local_hits: false,
        ..Default::default()
    };
    let (cache, _) = aggregator(local, remote.clone(), config);
    let lookup = cache.get_cache_entries(fp.weak).await.unwrap();

    assert_eq!(lookup.source, Some(Tier::Local));
    assert_eq!(lookup.entry(&fp), Some(&entry));
    assert_eq!(remote.entries_queries.load(Ordering::SeqCst), 0);
    assert_eq!(remote.entry_queries.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn concurrent_lookups_share_one_remote_query() {
    let local = Arc::new(MemoryTier::new(Tier::Local));
    let remote = Arc::new(CountingTier::slow(Tier::Remote, Duration::from_millis(100)));
    let fp = strong("main.c", "v1");
    let entry = entry_in(&remote.inner, "main.o", Determinism::Deterministic).await;
    remote.inner.add_or_get(&fp, entry.clone()).await.unwrap();

    let (cache, sink) = aggregator(local, remote.clone(), AggregatorConfig::default());
    let lookups = join_all((0..8).map(|_| cache.get_cache_entries(fp.weak))).await;

    for lookup in lookups {
        assert_eq!(lookup.unwrap().entry(&fp), Some(&entry));
    }
    assert_eq!(remote.entries_queries.load(Ordering::SeqCst), 1);
    assert!(sink.count("single_flight_deduplicated") >= 7);
}

#[tokio::test]
async fn more_deterministic_remote_entry_repairs_local() {
    let (local, remote) = memory_tiers();
    let fp = strong("main.c", "v1");
    let stale = entry_in(local.as_ref(), "local.o", Determinism::PossiblyNonDeterministic).await;
    let authoritative = entry_in(remote.as_ref(), "remote.o", Determinism::Deterministic).await;
    local.add_or_get(&fp, stale).await.unwrap();
    remote.add_or_get(&fp, authoritative.clone()).await.unwrap();

    let (cache, sink) = aggregator(local.clone(), remote, AggregatorConfig::default());
    let lookup = cache.get_cache_entry(fp).await.unwrap();
    assert_eq!(lookup.entry(&fp), Some(&authoritative));
    assert!(lookup.violations.is_empty());

    cache.flush().await;
    assert_eq!(local.get_cache_entry(&fp).await.unwrap(), Some(authoritative.clone()));
    assert_eq!(
        local.pin(&authoritative.outputs[0]).await.unwrap(),
        PinOutcome::Pinned
    );
    assert_eq!(sink.count("tier_repaired"), 1);
}

#[tokio::test]
async fn determinism_never_regresses() {
    let (local, remote) = memory_tiers();
    let fp = strong("main.c", "v1");
    let deterministic = entry_in(local.as_ref(), "first.o", Determinism::Deterministic).await;
    let weaker = entry_in(local.as_ref(), "second.o", Determinism::PossiblyNonDeterministic).await;

    let config = AggregatorConfig {
        write_policy: WritePolicy::LocalOnly,
        ..Default::default()
    };
    let (cache, _) = aggregator(local.clone(), remote, config);
    cache.add_or_get(fp, deterministic.clone()).await.unwrap();

    let outcome = cache.add_or_get(fp, weaker).await.unwrap();
    assert!(!outcome.newly_added);
    assert_eq!(outcome.entry, deterministic);
    assert_eq!(local.get_cache_entry(&fp).await.unwrap(), Some(deterministic));
}

#[tokio::test]
async fn more_deterministic_proposal_replaces_local_entry() {
    let (local, remote) = memory_tiers();
    let fp = strong("main.c", "v1");
    let weaker = entry_in(local.as_ref(), "first.o", Determinism::PossiblyNonDeterministic).await;
    let stronger = entry_in(local.as_ref(), "second.o", Determinism::ToolDeterministic).await;

    let (cache, sink) = aggregator(local.clone(), remote.clone(), AggregatorConfig::default());
    cache.add_or_get(fp, weaker).await.unwrap();
    cache.flush().await;
    let outcome = cache.add_or_get(fp, stronger.clone()).await.unwrap();
    cache.flush().await;

    assert_eq!(outcome.entry, stronger);
    assert_eq!(local.get_cache_entry(&fp).await.unwrap(), Some(stronger.clone()));
    assert_eq!(remote.get_cache_entry(&fp).await.unwrap(), Some(stronger));
    assert_eq!(sink.count("tier_repaired"), 2);
}

#[tokio::test]
async fn conflicting_deterministic_entries_prefer_remote() {
    let (local, remote) = memory_tiers();
    let fp = strong("main.c", "v1");
    let ours = entry_in(local.as_ref(), "local.o", Determinism::Deterministic).await;
    let theirs = entry_in(remote.as_ref(), "remote.o", Determinism::Deterministic).await;
    local.add_or_get(&fp, ours.clone()).await.unwrap();
    remote.add_or_get(&fp, theirs.clone()).await.unwrap();

    let (cache, sink) = aggregator(local.clone(), remote, AggregatorConfig::default());
    let lookup = cache.get_cache_entries(fp.weak).await.unwrap();

    assert_eq!(lookup.entry(&fp), Some(&theirs));
    assert_eq!(lookup.violations.len(), 1);
    assert_eq!(lookup.violations[0].kept, theirs);
    assert_eq!(lookup.violations[0].rejected, ours);
    assert_eq!(sink.count("determinism_violation"), 1);

    cache.flush().await;
    assert_eq!(local.get_cache_entry(&fp).await.unwrap(), Some(ours));
}

#[tokio::test]
async fn more_deterministic_local_entry_repairs_remote_with_its_content() {
    let (local, remote) = memory_tiers();
    let fp = strong("main.c", "v1");
    let ours = entry_in(local.as_ref(), "local.o", Determinism::Deterministic).await;
    let theirs = entry_in(remote.as_ref(), "remote.o", Determinism::PossiblyNonDeterministic).await;
    local.add_or_get(&fp, ours.clone()).await.unwrap();
    remote.add_or_get(&fp, theirs).await.unwrap();

    let (cache, sink) = aggregator(local, remote.clone(), AggregatorConfig::default());
    let lookup = cache.get_cache_entries(fp.weak).await.unwrap();
    assert_eq!(lookup.source, Some(Tier::Local));
    assert_eq!(lookup.entry(&fp), Some(&ours));
    assert!(lookup.violations.is_empty());

    cache.flush().await;
    assert_eq!(remote.get_cache_entry(&fp).await.unwrap(), Some(ours.clone()));
    for hash in ours.referenced_content() {
        assert_eq!(remote.pin(&hash).await.unwrap(), PinOutcome::Pinned);
    }
    assert_eq!(sink.count("tier_repaired"), 1);
}

#[tokio::test]
async fn dangling_local_entry_never_overrides_remote() {
    let (local, remote) = memory_tiers();
    let fp = strong("main.c", "v1");
    let dangling = CacheEntry::new(
        vec![ContentHash::of(b"gone")],
        ContentHash::of(b"gone metadata"),
        Determinism::Deterministic,
    );
    let good = entry_in(remote.as_ref(), "main.o", Determinism::PossiblyNonDeterministic).await;
    local.add_or_get(&fp, dangling).await.unwrap();
    remote.add_or_get(&fp, good.clone()).await.unwrap();

    let (cache, sink) = aggregator(local, remote.clone(), AggregatorConfig::default());
    let lookup = cache.get_cache_entry(fp).await.unwrap();
    assert_eq!(lookup.source, Some(Tier::Remote));
    assert_eq!(lookup.entry(&fp), Some(&good));
    assert!(lookup.violations.is_empty());

    cache.flush().await;
    assert_eq!(remote.get_cache_entry(&fp).await.unwrap(), Some(good));
    assert_eq!(sink.count("tier_repaired"), 0);
    assert_eq!(sink.count("determinism_violation"), 0);
}

#[tokio::test]
async fn write_behind_mirrors_content_and_entry() {
    let (local, remote) = memory_tiers();
    let fp = strong("main.c", "v1");
    let entry = entry_in(local.as_ref(), "main.o", Determinism::Deterministic).await;

    let (cache, sink) = aggregator(local, remote.clone(), AggregatorConfig::default());
    let outcome = cache.add_or_get(fp, entry.clone()).await.unwrap();
    assert!(outcome.newly_added);

    cache.flush().await;
    assert_eq!(remote.get_cache_entry(&fp).await.unwrap(), Some(entry.clone()));
    for hash in entry.referenced_content() {
        assert_eq!(remote.pin(&hash).await.unwrap(), PinOutcome::Pinned);
    }
    assert_eq!(sink.count("content_mirrored"), 2);
}

#[tokio::test]
async fn write_through_mirrors_before_returning() {
    let (local, remote) = memory_tiers();
    let fp = strong("main.c", "v1");
    let entry = entry_in(local.as_ref(), "main.o", Determinism::Deterministic).await;

    let config = AggregatorConfig {
        write_policy: WritePolicy::WriteThrough,
        ..Default::default()
    };
    let (cache, _) = aggregator(local, remote.clone(), config);
    cache.add_or_get(fp, entry.clone()).await.unwrap();

    assert_eq!(remote.get_cache_entry(&fp).await.unwrap(), Some(entry));
}

#[tokio::test]
async fn write_through_reports_unreachable_remote() {
    let local = Arc::new(MemoryTier::new(Tier::Local));
    let fp = strong("main.c", "v1");
    let entry = entry_in(local.as_ref(), "main.o", Determinism::Deterministic).await;

    let config = AggregatorConfig {
        write_policy: WritePolicy::WriteThrough,
        ..Default::default()
    };
    let (cache, _) = aggregator(local.clone(), Arc::new(FailingTier::new(Tier::Remote)), config);
    let err = cache.add_or_get(fp, entry.clone()).await.unwrap_err();

    assert!(matches!(err, VstoreError::WriteFailed { .. }));
    assert_eq!(local.get_cache_entry(&fp).await.unwrap(), Some(entry));
}

#[tokio::test]
async fn write_through_times_out_on_slow_remote() {
    let local = Arc::new(MemoryTier::new(Tier::Local));
    let remote = Arc::new(CountingTier::slow(Tier::Remote, Duration::from_millis(500)));
    let fp = strong("main.c", "v1");
    let entry = entry_in(local.as_ref(), "main.o", Determinism::Deterministic).await;

    let config = AggregatorConfig {
        write_policy: WritePolicy::WriteThrough,
        remote_timeout_ms: 20,
        ..Default::default()
    };
    let (cache, _) = aggregator(local, remote, config);
    let err = cache.add_or_get(fp, entry).await.unwrap_err();

    assert!(matches!(err, VstoreError::WriteFailed { .. }));
}

#[tokio::test]
async fn write_behind_failure_is_reported_not_raised() {
    let local = Arc::new(MemoryTier::new(Tier::Local));
    let fp = strong("main.c", "v1");
    let entry = entry_in(local.as_ref(), "main.o", Determinism::Deterministic).await;

    let (cache, sink) = aggregator(
        local,
        Arc::new(FailingTier::new(Tier::Remote)),
        AggregatorConfig::default(),
    );
    cache.add_or_get(fp, entry).await.unwrap();
    cache.flush().await;

    assert_eq!(sink.count("mirror_failed"), 1);
}

#[tokio::test]
async fn local_only_works_without_remote() {
    let local = Arc::new(MemoryTier::new(Tier::Local));
    let fp = strong("main.c", "v1");
    let entry = entry_in(local.as_ref(), "main.o", Determinism::Deterministic).await;

    let config = AggregatorConfig {
        write_policy: WritePolicy::LocalOnly,
        ..Default::default()
    };
    let (cache, sink) = aggregator(local, Arc::new(FailingTier::new(Tier::Remote)), config);

    let outcome = cache.add_or_get(fp, entry.clone()).await.unwrap();
    assert!(outcome.newly_added);
    cache.flush().await;
    assert_eq!(sink.count("mirror_failed"), 0);

    let lookup = cache.get_cache_entries(fp.weak).await.unwrap();
    assert_eq!(lookup.entry(&fp), Some(&entry));
    assert!(lookup.degraded);

    let miss = cache.get_cache_entries(weak("other.c")).await.unwrap();
    assert!(miss.is_miss());
}

#[tokio::test]
async fn local_only_never_writes_to_remote() {
    let local = Arc::new(MemoryTier::new(Tier::Local));
    let remote = Arc::new(CountingTier::new(Tier::Remote));
    let published = strong("main.c", "v1");
    let entry = entry_in(local.as_ref(), "main.o", Determinism::Deterministic).await;

    // Remote holds a weaker entry the local one would otherwise repair
    let shared = strong("util.c", "v1");
    let ours = entry_in(local.as_ref(), "util.o", Determinism::Deterministic).await;
    let theirs = entry_in(&remote.inner, "util-remote.o", Determinism::PossiblyNonDeterministic).await;
    local.add_or_get(&shared, ours.clone()).await.unwrap();
    remote.inner.add_or_get(&shared, theirs.clone()).await.unwrap();
    let remote_blobs = remote.inner.blob_count();

    let config = AggregatorConfig {
        write_policy: WritePolicy::LocalOnly,
        ..Default::default()
    };
    let (cache, sink) = aggregator(local, remote.clone(), config);

    cache.add_or_get(published, entry).await.unwrap();
    let lookup = cache.get_cache_entry(shared).await.unwrap();
    assert_eq!(lookup.entry(&shared), Some(&ours));
    cache.flush().await;

    assert_eq!(remote.publishes.load(Ordering::SeqCst), 0);
    assert_eq!(remote.inner.blob_count(), remote_blobs);
    assert_eq!(remote.inner.get_cache_entry(&published).await.unwrap(), None);
    assert_eq!(remote.inner.get_cache_entry(&shared).await.unwrap(), Some(theirs));
    assert_eq!(sink.count("content_mirrored"), 0);
    assert_eq!(sink.count("tier_repaired"), 0);
}

#[tokio::test]
async fn slow_remote_read_degrades_to_miss() {
    let local = Arc::new(MemoryTier::new(Tier::Local));
    let remote = Arc::new(CountingTier::slow(Tier::Remote, Duration::from_millis(500)));
    let config = AggregatorConfig {
        remote_timeout_ms: 20,
        ..Default::default()
    };
    let (cache, sink) = aggregator(local, remote, config);

    let lookup = cache.get_cache_entries(weak("main.c")).await.unwrap();
    assert!(lookup.is_miss());
    assert!(lookup.degraded);
    assert_eq!(sink.count("remote_degraded"), 1);
}

#[tokio::test]
async fn disabled_remote_reads_never_query_remote() {
    let local = Arc::new(MemoryTier::new(Tier::Local));
    let remote = Arc::new(CountingTier::new(Tier::Remote));
    let config = AggregatorConfig {
        remote_read_enabled: false,
        ..Default::default()
    };
    let (cache, _) = aggregator(local, remote.clone(), config);

    let lookup = cache.get_cache_entries(weak("main.c")).await.unwrap();
    assert!(lookup.is_miss());
    assert!(!lookup.degraded);
    assert_eq!(remote.entries_queries.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn lookup_after_publish_sees_the_write() {
    let (local, remote) = memory_tiers();
    let fp = strong("main.c", "v1");
    let entry = entry_in(local.as_ref(), "main.o", Determinism::Deterministic).await;
    let (cache, _) = aggregator(local, remote, AggregatorConfig::default());

    assert!(cache.get_cache_entries(fp.weak).await.unwrap().is_miss());
    cache.add_or_get(fp, entry.clone()).await.unwrap();

    let lookup = cache.get_cache_entries(fp.weak).await.unwrap();
    assert_eq!(lookup.entry(&fp), Some(&entry));
}

#[tokio::test]
async fn corrupt_local_content_is_served_from_remote() {
    let (local, remote) = memory_tiers();
    let hash = remote.put(b"artifact").await.unwrap();
    local.insert_raw(hash, b"bit rot".to_vec());

    let (cache, sink) = aggregator(local.clone(), remote, AggregatorConfig::default());
    let bytes = cache.get_content(hash).await.unwrap();

    assert_eq!(bytes.as_deref(), Some(&b"artifact"[..]));
    assert_eq!(sink.count("integrity_failure"), 1);
    assert_eq!(sink.count("content_backfilled"), 1);

    let healed = read_all(local.get_stream(&hash).await.unwrap().unwrap(), Tier::Local)
        .await
        .unwrap();
    assert_eq!(healed, b"artifact");

    let again = cache.get_content(hash).await.unwrap();
    assert_eq!(again.as_deref(), Some(&b"artifact"[..]));
    assert_eq!(sink.count("integrity_failure"), 1);
}

#[tokio::test]
async fn concurrent_content_reads_share_one_remote_fetch() {
    let local = Arc::new(MemoryTier::new(Tier::Local));
    let remote = Arc::new(CountingTier::slow(Tier::Remote, Duration::from_millis(100)));
    let hash = remote.inner.put(b"artifact").await.unwrap();

    let (cache, sink) = aggregator(local.clone(), remote.clone(), AggregatorConfig::default());
    let reads = join_all((0..8).map(|_| cache.get_content(hash))).await;

    for read in reads {
        assert_eq!(read.unwrap().as_deref(), Some(&b"artifact"[..]));
    }
    assert_eq!(remote.streams.load(Ordering::SeqCst), 1);
    assert_eq!(sink.count("content_backfilled"), 1);
    assert!(sink.count("single_flight_deduplicated") >= 7);
    assert_eq!(local.blob_count(), 1);
}

#[tokio::test]
async fn corrupt_content_in_both_tiers_is_an_error() {
    let (local, remote) = memory_tiers();
    let hash = ContentHash::of(b"artifact");
    local.insert_raw(hash, b"bit rot".to_vec());

    let (cache, _) = aggregator(local, remote, AggregatorConfig::default());
    let err = cache.get_content(hash).await.unwrap_err();

    assert!(matches!(err, VstoreError::ContentHashMismatch { tier: Tier::Local, .. }));
}

#[tokio::test]
async fn pin_backfills_remote_content() {
    let (local, remote) = memory_tiers();
    let hash = remote.put(b"artifact").await.unwrap();
    let (cache, _) = aggregator(local.clone(), remote, AggregatorConfig::default());

    assert_eq!(cache.pin_to_cas(hash).await.unwrap(), PinOutcome::Pinned);
    assert_eq!(local.pin_count(&hash), 1);

    let missing = ContentHash::of(b"nowhere");
    assert_eq!(cache.pin_to_cas(missing).await.unwrap(), PinOutcome::NotFound);
}

#[test]
fn invalid_policy_is_rejected_at_construction() {
    let (local, remote) = memory_tiers();
    let config = AggregatorConfig {
        remote_timeout_ms: 0,
        ..Default::default()
    };
    let result = VerticalAggregator::new(
        local,
        remote,
        config,
        Arc::new(vstore::telemetry::NullSink),
    );
    assert!(matches!(result, Err(VstoreError::ConfigConflict(_))));
}
