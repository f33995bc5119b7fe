pub mod cache_ttl {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use spark_governor::{DedupConfig, DedupOptions, KeyPattern, MockClock, RequestDeduplicator};

    use crate::common::advance;

    type Counted = std::future::Ready<spark_governor::Result<u32>>;

    fn counting(counter: &Arc<AtomicU32>) -> impl FnOnce() -> Counted + Send + 'static {
        let counter = Arc::clone(counter);
        move || std::future::ready(Ok(counter.fetch_add(1, Ordering::SeqCst) + 1))
    }

    #[tokio::test]
    async fn expired_entries_trigger_exactly_one_refresh() {
        let clock = MockClock::new();
        let config = DedupConfig {
            cache_ttl_ms: 1_000,
            ..DedupConfig::default()
        };
        let dedup = RequestDeduplicator::new(config, clock.shared());
        let counter = Arc::new(AtomicU32::new(0));

        let fresh = DedupOptions::default();
        assert_eq!(dedup.execute("k", counting(&counter), fresh).await, Ok(1));
        advance(&clock, Duration::from_millis(999)).await;
        assert_eq!(dedup.execute("k", counting(&counter), fresh).await, Ok(1));

        advance(&clock, Duration::from_millis(1)).await;
        let refreshed = (
            dedup.execute("k", counting(&counter), DedupOptions::default()),
            dedup.execute("k", counting(&counter), DedupOptions::default()),
        );
        let (a, b) = tokio::join!(refreshed.0, refreshed.1);
        assert_eq!((a, b), (Ok(2), Ok(2)));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_matches_exact_prefix_and_regex() {
        let clock = MockClock::new();
        let dedup = RequestDeduplicator::new(DedupConfig::default(), clock.shared());
        let counter = Arc::new(AtomicU32::new(0));
        for key in ["user:1", "user:2", "user:2/profile", "team:9"] {
            dedup
                .execute(key, counting(&counter), DedupOptions::default())
                .await
                .expect("cached");
        }
        assert_eq!(dedup.cache_len(), 4);

        assert_eq!(dedup.invalidate(&KeyPattern::exact("user:1")), 1);
        assert_eq!(
            dedup.invalidate(&KeyPattern::regex(r"/profile$").expect("valid")),
            1
        );
        assert_eq!(dedup.invalidate(&KeyPattern::prefix("user:")), 1);
        assert_eq!(dedup.cache_len(), 1);

        dedup.clear_cache();
        assert_eq!(dedup.cache_len(), 0);
        assert_eq!(
            dedup.execute("team:9", counting(&counter), DedupOptions::default()).await,
            Ok(5)
        );
    }

    #[tokio::test]
    async fn capacity_bound_evicts_oldest_entry() {
        let clock = MockClock::new();
        let config = DedupConfig {
            cache_ttl_ms: 10_000,
            max_cache_entries: Some(2),
        };
        let dedup = RequestDeduplicator::new(config, clock.shared());
        let counter = Arc::new(AtomicU32::new(0));

        for key in ["a", "b", "c"] {
            dedup
                .execute(key, counting(&counter), DedupOptions::default())
                .await
                .expect("cached");
            advance(&clock, Duration::from_millis(10)).await;
        }
        assert_eq!(dedup.cache_len(), 2);
        assert_eq!(
            dedup.execute("a", counting(&counter), DedupOptions::default()).await,
            Ok(4),
            "oldest entry was evicted and must be recomputed"
        );
        assert_eq!(
            dedup.execute("c", counting(&counter), DedupOptions::default()).await,
            Ok(3)
        );
    }

    #[tokio::test]
    async fn evict_expired_drops_only_stale_entries() {
        let clock = MockClock::new();
        let config = DedupConfig {
            cache_ttl_ms: 100,
            ..DedupConfig::default()
        };
        let dedup = RequestDeduplicator::new(config, clock.shared());
        let counter = Arc::new(AtomicU32::new(0));

        for key in ["old", "new"] {
            dedup
                .execute(key, counting(&counter), DedupOptions::default())
                .await
                .expect("cached");
            advance(&clock, Duration::from_millis(60)).await;
        }

        assert_eq!(dedup.evict_expired(), 1);
        assert_eq!(dedup.cache_len(), 1);
    }
}
