pub mod composition {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use spark_governor::{
        ConfigError, DedupOptions, Governor, GovernorError, MockClock,
    };

    use crate::common::{advance, settle};

    const CONFIG: &str = r#"
        [limiter]
        capacity = 2
        refill_per_second = 1.0
        rate_limit_cool_down_ms = 500

        [retry]
        max_retries = 2
        base_delay_ms = 100
        max_delay_ms = 1000
        jitter = false

        [batch]
        max_batch_size = 2
        max_batch_delay_ms = 10
    "#;

    fn governor(clock: &MockClock) -> Governor {
        Governor::from_toml_str(CONFIG, clock.shared()).expect("valid config")
    }

    #[test]
    fn invalid_configuration_is_rejected_up_front() {
        let clock = MockClock::new();
        let err = Governor::from_toml_str("[retry]\nfactor = 0.5\n", clock.shared())
            .expect_err("factor below 1");
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "retry.factor",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn transient_failures_retry_within_one_token() {
        let clock = MockClock::new();
        let governor = governor(&clock);
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&attempts);
        let call = tokio::spawn(governor.call(0, move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(GovernorError::status(503, "warming up"))
                } else {
                    Ok("ready")
                }
            }
        }));

        settle().await;
        advance(&clock, Duration::from_millis(100)).await;
        advance(&clock, Duration::from_millis(200)).await;

        assert_eq!(call.await.expect("join"), Ok("ready"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let status = governor.limiter().status();
        assert_eq!(status.dispatched, 1);
        assert_eq!(status.requeued, 0);
    }

    #[tokio::test]
    async fn rate_limits_are_handed_back_to_the_limiter() {
        let clock = MockClock::new();
        let governor = governor(&clock);
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&attempts);
        let call = tokio::spawn(governor.call(0, move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(GovernorError::status(429, "slow down"))
                } else {
                    Ok(attempt)
                }
            }
        }));

        settle().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        advance(&clock, Duration::from_millis(500)).await;

        assert_eq!(call.await.expect("join"), Ok(1));
        let status = governor.limiter().status();
        assert_eq!(status.dispatched, 2);
        assert_eq!(status.requeued, 1);
    }

    #[tokio::test]
    async fn deduplicated_reads_spend_one_token() {
        let clock = MockClock::new();
        let governor = governor(&clock);
        let dedup = governor.deduplicator::<u64>();
        let fetches = Arc::new(AtomicU32::new(0));

        let read = |fetches: Arc<AtomicU32>| {
            let limiter = governor.limiter().clone();
            move || {
                limiter.execute(
                    move || {
                        let fetches = Arc::clone(&fetches);
                        async move {
                            fetches.fetch_add(1, Ordering::SeqCst);
                            Ok(42)
                        }
                    },
                    5,
                )
            }
        };

        let a = dedup.execute("account:7", read(Arc::clone(&fetches)), DedupOptions::default());
        let b = dedup.execute("account:7", read(Arc::clone(&fetches)), DedupOptions::default());
        let (a, b) = tokio::join!(a, b);

        assert_eq!((a, b), (Ok(42), Ok(42)));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(governor.limiter().status().dispatched, 1);
    }

    #[tokio::test]
    async fn factories_share_configuration_and_clock() {
        let clock = MockClock::new();
        let governor = governor(&clock);
        let batcher = governor.batcher::<u32, u32>();

        let single = tokio::spawn(batcher.add("sum", 5, |items: Vec<u32>| async move {
            Ok(items.into_iter().map(|item| item + 1).collect())
        }));
        settle().await;
        advance(&clock, Duration::from_millis(10)).await;
        assert_eq!(single.await.expect("join"), Ok(6));

        assert_eq!(governor.config().limiter.capacity, 2);
        assert_eq!(governor.retry_policy().config().max_retries, 2);
        assert!(governor.config().retry.factor >= 1.0);
        assert!(format!("{governor:?}").starts_with("Governor {"));
    }
}
