pub mod end_to_end {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use spark_governor::{
        DrainState, GovernorError, LimiterConfig, MockClock, TokenBucketLimiter,
    };

    use crate::common::{advance, settle};

    fn limiter(clock: &MockClock, rate: f64) -> TokenBucketLimiter {
        let config = LimiterConfig {
            capacity: 1,
            refill_per_second: rate,
            ..LimiterConfig::default()
        };
        TokenBucketLimiter::new(config, clock.shared())
    }

    fn counting_calls(
        limiter: &TokenBucketLimiter,
        executed: &Arc<AtomicU32>,
        count: usize,
    ) -> Vec<tokio::task::JoinHandle<spark_governor::Result<()>>> {
        (0..count)
            .map(|_| {
                let executed = Arc::clone(executed);
                tokio::spawn(limiter.execute(
                    move || {
                        executed.fetch_add(1, Ordering::SeqCst);
                        async { Ok(()) }
                    },
                    0,
                ))
            })
            .collect()
    }

    #[tokio::test]
    async fn zero_rate_holds_the_queue_until_reset() {
        let clock = MockClock::new();
        let limiter = limiter(&clock, 0.0);
        let executed = Arc::new(AtomicU32::new(0));
        let calls = counting_calls(&limiter, &executed, 3);

        settle().await;
        assert_eq!(executed.load(Ordering::SeqCst), 1);
        let status = limiter.status();
        assert_eq!(status.queue_length, 2);
        assert_eq!(status.available_tokens, 0);
        assert_eq!(status.utilization, 100.0);
        assert_eq!(status.drain, DrainState::Draining);

        advance(&clock, Duration::from_secs(3_600)).await;
        assert_eq!(limiter.status().queue_length, 2);

        limiter.reset();
        settle().await;
        let outcomes: Vec<_> = futures::future::join_all(calls)
            .await
            .into_iter()
            .map(|joined| joined.expect("join"))
            .collect();
        assert_eq!(outcomes[0], Ok(()));
        for outcome in &outcomes[1..] {
            assert!(matches!(outcome, Err(GovernorError::Abandoned { .. })));
        }
        assert_eq!(limiter.status().drain, DrainState::Idle);
    }

    #[tokio::test]
    async fn queue_shrinks_as_tokens_refill() {
        let clock = MockClock::new();
        let limiter = limiter(&clock, 1.0);
        let executed = Arc::new(AtomicU32::new(0));
        let calls = counting_calls(&limiter, &executed, 3);

        settle().await;
        assert_eq!(limiter.status().queue_length, 2);
        advance(&clock, Duration::from_millis(999)).await;
        assert_eq!(limiter.status().queue_length, 2);
        advance(&clock, Duration::from_millis(1)).await;
        assert_eq!(limiter.status().queue_length, 1);
        advance(&clock, Duration::from_secs(1)).await;
        assert_eq!(executed.load(Ordering::SeqCst), 3);

        for call in calls {
            call.await.expect("join").expect("call succeeds");
        }
    }

    #[tokio::test]
    async fn status_serializes_for_export() {
        let clock = MockClock::new();
        let limiter = limiter(&clock, 1.0);
        let json = serde_json::to_value(limiter.status()).expect("serializable");
        assert_eq!(json["available_tokens"], 1);
        assert_eq!(json["drain"], "idle");
    }
}
