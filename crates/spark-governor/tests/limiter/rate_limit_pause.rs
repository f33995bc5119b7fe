pub mod rate_limit_pause {
    //! 限流失败后的冷却期内，队列中的其它任务即使有令牌也不得派发。

    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;
    use spark_governor::{GovernorError, LimiterConfig, MockClock, TokenBucketLimiter};

    use crate::common::{advance, settle};

    #[tokio::test]
    async fn cool_down_holds_back_lower_priority_work() {
        let clock = MockClock::new();
        let config = LimiterConfig {
            capacity: 5,
            refill_per_second: 100.0,
            ..LimiterConfig::default()
        };
        let limiter = TokenBucketLimiter::new(config, clock.shared());
        let log = Arc::new(Mutex::new(Vec::new()));
        let attempts = Arc::new(AtomicU32::new(0));

        let (urgent_log, counter) = (Arc::clone(&log), Arc::clone(&attempts));
        let urgent = tokio::spawn(limiter.execute(
            move || {
                urgent_log.lock().push("urgent");
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(GovernorError::rate_limited(Some(Duration::from_millis(200))))
                    } else {
                        Ok("urgent done")
                    }
                }
            },
            10,
        ));
        let background_log = Arc::clone(&log);
        let background = tokio::spawn(limiter.execute(
            move || {
                background_log.lock().push("background");
                async { Ok("background done") }
            },
            0,
        ));

        settle().await;
        assert_eq!(*log.lock(), vec!["urgent"]);
        assert_eq!(limiter.status().queue_length, 1);

        advance(&clock, Duration::from_millis(199)).await;
        assert_eq!(*log.lock(), vec!["urgent"]);

        advance(&clock, Duration::from_millis(1)).await;
        assert_eq!(*log.lock(), vec!["urgent", "background", "urgent"]);
        assert_eq!(urgent.await.expect("join"), Ok("urgent done"));
        assert_eq!(background.await.expect("join"), Ok("background done"));

        let status = limiter.status();
        assert_eq!(status.requeued, 1);
        assert_eq!(status.dispatched, 3);
    }

    #[tokio::test]
    async fn reset_cuts_a_cool_down_short() {
        let clock = MockClock::new();
        let limiter = TokenBucketLimiter::new(LimiterConfig::default(), clock.shared());

        let limited = tokio::spawn(limiter.execute(
            || async { Err::<(), _>(GovernorError::rate_limited(Some(Duration::from_secs(60)))) },
            0,
        ));
        settle().await;
        let queued = tokio::spawn(limiter.execute(|| async { Ok(7) }, 0));
        settle().await;
        assert_eq!(limiter.status().queue_length, 1);

        limiter.reset();
        settle().await;

        assert!(matches!(
            limited.await.expect("join"),
            Err(GovernorError::Abandoned { .. })
        ));
        assert!(matches!(
            queued.await.expect("join"),
            Err(GovernorError::Abandoned { .. })
        ));
        let status = limiter.status();
        assert_eq!(status.requeued, 0);
        assert_eq!(status.drain, spark_governor::DrainState::Idle);

        let fresh = limiter.execute(|| async { Ok(8) }, 0).await;
        assert_eq!(fresh, Ok(8));
    }
}
