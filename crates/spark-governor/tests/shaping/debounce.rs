pub mod debounce {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use spark_governor::{Debounce, GovernorError, MockClock};

    use crate::common::{advance, settle};

    fn counting(clock: &MockClock, runs: &Arc<AtomicU32>) -> Debounce<&'static str, String> {
        let runs = Arc::clone(runs);
        Debounce::new(
            move |query: &'static str| {
                runs.fetch_add(1, Ordering::SeqCst);
                async move { Ok(format!("results for {query}")) }
            },
            Duration::from_millis(50),
            clock.shared(),
        )
    }

    #[tokio::test]
    async fn only_the_last_call_in_a_quiet_period_runs() {
        let clock = MockClock::new();
        let runs = Arc::new(AtomicU32::new(0));
        let debounce = counting(&clock, &runs);

        let first = tokio::spawn(debounce.call("r"));
        settle().await;
        advance(&clock, Duration::from_millis(30)).await;
        let second = tokio::spawn(debounce.call("ru"));
        settle().await;
        advance(&clock, Duration::from_millis(30)).await;
        let third = tokio::spawn(debounce.call("rust"));
        settle().await;

        assert_eq!(first.await.expect("join"), Err(GovernorError::Superseded));
        assert_eq!(second.await.expect("join"), Err(GovernorError::Superseded));
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        advance(&clock, Duration::from_millis(50)).await;
        assert_eq!(
            third.await.expect("join"),
            Ok("results for rust".to_owned())
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!debounce.is_pending());
    }

    #[tokio::test]
    async fn calls_in_separate_quiet_periods_each_run() {
        let clock = MockClock::new();
        let runs = Arc::new(AtomicU32::new(0));
        let debounce = counting(&clock, &runs);

        let first = tokio::spawn(debounce.call("a"));
        settle().await;
        advance(&clock, Duration::from_millis(50)).await;
        let second = tokio::spawn(debounce.call("b"));
        settle().await;
        advance(&clock, Duration::from_millis(50)).await;

        assert_eq!(first.await.expect("join"), Ok("results for a".to_owned()));
        assert_eq!(second.await.expect("join"), Ok("results for b".to_owned()));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
