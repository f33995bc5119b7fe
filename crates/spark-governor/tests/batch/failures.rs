pub mod failures {
    use std::time::Duration;

    use spark_governor::{BatchConfig, GovernorError, MockClock, RequestBatcher};

    use crate::common::{advance, settle};

    #[tokio::test]
    async fn processor_error_rejects_every_waiter() {
        let clock = MockClock::new();
        let config = BatchConfig {
            max_batch_size: 10,
            max_batch_delay_ms: 20,
        };
        let batcher = RequestBatcher::<u32, u32>::new(config, clock.shared());
        let processor =
            |_items: Vec<u32>| async { Err(GovernorError::rejected("item 2 failed validation")) };

        let calls: Vec<_> = (0..3)
            .map(|item| tokio::spawn(batcher.add("bulk", item, processor)))
            .collect();
        settle().await;
        advance(&clock, Duration::from_millis(20)).await;

        for call in calls {
            assert_eq!(
                call.await.expect("join"),
                Err(GovernorError::rejected("item 2 failed validation"))
            );
        }
    }

    #[tokio::test]
    async fn processor_is_fixed_when_the_batch_opens() {
        let clock = MockClock::new();
        let config = BatchConfig {
            max_batch_size: 2,
            max_batch_delay_ms: 20,
        };
        let batcher = RequestBatcher::<u32, u32>::new(config, clock.shared());

        let doubled = batcher.add("k", 1, |items: Vec<u32>| async move {
            Ok(items.into_iter().map(|item| item * 2).collect())
        });
        let ignored = batcher.add("k", 2, |items: Vec<u32>| async move {
            Ok(items.into_iter().map(|item| item * 100).collect())
        });

        assert_eq!(doubled.await, Ok(2));
        assert_eq!(ignored.await, Ok(4));
    }
}
