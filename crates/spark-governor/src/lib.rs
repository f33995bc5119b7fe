#![deny(unsafe_code)]
#![doc = "spark-governor: 面向下游 API 的客户端请求治理。"]
#![doc = ""]
#![doc = "== 组件 =="]
#![doc = "1. [`TokenBucketLimiter`]：带优先级队列的令牌桶准入控制，唯一拥有内部调度循环的组件。"]
#![doc = "2. [`RequestDeduplicator`]：同键并发调用合并为一次，并在 TTL 内缓存成功结果。"]
#![doc = "3. [`RequestBatcher`]：按批次键累积条目，数量或延迟阈值触发一次批量处理。"]
#![doc = "4. [`RetryPolicy`] / [`retry_with_backoff`]：带抖动的指数退避重试。"]
#![doc = "5. [`Throttle`] / [`Debounce`]：与上述组件共享时钟模型的调用整形工具。"]
#![doc = ""]
#![doc = "== 运行时模型 =="]
#![doc = "所有计时通过注入的 [`Clock`] 完成，后台任务运行在 Tokio 之上；共享状态由 `parking_lot::Mutex` 保护，锁从不跨越 `.await` 持有。"]
#![doc = "应用通过组合根 [`Governor`] 显式构造组件，测试注入 [`MockClock`] 以确定性地推进时间。"]

pub mod batch;
pub mod config;
pub mod dedup;
pub mod error;
pub mod governor;
pub mod limiter;
pub mod observability;
pub mod retry;
pub mod shaping;
pub mod time;

pub use batch::RequestBatcher;
pub use config::{BatchConfig, DedupConfig, GovernorConfig, LimiterConfig, RetryConfig};
pub use dedup::{DedupOptions, KeyPattern, RequestDeduplicator};
pub use error::{ConfigError, ErrorCategory, GovernorError, Result};
pub use governor::Governor;
pub use limiter::{DrainState, LimiterStatus, TokenBucketLimiter};
pub use observability::install_tracing;
pub use retry::{RetryOptions, RetryPolicy, retry_with_backoff};
pub use shaping::{Debounce, Throttle, ThrottleDecision};
pub use time::{Clock, MockClock, SharedClock, SystemClock};
