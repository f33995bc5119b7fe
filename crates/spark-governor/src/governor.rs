use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::batch::RequestBatcher;
use crate::config::GovernorConfig;
use crate::dedup::RequestDeduplicator;
use crate::error::{ConfigError, Result};
use crate::limiter::TokenBucketLimiter;
use crate::retry::RetryPolicy;
use crate::shaping::{Debounce, Throttle};
use crate::time::SharedClock;

/// 治理组件的组合根。
///
/// # 设计背景（Why）
/// - 应用在启动时显式构造一个 `Governor` 并以引用传递给调用方，不存在进程级单例；
/// - 同一个 `Governor` 派生的组件共享时钟与配置，测试注入 [`MockClock`](crate::time::MockClock)
///   即可让整条调用链确定性地推进。
///
/// # 契约说明（What）
/// - 限流器与重试策略各只有一份，所有 [`call`](Self::call) 共享同一个令牌桶；
/// - 去重器与批处理器按结果类型区分，每次调用工厂方法都得到一个独立实例。
#[derive(Clone)]
pub struct Governor {
    config: GovernorConfig,
    clock: SharedClock,
    limiter: TokenBucketLimiter,
    retry: RetryPolicy,
}

impl Governor {
    /// 校验配置并构造全部共享组件。
    pub fn new(config: GovernorConfig, clock: SharedClock) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let limiter = TokenBucketLimiter::new(config.limiter.clone(), Arc::clone(&clock));
        let retry = RetryPolicy::new(config.retry.clone(), Arc::clone(&clock));
        Ok(Self {
            config,
            clock,
            limiter,
            retry,
        })
    }

    /// 从 TOML 文本构造。
    pub fn from_toml_str(
        source: &str,
        clock: SharedClock,
    ) -> std::result::Result<Self, ConfigError> {
        Self::new(GovernorConfig::from_toml_str(source)?, clock)
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn limiter(&self) -> &TokenBucketLimiter {
        &self.limiter
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn deduplicator<T>(&self) -> RequestDeduplicator<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        RequestDeduplicator::new(self.config.dedup.clone(), Arc::clone(&self.clock))
    }

    pub fn batcher<I, R>(&self) -> RequestBatcher<I, R>
    where
        I: Send + 'static,
        R: Send + 'static,
    {
        RequestBatcher::new(self.config.batch.clone(), Arc::clone(&self.clock))
    }

    pub fn throttle<A, F>(&self, action: F, window: Duration) -> Throttle<A>
    where
        A: Send + 'static,
        F: Fn(A) + Send + Sync + 'static,
    {
        Throttle::new(action, window, Arc::clone(&self.clock))
    }

    pub fn debounce<A, T, F, Fut>(&self, action: F, quiet: Duration) -> Debounce<A, T>
    where
        A: Send + 'static,
        T: Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Debounce::new(action, quiet, Arc::clone(&self.clock))
    }

    /// 在限流器内以退避重试执行 `operation`。
    ///
    /// 每次派发占用一个令牌，令牌内部按重试策略处理瞬时故障；限流信号不在令牌内重试，
    /// 而是交还限流器冷却后重新排队。
    pub fn call<F, Fut, T>(
        &self,
        priority: i32,
        operation: F,
    ) -> impl Future<Output = Result<T>> + Send + 'static + use<F, Fut, T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let operation = Arc::new(operation);
        let retry = self
            .retry
            .clone()
            .with_predicate(|err| err.is_retryable() && !err.is_rate_limited());
        self.limiter.execute(
            move || {
                let operation = Arc::clone(&operation);
                let retry = retry.clone();
                async move { retry.run(|| operation()).await }
            },
            priority,
        )
    }
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor")
            .field("config", &self.config)
            .field("limiter", &self.limiter)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
