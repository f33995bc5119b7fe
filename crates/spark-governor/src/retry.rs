//! 指数退避重试。
//!
//! # 行为概览（How）
//! - 第 `n` 次重试（从 0 计）前等待 `min(base · factor^n, max_delay)`；
//! - 开启抖动时在该值之上叠加 `[0, jitter_ratio · delay)` 的随机量，结果仍不超过 `max_delay`；
//! - 错误携带 `retry_after` 提示时直接采用提示值，覆盖计算结果；
//! - 次数耗尽或判定不可重试时，原样返回最后一次错误。
//!
//! 抖动使用 SplitMix64 序列：同一种子与同一调用序号下结果完全确定，
//! 测试可通过 [`RetryPolicy::with_seed`] 固定。

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{GovernorError, Result};
use crate::time::SharedClock;

/// 判定错误是否值得重试的谓词。
pub type RetryPredicate = Arc<dyn Fn(&GovernorError) -> bool + Send + Sync>;

/// 单次 [`retry_with_backoff`] 调用的选项：退避参数、可重试判定与可选的固定种子。
#[derive(Clone)]
pub struct RetryOptions {
    pub config: RetryConfig,
    pub is_retryable: RetryPredicate,
    pub seed: Option<u64>,
}

impl RetryOptions {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            is_retryable: Arc::new(GovernorError::is_retryable),
            seed: None,
        }
    }

    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&GovernorError) -> bool + Send + Sync + 'static,
    {
        self.is_retryable = Arc::new(predicate);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl From<RetryConfig> for RetryOptions {
    fn from(config: RetryConfig) -> Self {
        Self::new(config)
    }
}

impl std::fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("config", &self.config)
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}

/// 退避重试策略，克隆后共享抖动序列。
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    clock: SharedClock,
    seed: u64,
    is_retryable: RetryPredicate,
    calls: Arc<AtomicU64>,
}

impl RetryPolicy {
    /// 以默认谓词（[`GovernorError::is_retryable`]）构造策略，种子取自进程号与当前时间。
    pub fn new(config: RetryConfig, clock: SharedClock) -> Self {
        Self::from_options(RetryOptions::new(config), clock)
    }

    /// 从 [`RetryOptions`] 构造；未指定种子时同 [`new`](Self::new)。
    pub fn from_options(options: RetryOptions, clock: SharedClock) -> Self {
        Self {
            config: options.config,
            clock,
            seed: options.seed.unwrap_or_else(entropy_seed),
            is_retryable: options.is_retryable,
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 固定抖动种子。
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// 替换可重试判定。
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&GovernorError) -> bool + Send + Sync + 'static,
    {
        self.is_retryable = Arc::new(predicate);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// 第 `attempt` 次重试（从 0 计）前的等待时长。
    ///
    /// 对同一策略与同一 `attempt` 恒定；[`run`](Self::run) 内部会为每次调用换用独立的抖动序列。
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay(attempt, 0)
    }

    fn delay(&self, attempt: u32, stream: u64) -> Duration {
        let base = self.config.base_delay().as_secs_f64();
        let max = self.config.max_delay().as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut secs = base * self.config.factor.powi(exponent);
        if !secs.is_finite() || secs > max {
            secs = max;
        }
        if self.config.jitter && self.config.jitter_ratio > 0.0 {
            let unit = unit_interval(mix64(
                self.seed ^ stream.wrapping_mul(GOLDEN_GAMMA) ^ u64::from(attempt),
            ));
            secs = (secs + unit * self.config.jitter_ratio * secs).min(max);
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// 执行 `operation`，失败时按策略退避重试。
    ///
    /// 总调用次数至多为 `max_retries + 1`。不可重试的错误在首次出现时即返回。
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let stream = self.calls.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let mut attempt = 0u32;
        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempt >= self.config.max_retries {
                debug!(attempts = attempt + 1, error = %err, "retries exhausted");
                return Err(err);
            }
            if !(self.is_retryable)(&err) {
                debug!(error = %err, "failure is not retryable");
                return Err(err);
            }

            let delay = err
                .retry_after()
                .unwrap_or_else(|| self.delay(attempt, stream));
            warn!(
                retry = attempt + 1,
                max_retries = self.config.max_retries,
                ?delay,
                error = %err,
                "operation failed, backing off"
            );
            self.clock.sleep(delay).await;
            attempt += 1;
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}

/// 以给定选项执行一次带退避的调用，适合不需要长期持有策略的场景。
///
/// `options` 可以直接传入 [`RetryConfig`]，此时使用默认的可重试判定。
pub async fn retry_with_backoff<F, Fut, T>(
    operation: F,
    options: impl Into<RetryOptions>,
    clock: SharedClock,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryPolicy::from_options(options.into(), clock)
        .run(operation)
        .await
}

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

fn entropy_seed() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_nanos() as u64)
        .unwrap_or_default();
    mix64(nanos ^ u64::from(std::process::id()).rotate_left(32))
}

/// 把 64 位混合结果映射到 `[0, 1)`。
#[inline]
fn unit_interval(mixed: u64) -> f64 {
    (mixed >> 11) as f64 / (1u64 << 53) as f64
}

#[inline]
fn mix64(mut x: u64) -> u64 {
    x = x.wrapping_add(GOLDEN_GAMMA);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}
