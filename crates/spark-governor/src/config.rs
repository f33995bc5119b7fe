//! 治理组件的配置树。
//!
//! 配置以 TOML 描述，所有字段都有默认值，缺省的段落按默认值补齐：
//!
//! ```toml
//! [limiter]
//! capacity = 20
//! refill_per_second = 5.0
//!
//! [batch]
//! max_batch_size = 25
//! max_batch_delay_ms = 20
//! ```
//!
//! 时长字段统一以毫秒整数表达，由各段的访问器转换为 [`Duration`]。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// 顶层配置，由组合根 [`crate::Governor`] 消费。
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GovernorConfig {
    pub limiter: LimiterConfig,
    pub dedup: DedupConfig,
    pub batch: BatchConfig,
    pub retry: RetryConfig,
}

impl GovernorConfig {
    /// 从 TOML 文本解析并校验配置。
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// 逐段校验。
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limiter.validate()?;
        self.dedup.validate()?;
        self.batch.validate()?;
        self.retry.validate()
    }
}

/// 令牌桶限流器配置。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimiterConfig {
    /// 桶容量，即可立即放行的最大突发量。
    pub capacity: u32,
    /// 每秒补充的令牌数；为 0 时桶耗尽后只能通过 `reset` 恢复。
    pub refill_per_second: f64,
    /// 限流失败未携带 `Retry-After` 时的默认冷却时长。
    pub rate_limit_cool_down_ms: u64,
    /// 单个任务因限流被内部重排队的次数上限；`None` 表示不设上限。
    ///
    /// TOML 没有空值，省略该键即取默认值；不设上限只能在代码中构造。
    pub max_rate_limit_requeues: Option<u32>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_second: 10.0,
            rate_limit_cool_down_ms: 1_000,
            max_rate_limit_requeues: Some(5),
        }
    }
}

impl LimiterConfig {
    pub fn rate_limit_cool_down(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cool_down_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid(
                "limiter.capacity",
                "capacity must be at least 1",
            ));
        }
        if !self.refill_per_second.is_finite() || self.refill_per_second < 0.0 {
            return Err(ConfigError::invalid(
                "limiter.refill_per_second",
                format!(
                    "{} is not a finite, non-negative rate",
                    self.refill_per_second
                ),
            ));
        }
        Ok(())
    }
}

/// 去重器配置。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DedupConfig {
    /// 成功结果的缓存有效期。
    pub cache_ttl_ms: u64,
    /// 缓存条目上限，溢出时淘汰最早写入的条目；`None` 表示不设上限。
    pub max_cache_entries: Option<usize>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 5_000,
            max_cache_entries: Some(1_024),
        }
    }
}

impl DedupConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cache_entries == Some(0) {
            return Err(ConfigError::invalid(
                "dedup.max_cache_entries",
                "use `None` to disable the bound instead of 0",
            ));
        }
        Ok(())
    }
}

/// 批处理器配置。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_batch_delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_batch_delay_ms: 50,
        }
    }
}

impl BatchConfig {
    pub fn max_batch_delay(&self) -> Duration {
        Duration::from_millis(self.max_batch_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::invalid(
                "batch.max_batch_size",
                "a batch must hold at least one item",
            ));
        }
        Ok(())
    }
}

/// 退避重试配置。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// 首次尝试之后允许的最大重试次数。
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 每次重试的延迟放大倍数。
    pub factor: f64,
    pub jitter: bool,
    /// 抖动上界相对当前延迟的比例，取值 `[0, 1]`。
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            factor: 2.0,
            jitter: true,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(ConfigError::invalid(
                "retry.factor",
                format!("{} must be a finite value >= 1.0", self.factor),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(ConfigError::invalid(
                "retry.jitter_ratio",
                format!("{} is outside [0, 1]", self.jitter_ratio),
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::invalid(
                "retry.base_delay_ms",
                "base delay exceeds max delay",
            ));
        }
        Ok(())
    }
}
