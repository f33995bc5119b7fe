use std::borrow::Cow;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// crate 统一的结果别名。
pub type Result<T, E = GovernorError> = std::result::Result<T, E>;

/// 治理层对调用方暴露的错误类型。
///
/// # 设计背景（Why）
/// - 去重的扇入调用方与同批次的全部等待者必须观察到“同一个”失败，因此错误需要 `Clone`；
/// - 重试策略与限流器的内部重排队都依据错误分类决策，分类必须机读，不能靠解析字符串。
///
/// # 契约说明（What）
/// - 调用方提供的异步操作统一返回 `Result<T, GovernorError>`，传输层错误需在边界处映射；
/// - [`category`](Self::category) 给出处置策略，`retry_after` 提取显式退避提示。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum GovernorError {
    /// 连接失败、连接被重置等传输层故障。
    #[error("connection failed: {message}")]
    Connection { message: Cow<'static, str> },

    /// 下游返回的 HTTP 类状态码。
    #[error("downstream responded with status {status}: {message}")]
    Status {
        status: u16,
        message: Cow<'static, str>,
        retry_after: Option<Duration>,
    },

    /// 调用方显式标记的限流失败。
    #[error("rate limited by downstream")]
    RateLimited { retry_after: Option<Duration> },

    /// 校验失败、编程错误或其它不可重试的拒绝。
    #[error("request rejected: {message}")]
    Rejected { message: Cow<'static, str> },

    /// 批处理器返回的结果数量与输入条目数量不一致。
    #[error("batch `{batch_key}` processor returned {actual} results for {expected} items")]
    BatchSizeMismatch {
        batch_key: String,
        expected: usize,
        actual: usize,
    },

    /// 防抖窗口内被更新的调用取代。
    #[error("call superseded by a newer debounced call")]
    Superseded,

    /// 排队中的调用被组件丢弃（例如限流器 `reset`）。
    #[error("queued call abandoned: {reason}")]
    Abandoned { reason: &'static str },

    /// 当前线程不在 Tokio 运行时内，无法驱动后台任务。
    #[error("no Tokio runtime available to drive `{component}`")]
    NoRuntime { component: &'static str },
}

/// 错误分类，驱动重试与限流器的内部重排队。
///
/// - `Retryable`：连接失败、5xx 等瞬时故障，可交给 [`crate::retry`] 重试；
/// - `RateLimited`：429 或显式限流标记，既可重试，也触发限流器内部的冷却重排队；
/// - `NonRetryable`：首次出现即向调用方传播。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Retryable { retry_after: Option<Duration> },
    RateLimited { retry_after: Option<Duration> },
    NonRetryable,
}

impl GovernorError {
    /// 构造连接失败错误。
    pub fn connection(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// 构造状态码错误，不附带退避提示。
    pub fn status(status: u16, message: impl Into<Cow<'static, str>>) -> Self {
        Self::Status {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    /// 构造不可重试的拒绝错误。
    pub fn rejected(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// 构造显式限流错误。
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self::RateLimited { retry_after }
    }

    /// 为状态码或限流错误附加 `Retry-After` 提示；其它分支原样返回。
    pub fn with_retry_after(self, wait: Duration) -> Self {
        match self {
            Self::Status {
                status, message, ..
            } => Self::Status {
                status,
                message,
                retry_after: Some(wait),
            },
            Self::RateLimited { .. } => Self::RateLimited {
                retry_after: Some(wait),
            },
            other => other,
        }
    }

    /// 返回错误的处置分类。
    ///
    /// 映射规则：
    /// 1. `Connection` → `Retryable`；
    /// 2. `Status`：429 → `RateLimited`，5xx → `Retryable`，其余 → `NonRetryable`；
    /// 3. `RateLimited` → `RateLimited`；
    /// 4. 其余分支均为 `NonRetryable`。
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Retryable { retry_after: None },
            Self::Status {
                status,
                retry_after,
                ..
            } => match *status {
                429 => ErrorCategory::RateLimited {
                    retry_after: *retry_after,
                },
                500..=599 => ErrorCategory::Retryable {
                    retry_after: *retry_after,
                },
                _ => ErrorCategory::NonRetryable,
            },
            Self::RateLimited { retry_after } => ErrorCategory::RateLimited {
                retry_after: *retry_after,
            },
            _ => ErrorCategory::NonRetryable,
        }
    }

    /// 是否属于可重试的传输类错误（含限流）。
    pub fn is_retryable(&self) -> bool {
        !matches!(self.category(), ErrorCategory::NonRetryable)
    }

    /// 是否属于限流信号。
    pub fn is_rate_limited(&self) -> bool {
        matches!(self.category(), ErrorCategory::RateLimited { .. })
    }

    /// 错误上携带的显式退避提示。
    pub fn retry_after(&self) -> Option<Duration> {
        match self.category() {
            ErrorCategory::Retryable { retry_after } | ErrorCategory::RateLimited { retry_after } => {
                retry_after
            }
            ErrorCategory::NonRetryable => None,
        }
    }
}

impl From<io::Error> for GovernorError {
    fn from(error: io::Error) -> Self {
        use io::ErrorKind;
        match error.kind() {
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::AddrNotAvailable
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::UnexpectedEof
            | ErrorKind::Interrupted => Self::connection(error.to_string()),
            _ => Self::rejected(error.to_string()),
        }
    }
}

/// 配置加载与校验失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse governor configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: Cow<'static, str>,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
