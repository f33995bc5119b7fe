//! 日志接入。
//!
//! 治理组件只通过 `tracing` 宏输出事件，从不依赖订阅者是否存在；本模块为宿主提供
//! 一个可选的全局订阅者安装入口。

use tracing::dispatcher;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;

/// 未设置 `RUST_LOG` 时使用的过滤指令。
pub const DEFAULT_DIRECTIVE: &str = "info";

/// 订阅者安装失败。
#[derive(Debug, thiserror::Error)]
pub enum TracingInstallError {
    /// 进程内已存在全局 `tracing` 订阅者。
    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled,

    #[error("failed to set global tracing subscriber: {0}")]
    SetGlobalDefault(#[from] dispatcher::SetGlobalDefaultError),
}

/// 安装 `fmt + EnvFilter` 全局订阅者。
///
/// # 教案式说明
/// - **意图（Why）**：宿主进程只需一次调用即可看到排空循环、重试退避与批次触发的日志；
/// - **逻辑（How）**：优先读取 `RUST_LOG`，缺省回退到 `directive`（通常传入 [`DEFAULT_DIRECTIVE`]），
///   与 `fmt` Layer 组合后设为全局默认；
/// - **契约（What）**：重复调用或外部已设置订阅者时返回 [`TracingInstallError::AlreadyInstalled`]，
///   已有订阅者不受影响。
pub fn install_tracing(directive: &str) -> Result<(), TracingInstallError> {
    if dispatcher::has_been_set() {
        return Err(TracingInstallError::AlreadyInstalled);
    }
    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter(directive))
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn build_env_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
}
