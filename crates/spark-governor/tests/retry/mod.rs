//! 退避重试集成测试入口。

#[path = "../common/mod.rs"]
mod common;

pub mod tests {
    pub mod retry {
        include!("backoff.rs");
    }
}
