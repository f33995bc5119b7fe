//! 组合根集成测试入口：从 TOML 构造 [`spark_governor::Governor`]，
//! 验证限流、重试与去重在同一条调用链上的协作。

#[path = "../common/mod.rs"]
mod common;

pub mod tests {
    pub mod governor {
        include!("composition.rs");
    }
}
