//! 时间抽象：读取当前时间与在指定时长后唤醒，是治理组件依赖的全部宿主原语。
//!
//! 组件只持有 [`SharedClock`]。生产环境注入 [`SystemClock`]；测试注入 [`MockClock`]，
//! 让“等待 1 秒后补充一个令牌”这类断言在 CI 中完全可复现。

pub mod clock;

pub use clock::{Clock, MockClock, SharedClock, Sleep, SystemClock};
