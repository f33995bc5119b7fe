use std::time::{Duration, Instant};

/// 浮点补充后允许的舍入误差，避免 `0.999_999_9` 这类结果让排空循环多睡一轮。
const TOKEN_EPSILON: f64 = 1e-9;

/// 令牌桶状态：`{capacity, tokens, refill_rate, last_refill}`。
///
/// # 契约说明（What）
/// - 任意观测点均满足 `0 ≤ tokens ≤ capacity`；
/// - 补充是惰性的：每次 [`refill`](Self::refill) 按距上次补充的流逝时间计算增量，
///   不依赖后台定时器；
/// - 所有时间点由调用方传入，结构本身不读取时钟，便于在属性测试中直接驱动。
#[derive(Clone, Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// 创建满桶。
    pub fn new(capacity: u32, refill_per_second: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            tokens: capacity,
            refill_per_second: refill_per_second.max(0.0),
            last_refill: now,
        }
    }

    /// 依据流逝时间补充令牌：`tokens = min(capacity, tokens + elapsed * rate)`。
    ///
    /// `now` 早于上次补充时间时视为零流逝。
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed > Duration::ZERO {
            let added = elapsed.as_secs_f64() * self.refill_per_second;
            self.tokens = (self.tokens + added).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// 尝试取走一个令牌。
    pub fn try_take(&mut self) -> bool {
        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }

    /// 距离攒够一个令牌还需等待的时长：`(1 - tokens) / rate`。
    ///
    /// 返回 `None` 表示补充速率为 0，桶永远不会自行恢复。结果向上取整到微秒，
    /// 保证按该时长睡眠后补充结果不小于 1。
    pub fn time_until_token(&self) -> Option<Duration> {
        let missing = 1.0 - self.tokens;
        if missing <= TOKEN_EPSILON {
            return Some(Duration::ZERO);
        }
        if self.refill_per_second <= 0.0 {
            return None;
        }
        let micros = (missing / self.refill_per_second * 1_000_000.0).ceil();
        Some(Duration::from_micros(micros as u64))
    }

    /// 重新装满并把补充基准重置到 `now`。
    pub fn refill_to_capacity(&mut self, now: Instant) {
        self.tokens = self.capacity;
        self.last_refill = now;
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}
