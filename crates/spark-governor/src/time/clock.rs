use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// `Clock::sleep` 返回的装箱延迟。提前 Drop 即取消等待。
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// 组件之间共享的时钟句柄。
pub type SharedClock = Arc<dyn Clock>;

/// 治理组件读取时间与挂起等待的唯一入口。
///
/// # 设计背景（Why）
/// - 令牌补充、退避、批次定时器都以时间为输入；注入时钟后，测试用 [`MockClock`]
///   手动推进，不再依赖真实等待。
///
/// # 接口约束（What）
/// - `now` 单调不回退；
/// - `sleep(d)` 返回的 Future 至少在 `d` 之后才就绪。
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration) -> Sleep;
}

/// 生产环境时钟：`Instant::now` 加 Tokio 定时器，`sleep` 只能在 Tokio 运行时内轮询。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// 手动推进的虚拟时钟。
///
/// 所有未到期的 `sleep` 以登记序号为键记在同一张表里；[`advance`](Self::advance)
/// 推进偏移量后按序号顺序唤醒到期者，因此同一截止时间的等待者按登记先后被唤醒。
/// 零时长的 `sleep` 立即就绪，不登记。
///
/// 唤醒只让任务重新可调度，测试在推进之后仍需让出执行权才能观察到后续副作用。
#[derive(Clone, Debug)]
pub struct MockClock {
    timeline: Arc<Mutex<Timeline>>,
}

#[derive(Debug)]
struct Timeline {
    origin: Instant,
    elapsed: Duration,
    /// 登记序号 → (截止偏移, 最近一次轮询留下的 waker)。
    timers: BTreeMap<u64, (Duration, Option<Waker>)>,
    next_timer: u64,
}

impl MockClock {
    pub fn new() -> Self {
        Self::with_start(Instant::now())
    }

    /// 以固定起点构造，`now()` 返回 `origin + elapsed`。
    pub fn with_start(origin: Instant) -> Self {
        Self {
            timeline: Arc::new(Mutex::new(Timeline {
                origin,
                elapsed: Duration::ZERO,
                timers: BTreeMap::new(),
                next_timer: 0,
            })),
        }
    }

    /// 同一虚拟时钟的共享句柄，供组件注入。
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }

    /// 推进虚拟时间，返回前唤醒全部到期的等待者。
    pub fn advance(&self, delta: Duration) {
        let due: Vec<Waker> = {
            let mut timeline = self.timeline.lock();
            timeline.elapsed = timeline.elapsed.saturating_add(delta);
            let now = timeline.elapsed;
            let expired: Vec<u64> = timeline
                .timers
                .iter()
                .filter(|(_, (deadline, _))| *deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            expired
                .into_iter()
                .filter_map(|id| timeline.timers.remove(&id).and_then(|(_, waker)| waker))
                .collect()
        };
        for waker in due {
            waker.wake();
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.timeline.lock().elapsed
    }

    /// 尚未到期的等待数量，测试据此判断后台任务是否已进入等待。
    pub fn pending_sleepers(&self) -> usize {
        self.timeline.lock().timers.len()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        let timeline = self.timeline.lock();
        timeline.origin + timeline.elapsed
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        let mut timeline = self.timeline.lock();
        let deadline = timeline.elapsed.saturating_add(duration);
        let id = timeline.next_timer;
        timeline.next_timer += 1;
        if !duration.is_zero() {
            timeline.timers.insert(id, (deadline, None));
        }
        Box::pin(VirtualSleep {
            timeline: Arc::clone(&self.timeline),
            id,
            deadline,
        })
    }
}

struct VirtualSleep {
    timeline: Arc<Mutex<Timeline>>,
    id: u64,
    deadline: Duration,
}

impl Future for VirtualSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // 判断与登记 waker 在同一把锁内完成，`advance` 不会在两者之间插入。
        let mut timeline = self.timeline.lock();
        if timeline.elapsed >= self.deadline {
            timeline.timers.remove(&self.id);
            return Poll::Ready(());
        }
        if let Some((_, slot)) = timeline.timers.get_mut(&self.id) {
            if !slot.as_ref().is_some_and(|waker| waker.will_wake(cx.waker())) {
                *slot = Some(cx.waker().clone());
            }
        }
        Poll::Pending
    }
}

impl Drop for VirtualSleep {
    fn drop(&mut self) {
        self.timeline.lock().timers.remove(&self.id);
    }
}
