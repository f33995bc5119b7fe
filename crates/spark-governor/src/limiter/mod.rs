//! 优先级令牌桶限流器。
//!
//! # 行为概览（How）
//! - [`TokenBucketLimiter::execute`] 同步地把操作登记进优先级队列，返回等待结果的 Future；
//! - 同一时刻至多一个排空任务在运行：取令牌、弹出最高优先级条目并在循环内等待其执行完毕；
//!   令牌不足时按 `(1 - tokens) / rate` 睡眠，补充速率为 0 时挂起直到 [`reset`](TokenBucketLimiter::reset)；
//! - 操作以限流错误失败时，排空循环整体暂停一个冷却期，随后该任务以最低优先级重新入队，重排队次数受
//!   [`LimiterConfig::max_rate_limit_requeues`] 约束，超出后把最后一次失败交给调用方。
//!
//! # 契约说明（What）
//! - 任意长度为 `t` 的窗口内派发次数不超过 `floor(capacity + rate · t)`；
//! - 派发顺序：优先级降序，同优先级先进先出；
//! - 调用方 Drop 结果 Future 即视为取消，尚未派发的条目在出队时被跳过且不消耗令牌。

mod bucket;
mod queue;

pub use bucket::TokenBucket;

use std::collections::BinaryHeap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::LimiterConfig;
use crate::error::{GovernorError, Result};
use crate::time::SharedClock;

use queue::{Dispatched, Job, OperationJob, QueuedTask, REQUEUE_PRIORITY, abandoned};

const COMPONENT: &str = "TokenBucketLimiter";

/// 排空循环的运行状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainState {
    Idle,
    Draining,
}

/// [`TokenBucketLimiter::status`] 返回的快照。
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LimiterStatus {
    /// 当前可用令牌数（向下取整）。
    pub available_tokens: u32,
    pub capacity: u32,
    pub queue_length: usize,
    /// 已消耗令牌占容量的百分比。
    pub utilization: f64,
    pub drain: DrainState,
    /// 累计派发次数（含重排队后的再次派发）。
    pub dispatched: u64,
    /// 因限流失败被重新入队的次数。
    pub requeued: u64,
    /// 以错误结束并交付给调用方的次数。
    pub rejected: u64,
    /// 调用方放弃等待、出队时被跳过的条目数。
    pub skipped: u64,
}

/// 客户端侧令牌桶限流器，克隆后共享同一个桶与队列。
#[derive(Clone)]
pub struct TokenBucketLimiter {
    inner: Arc<LimiterInner>,
}

struct LimiterInner {
    clock: SharedClock,
    config: LimiterConfig,
    state: Mutex<LimiterState>,
    /// `reset` 用来唤醒正在等待令牌的排空循环。
    wake: Notify,
}

struct LimiterState {
    bucket: TokenBucket,
    queue: BinaryHeap<QueuedTask>,
    next_sequence: u64,
    drain: DrainState,
    /// 每次 `reset` 递增；冷却中的任务据此判断是否还应回到队列。
    generation: u64,
    counters: Counters,
}

#[derive(Default)]
struct Counters {
    dispatched: u64,
    requeued: u64,
    rejected: u64,
    skipped: u64,
}

enum Step {
    Dispatch { task: QueuedTask, generation: u64 },
    Wait(Option<Duration>),
    Idle,
}

impl TokenBucketLimiter {
    pub fn new(config: LimiterConfig, clock: SharedClock) -> Self {
        let bucket = TokenBucket::new(config.capacity, config.refill_per_second, clock.now());
        Self {
            inner: Arc::new(LimiterInner {
                clock,
                config,
                state: Mutex::new(LimiterState {
                    bucket,
                    queue: BinaryHeap::new(),
                    next_sequence: 0,
                    drain: DrainState::Idle,
                    generation: 0,
                    counters: Counters::default(),
                }),
                wake: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.inner.config
    }

    /// 以给定优先级排队执行 `operation`，数值越大越先派发。
    ///
    /// 登记在调用时同步完成，返回的 Future 只负责等待结果；因此多个 `execute`
    /// 的入队顺序就是调用顺序，与何时轮询无关。`operation` 可能因限流重排队被调用多次。
    ///
    /// # 错误
    /// - 当前线程不在 Tokio 运行时内：[`GovernorError::NoRuntime`]，操作不会执行；
    /// - 条目被 [`reset`](Self::reset) 清除：[`GovernorError::Abandoned`]；
    /// - 其余错误均来自 `operation` 本身。
    pub fn execute<F, Fut, T>(
        &self,
        operation: F,
        priority: i32,
    ) -> impl Future<Output = Result<T>> + Send + 'static + use<F, Fut, T>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        let admitted = match Handle::try_current() {
            Ok(handle) => {
                let job = Box::new(OperationJob::new(operation, reply));
                self.inner.enqueue(&handle, job, priority, 0);
                true
            }
            Err(_) => false,
        };

        async move {
            if !admitted {
                return Err(GovernorError::NoRuntime {
                    component: COMPONENT,
                });
            }
            receiver.await.unwrap_or_else(|_| Err(abandoned()))
        }
    }

    /// 返回当前状态快照。读取前会先按流逝时间补充令牌。
    pub fn status(&self) -> LimiterStatus {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();
        state.bucket.refill(now);
        let tokens = state.bucket.tokens();
        let capacity = state.bucket.capacity();
        LimiterStatus {
            available_tokens: tokens.floor() as u32,
            capacity: self.inner.config.capacity,
            queue_length: state.queue.len(),
            utilization: (1.0 - tokens / capacity) * 100.0,
            drain: state.drain,
            dispatched: state.counters.dispatched,
            requeued: state.counters.requeued,
            rejected: state.counters.rejected,
            skipped: state.counters.skipped,
        }
    }

    /// 装满令牌桶并清空队列。
    ///
    /// 被清除的调用方收到 [`GovernorError::Abandoned`]；正在冷却、尚未回到队列的任务
    /// 同样被丢弃。已派发、正在执行的操作不受影响。
    pub fn reset(&self) {
        let cleared = {
            let now = self.inner.clock.now();
            let mut state = self.inner.state.lock();
            state.bucket.refill_to_capacity(now);
            state.generation = state.generation.wrapping_add(1);
            std::mem::take(&mut state.queue)
        };
        // 排空循环可能停在无限期等待上，需要显式唤醒。
        self.inner.wake.notify_one();
        info!(abandoned = cleared.len(), "limiter reset");
        drop(cleared);
    }

    /// 周期性以 `debug` 级别输出状态快照。
    ///
    /// 任务只持有弱引用，所有限流器句柄被 Drop 后自行退出；也可以通过返回的句柄提前中止。
    pub fn spawn_status_reporter(&self, interval: Duration) -> Result<JoinHandle<()>> {
        let handle = Handle::try_current().map_err(|_| GovernorError::NoRuntime {
            component: COMPONENT,
        })?;
        let weak: Weak<LimiterInner> = Arc::downgrade(&self.inner);
        let clock = Arc::clone(&self.inner.clock);
        Ok(handle.spawn(async move {
            loop {
                clock.sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let status = TokenBucketLimiter { inner }.status();
                debug!(
                    available_tokens = status.available_tokens,
                    capacity = status.capacity,
                    queue_length = status.queue_length,
                    utilization = status.utilization,
                    dispatched = status.dispatched,
                    requeued = status.requeued,
                    "limiter status"
                );
            }
        }))
    }
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl LimiterInner {
    /// 入队并在必要时启动排空循环；两者在同一临界区内完成，
    /// 保证排空循环转为 `Idle` 之后的入队一定会触发新的循环。
    fn enqueue(self: &Arc<Self>, handle: &Handle, job: Box<dyn Job>, priority: i32, requeues: u32) {
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.queue.push(QueuedTask {
            job,
            priority,
            sequence,
            requeues,
        });
        trace!(priority, sequence, queue_length = state.queue.len(), "call queued");
        if state.drain == DrainState::Idle {
            state.drain = DrainState::Draining;
            handle.spawn(Arc::clone(self).drain(handle.clone()));
        }
    }

    fn next_step(&self) -> Step {
        let now = self.clock.now();
        let mut state = self.state.lock();
        while state.queue.peek().is_some_and(|task| task.job.is_abandoned()) {
            state.queue.pop();
            state.counters.skipped += 1;
        }
        if state.queue.is_empty() {
            state.drain = DrainState::Idle;
            return Step::Idle;
        }

        state.bucket.refill(now);
        if !state.bucket.try_take() {
            return Step::Wait(state.bucket.time_until_token());
        }
        match state.queue.pop() {
            Some(task) => {
                state.counters.dispatched += 1;
                Step::Dispatch {
                    task,
                    generation: state.generation,
                }
            }
            None => Step::Idle,
        }
    }

    async fn drain(self: Arc<Self>, handle: Handle) {
        debug!("limiter drain started");
        loop {
            match self.next_step() {
                Step::Idle => break,
                Step::Dispatch { task, generation } => {
                    self.dispatch(&handle, task, generation).await;
                }
                Step::Wait(Some(wait)) => {
                    trace!(?wait, "waiting for refill");
                    tokio::select! {
                        _ = self.clock.sleep(wait) => {}
                        _ = self.wake.notified() => {}
                    }
                }
                Step::Wait(None) => {
                    debug!("bucket empty with zero refill rate, parking until reset");
                    self.wake.notified().await;
                }
            }
        }
        debug!("limiter drain idle");
    }

    /// 在排空循环内执行一个已取得令牌的任务。
    ///
    /// 操作结束前不会派发下一个任务；限流失败时冷却期同样在循环内度过，
    /// 冷却结束（或被 `reset` 打断）之前队列保持静止。
    async fn dispatch(self: &Arc<Self>, handle: &Handle, task: QueuedTask, generation: u64) {
        let QueuedTask {
            job,
            priority,
            sequence,
            requeues,
        } = task;
        trace!(priority, sequence, "dispatching");
        let allow_requeue = self
            .config
            .max_rate_limit_requeues
            .is_none_or(|limit| requeues < limit);

        let outcome = AssertUnwindSafe(async move { job.run(allow_requeue).await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Dispatched::Settled { succeeded: true }) => {}
            Ok(Dispatched::Settled { succeeded: false }) => {
                self.state.lock().counters.rejected += 1;
            }
            Err(_) => {
                warn!(priority, sequence, "operation panicked, caller sees it as abandoned");
                self.state.lock().counters.rejected += 1;
            }
            Ok(Dispatched::RateLimited { job, retry_after }) => {
                let cool_down = retry_after.unwrap_or_else(|| self.config.rate_limit_cool_down());
                warn!(
                    priority,
                    requeues,
                    ?cool_down,
                    "operation rate limited, pausing dispatch for cool-down"
                );
                let mut sleep = self.clock.sleep(cool_down);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        _ = self.wake.notified() => {
                            // 早先 `reset` 留下的唤醒许可不能缩短本次冷却。
                            if self.state.lock().generation != generation {
                                break;
                            }
                        }
                    }
                }
                {
                    let mut state = self.state.lock();
                    if state.generation != generation {
                        debug!("limiter was reset during cool-down, dropping call");
                        return;
                    }
                    state.counters.requeued += 1;
                }
                self.enqueue(handle, job, REQUEUE_PRIORITY, requeues + 1);
            }
        }
    }
}
