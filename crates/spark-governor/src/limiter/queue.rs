use std::cmp::Ordering;
use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::error::{GovernorError, Result};

/// 限流重排队时使用的最低优先级档位。
pub(crate) const REQUEUE_PRIORITY: i32 = i32::MIN;

/// 单次派发的结果：已向调用方交付，或因限流需要冷却后重排队。
pub(crate) enum Dispatched {
    Settled { succeeded: bool },
    RateLimited {
        job: Box<dyn Job>,
        retry_after: Option<Duration>,
    },
}

/// 类型擦除后的排队任务。
///
/// 限流器的队列需要容纳返回类型各异的操作；`Job` 把“执行一次操作并把结果交给调用方”
/// 封装成统一接口。遇到限流失败且允许重排队时，任务把自身所有权交还给限流器，
/// 由后者在冷却后重新入队，因此同一个操作可以被多次执行。
pub(crate) trait Job: Send {
    /// 执行一次底层操作。`allow_requeue` 为 `false` 时，限流失败也会直接交付给调用方。
    fn run(self: Box<Self>, allow_requeue: bool) -> BoxFuture<'static, Dispatched>;

    /// 调用方是否已放弃等待（接收端已被 Drop）。
    fn is_abandoned(&self) -> bool;
}

pub(crate) struct OperationJob<F, T> {
    operation: F,
    reply: oneshot::Sender<Result<T>>,
}

impl<F, T> OperationJob<F, T> {
    pub(crate) fn new(operation: F, reply: oneshot::Sender<Result<T>>) -> Self {
        Self { operation, reply }
    }
}

impl<F, Fut, T> Job for OperationJob<F, T>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    fn run(mut self: Box<Self>, allow_requeue: bool) -> BoxFuture<'static, Dispatched> {
        let pending = (self.operation)();
        Box::pin(async move {
            match pending.await {
                Err(err) if allow_requeue && err.is_rate_limited() => Dispatched::RateLimited {
                    retry_after: err.retry_after(),
                    job: self,
                },
                outcome => {
                    let succeeded = outcome.is_ok();
                    // 调用方可能已放弃等待，交付失败无需处理。
                    let _ = self.reply.send(outcome);
                    Dispatched::Settled { succeeded }
                }
            }
        })
    }

    fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

/// 队列条目：`{job, priority, sequence}`。
///
/// 排序规则：优先级降序，同优先级按入队序号升序（同档位内稳定 FIFO）。
/// `BinaryHeap` 是大顶堆，因此 `Ord` 把“应当先派发”的条目定义为更大。
pub(crate) struct QueuedTask {
    pub(crate) job: Box<dyn Job>,
    pub(crate) priority: i32,
    pub(crate) sequence: u64,
    pub(crate) requeues: u32,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// 排队任务被限流器丢弃（`reset` 或运行时关闭）时交给调用方的错误。
pub(crate) fn abandoned() -> GovernorError {
    GovernorError::Abandoned {
        reason: "queued call dropped by the limiter",
    }
}
