//! 按批次键聚合调用，在达到数量或延迟阈值时一次性交给批处理函数。
//!
//! # 契约说明（What）
//! - 批次内 `items` 与等待者一一对应，结果按位置分发：`results[i]` 交给第 `i` 个调用方；
//! - 数量达到 `max_batch_size` 立即触发，否则在最后一次 `add` 之后 `max_batch_delay` 触发；
//! - 批次在处理函数运行前已从活动表摘除，同键的新 `add` 会开启新批次；
//! - 处理函数失败或返回数量不符时，整批等待者收到同一个错误，不存在部分成功。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::BatchConfig;
use crate::error::{GovernorError, Result};
use crate::time::SharedClock;

const COMPONENT: &str = "RequestBatcher";

type Processor<I, R> = Arc<dyn Fn(Vec<I>) -> BoxFuture<'static, Result<Vec<R>>> + Send + Sync>;

/// 批次的触发原因，仅用于日志。
#[derive(Clone, Copy, Debug)]
enum Trigger {
    Size,
    Delay,
    Explicit,
}

/// 请求批处理器，克隆后共享活动批次表。
pub struct RequestBatcher<I, R> {
    inner: Arc<BatchInner<I, R>>,
}

impl<I, R> Clone for RequestBatcher<I, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct BatchInner<I, R> {
    clock: SharedClock,
    config: BatchConfig,
    state: Mutex<BatchState<I, R>>,
}

struct BatchState<I, R> {
    batches: HashMap<String, OpenBatch<I, R>>,
    next_epoch: u64,
}

struct OpenBatch<I, R> {
    /// 当前延迟计时器的编号，每次重启计时器都会换新；过期计时器凭此认出自己已被取代。
    epoch: u64,
    items: Vec<I>,
    waiters: Vec<oneshot::Sender<Result<R>>>,
    processor: Processor<I, R>,
    timer: Option<JoinHandle<()>>,
}

impl<I, R> RequestBatcher<I, R>
where
    I: Send + 'static,
    R: Send + 'static,
{
    pub fn new(config: BatchConfig, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                clock,
                config,
                state: Mutex::new(BatchState {
                    batches: HashMap::new(),
                    next_epoch: 0,
                }),
            }),
        }
    }

    /// 把 `item` 加入 `batch_key` 对应的批次，返回该条目的结果。
    ///
    /// `processor` 只在本次调用新建批次时被采用；加入已有批次时沿用建批时的处理函数。
    /// 处理函数必须返回与输入等长、同序的结果。
    ///
    /// # 错误
    /// - 当前不在 Tokio 运行时内：[`GovernorError::NoRuntime`]，条目不会入批；
    /// - 结果数量不符：[`GovernorError::BatchSizeMismatch`]；
    /// - 处理函数失败：整批收到同一个错误。
    pub fn add<K, P, Fut>(
        &self,
        batch_key: K,
        item: I,
        processor: P,
    ) -> impl Future<Output = Result<R>> + Send + 'static + use<I, R, K, P, Fut>
    where
        K: Into<String>,
        P: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<R>>> + Send + 'static,
    {
        let (waiter, receiver) = oneshot::channel();
        let admitted = match Handle::try_current() {
            Ok(handle) => {
                self.inner
                    .push(&handle, batch_key.into(), item, waiter, processor);
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
            receiver.await.unwrap_or_else(|_| {
                Err(GovernorError::Abandoned {
                    reason: "batch dropped before settling",
                })
            })
        }
    }

    /// 立即处理所有未触发的批次，并等待它们的处理函数全部结束。
    pub async fn flush(&self) {
        let detached: Vec<(String, OpenBatch<I, R>)> = {
            let mut state = self.inner.state.lock();
            state.batches.drain().collect()
        };
        if detached.is_empty() {
            return;
        }
        debug!(batches = detached.len(), "flushing all pending batches");
        join_all(
            detached
                .into_iter()
                .map(|(key, batch)| run_batch(key, batch, Trigger::Explicit)),
        )
        .await;
    }

    /// 尚未触发的批次数量。
    pub fn pending_batches(&self) -> usize {
        self.inner.state.lock().batches.len()
    }

    /// 指定批次中已累积的条目数量。
    pub fn pending_items(&self, batch_key: &str) -> usize {
        self.inner
            .state
            .lock()
            .batches
            .get(batch_key)
            .map_or(0, |batch| batch.items.len())
    }
}

impl<I, R> BatchInner<I, R>
where
    I: Send + 'static,
    R: Send + 'static,
{
    fn push<P, Fut>(
        self: &Arc<Self>,
        handle: &Handle,
        key: String,
        item: I,
        waiter: oneshot::Sender<Result<R>>,
        processor: P,
    ) where
        P: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<R>>> + Send + 'static,
    {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let epoch = state.next_epoch;
        state.next_epoch += 1;
        if !state.batches.contains_key(&key) {
            trace!(%key, "opening batch");
            state.batches.insert(
                key.clone(),
                OpenBatch {
                    epoch,
                    items: Vec::new(),
                    waiters: Vec::new(),
                    processor: Arc::new(move |items| processor(items).boxed()),
                    timer: None,
                },
            );
        }

        let Some(batch) = state.batches.get_mut(&key) else {
            return;
        };
        batch.items.push(item);
        batch.waiters.push(waiter);
        if let Some(timer) = batch.timer.take() {
            timer.abort();
        }

        let full = batch.items.len() >= self.config.max_batch_size;
        if full {
            if let Some(full) = state.batches.remove(&key) {
                handle.spawn(run_batch(key, full, Trigger::Size));
            }
            return;
        }

        batch.epoch = epoch;
        let inner = Arc::clone(self);
        let delay = self.config.max_batch_delay();
        batch.timer = Some(handle.spawn(async move {
            inner.clock.sleep(delay).await;
            if let Some(batch) = inner.take_expired(&key, epoch) {
                run_batch(key, batch, Trigger::Delay).await;
            }
        }));
    }

    /// 计时器到期时摘除批次；计时器已被重启或批次已被摘走时返回 `None`。
    ///
    /// `abort` 只在下一个挂起点生效，已醒来的旧计时器可能在新 `add` 之后才拿到锁，
    /// 因此这里按编号而不是按键判断归属。
    fn take_expired(&self, key: &str, epoch: u64) -> Option<OpenBatch<I, R>> {
        let mut state = self.state.lock();
        match state.batches.get(key) {
            Some(batch) if batch.epoch == epoch => state.batches.remove(key),
            _ => None,
        }
    }
}

/// 运行一个已摘除的批次并分发结果。
async fn run_batch<I, R>(key: String, batch: OpenBatch<I, R>, trigger: Trigger) {
    let OpenBatch {
        items,
        waiters,
        processor,
        timer,
        ..
    } = batch;
    // 延迟触发时 timer 就是当前任务本身，这里只处理尚未触发的计时器。
    if let Some(timer) = timer {
        if !matches!(trigger, Trigger::Delay) {
            timer.abort();
        }
    }

    let expected = items.len();
    debug!(batch_key = %key, size = expected, ?trigger, "flushing batch");
    match processor(items).await {
        Ok(results) if results.len() == expected => {
            for (waiter, result) in waiters.into_iter().zip(results) {
                let _ = waiter.send(Ok(result));
            }
        }
        Ok(results) => {
            warn!(
                batch_key = %key,
                expected,
                actual = results.len(),
                "batch processor returned mismatched result count"
            );
            reject_all(
                waiters,
                GovernorError::BatchSizeMismatch {
                    batch_key: key,
                    expected,
                    actual: results.len(),
                },
            );
        }
        Err(err) => {
            debug!(batch_key = %key, error = %err, "batch processor failed");
            reject_all(waiters, err);
        }
    }
}

fn reject_all<R>(waiters: Vec<oneshot::Sender<Result<R>>>, err: GovernorError) {
    for waiter in waiters {
        let _ = waiter.send(Err(err.clone()));
    }
}

impl<I, R> std::fmt::Debug for RequestBatcher<I, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBatcher")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
