//! 节流与防抖。
//!
//! 两者与其它组件共用同一套挂起模型：计时由注入的 [`Clock`](crate::time::Clock) 驱动，
//! 定时任务运行在 Tokio 之上。

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::{GovernorError, Result};
use crate::time::SharedClock;

/// 一次节流调用的去向。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// 窗口空闲，已立即执行。
    Immediate,
    /// 窗口内首次被挡下，已安排在窗口结束时执行。
    Scheduled,
    /// 窗口内已有待执行的尾调用，本次参数替换了它。
    Coalesced,
}

/// 节流包装：每个窗口至多一次立即执行，窗口内的后续调用合并为一次携带最新参数的尾调用。
pub struct Throttle<A> {
    inner: Arc<ThrottleInner<A>>,
}

impl<A> Clone for Throttle<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ThrottleInner<A> {
    action: Box<dyn Fn(A) + Send + Sync>,
    window: Duration,
    clock: SharedClock,
    state: Mutex<ThrottleState<A>>,
}

struct ThrottleState<A> {
    window: Window,
    trailing: Option<A>,
}

/// 当前节流窗口。`Unbounded` 表示窗口终点超出 `Instant` 可表示范围。
#[derive(Clone, Copy, Debug)]
enum Window {
    Open,
    Until(Instant),
    Unbounded,
}

impl Window {
    fn starting_at(now: Instant, length: Duration) -> Self {
        now.checked_add(length).map_or(Self::Unbounded, Self::Until)
    }

    fn is_open(self, now: Instant) -> bool {
        match self {
            Self::Open => true,
            Self::Until(ends) => now >= ends,
            Self::Unbounded => false,
        }
    }

    fn remaining(self, now: Instant) -> Duration {
        match self {
            Self::Open => Duration::ZERO,
            Self::Until(ends) => ends.saturating_duration_since(now),
            Self::Unbounded => Duration::MAX,
        }
    }
}

impl<A> Throttle<A>
where
    A: Send + 'static,
{
    pub fn new<F>(action: F, window: Duration, clock: SharedClock) -> Self
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ThrottleInner {
                action: Box::new(action),
                window,
                clock,
                state: Mutex::new(ThrottleState {
                    window: Window::Open,
                    trailing: None,
                }),
            }),
        }
    }

    /// 提交一次调用。需要安排尾调用但当前不在 Tokio 运行时内时返回 [`GovernorError::NoRuntime`]。
    pub fn call(&self, args: A) -> Result<ThrottleDecision> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();

        if state.window.is_open(now) {
            state.window = Window::starting_at(now, self.inner.window);
            drop(state);
            (self.inner.action)(args);
            return Ok(ThrottleDecision::Immediate);
        }

        if let Some(pending) = state.trailing.as_mut() {
            *pending = args;
            return Ok(ThrottleDecision::Coalesced);
        }

        let handle = Handle::try_current().map_err(|_| GovernorError::NoRuntime {
            component: "Throttle",
        })?;
        let remaining = state.window.remaining(now);
        state.trailing = Some(args);
        let inner = Arc::clone(&self.inner);
        handle.spawn(async move {
            inner.clock.sleep(remaining).await;
            let args = {
                let mut state = inner.state.lock();
                state.window = Window::starting_at(inner.clock.now(), inner.window);
                state.trailing.take()
            };
            if let Some(args) = args {
                trace!("running trailing throttled call");
                (inner.action)(args);
            }
        });
        Ok(ThrottleDecision::Scheduled)
    }
}

/// 防抖包装：每次调用都会重置静默计时，只有静默期结束时的最后一次调用真正执行。
///
/// 被后续调用取代的调用方收到 [`GovernorError::Superseded`]，不会观察到最终执行的结果；
/// 每个静默窗口至多一个调用方拿到结果。
pub struct Debounce<A, T> {
    inner: Arc<DebounceInner<A, T>>,
}

impl<A, T> Clone for Debounce<A, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

type DebouncedAction<A, T> = Box<dyn Fn(A) -> BoxFuture<'static, Result<T>> + Send + Sync>;

struct DebounceInner<A, T> {
    action: DebouncedAction<A, T>,
    quiet: Duration,
    clock: SharedClock,
    state: Mutex<DebounceState<T>>,
}

struct DebounceState<T> {
    generation: u64,
    waiter: Option<oneshot::Sender<Result<T>>>,
    timer: Option<JoinHandle<()>>,
}

impl<T> DebounceState<T> {
    /// 让当前等待者失效并停止其计时。
    fn supersede(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(Err(GovernorError::Superseded));
        }
    }
}

impl<A, T> Debounce<A, T>
where
    A: Send + 'static,
    T: Send + 'static,
{
    pub fn new<F, Fut>(action: F, quiet: Duration, clock: SharedClock) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            inner: Arc::new(DebounceInner {
                action: Box::new(move |args| action(args).boxed()),
                quiet,
                clock,
                state: Mutex::new(DebounceState {
                    generation: 0,
                    waiter: None,
                    timer: None,
                }),
            }),
        }
    }

    /// 提交一次调用；若静默期内再无新调用，则以本次参数执行并返回结果。
    pub fn call(
        &self,
        args: A,
    ) -> impl Future<Output = Result<T>> + Send + 'static + use<A, T> {
        let (waiter, receiver) = oneshot::channel();
        let scheduled = match Handle::try_current() {
            Ok(handle) => {
                self.schedule(&handle, args, waiter);
                true
            }
            Err(_) => false,
        };

        async move {
            if !scheduled {
                return Err(GovernorError::NoRuntime {
                    component: "Debounce",
                });
            }
            receiver.await.unwrap_or_else(|_| {
                Err(GovernorError::Abandoned {
                    reason: "debounced call dropped before running",
                })
            })
        }
    }

    fn schedule(&self, handle: &Handle, args: A, waiter: oneshot::Sender<Result<T>>) {
        let mut state = self.inner.state.lock();
        state.supersede();
        let generation = state.generation;
        state.waiter = Some(waiter);

        let inner = Arc::clone(&self.inner);
        state.timer = Some(handle.spawn(async move {
            inner.clock.sleep(inner.quiet).await;
            let waiter = {
                let mut state = inner.state.lock();
                if state.generation != generation {
                    return;
                }
                // 计时已结束，之后的新调用不应再中止正在执行的动作。
                state.timer = None;
                state.waiter.take()
            };
            let Some(waiter) = waiter else {
                return;
            };
            trace!("quiet period elapsed, running debounced call");
            let outcome = (inner.action)(args).await;
            let _ = waiter.send(outcome);
        }));
    }

    /// 取消尚未执行的调用，其调用方收到 [`GovernorError::Superseded`]。
    pub fn cancel(&self) {
        self.inner.state.lock().supersede();
    }

    /// 是否有调用正在等待静默期结束。
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().waiter.is_some()
    }
}

impl<A> std::fmt::Debug for Throttle<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("window", &self.inner.window)
            .finish_non_exhaustive()
    }
}

impl<A, T> std::fmt::Debug for Debounce<A, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debounce")
            .field("quiet", &self.inner.quiet)
            .finish_non_exhaustive()
    }
}
