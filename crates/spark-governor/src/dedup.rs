//! 在途请求合并与短期结果缓存。
//!
//! # 行为概览（How）
//! - 同一键的并发调用只触发一次底层操作，所有调用方共享同一个结果（成功值或错误）；
//! - 幂等调用成功后写入缓存，TTL 内的后续调用直接命中缓存；
//! - 底层操作在独立的 Tokio 任务中运行，即使所有调用方都不再轮询，
//!   在途表也会在操作结束时被清理。
//!
//! # 契约说明（What）
//! - 任一时刻每个键至多一个在途条目；操作结束（无论成败）即移除；
//! - 失败结果从不缓存；
//! - 过期条目不会被返回，只会被刷新或淘汰。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use regex::Regex;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::config::DedupConfig;
use crate::error::{GovernorError, Result};
use crate::time::SharedClock;

const COMPONENT: &str = "RequestDeduplicator";

type SharedCall<T> = Shared<BoxFuture<'static, Result<T>>>;

/// 单次调用的去重选项。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DedupOptions {
    /// 为 `true` 时读取并写入结果缓存；否则只参与在途合并。
    pub idempotent: bool,
}

impl DedupOptions {
    pub fn non_idempotent() -> Self {
        Self { idempotent: false }
    }
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self { idempotent: true }
    }
}

/// [`RequestDeduplicator::invalidate`] 的匹配规则。
#[derive(Clone, Debug)]
pub enum KeyPattern {
    Exact(String),
    Prefix(String),
    Regex(Regex),
}

impl KeyPattern {
    pub fn exact(key: impl Into<String>) -> Self {
        Self::Exact(key.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    /// 编译正则表达式；匹配语义为“在键中任意位置命中”。
    pub fn regex(pattern: &str) -> std::result::Result<Self, regex::Error> {
        Regex::new(pattern).map(Self::Regex)
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(expected) => key == expected,
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
            Self::Regex(regex) => regex.is_match(key),
        }
    }
}

/// 请求去重器，克隆后共享缓存与在途表。
pub struct RequestDeduplicator<T> {
    inner: Arc<DedupInner<T>>,
}

impl<T> Clone for RequestDeduplicator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct DedupInner<T> {
    clock: SharedClock,
    config: DedupConfig,
    state: Mutex<DedupState<T>>,
}

struct DedupState<T> {
    cache: HashMap<String, CacheEntry<T>>,
    pending: HashMap<String, PendingCall<T>>,
    next_call: u64,
}

struct CacheEntry<T> {
    value: T,
    stored_at: Instant,
}

struct PendingCall<T> {
    id: u64,
    call: SharedCall<T>,
}

enum Lookup<T> {
    Hit(T),
    Joined(SharedCall<T>),
    Failed(GovernorError),
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: DedupConfig, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(DedupInner {
                clock,
                config,
                state: Mutex::new(DedupState {
                    cache: HashMap::new(),
                    pending: HashMap::new(),
                    next_call: 0,
                }),
            }),
        }
    }

    /// 以 `key` 为身份执行 `operation`。
    ///
    /// 查找顺序：有效缓存（仅幂等调用）→ 在途调用 → 启动新调用。查找与登记在调用时
    /// 同步完成，返回的 Future 只负责等待。
    ///
    /// # 错误
    /// - 需要启动新调用但当前不在 Tokio 运行时内：[`GovernorError::NoRuntime`]；
    /// - 操作所在任务 panic：[`GovernorError::Abandoned`]；
    /// - 其余错误来自 `operation`，并原样交给该键的全部扇入调用方。
    pub fn execute<K, F, Fut>(
        &self,
        key: K,
        operation: F,
        options: DedupOptions,
    ) -> impl Future<Output = Result<T>> + Send + 'static + use<T, K, F, Fut>
    where
        K: Into<String>,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let lookup = self.lookup(key.into(), operation, options);
        async move {
            match lookup {
                Lookup::Hit(value) => Ok(value),
                Lookup::Joined(call) => call.await,
                Lookup::Failed(err) => Err(err),
            }
        }
    }

    fn lookup<F, Fut>(&self, key: String, operation: F, options: DedupOptions) -> Lookup<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let now = self.inner.clock.now();
        let ttl = self.inner.config.cache_ttl();
        let mut state = self.inner.state.lock();

        if options.idempotent {
            match state.cache.get(&key) {
                Some(entry) if now.saturating_duration_since(entry.stored_at) < ttl => {
                    trace!(%key, "dedup cache hit");
                    return Lookup::Hit(entry.value.clone());
                }
                Some(_) => {
                    state.cache.remove(&key);
                }
                None => {}
            }
        }

        if let Some(pending) = state.pending.get(&key) {
            trace!(%key, "joining in-flight call");
            return Lookup::Joined(pending.call.clone());
        }

        let Ok(handle) = Handle::try_current() else {
            return Lookup::Failed(GovernorError::NoRuntime {
                component: COMPONENT,
            });
        };

        let id = state.next_call;
        state.next_call += 1;
        let slot = PendingSlot {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
            id,
        };
        let idempotent = options.idempotent;
        let task = handle.spawn(async move {
            let outcome = operation().await;
            slot.inner.settle(&slot.key, slot.id, idempotent, &outcome);
            outcome
        });
        let call = task
            .map(|joined| {
                joined.unwrap_or_else(|_| {
                    Err(GovernorError::Abandoned {
                        reason: "deduplicated operation did not complete",
                    })
                })
            })
            .boxed()
            .shared();

        debug!(%key, idempotent, "starting deduplicated call");
        state.pending.insert(
            key,
            PendingCall {
                id,
                call: call.clone(),
            },
        );
        Lookup::Joined(call)
    }

    /// 删除匹配的缓存条目，返回删除数量。在途调用不受影响。
    pub fn invalidate(&self, pattern: &KeyPattern) -> usize {
        let mut state = self.inner.state.lock();
        let before = state.cache.len();
        state.cache.retain(|key, _| !pattern.matches(key));
        let removed = before - state.cache.len();
        debug!(removed, ?pattern, "dedup cache invalidated");
        removed
    }

    /// 清空缓存，在途调用保持不变。
    pub fn clear_cache(&self) {
        self.inner.state.lock().cache.clear();
    }

    /// 主动淘汰已过期的缓存条目，返回淘汰数量。
    pub fn evict_expired(&self) -> usize {
        let now = self.inner.clock.now();
        let ttl = self.inner.config.cache_ttl();
        let mut state = self.inner.state.lock();
        let before = state.cache.len();
        state
            .cache
            .retain(|_, entry| now.saturating_duration_since(entry.stored_at) < ttl);
        before - state.cache.len()
    }

    pub fn cache_len(&self) -> usize {
        self.inner.state.lock().cache.len()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().pending.len()
    }
}

/// 在途条目的持有凭证：无论操作正常结束、panic 还是随任务一起被取消，
/// Drop 时都会移除自己登记的在途条目。
struct PendingSlot<T> {
    inner: Arc<DedupInner<T>>,
    key: String,
    id: u64,
}

impl<T> Drop for PendingSlot<T> {
    fn drop(&mut self) {
        if self.inner.release(&self.key, self.id) {
            debug!(key = %self.key, "deduplicated call ended without settling");
        }
    }
}

impl<T> DedupInner<T> {
    /// 移除 `id` 对应的在途条目；同键已被更新的调用取代时保持不动。
    fn release(&self, key: &str, id: u64) -> bool {
        let mut state = self.state.lock();
        if state.pending.get(key).is_some_and(|pending| pending.id == id) {
            state.pending.remove(key);
            return true;
        }
        false
    }

    /// 操作结束时调用：移除在途条目，并在幂等成功时写入缓存。
    ///
    /// 两步在同一临界区内完成，新调用方要么加入在途调用，要么命中缓存。
    fn settle(&self, key: &str, id: u64, idempotent: bool, outcome: &Result<T>)
    where
        T: Clone,
    {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if state.pending.get(key).is_some_and(|pending| pending.id == id) {
            state.pending.remove(key);
        }

        match outcome {
            Ok(value) if idempotent => {
                state.cache.insert(
                    key.to_owned(),
                    CacheEntry {
                        value: value.clone(),
                        stored_at: now,
                    },
                );
                if let Some(limit) = self.config.max_cache_entries {
                    while state.cache.len() > limit {
                        let Some(oldest) = state
                            .cache
                            .iter()
                            .min_by_key(|(_, entry)| entry.stored_at)
                            .map(|(key, _)| key.clone())
                        else {
                            break;
                        };
                        trace!(key = %oldest, "dedup cache full, evicting oldest entry");
                        state.cache.remove(&oldest);
                    }
                }
            }
            Ok(_) => {}
            Err(err) => debug!(%key, error = %err, "deduplicated call failed, not cached"),
        }
    }
}

impl<T> std::fmt::Debug for RequestDeduplicator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDeduplicator")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
