//! 组件级事件总线
//!
//! 每个核心组件持有一个 `EventBus<E>`：`subscribe` 注册回调并返回 `Subscription`，
//! `emit` 在调用线程上同步依次调用所有回调。某个回调 panic 只记录日志，
//! 其余回调照常收到事件。

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// 事件回调
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

type Registry<E> = Mutex<BTreeMap<u64, Listener<E>>>;

/// 单组件的监听者注册表
pub struct EventBus<E> {
    listeners: Arc<Registry<E>>,
    next_id: AtomicU64,
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// 注册回调；按注册顺序投递
    ///
    /// 丢弃返回的 `Subscription` 不会退订，需显式调用 `unsubscribe`。
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
        E: 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).insert(id, Arc::new(listener));

        let weak: Weak<Registry<E>> = Arc::downgrade(&self.listeners);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(listeners) = weak.upgrade() {
                    lock(&listeners).remove(&id);
                }
            })),
        }
    }

    /// 向当前所有监听者投递事件，返回成功处理（未 panic）的监听者数量
    pub fn emit(&self, event: &E) -> usize {
        // 先拷贝快照再释放锁，回调里可以安全地 subscribe / unsubscribe
        let snapshot: Vec<Listener<E>> = lock(&self.listeners).values().cloned().collect();

        let mut delivered = 0;
        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(_) => tracing::warn!("Event listener panicked; continuing with remaining listeners"),
            }
        }
        delivered
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<E>(registry: &Registry<E>) -> std::sync::MutexGuard<'_, BTreeMap<u64, Listener<E>>> {
    // 回调在锁外执行，中毒只可能来自 BTreeMap 自身操作，数据仍然一致
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `subscribe` 的退订句柄
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// 退订；注册表已销毁时为空操作
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
