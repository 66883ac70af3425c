//! 回调关联（CallbackCorrelator）
//!
//! 发送方在发送前以源键登记一个等待句柄，发送后把源键改写为事件 ID，
//! broker 的确认/退回经由事件 ID 解析到对应句柄。每个句柄只会被解析一次，
//! 超时由独立的计时任务负责驱逐并以超时结果唤醒等待方。
//!
use crate::error::{OutboxError, OutboxResult, require_non_empty};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// 句柄的最终结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Delivered,
    Failed(String),
    TimedOut,
}

struct Slot {
    key: String,
    tx: oneshot::Sender<Resolution>,
}

struct Inner {
    by_key: DashMap<String, u64>,
    slots: DashMap<u64, Slot>,
    next_ticket: AtomicU64,
    default_timeout: Duration,
}

impl Inner {
    fn expire(&self, ticket: u64) {
        if let Some((_, slot)) = self.slots.remove(&ticket) {
            self.by_key.remove_if(&slot.key, |_, t| *t == ticket);
            debug!(key = %slot.key, "pending callback timed out");
            let _ = slot.tx.send(Resolution::TimedOut);
        }
    }

    fn resolve(&self, key: &str, resolution: Resolution) -> bool {
        let Some((_, ticket)) = self.by_key.remove(key) else {
            debug!(key = %key, "no pending callback for key");
            return false;
        };
        let Some((_, slot)) = self.slots.remove(&ticket) else {
            debug!(key = %key, "pending callback already evicted");
            return false;
        };
        let _ = slot.tx.send(resolution);
        true
    }
}

#[derive(Clone)]
pub struct CallbackCorrelator {
    inner: Arc<Inner>,
}

impl Default for CallbackCorrelator {
    fn default() -> Self {
        Self::new(Duration::from_millis(5000))
    }
}

impl CallbackCorrelator {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                by_key: DashMap::new(),
                slots: DashMap::new(),
                next_ticket: AtomicU64::new(1),
                default_timeout,
            }),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    pub fn register(&self, key: &str) -> OutboxResult<PendingHandle> {
        self.register_with_timeout(key, self.inner.default_timeout)
    }

    /// 以源键登记等待句柄；同一键不可重复登记。需在 tokio 运行时内调用
    pub fn register_with_timeout(
        &self,
        key: &str,
        timeout: Duration,
    ) -> OutboxResult<PendingHandle> {
        require_non_empty("key", key)?;

        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        match self.inner.by_key.entry(key.to_string()) {
            Entry::Occupied(_) => {
                return Err(OutboxError::validation(format!(
                    "callback already pending for key {key}"
                )));
            }
            Entry::Vacant(vacant) => {
                self.inner.slots.insert(
                    ticket,
                    Slot {
                        key: key.to_string(),
                        tx,
                    },
                );
                vacant.insert(ticket);
            }
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(ticket);
            }
        });

        Ok(PendingHandle {
            key: key.to_string(),
            timeout,
            rx,
        })
    }

    /// 将句柄从源键改挂到新键（通常是事件 ID）
    pub fn rekey(&self, source_key: &str, new_key: &str) -> OutboxResult<()> {
        require_non_empty("source_key", source_key)?;
        require_non_empty("new_key", new_key)?;

        let Some((_, ticket)) = self.inner.by_key.remove(source_key) else {
            return Err(OutboxError::CorrelationMiss {
                key: source_key.to_string(),
            });
        };

        let taken = match self.inner.by_key.entry(new_key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(ticket);
                true
            }
        };
        if !taken {
            self.inner.by_key.insert(source_key.to_string(), ticket);
            return Err(OutboxError::validation(format!(
                "callback already pending for key {new_key}"
            )));
        }

        // 改挂期间句柄可能已超时被驱逐
        match self.inner.slots.get_mut(&ticket) {
            Some(mut slot) => {
                slot.key = new_key.to_string();
                debug!(source_key = %source_key, new_key = %new_key, "pending callback rekeyed");
                Ok(())
            }
            None => {
                self.inner.by_key.remove_if(new_key, |_, t| *t == ticket);
                Err(OutboxError::CorrelationMiss {
                    key: source_key.to_string(),
                })
            }
        }
    }

    pub fn resolve_success(&self, key: &str) -> bool {
        self.inner.resolve(key, Resolution::Delivered)
    }

    pub fn resolve_failure(&self, key: &str, reason: impl Into<String>) -> bool {
        self.inner.resolve(key, Resolution::Failed(reason.into()))
    }

    pub fn pending_count(&self) -> usize {
        self.inner.slots.len()
    }
}

/// 等待句柄
#[must_use = "a pending handle does nothing unless waited on"]
pub struct PendingHandle {
    key: String,
    timeout: Duration,
    rx: oneshot::Receiver<Resolution>,
}

impl PendingHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn wait(self) -> OutboxResult<()> {
        match self.rx.await {
            Ok(Resolution::Delivered) => Ok(()),
            Ok(Resolution::Failed(reason)) => Err(OutboxError::DeliveryFailed {
                key: self.key,
                reason,
            }),
            Ok(Resolution::TimedOut) | Err(_) => Err(OutboxError::Timeout {
                key: self.key,
                waited_ms: self.timeout.as_millis(),
            }),
        }
    }
}
