use crate::error::AppError;
use async_trait::async_trait;
use dashmap::DashMap;
use outbox_domain::domain_event::Message;
use outbox_domain::eventing::DeliveryTracker;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// 业务消费逻辑
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    async fn consume(&self, message: &Message) -> anyhow::Result<()>;
}

#[async_trait]
impl<T> MessageConsumer for Arc<T>
where
    T: MessageConsumer + ?Sized,
{
    async fn consume(&self, message: &Message) -> anyhow::Result<()> {
        (**self).consume(message).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// 已执行业务逻辑并标记消费
    Processed,
    /// 重复投递，已跳过
    Skipped,
    /// 消息不带事件 ID/通道头，直接交给业务逻辑
    Untracked,
}

/// MessageConsumer 的装饰器：消费端去重
///
/// 开启去重时，同一事件的并发投递按事件键串行化：
/// 查询是否已消费 → 执行业务逻辑 → 标记消费。
/// 关闭去重时只在成功后标记消费。
pub struct IdempotentConsumer<C> {
    inner: C,
    tracker: Arc<DeliveryTracker>,
    ignore_duplicate: bool,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<C> IdempotentConsumer<C>
where
    C: MessageConsumer,
{
    pub fn new(inner: C, tracker: Arc<DeliveryTracker>, ignore_duplicate: bool) -> Self {
        Self {
            inner,
            tracker,
            ignore_duplicate,
            locks: DashMap::new(),
        }
    }

    pub async fn handle(&self, message: &Message) -> Result<ConsumeOutcome, AppError> {
        let (Some(event_id), Some(channel)) = (message.event_id(), message.channel()) else {
            self.run_inner(message).await?;
            return Ok(ConsumeOutcome::Untracked);
        };

        if !self.ignore_duplicate {
            self.run_inner(message).await?;
            self.tracker.mark_as_consumed(event_id, channel).await?;
            return Ok(ConsumeOutcome::Processed);
        }

        let key = format!("{channel}/{event_id}");
        let lock = self.locks.entry(key.clone()).or_default().value().clone();
        let outcome = {
            let _guard = lock.lock().await;
            self.consume_once(message, event_id, channel).await
        };

        drop(lock);
        self.locks.remove_if(&key, |_, l| Arc::strong_count(l) == 1);
        outcome
    }

    async fn consume_once(
        &self,
        message: &Message,
        event_id: &str,
        channel: &str,
    ) -> Result<ConsumeOutcome, AppError> {
        if self.tracker.has_been_consumed(event_id, channel).await? {
            debug!(event_id = %event_id, channel = %channel, "duplicate delivery skipped");
            return Ok(ConsumeOutcome::Skipped);
        }

        self.run_inner(message).await?;
        self.tracker.mark_as_consumed(event_id, channel).await?;
        Ok(ConsumeOutcome::Processed)
    }

    async fn run_inner(&self, message: &Message) -> Result<(), AppError> {
        self.inner
            .consume(message)
            .await
            .map_err(|e| AppError::Consumer(format!("{e:#}")))
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// 当前持有的事件键锁数量
    pub fn in_flight(&self) -> usize {
        self.locks.len()
    }
}

#[async_trait]
impl<C> MessageConsumer for IdempotentConsumer<C>
where
    C: MessageConsumer,
{
    async fn consume(&self, message: &Message) -> anyhow::Result<()> {
        self.handle(message).await?;
        Ok(())
    }
}
