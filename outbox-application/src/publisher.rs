use crate::error::AppError;
use async_trait::async_trait;
use outbox_domain::domain_event::Message;
use outbox_domain::error::OutboxError;
use outbox_domain::eventing::{BrokerDispatcher, CallbackCorrelator, DeliveryTracker};
use std::sync::Arc;
use tracing::{debug, warn};

#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, channel: &str, message: Message) -> Result<(), AppError>;
}

#[async_trait]
impl<T> MessagePublisher for Arc<T>
where
    T: MessagePublisher + ?Sized,
{
    async fn publish(&self, channel: &str, message: Message) -> Result<(), AppError> {
        (**self).publish(channel, message).await
    }
}

/// 直接交给 broker 发送，不做任何跟踪
pub struct DispatcherPublisher {
    dispatcher: Arc<dyn BrokerDispatcher>,
}

impl DispatcherPublisher {
    pub fn new(dispatcher: Arc<dyn BrokerDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl MessagePublisher for DispatcherPublisher {
    async fn publish(&self, channel: &str, message: Message) -> Result<(), AppError> {
        self.dispatcher
            .send(channel, message)
            .await
            .map_err(|e| AppError::Broker(format!("{e:#}")))
    }
}

/// MessagePublisher 的装饰器：跟踪通道上的消息先落库再交给内层发送
pub struct OutboxPublisher<P> {
    inner: P,
    tracker: Arc<DeliveryTracker>,
    correlator: CallbackCorrelator,
}

impl<P> OutboxPublisher<P>
where
    P: MessagePublisher,
{
    pub fn new(inner: P, tracker: Arc<DeliveryTracker>, correlator: CallbackCorrelator) -> Self {
        Self {
            inner,
            tracker,
            correlator,
        }
    }

    /// 发送并同步等待 broker 确认，返回事件 ID
    ///
    /// `source_key` 在发送前登记，发送时改挂到事件 ID，
    /// 由确认回调（`DeliveryAckHandler`）解析。
    pub async fn publish_confirmed(
        &self,
        channel: &str,
        message: Message,
        source_key: &str,
    ) -> Result<String, AppError> {
        if !self.tracker.is_tracked(channel) {
            return Err(AppError::Validation(format!(
                "channel {channel} is not tracked"
            )));
        }

        let handle = self.correlator.register(source_key)?;
        let correlator = self.correlator.clone();
        let inner = &self.inner;

        let dispatched = self
            .tracker
            .record_and_dispatch(message, channel, |msg| async move {
                let event_id = msg
                    .event_id()
                    .map(str::to_string)
                    .ok_or_else(|| anyhow::anyhow!("recorded message has no event id"))?;
                // 确认可能先于发送返回到达，必须在发送前改挂
                if let Err(e) = correlator.rekey(source_key, &event_id) {
                    warn!(source_key = %source_key, event_id = %event_id, error = %e, "rekey failed");
                }
                inner.publish(channel, msg).await?;
                Ok(event_id)
            })
            .await;

        match dispatched {
            Ok(event_id) => {
                handle.wait().await?;
                debug!(event_id = %event_id, channel = %channel, "publish confirmed");
                Ok(event_id)
            }
            Err(e) => {
                let key = match &e {
                    OutboxError::Dispatch { event_id, .. } => event_id.as_str(),
                    _ => source_key,
                };
                self.correlator.resolve_failure(key, e.to_string());
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl<P> MessagePublisher for OutboxPublisher<P>
where
    P: MessagePublisher,
{
    async fn publish(&self, channel: &str, message: Message) -> Result<(), AppError> {
        if !self.tracker.is_tracked(channel) {
            return self.inner.publish(channel, message).await;
        }

        let inner = &self.inner;
        self.tracker
            .record_and_dispatch(message, channel, |msg| async move {
                inner.publish(channel, msg).await?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
