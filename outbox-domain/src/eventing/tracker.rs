//! 投递跟踪（DeliveryTracker）
//!
//! 对记录存储的薄封装：发送前落库、确认/退回/消费的状态迁移、消费端去重查询，
//! 以及跟踪通道的注册。
//!
use super::broker::ChannelDiscovery;
use crate::codec::MessageCodec;
use crate::domain_event::{DomainEvent, Message};
use crate::error::{OutboxError, OutboxResult, require_non_empty};
use crate::id_generator::{IdGenerator, SeededIdGenerator};
use crate::persist::EventRecordStore;
use bon::Builder;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

fn default_id_generator() -> Arc<dyn IdGenerator> {
    Arc::new(SeededIdGenerator::new())
}

#[derive(Builder)]
pub struct DeliveryTracker {
    store: Arc<dyn EventRecordStore>,
    codec: Arc<dyn MessageCodec>,
    #[builder(default = default_id_generator())]
    id_generator: Arc<dyn IdGenerator>,
    #[builder(skip)]
    channels: RwLock<BTreeSet<String>>,
}

impl DeliveryTracker {
    pub fn store(&self) -> &Arc<dyn EventRecordStore> {
        &self.store
    }

    pub fn codec(&self) -> &Arc<dyn MessageCodec> {
        &self.codec
    }

    /// 发现并注册跟踪通道，同时准备对应分区；返回本次发现的通道
    pub async fn register_channels(
        &self,
        discovery: &dyn ChannelDiscovery,
    ) -> OutboxResult<BTreeSet<String>> {
        let discovered = discovery.list_tracked_channels();
        let names: Vec<String> = discovered.iter().cloned().collect();
        self.store.initialize(&names).await?;

        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels.extend(discovered.iter().cloned());
        debug!(channels = ?names, "tracked channels registered");

        Ok(discovered)
    }

    pub fn registered_channels(&self) -> BTreeSet<String> {
        self.channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_tracked(&self, channel: &str) -> bool {
        self.channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(channel)
    }

    /// 分配事件 ID 并落库，返回记录与附带了 `eventId`/`outputChannelName` 头的消息
    pub async fn record(
        &self,
        message: Message,
        channel: &str,
    ) -> OutboxResult<(DomainEvent, Message)> {
        require_non_empty("channel", channel)?;

        let id = self.id_generator.generate();
        let header = self.codec.encode_headers(message.headers())?;
        let payload = self
            .codec
            .encode_payload(message.payload(), message.payload_type())?;

        let record = self
            .store
            .create(&id, &header, &payload, message.payload_type(), channel)
            .await?;
        debug!(event_id = %id, channel = %channel, "event recorded");

        Ok((record, message.annotate(&id, channel)))
    }

    /// 先落库再发送；发送失败时记录保留，等待补偿扫描重发
    pub async fn record_and_dispatch<F, Fut, R>(
        &self,
        message: Message,
        channel: &str,
        dispatch: F,
    ) -> OutboxResult<R>
    where
        F: FnOnce(Message) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<R>> + Send,
    {
        let (record, message) = self.record(message, channel).await?;

        dispatch(message).await.map_err(|e| {
            warn!(
                event_id = %record.id(),
                channel = %channel,
                error = %e,
                "dispatch failed, event kept for resend"
            );
            OutboxError::Dispatch {
                event_id: record.id().to_string(),
                reason: format!("{e:#}"),
            }
        })
    }

    pub async fn mark_as_returned(
        &self,
        id: &str,
        channel: &str,
    ) -> OutboxResult<Option<DomainEvent>> {
        require_non_empty("id", id)?;
        require_non_empty("channel", channel)?;
        let updated = self.store.mark_returned(id, channel).await?;
        Self::report("returned", id, channel, updated)
    }

    pub async fn mark_as_produced(
        &self,
        id: &str,
        channel: &str,
    ) -> OutboxResult<Option<DomainEvent>> {
        require_non_empty("id", id)?;
        require_non_empty("channel", channel)?;
        let updated = self.store.mark_produced(id, channel).await?;
        Self::report("produced", id, channel, updated)
    }

    pub async fn mark_as_consumed(
        &self,
        id: &str,
        channel: &str,
    ) -> OutboxResult<Option<DomainEvent>> {
        require_non_empty("id", id)?;
        require_non_empty("channel", channel)?;
        let updated = self.store.mark_consumed(id, channel).await?;
        Self::report("consumed", id, channel, updated)
    }

    /// 消费端去重判断
    pub async fn has_been_consumed(&self, id: &str, channel: &str) -> OutboxResult<bool> {
        require_non_empty("id", id)?;
        require_non_empty("channel", channel)?;
        self.store.has_consumed_timestamp(id, channel).await
    }

    pub fn rebuild_message(&self, record: &DomainEvent) -> OutboxResult<Message> {
        Message::from_record(record, self.codec.as_ref())
    }

    fn report(
        transition: &str,
        id: &str,
        channel: &str,
        updated: Option<DomainEvent>,
    ) -> OutboxResult<Option<DomainEvent>> {
        match &updated {
            Some(_) => debug!(event_id = %id, channel = %channel, transition, "event marked"),
            None => warn!(
                event_id = %id,
                channel = %channel,
                transition,
                "event not found, transition skipped"
            ),
        }
        Ok(updated)
    }
}

/// 已注册的跟踪通道即为补偿引擎的扫描范围
impl ChannelDiscovery for DeliveryTracker {
    fn list_tracked_channels(&self) -> BTreeSet<String> {
        self.registered_channels()
    }
}
