//! 事件记录存储协议
//!
//! 每条状态迁移都是单次原子的“查找并更新”，返回更新后的记录；
//! 补偿扫描通过 `ResendSession` 在一个事务会话内完成候选查询与认领。
//!
use crate::clock::Timestamp;
use crate::domain_event::DomainEvent;
use crate::error::OutboxResult;
use async_trait::async_trait;
use std::sync::Arc;

/// 可重发候选的筛选条件
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResendCriteria {
    /// 写入时间早于该时刻
    pub written_before: Timestamp,
    /// 生产者确认早于该时刻仍未被消费，同样视为可重发；`None` 表示不启用
    pub producer_ack_before: Option<Timestamp>,
    /// 单轮最多返回的候选数
    pub limit: usize,
}

impl ResendCriteria {
    pub fn matches(&self, event: &DomainEvent) -> bool {
        if event.written_on() >= self.written_before || event.is_consumed() {
            return false;
        }

        match event.producer_ack_on() {
            None => true,
            Some(_) if event.returned_on().is_some() => true,
            Some(acked) => self.producer_ack_before.is_some_and(|before| acked < before),
        }
    }

    /// 过滤、按写入时间倒序并截断到 `limit`
    pub fn select<'a, I>(&self, events: I) -> Vec<DomainEvent>
    where
        I: IntoIterator<Item = &'a DomainEvent>,
    {
        let mut matched: Vec<DomainEvent> = events
            .into_iter()
            .filter(|e| self.matches(e))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.written_on().cmp(&a.written_on()));
        matched.truncate(self.limit);
        matched
    }
}

#[async_trait]
pub trait EventRecordStore: Send + Sync {
    /// 幂等地准备各通道的分区
    async fn initialize(&self, channels: &[String]) -> OutboxResult<()>;

    /// 新建记录：`attempt_count=1`，`created_on=written_on=now`；ID 冲突返回 `DuplicateId`
    async fn create(
        &self,
        id: &str,
        header: &str,
        payload: &str,
        payload_type: &str,
        channel: &str,
    ) -> OutboxResult<DomainEvent>;

    async fn mark_returned(&self, id: &str, channel: &str) -> OutboxResult<Option<DomainEvent>>;

    async fn mark_produced(&self, id: &str, channel: &str) -> OutboxResult<Option<DomainEvent>>;

    async fn mark_consumed(&self, id: &str, channel: &str) -> OutboxResult<Option<DomainEvent>>;

    async fn has_consumed_timestamp(&self, id: &str, channel: &str) -> OutboxResult<bool>;

    /// 打开一个针对单通道的重发事务会话
    async fn begin_resend(&self, channel: &str) -> OutboxResult<Box<dyn ResendSession>>;

    async fn delete_all(&self, channel: &str) -> OutboxResult<()>;

    async fn find_all(&self, channel: &str) -> OutboxResult<Vec<DomainEvent>>;
}

/// 重发事务会话
///
/// 未提交即被丢弃的会话等同于 `abort`。
#[async_trait]
pub trait ResendSession: Send {
    async fn candidates(&mut self, criteria: &ResendCriteria) -> OutboxResult<Vec<DomainEvent>>;

    /// 原子的条件重置：仍满足条件时 `attempt_count+1`、刷新 `written_on`、
    /// 清空生产者确认与退回时间并返回新记录；条件已不成立时返回 `None`
    async fn claim(
        &mut self,
        id: &str,
        criteria: &ResendCriteria,
    ) -> OutboxResult<Option<DomainEvent>>;

    async fn commit(self: Box<Self>) -> OutboxResult<()>;

    async fn abort(self: Box<Self>) -> OutboxResult<()>;
}

#[async_trait]
impl<T> EventRecordStore for Arc<T>
where
    T: EventRecordStore + ?Sized,
{
    async fn initialize(&self, channels: &[String]) -> OutboxResult<()> {
        (**self).initialize(channels).await
    }

    async fn create(
        &self,
        id: &str,
        header: &str,
        payload: &str,
        payload_type: &str,
        channel: &str,
    ) -> OutboxResult<DomainEvent> {
        (**self)
            .create(id, header, payload, payload_type, channel)
            .await
    }

    async fn mark_returned(&self, id: &str, channel: &str) -> OutboxResult<Option<DomainEvent>> {
        (**self).mark_returned(id, channel).await
    }

    async fn mark_produced(&self, id: &str, channel: &str) -> OutboxResult<Option<DomainEvent>> {
        (**self).mark_produced(id, channel).await
    }

    async fn mark_consumed(&self, id: &str, channel: &str) -> OutboxResult<Option<DomainEvent>> {
        (**self).mark_consumed(id, channel).await
    }

    async fn has_consumed_timestamp(&self, id: &str, channel: &str) -> OutboxResult<bool> {
        (**self).has_consumed_timestamp(id, channel).await
    }

    async fn begin_resend(&self, channel: &str) -> OutboxResult<Box<dyn ResendSession>> {
        (**self).begin_resend(channel).await
    }

    async fn delete_all(&self, channel: &str) -> OutboxResult<()> {
        (**self).delete_all(channel).await
    }

    async fn find_all(&self, channel: &str) -> OutboxResult<Vec<DomainEvent>> {
        (**self).find_all(channel).await
    }
}
