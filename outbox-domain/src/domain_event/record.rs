use crate::clock::Timestamp;
use crate::error::{OutboxResult, require_non_empty};
use bon::bon;
use serde::{Deserialize, Serialize};

/// 事件存储中的持久化记录
///
/// 一条记录对应一次对外发布的消息，按通道分区存放，`id` 同时作为分片键。
/// 状态由四个时间戳表达：
/// - `written_on`：最近一次（重）写入；
/// - `producer_ack_on`：broker 确认收到；
/// - `returned_on`：broker 退回/拒收；
/// - `consumer_ack_on`：下游消费成功（终态）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    id: String,
    created_on: Timestamp,
    channel: String,
    header: String,
    payload: String,
    payload_type: String,
    written_on: Timestamp,
    attempt_count: u64,
    returned_on: Option<Timestamp>,
    producer_ack_on: Option<Timestamp>,
    consumer_ack_on: Option<Timestamp>,
}

#[bon]
impl DomainEvent {
    /// 构造记录；`created_on` 取首次 `written_on`。
    ///
    /// 必填字段缺失无法通过编译，`id`/`channel`/`payload_type` 为空时返回校验错误。
    #[builder]
    pub fn new(
        #[builder(into)] id: String,
        #[builder(into)] channel: String,
        #[builder(into)] header: String,
        #[builder(into)] payload: String,
        #[builder(into)] payload_type: String,
        written_on: Timestamp,
        #[builder(default = 1)] attempt_count: u64,
        returned_on: Option<Timestamp>,
        producer_ack_on: Option<Timestamp>,
        consumer_ack_on: Option<Timestamp>,
    ) -> OutboxResult<Self> {
        require_non_empty("id", &id)?;
        require_non_empty("channel", &channel)?;
        require_non_empty("payloadType", &payload_type)?;

        Ok(Self {
            id,
            created_on: written_on,
            channel,
            header,
            payload,
            payload_type,
            written_on,
            attempt_count,
            returned_on,
            producer_ack_on,
            consumer_ack_on,
        })
    }
}

impl DomainEvent {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_on(&self) -> Timestamp {
        self.created_on
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn payload_type(&self) -> &str {
        &self.payload_type
    }

    pub fn written_on(&self) -> Timestamp {
        self.written_on
    }

    pub fn attempt_count(&self) -> u64 {
        self.attempt_count
    }

    pub fn returned_on(&self) -> Option<Timestamp> {
        self.returned_on
    }

    pub fn producer_ack_on(&self) -> Option<Timestamp> {
        self.producer_ack_on
    }

    pub fn consumer_ack_on(&self) -> Option<Timestamp> {
        self.consumer_ack_on
    }

    /// 已被消费的记录不再参与重发
    pub fn is_consumed(&self) -> bool {
        self.consumer_ack_on.is_some()
    }

    pub(crate) fn set_returned_on(&mut self, at: Timestamp) {
        self.returned_on = Some(at);
    }

    pub(crate) fn set_producer_ack_on(&mut self, at: Timestamp) {
        self.producer_ack_on = Some(at);
    }

    pub(crate) fn set_consumer_ack_on(&mut self, at: Timestamp) {
        self.consumer_ack_on = Some(at);
    }

    /// 重发前的状态重置：尝试次数 +1，刷新写入时间，清空上一次的确认/退回结果
    pub(crate) fn reset_for_resend(&mut self, at: Timestamp) {
        self.attempt_count += 1;
        self.written_on = at;
        self.producer_ack_on = None;
        self.returned_on = None;
    }

    /// 回滚一次重发重置：只恢复认领之后未被其他写入改动过的字段
    pub(crate) fn restore_resend_state(&mut self, previous: &DomainEvent, claimed: &DomainEvent) {
        if self.attempt_count == claimed.attempt_count {
            self.attempt_count = previous.attempt_count;
        }
        if self.written_on == claimed.written_on {
            self.written_on = previous.written_on;
        }
        if self.producer_ack_on == claimed.producer_ack_on {
            self.producer_ack_on = previous.producer_ack_on;
        }
        if self.returned_on == claimed.returned_on {
            self.returned_on = previous.returned_on;
        }
    }
}
