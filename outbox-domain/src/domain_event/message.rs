use crate::codec::MessageCodec;
use crate::error::{OutboxError, OutboxResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::DomainEvent;

/// 事件 ID 头
pub const EVENT_ID_HEADER: &str = "eventId";
/// 输出通道名头
pub const CHANNEL_HEADER: &str = "outputChannelName";

/// 消息头（JSON 对象）
pub type Headers = serde_json::Map<String, Value>;

/// 可发布的业务载荷，`TYPE` 作为反序列化所需的类型标签
pub trait Payload: Serialize + DeserializeOwned + Send + Sync {
    const TYPE: &'static str;
}

/// 在进程与 broker 之间流转的消息：头 + 载荷 + 载荷类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    headers: Headers,
    payload: Value,
    payload_type: String,
}

impl Message {
    pub fn new(payload: Value, payload_type: impl Into<String>) -> Self {
        Self {
            headers: Headers::new(),
            payload,
            payload_type: payload_type.into(),
        }
    }

    pub fn from_payload<P: Payload>(payload: &P) -> OutboxResult<Self> {
        Ok(Self::new(serde_json::to_value(payload)?, P::TYPE))
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(Value::as_str)
    }

    /// 非空的事件 ID 头
    pub fn event_id(&self) -> Option<&str> {
        self.header_str(EVENT_ID_HEADER).filter(|s| !s.is_empty())
    }

    /// 非空的输出通道头
    pub fn channel(&self) -> Option<&str> {
        self.header_str(CHANNEL_HEADER).filter(|s| !s.is_empty())
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn payload_type(&self) -> &str {
        &self.payload_type
    }

    /// 还原为具体载荷类型，类型标签不符时报错
    pub fn decode<P: Payload>(&self) -> OutboxResult<P> {
        if self.payload_type != P::TYPE {
            return Err(OutboxError::Codec {
                reason: format!(
                    "payload type mismatch: expected={}, found={}",
                    P::TYPE,
                    self.payload_type
                ),
            });
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// 写入事件 ID 与输出通道，供确认通道与消费端回查记录
    pub(crate) fn annotate(self, event_id: &str, channel: &str) -> Self {
        self.with_header(EVENT_ID_HEADER, event_id)
            .with_header(CHANNEL_HEADER, channel)
    }

    /// 由存储记录重建消息（用于补偿重发）
    pub fn from_record(record: &DomainEvent, codec: &dyn MessageCodec) -> OutboxResult<Self> {
        let headers = codec.decode_headers(record.header())?;
        let payload = codec.decode_payload(record.payload(), record.payload_type())?;

        Ok(Self::new(payload, record.payload_type())
            .with_headers(headers)
            .annotate(record.id(), record.channel()))
    }
}
