//! 消息编解码
//!
//! 记录中以字符串形式保存头与载荷，`payload_type` 作为类型标签，
//! 重发时由编解码器还原。编解码器以构造参数注入各组件。
//!
use crate::domain_event::{Headers, Payload};
use crate::error::{OutboxError, OutboxResult};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

pub trait MessageCodec: Send + Sync {
    fn encode_headers(&self, headers: &Headers) -> OutboxResult<String>;

    fn decode_headers(&self, raw: &str) -> OutboxResult<Headers>;

    fn encode_payload(&self, payload: &Value, payload_type: &str) -> OutboxResult<String>;

    /// 按类型标签还原载荷；未登记的类型返回 `UnknownPayloadType`
    fn decode_payload(&self, raw: &str, payload_type: &str) -> OutboxResult<Value>;
}

type Validator = fn(&Value) -> OutboxResult<()>;

fn validate_as<P: Payload>(value: &Value) -> OutboxResult<()> {
    P::deserialize(value).map(|_| ()).map_err(|e| OutboxError::Codec {
        reason: format!("payload does not match {}: {e}", P::TYPE),
    })
}

fn accept_any(_: &Value) -> OutboxResult<()> {
    Ok(())
}

/// 基于 serde_json 的编解码器，维护类型标签到校验函数的登记表
#[derive(Clone, Default)]
pub struct JsonCodec {
    registry: HashMap<String, Validator>,
}

impl JsonCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个强类型载荷，解码时按其结构校验
    pub fn register<P: Payload>(mut self) -> Self {
        self.registry.insert(P::TYPE.to_string(), validate_as::<P>);
        self
    }

    /// 登记一个不做结构校验的类型标签
    pub fn register_untyped(mut self, payload_type: impl Into<String>) -> Self {
        self.registry.insert(payload_type.into(), accept_any);
        self
    }

    pub fn is_registered(&self, payload_type: &str) -> bool {
        self.registry.contains_key(payload_type)
    }

    fn validator(&self, payload_type: &str) -> OutboxResult<Validator> {
        self.registry
            .get(payload_type)
            .copied()
            .ok_or_else(|| OutboxError::UnknownPayloadType {
                payload_type: payload_type.to_string(),
            })
    }
}

impl fmt::Debug for JsonCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.registry.keys().collect();
        types.sort();
        f.debug_struct("JsonCodec").field("types", &types).finish()
    }
}

impl MessageCodec for JsonCodec {
    fn encode_headers(&self, headers: &Headers) -> OutboxResult<String> {
        Ok(serde_json::to_string(headers)?)
    }

    fn decode_headers(&self, raw: &str) -> OutboxResult<Headers> {
        if raw.trim().is_empty() {
            return Ok(Headers::new());
        }
        Ok(serde_json::from_str(raw)?)
    }

    fn encode_payload(&self, payload: &Value, payload_type: &str) -> OutboxResult<String> {
        (self.validator(payload_type)?)(payload)?;
        Ok(serde_json::to_string(payload)?)
    }

    fn decode_payload(&self, raw: &str, payload_type: &str) -> OutboxResult<Value> {
        let validate = self.validator(payload_type)?;
        let value: Value = serde_json::from_str(raw)?;
        validate(&value)?;
        Ok(value)
    }
}
