//! Outbox 统一错误定义
//!
//! 覆盖记录存储、状态迁移、补偿扫描事务、回调关联与编解码/配置解析，
//! 便于各实现层统一转换为 `OutboxError`。
//!
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum OutboxError {
    // --- 调用方参数 ---
    #[error("validation error: {reason}")]
    Validation { reason: String },

    // --- 记录存储 ---
    #[error("event not found: event_id={event_id}, channel={channel}")]
    NotFound { event_id: String, channel: String },
    #[error("duplicate event id: event_id={event_id}, channel={channel}")]
    DuplicateId { event_id: String, channel: String },
    #[error("event store error: {reason}")]
    Store { reason: String },

    // --- 补偿扫描 ---
    #[error("transaction failed: channel={channel}, retryable={retryable}, reason={reason}")]
    Transaction {
        channel: String,
        reason: String,
        retryable: bool,
    },

    // --- 投递与回调关联 ---
    #[error("dispatch failed: event_id={event_id}, reason={reason}")]
    Dispatch { event_id: String, reason: String },
    #[error("correlation miss: key={key}")]
    CorrelationMiss { key: String },
    #[error("delivery failed: key={key}, reason={reason}")]
    DeliveryFailed { key: String, reason: String },
    #[error("timed out waiting for delivery outcome: key={key}, waited_ms={waited_ms}")]
    Timeout { key: String, waited_ms: u128 },

    // --- 编解码/配置 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("unknown payload type: {payload_type}")]
    UnknownPayloadType { payload_type: String },
    #[error("codec error: {reason}")]
    Codec { reason: String },
    #[error("parse error: {reason}")]
    Parse { reason: String },
    #[error("invalid config: {reason}")]
    Config { reason: String },
}

impl OutboxError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn store(reason: impl Into<String>) -> Self {
        Self::Store {
            reason: reason.into(),
        }
    }

    pub fn transaction(channel: impl Into<String>, reason: impl Into<String>, retryable: bool) -> Self {
        Self::Transaction {
            channel: channel.into(),
            reason: reason.into(),
            retryable,
        }
    }

    /// 仅当底层事务引擎明确标记为可重试时返回 true
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transaction { retryable: true, .. })
    }
}

/// 统一 Result 类型别名
pub type OutboxResult<T> = Result<T, OutboxError>;

impl From<std::num::ParseIntError> for OutboxError {
    fn from(err: std::num::ParseIntError) -> Self {
        OutboxError::Parse {
            reason: err.to_string(),
        }
    }
}

impl From<std::str::ParseBoolError> for OutboxError {
    fn from(err: std::str::ParseBoolError) -> Self {
        OutboxError::Parse {
            reason: err.to_string(),
        }
    }
}

impl From<chrono::ParseError> for OutboxError {
    fn from(err: chrono::ParseError) -> Self {
        OutboxError::Parse {
            reason: err.to_string(),
        }
    }
}

/// 拒绝空白参数（事件 ID、通道名等）
pub(crate) fn require_non_empty(name: &str, value: &str) -> OutboxResult<()> {
    if value.trim().is_empty() {
        return Err(OutboxError::validation(format!("{name} should not be empty")));
    }
    Ok(())
}
