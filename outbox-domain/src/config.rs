//! Outbox 配置
//!
//! 既可通过 serde 从结构化配置（JSON 等）反序列化，也可从扁平的点分属性
//! （如 `retry.message.expired.seconds=60`）构建。未设置的项使用默认值。
//!
use crate::error::{OutboxError, OutboxResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// 点分属性可选的统一前缀
pub const PROPERTY_PREFIX: &str = "outbox.";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OutboxConfig {
    pub retry: RetryConfig,
    pub consumer: ConsumerConfig,
    pub eventstore: EventStoreConfig,
}

/// 补偿重发相关配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// 启动时是否自动运行补偿引擎
    pub auto_start: bool,
    /// 引擎扫描间隔（秒）
    pub interval_seconds: u64,
    /// 写入后超过该时长仍未确认的事件才可重发（秒）
    pub message_expired_seconds: u64,
    /// 每轮每通道最多重发的事件数
    pub message_batch_size: usize,
    /// 可重试事务失败的最大尝试次数
    pub transaction_max_attempts: u32,
    /// 每轮并发扫描的通道数
    pub channel_concurrency: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            auto_start: true,
            interval_seconds: 10,
            message_expired_seconds: 60,
            message_batch_size: 1000,
            transaction_max_attempts: 3,
            channel_concurrency: 4,
        }
    }
}

/// 消费端配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConsumerConfig {
    /// 开启消费端去重
    pub ignore_duplicate: bool,
    /// 生产者确认后仍未被消费的二次过期窗口（秒），0 表示关闭
    pub expired_time_in_sec: u64,
    /// 回调等待的默认超时（毫秒）
    pub callback_timeout_millis: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            ignore_duplicate: false,
            expired_time_in_sec: 0,
            callback_timeout_millis: 5000,
        }
    }
}

/// 事件存储配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventStoreConfig {
    pub collection_prefix: String,
    /// `UTC` 或 `+08:00` 形式的固定偏移；为空时使用 UTC
    pub timezone: Option<String>,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            collection_prefix: "DefaultEventStore".to_string(),
            timezone: None,
        }
    }
}

impl OutboxConfig {
    /// 从点分属性构建配置，键可带 `outbox.` 前缀，未知键忽略
    pub fn from_properties<I, K, V>(properties: I) -> OutboxResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in properties {
            let key = key.as_ref().trim();
            let key = key.strip_prefix(PROPERTY_PREFIX).unwrap_or(key);
            let value = value.as_ref().trim();

            match key {
                "retry.autoStart" => config.retry.auto_start = value.parse()?,
                "retry.interval.seconds" => config.retry.interval_seconds = value.parse()?,
                "retry.message.expired.seconds" => {
                    config.retry.message_expired_seconds = value.parse()?
                }
                "retry.message.batchSize" => config.retry.message_batch_size = value.parse()?,
                "retry.transaction.maxAttempts" => {
                    config.retry.transaction_max_attempts = value.parse()?
                }
                "retry.channelConcurrency" => config.retry.channel_concurrency = value.parse()?,
                "consumer.ignoreDuplicate" => config.consumer.ignore_duplicate = value.parse()?,
                "consumer.expiredTimeInSec" => {
                    config.consumer.expired_time_in_sec = value.parse()?
                }
                "consumer.callbackTimeoutMillis" => {
                    config.consumer.callback_timeout_millis = value.parse()?
                }
                "eventstore.collectionPrefix" => {
                    config.eventstore.collection_prefix = value.to_string()
                }
                "eventstore.timezone" => {
                    config.eventstore.timezone = (!value.is_empty()).then(|| value.to_string())
                }
                other => debug!(key = %other, "ignoring unknown outbox property"),
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> OutboxResult<()> {
        let invalid = |reason: &str| -> OutboxResult<()> {
            Err(OutboxError::Config {
                reason: reason.to_string(),
            })
        };

        if self.retry.interval_seconds == 0 {
            return invalid("retry.interval.seconds must be greater than 0");
        }
        if self.retry.message_batch_size == 0 {
            return invalid("retry.message.batchSize must be greater than 0");
        }
        if self.retry.transaction_max_attempts == 0 {
            return invalid("retry.transaction.maxAttempts must be greater than 0");
        }
        if self.retry.channel_concurrency == 0 {
            return invalid("retry.channelConcurrency must be greater than 0");
        }
        if self.consumer.callback_timeout_millis == 0 {
            return invalid("consumer.callbackTimeoutMillis must be greater than 0");
        }
        if self.eventstore.collection_prefix.trim().is_empty() {
            return invalid("eventstore.collectionPrefix must not be empty");
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.retry.interval_seconds)
    }

    pub fn message_expiry(&self) -> chrono::Duration {
        chrono::Duration::seconds(saturating_i64(self.retry.message_expired_seconds))
    }

    /// 二次过期窗口；未配置时为 `None`
    pub fn consumer_expiry(&self) -> Option<chrono::Duration> {
        (self.consumer.expired_time_in_sec > 0)
            .then(|| chrono::Duration::seconds(saturating_i64(self.consumer.expired_time_in_sec)))
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer.callback_timeout_millis)
    }
}

fn saturating_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000)
}
