//! broker 接缝
//!
//! `BrokerDispatcher` 负责把消息真正发往 broker；
//! `ChannelDiscovery` 列出需要被跟踪的输出通道。
//!
use crate::domain_event::Message;
use async_trait::async_trait;
use std::collections::BTreeSet;

/// 消息发送器：向指定通道发送一条消息（可能失败）
#[async_trait]
pub trait BrokerDispatcher: Send + Sync {
    async fn send(&self, channel: &str, message: Message) -> anyhow::Result<()>;
}

/// 跟踪通道发现
pub trait ChannelDiscovery: Send + Sync {
    fn list_tracked_channels(&self) -> BTreeSet<String>;
}

/// 固定列表的通道发现
#[derive(Debug, Clone, Default)]
pub struct StaticChannels(BTreeSet<String>);

impl StaticChannels {
    pub fn new<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(channels.into_iter().map(Into::into).collect())
    }
}

impl ChannelDiscovery for StaticChannels {
    fn list_tracked_channels(&self) -> BTreeSet<String> {
        self.0.clone()
    }
}
