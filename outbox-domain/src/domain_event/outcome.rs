use serde::{Deserialize, Serialize};

/// broker 对一次发送的异步答复
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryOutcome {
    /// broker 已确认接收
    Confirmed,
    /// 已到达 broker 但无法路由，被退回
    Returned(String),
    /// broker 拒收（未到达交换机/分区）
    Declined(String),
}

impl DeliveryOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Confirmed => None,
            Self::Returned(reason) | Self::Declined(reason) => Some(reason),
        }
    }
}

/// 带有目标记录定位信息的答复信号
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckSignal {
    pub event_id: String,
    pub channel: String,
    pub outcome: DeliveryOutcome,
}

impl AckSignal {
    pub fn new(
        event_id: impl Into<String>,
        channel: impl Into<String>,
        outcome: DeliveryOutcome,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            channel: channel.into(),
            outcome,
        }
    }
}
