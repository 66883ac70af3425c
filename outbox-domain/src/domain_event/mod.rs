//! 事件记录与消息（domain_event）
//!
//! 定义 Outbox 的持久化单元 `DomainEvent`、在进程与 broker 间流转的 `Message`，
//! 以及 broker 异步答复的 `DeliveryOutcome`。

mod message;
mod outcome;
mod record;

pub use message::{CHANNEL_HEADER, EVENT_ID_HEADER, Headers, Message, Payload};
pub use outcome::{AckSignal, DeliveryOutcome};
pub use record::DomainEvent;
