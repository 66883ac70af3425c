//! Outbox 应用层（outbox-application）
//!
//! 以显式的装饰器链把领域层组件接入发送与消费路径：
//! - `OutboxPublisher`：对跟踪通道先落库再发送，可选同步等待确认；
//! - `IdempotentConsumer`：按事件 ID 去重并在成功后标记消费；
//! - `DeliveryAckHandler`：把 broker 的异步确认/退回映射为状态迁移与回调解析；
//! - `OutboxRuntime`：按配置装配全部组件并启动补偿引擎。
//!
pub mod ack_handler;
pub mod bootstrap;
pub mod consumer;
pub mod error;
pub mod publisher;

pub use ack_handler::{BrokerAdapter, DeliveryAckHandler};
pub use bootstrap::OutboxRuntime;
pub use consumer::{ConsumeOutcome, IdempotentConsumer, MessageConsumer};
pub use error::AppError;
pub use publisher::{DispatcherPublisher, MessagePublisher, OutboxPublisher};
