//! Outbox 领域层（outbox-domain）
//!
//! 实现“先落库、再发送、异步确认、超时补偿”的事务型 Outbox，
//! 在至少一次投递的 broker 之上配合消费端去重达到“实际效果恰好一次”：
//! - 事件记录与消息（`domain_event`）及其编解码（`codec`）
//! - 按通道分区的记录存储与重发事务会话（`persist`）
//! - 投递跟踪、补偿扫描与引擎、回调关联（`eventing`）
//! - 时钟（`clock`）、ID 生成（`id_generator`）与配置（`config`）
//!
//! 本 crate 与存储和传输实现解耦，只定义协议并提供内存实现，
//! 以便在不同基础设施（文档库、消息中间件等）上进行适配。
//!
//! 典型用法：
//! 1. 构建 `DeliveryTracker` 并注册需要跟踪的通道；
//! 2. 发送时调用 `record_and_dispatch`，确认到达后调用 `mark_as_*`；
//! 3. 用 `RetryEngine` 周期驱动 `ReconciliationScanner` 补偿重发；
//! 4. 需要同步确认时，用 `CallbackCorrelator` 等待 broker 的异步答复。
//!
pub mod clock;
pub mod codec;
pub mod config;
pub mod domain_event;
pub mod error;
pub mod eventing;
pub mod id_generator;
pub mod persist;
