//! 持久化（persist）
//!
//! 定义事件记录存储协议与内存实现：
//! - 记录创建与单条原子状态迁移（`EventRecordStore`）；
//! - 补偿扫描的事务会话（`ResendSession`）与候选筛选条件（`ResendCriteria`）；
//! - 基于读写锁的内存后端（`InMemoryEventRecordStore`）。
//!
//! 具体的持久化后端（文档库、关系库等）由上层实现协议后注入。
//!
mod event_record_store;
mod inmemory_store;

pub use event_record_store::{EventRecordStore, ResendCriteria, ResendSession};
pub use inmemory_store::InMemoryEventRecordStore;
