//! 投递子系统（eventing）
//!
//! 围绕 Outbox 记录的运行时组件：
//! - `DeliveryTracker`：发送前落库与各类确认的状态迁移；
//! - `ReconciliationScanner`：按通道补偿重发超时未确认的事件；
//! - `RetryEngine`：周期驱动补偿扫描的长驻任务；
//! - `CallbackCorrelator`：把异步确认关联回同步等待的发送方；
//! - `BrokerDispatcher`/`ChannelDiscovery`：与具体 broker 的接缝。
//!
//! 该模块不绑定具体传输实现，可对接任意消息系统或内存实现。
//!
pub mod broker;
pub mod correlator;
pub mod engine;
pub mod scanner;
pub mod tracker;

pub use broker::{BrokerDispatcher, ChannelDiscovery, StaticChannels};
pub use correlator::{CallbackCorrelator, PendingHandle, Resolution};
pub use engine::{EngineHandle, RetryEngine};
pub use scanner::{ReconciliationScanner, ScanReport};
pub use tracker::DeliveryTracker;
