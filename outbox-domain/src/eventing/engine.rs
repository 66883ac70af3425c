//! 补偿引擎（RetryEngine）
//!
//! 长驻任务，按固定间隔（或外部触发）对全部跟踪通道执行一轮补偿扫描：
//! - 通道间并发扫描，并发度受 `channel_concurrency` 限制；
//! - 单通道失败只记录日志，下一轮继续；
//! - 提供关闭、等待与手动触发的 `EngineHandle`。
//!
use super::broker::ChannelDiscovery;
use super::scanner::{ReconciliationScanner, ScanReport};
use crate::error::OutboxResult;
use bon::Builder;
use futures_util::{StreamExt, stream};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Builder)]
pub struct RetryEngine {
    scanner: Arc<ReconciliationScanner>,
    channels: Arc<dyn ChannelDiscovery>,
    #[builder(default = Duration::from_secs(10))]
    interval: Duration,
    #[builder(default = 4)]
    channel_concurrency: usize,
    #[builder(skip)]
    trigger: Arc<Notify>,
}

impl RetryEngine {
    /// 启动补偿循环，返回可用于关闭/等待/触发的句柄
    pub fn start(self: Arc<Self>) -> EngineHandle {
        let token = CancellationToken::new();
        let trigger = self.trigger.clone();
        let task = tokio::spawn(Self::run_loop(self, token.clone()));

        EngineHandle {
            token,
            trigger,
            task: Some(task),
        }
    }

    /// 请求尽快执行一轮扫描
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// 对当前全部跟踪通道执行一轮扫描
    pub async fn run_once(&self) -> Vec<OutboxResult<ScanReport>> {
        let channels = self.channels.list_tracked_channels();
        if channels.is_empty() {
            return Vec::new();
        }

        let scanner = self.scanner.clone();
        let results: Vec<OutboxResult<ScanReport>> = stream::iter(channels)
            .map(move |channel| {
                let scanner = scanner.clone();
                async move {
                    let result = scanner.scan_channel(&channel).await;
                    if let Err(e) = &result {
                        error!(channel = %channel, error = %e, "reconciliation scan failed");
                    }
                    result
                }
            })
            .buffer_unordered(self.channel_concurrency.max(1))
            .collect()
            .await;

        let resent: usize = results
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|r| r.resent)
            .sum();
        debug!(channels = results.len(), resent, "reconciliation cycle finished");
        results
    }

    async fn run_loop(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.trigger.notified() => {}
            }
            self.run_once().await;
        }
        debug!("retry engine stopped");
    }
}

/// 引擎运行句柄：用于优雅关闭、等待任务结束与手动触发
#[must_use = "dropping the handle stops the retry engine"]
pub struct EngineHandle {
    token: CancellationToken,
    trigger: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::codec::JsonCodec;
    use crate::domain_event::Message;
    use crate::eventing::{BrokerDispatcher, StaticChannels};
    use crate::persist::{EventRecordStore, InMemoryEventRecordStore};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDispatcher {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl BrokerDispatcher for CountingDispatcher {
        async fn send(&self, _channel: &str, _message: Message) -> anyhow::Result<()> {
            self.sent.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    async fn setup() -> (Arc<RetryEngine>, Arc<CountingDispatcher>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryEventRecordStore::builder().clock(clock.clone()).build());
        for (id, channel) in [("a-1", "orders"), ("a-2", "orders"), ("b-1", "payments")] {
            store.create(id, "{}", "{}", "Ping", channel).await.unwrap();
        }
        clock.advance(ChronoDuration::seconds(120));

        let dispatcher = Arc::new(CountingDispatcher::default());
        let scanner = Arc::new(
            ReconciliationScanner::builder()
                .store(store)
                .codec(Arc::new(JsonCodec::new().register_untyped("Ping")))
                .dispatcher(dispatcher.clone())
                .clock(clock)
                .build(),
        );
        let engine = Arc::new(
            RetryEngine::builder()
                .scanner(scanner)
                .channels(Arc::new(StaticChannels::new(["orders", "payments"])))
                .interval(Duration::from_secs(3600))
                .channel_concurrency(2)
                .build(),
        );
        (engine, dispatcher)
    }

    #[tokio::test]
    async fn run_once_scans_every_channel() {
        let (engine, dispatcher) = setup().await;
        let results = engine.run_once().await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(dispatcher.sent.load(Ordering::Relaxed), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn engine_runs_on_start_and_stops_on_shutdown() {
        let (engine, dispatcher) = setup().await;
        let handle = engine.start();

        // interval 的首个 tick 立即触发
        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            while dispatcher.sent.load(Ordering::Relaxed) < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        handle.trigger();
        handle.shutdown();
        handle.join().await;

        assert_eq!(dispatcher.sent.load(Ordering::Relaxed), 3);
    }
}
