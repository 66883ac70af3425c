//! Outbox 运行时装配
//!
//! 按 `OutboxConfig` 构建时钟、ID 生成器、记录存储、跟踪器、补偿扫描与引擎、回调关联器，
//! 并提供发送/消费/确认三条路径的装饰器入口。
//!
use crate::ack_handler::DeliveryAckHandler;
use crate::consumer::{IdempotentConsumer, MessageConsumer};
use crate::error::AppError;
use crate::publisher::{DispatcherPublisher, OutboxPublisher};
use bon::bon;
use outbox_domain::clock::{Clock, SystemClock};
use outbox_domain::codec::MessageCodec;
use outbox_domain::config::OutboxConfig;
use outbox_domain::eventing::{
    BrokerDispatcher, CallbackCorrelator, ChannelDiscovery, DeliveryTracker, EngineHandle,
    ReconciliationScanner, RetryEngine,
};
use outbox_domain::id_generator::{IdGenerator, SeededIdGenerator};
use outbox_domain::persist::{EventRecordStore, InMemoryEventRecordStore};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

pub struct OutboxRuntime {
    config: OutboxConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn EventRecordStore>,
    dispatcher: Arc<dyn BrokerDispatcher>,
    tracker: Arc<DeliveryTracker>,
    scanner: Arc<ReconciliationScanner>,
    engine: Arc<RetryEngine>,
    correlator: CallbackCorrelator,
}

#[bon]
impl OutboxRuntime {
    /// 未注入的存储/时钟/ID 生成器按配置使用默认实现
    #[builder]
    pub fn new(
        #[builder(default)] config: OutboxConfig,
        dispatcher: Arc<dyn BrokerDispatcher>,
        codec: Arc<dyn MessageCodec>,
        store: Option<Arc<dyn EventRecordStore>>,
        clock: Option<Arc<dyn Clock>>,
        id_generator: Option<Arc<dyn IdGenerator>>,
    ) -> Result<Self, AppError> {
        config.validate()?;

        let clock: Arc<dyn Clock> = match clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock::from_timezone(
                config.eventstore.timezone.as_deref(),
            )?),
        };
        let store: Arc<dyn EventRecordStore> = match store {
            Some(store) => store,
            None => Arc::new(
                InMemoryEventRecordStore::builder()
                    .clock(clock.clone())
                    .collection_prefix(config.eventstore.collection_prefix.clone())
                    .build(),
            ),
        };
        let id_generator: Arc<dyn IdGenerator> = match id_generator {
            Some(id_generator) => id_generator,
            None => Arc::new(SeededIdGenerator::new()),
        };

        let tracker = Arc::new(
            DeliveryTracker::builder()
                .store(store.clone())
                .codec(codec.clone())
                .id_generator(id_generator)
                .build(),
        );
        let scanner = Arc::new(
            ReconciliationScanner::builder()
                .store(store.clone())
                .codec(codec)
                .dispatcher(dispatcher.clone())
                .clock(clock.clone())
                .config(config.clone())
                .build(),
        );
        let engine = Arc::new(
            RetryEngine::builder()
                .scanner(scanner.clone())
                .channels(tracker.clone())
                .interval(config.scan_interval())
                .channel_concurrency(config.retry.channel_concurrency)
                .build(),
        );
        let correlator = CallbackCorrelator::new(config.callback_timeout());

        Ok(Self {
            config,
            clock,
            store,
            dispatcher,
            tracker,
            scanner,
            engine,
            correlator,
        })
    }
}

impl OutboxRuntime {
    /// 注册跟踪通道；`retry.autoStart` 开启时同时启动补偿引擎
    pub async fn start(
        &self,
        discovery: &dyn ChannelDiscovery,
    ) -> Result<Option<EngineHandle>, AppError> {
        let channels: BTreeSet<String> = self.tracker.register_channels(discovery).await?;
        info!(channels = ?channels, auto_start = self.config.retry.auto_start, "outbox started");

        if !self.config.retry.auto_start {
            return Ok(None);
        }
        Ok(Some(self.engine.clone().start()))
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn store(&self) -> &Arc<dyn EventRecordStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<DeliveryTracker> {
        &self.tracker
    }

    pub fn scanner(&self) -> &Arc<ReconciliationScanner> {
        &self.scanner
    }

    pub fn engine(&self) -> &Arc<RetryEngine> {
        &self.engine
    }

    pub fn correlator(&self) -> &CallbackCorrelator {
        &self.correlator
    }

    pub fn publisher(&self) -> OutboxPublisher<DispatcherPublisher> {
        OutboxPublisher::new(
            DispatcherPublisher::new(self.dispatcher.clone()),
            self.tracker.clone(),
            self.correlator.clone(),
        )
    }

    pub fn consumer<C>(&self, inner: C) -> IdempotentConsumer<C>
    where
        C: MessageConsumer,
    {
        IdempotentConsumer::new(
            inner,
            self.tracker.clone(),
            self.config.consumer.ignore_duplicate,
        )
    }

    pub fn ack_handler(&self) -> DeliveryAckHandler {
        DeliveryAckHandler::new(self.tracker.clone(), self.correlator.clone())
    }
}
