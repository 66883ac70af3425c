use async_trait::async_trait;
use outbox_application::{
    AppError, BrokerAdapter, ConsumeOutcome, DeliveryAckHandler, IdempotentConsumer,
    MessageConsumer, MessagePublisher, OutboxRuntime,
};
use outbox_domain::clock::ManualClock;
use outbox_domain::codec::JsonCodec;
use outbox_domain::config::OutboxConfig;
use outbox_domain::domain_event::{AckSignal, DeliveryOutcome, Message};
use outbox_domain::error::OutboxError;
use outbox_domain::eventing::{BrokerDispatcher, StaticChannels};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const ORDERS: &str = "orders";

#[derive(Clone, Copy, PartialEq, Eq)]
enum Reply {
    Confirm,
    Return,
    Silent,
    Refuse,
}

/// 发送后异步回调确认处理器的测试 broker
struct LoopbackBroker {
    reply: Mutex<Reply>,
    acks: Mutex<Option<DeliveryAckHandler>>,
    sent: Mutex<Vec<(String, Message)>>,
}

impl LoopbackBroker {
    fn new(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            reply: Mutex::new(reply),
            acks: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn set_reply(&self, reply: Reply) {
        *self.reply.lock().unwrap() = reply;
    }

    fn sent(&self) -> Vec<(String, Message)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrokerDispatcher for LoopbackBroker {
    async fn send(&self, channel: &str, message: Message) -> anyhow::Result<()> {
        let reply = *self.reply.lock().unwrap();
        if reply == Reply::Refuse {
            anyhow::bail!("broker unavailable");
        }
        self.sent
            .lock()
            .unwrap()
            .push((channel.to_string(), message.clone()));

        let acks = self.acks.lock().unwrap().clone();
        if let (Some(acks), Some(event_id)) = (acks, message.event_id().map(str::to_string)) {
            let channel = channel.to_string();
            let outcome = match reply {
                Reply::Confirm => Some(DeliveryOutcome::Confirmed),
                Reply::Return => Some(DeliveryOutcome::Returned("NO_ROUTE".into())),
                _ => None,
            };
            if let Some(outcome) = outcome {
                tokio::spawn(async move {
                    let _ = acks.on_outcome(&event_id, &channel, outcome).await;
                });
            }
        }
        Ok(())
    }
}

async fn runtime(reply: Reply, config: OutboxConfig) -> (OutboxRuntime, Arc<LoopbackBroker>) {
    let broker = LoopbackBroker::new(reply);
    let runtime = OutboxRuntime::builder()
        .config(config)
        .dispatcher(broker.clone())
        .codec(Arc::new(JsonCodec::new().register_untyped("OrderPlaced")))
        .build()
        .unwrap();
    *broker.acks.lock().unwrap() = Some(runtime.ack_handler());

    let engine = runtime
        .start(&StaticChannels::new([ORDERS]))
        .await
        .unwrap();
    assert!(engine.is_none());
    (runtime, broker)
}

fn manual_config() -> OutboxConfig {
    let mut config = OutboxConfig::default();
    config.retry.auto_start = false;
    config
}

fn order(n: u32) -> Message {
    Message::new(json!({ "n": n }), "OrderPlaced")
}

#[tokio::test]
async fn tracked_channels_are_recorded_untracked_pass_through() {
    let (runtime, broker) = runtime(Reply::Silent, manual_config()).await;
    let publisher = runtime.publisher();

    publisher.publish(ORDERS, order(1)).await.unwrap();
    publisher.publish("audit", order(2)).await.unwrap();

    let records = runtime.store().find_all(ORDERS).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(runtime.store().find_all("audit").await.unwrap().is_empty());

    let sent = broker.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].1.event_id(), Some(records[0].id()));
    assert_eq!(sent[1].1.event_id(), None);
}

#[tokio::test]
async fn confirmed_publish_waits_for_producer_ack() {
    let (runtime, _broker) = runtime(Reply::Confirm, manual_config()).await;
    let source_key = ulid::Ulid::new().to_string();

    let event_id = runtime
        .publisher()
        .publish_confirmed(ORDERS, order(1), &source_key)
        .await
        .unwrap();

    let records = runtime.store().find_all(ORDERS).await.unwrap();
    assert_eq!(records[0].id(), event_id);
    assert!(records[0].producer_ack_on().is_some());
    assert_eq!(runtime.correlator().pending_count(), 0);
}

#[tokio::test]
async fn returned_publish_fails_and_marks_record() {
    let (runtime, _broker) = runtime(Reply::Return, manual_config()).await;

    let err = runtime
        .publisher()
        .publish_confirmed(ORDERS, order(1), "req-returned")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Outbox(OutboxError::DeliveryFailed { ref reason, .. }) if reason == "NO_ROUTE"
    ));

    let records = runtime.store().find_all(ORDERS).await.unwrap();
    assert!(records[0].returned_on().is_some());
}

#[tokio::test(start_paused = true)]
async fn silent_broker_times_out_the_waiter() {
    let mut config = manual_config();
    config.consumer.callback_timeout_millis = 250;
    let (runtime, _broker) = runtime(Reply::Silent, config).await;

    let err = runtime
        .publisher()
        .publish_confirmed(ORDERS, order(1), "req-silent")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Outbox(OutboxError::Timeout { waited_ms: 250, .. })
    ));
    assert_eq!(runtime.correlator().pending_count(), 0);
    // 记录仍在，等待补偿扫描
    assert_eq!(runtime.store().find_all(ORDERS).await.unwrap().len(), 1);
}

#[tokio::test]
async fn dispatch_failure_keeps_record_and_releases_waiter() {
    let (runtime, broker) = runtime(Reply::Refuse, manual_config()).await;

    let err = runtime
        .publisher()
        .publish_confirmed(ORDERS, order(1), "req-refused")
        .await
        .unwrap_err();
    assert!(err.is_pending_resend());
    assert_eq!(runtime.correlator().pending_count(), 0);
    assert_eq!(runtime.store().find_all(ORDERS).await.unwrap().len(), 1);

    // 同一个源键可以再次使用
    broker.set_reply(Reply::Confirm);
    runtime
        .publisher()
        .publish_confirmed(ORDERS, order(2), "req-refused")
        .await
        .unwrap();
}

#[tokio::test]
async fn confirmed_publish_rejects_untracked_channel() {
    let (runtime, _broker) = runtime(Reply::Confirm, manual_config()).await;
    let err = runtime
        .publisher()
        .publish_confirmed("audit", order(1), "req-x")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[derive(Default)]
struct CountingConsumer {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl MessageConsumer for CountingConsumer {
    async fn consume(&self, _message: &Message) -> anyhow::Result<()> {
        tokio::task::yield_now().await;
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("business rule violated");
        }
        Ok(())
    }
}

async fn delivered(runtime: &OutboxRuntime, broker: &LoopbackBroker) -> Message {
    runtime.publisher().publish(ORDERS, order(9)).await.unwrap();
    broker.sent().pop().unwrap().1
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_deliveries_run_business_logic_once() {
    let mut config = manual_config();
    config.consumer.ignore_duplicate = true;
    let (runtime, broker) = runtime(Reply::Silent, config).await;
    let message = delivered(&runtime, &broker).await;

    let consumer = Arc::new(runtime.consumer(CountingConsumer::default()));
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let consumer = consumer.clone();
        let message = message.clone();
        tasks.push(tokio::spawn(async move { consumer.handle(&message).await }));
    }

    let mut processed = 0;
    for task in tasks {
        match task.await.unwrap().unwrap() {
            ConsumeOutcome::Processed => processed += 1,
            ConsumeOutcome::Skipped => {}
            ConsumeOutcome::Untracked => panic!("message should be tracked"),
        }
    }

    assert_eq!(processed, 1);
    assert_eq!(consumer_inner_calls(&consumer), 1);
    assert_eq!(consumer.in_flight(), 0);

    let event_id = message.event_id().unwrap();
    assert!(runtime.tracker().has_been_consumed(event_id, ORDERS).await.unwrap());
}

fn consumer_inner_calls(consumer: &IdempotentConsumer<CountingConsumer>) -> usize {
    consumer.inner().calls.load(Ordering::SeqCst)
}

#[tokio::test]
async fn without_gate_every_delivery_runs_and_marks_consumed() {
    let (runtime, broker) = runtime(Reply::Silent, manual_config()).await;
    let message = delivered(&runtime, &broker).await;
    let consumer = runtime.consumer(CountingConsumer::default());

    assert_eq!(consumer.handle(&message).await.unwrap(), ConsumeOutcome::Processed);
    assert_eq!(consumer.handle(&message).await.unwrap(), ConsumeOutcome::Processed);
    assert_eq!(consumer_inner_calls(&consumer), 2);
    assert!(
        runtime
            .tracker()
            .has_been_consumed(message.event_id().unwrap(), ORDERS)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn failed_consumption_is_not_marked() {
    let mut config = manual_config();
    config.consumer.ignore_duplicate = true;
    let (runtime, broker) = runtime(Reply::Silent, config).await;
    let message = delivered(&runtime, &broker).await;

    let consumer = runtime.consumer(CountingConsumer {
        fail: true,
        ..Default::default()
    });
    let err = consumer.handle(&message).await.unwrap_err();
    assert!(matches!(err, AppError::Consumer(_)));
    assert!(
        !runtime
            .tracker()
            .has_been_consumed(message.event_id().unwrap(), ORDERS)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn untracked_messages_bypass_the_gate() {
    let mut config = manual_config();
    config.consumer.ignore_duplicate = true;
    let (runtime, _broker) = runtime(Reply::Silent, config).await;
    let consumer = runtime.consumer(CountingConsumer::default());

    let outcome = consumer.handle(&order(1)).await.unwrap();
    assert_eq!(outcome, ConsumeOutcome::Untracked);
    assert_eq!(consumer_inner_calls(&consumer), 1);
}

/// 以 `(delivery_tag, status)` 形式上报的 broker 回调
struct TagAdapter;

impl BrokerAdapter for TagAdapter {
    type Signal = (String, &'static str);

    fn classify(&self, (tag, status): Self::Signal) -> Option<AckSignal> {
        let (channel, event_id) = tag.split_once('/')?;
        let outcome = match status {
            "ack" => DeliveryOutcome::Confirmed,
            "nack" => DeliveryOutcome::Declined("nack".into()),
            _ => return None,
        };
        Some(AckSignal::new(event_id, channel, outcome))
    }
}

#[tokio::test]
async fn ack_handler_maps_signals_and_ignores_noise() {
    let (runtime, broker) = runtime(Reply::Silent, manual_config()).await;
    let message = delivered(&runtime, &broker).await;
    let event_id = message.event_id().unwrap().to_string();
    let acks = runtime.ack_handler();

    // 空 ID/通道与无法识别的信号都被忽略
    acks.on_producer_confirm("", ORDERS).await.unwrap();
    assert!(
        !acks
            .on_signal(&TagAdapter, ("garbage".to_string(), "ack"))
            .await
            .unwrap()
    );

    let tag = format!("{ORDERS}/{event_id}");
    assert!(acks.on_signal(&TagAdapter, (tag.clone(), "ack")).await.unwrap());
    let records = runtime.store().find_all(ORDERS).await.unwrap();
    assert!(records[0].producer_ack_on().is_some());
    assert!(records[0].returned_on().is_none());

    assert!(acks.on_signal(&TagAdapter, (tag, "nack")).await.unwrap());
    let records = runtime.store().find_all(ORDERS).await.unwrap();
    assert!(records[0].returned_on().is_some());

    // 未知事件只记录日志
    acks.on_returned("missing", ORDERS, "NO_ROUTE").await.unwrap();
}

#[tokio::test]
async fn lost_ack_is_recovered_by_the_engine() {
    let clock = Arc::new(ManualClock::starting_now());
    let broker = LoopbackBroker::new(Reply::Silent);
    let runtime = OutboxRuntime::builder()
        .config(manual_config())
        .dispatcher(broker.clone())
        .codec(Arc::new(JsonCodec::new().register_untyped("OrderPlaced")))
        .clock(clock.clone())
        .build()
        .unwrap();
    runtime
        .start(&StaticChannels::new([ORDERS]))
        .await
        .unwrap();

    runtime.publisher().publish(ORDERS, order(1)).await.unwrap();
    clock.advance(chrono::Duration::seconds(61));

    let reports = runtime.engine().run_once().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].as_ref().unwrap().resent, 1);

    let sent = broker.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].1.event_id(), sent[1].1.event_id());
    let records = runtime.store().find_all(ORDERS).await.unwrap();
    assert_eq!(records[0].attempt_count(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn auto_start_runs_the_engine_until_shutdown() {
    let clock = Arc::new(ManualClock::starting_now());
    let broker = LoopbackBroker::new(Reply::Silent);
    let runtime = OutboxRuntime::builder()
        .dispatcher(broker.clone())
        .codec(Arc::new(JsonCodec::new().register_untyped("OrderPlaced")))
        .clock(clock.clone())
        .build()
        .unwrap();
    assert!(runtime.config().retry.auto_start);

    let engine = runtime
        .start(&StaticChannels::new([ORDERS]))
        .await
        .unwrap()
        .expect("engine starts when autoStart is on");

    runtime.publisher().publish(ORDERS, order(1)).await.unwrap();
    clock.advance(chrono::Duration::seconds(61));
    engine.trigger();

    let resent = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while broker.sent().len() < 2 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(resent.is_ok(), "engine did not resend the expired event");

    engine.shutdown();
    engine.join().await;

    let sent = broker.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].1.event_id(), sent[1].1.event_id());
    let records = runtime.store().find_all(ORDERS).await.unwrap();
    assert_eq!(records[0].attempt_count(), 2);
}
