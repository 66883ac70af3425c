use async_trait::async_trait;
use outbox_application::{DeliveryAckHandler, MessageConsumer, MessagePublisher, OutboxRuntime};
use outbox_domain::clock::ManualClock;
use outbox_domain::codec::JsonCodec;
use outbox_domain::config::OutboxConfig;
use outbox_domain::domain_event::{DeliveryOutcome, Message, Payload};
use outbox_domain::eventing::{BrokerDispatcher, StaticChannels};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const ORDERS: &str = "orders";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: String,
    amount: i64,
}

impl Payload for OrderPlaced {
    const TYPE: &'static str = "OrderPlaced";
}

/// broker 行为，用于演示各类故障
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Mode {
    Healthy = 0,
    /// 消息丢失：既不投递也不确认
    LoseMessage = 1,
    /// 重复投递给消费端
    Duplicate = 2,
}

/// 进程内模拟 broker：投递给消费端并异步回调确认
struct InMemoryBroker {
    mode: AtomicU8,
    acks: OnceLock<DeliveryAckHandler>,
    deliveries: mpsc::UnboundedSender<Message>,
}

impl InMemoryBroker {
    fn set_mode(&self, mode: Mode) {
        self.mode.store(mode as u8, Ordering::SeqCst);
    }

    fn mode(&self) -> Mode {
        match self.mode.load(Ordering::SeqCst) {
            1 => Mode::LoseMessage,
            2 => Mode::Duplicate,
            _ => Mode::Healthy,
        }
    }
}

#[async_trait]
impl BrokerDispatcher for InMemoryBroker {
    async fn send(&self, channel: &str, message: Message) -> anyhow::Result<()> {
        let mode = self.mode();
        if mode == Mode::LoseMessage {
            info!(%channel, "broker dropped message");
            return Ok(());
        }

        self.deliveries.send(message.clone())?;
        if mode == Mode::Duplicate {
            self.deliveries.send(message.clone())?;
        }

        if let (Some(acks), Some(event_id)) = (self.acks.get().cloned(), message.event_id()) {
            let event_id = event_id.to_string();
            let channel = channel.to_string();
            tokio::spawn(async move {
                if let Err(e) = acks
                    .on_outcome(&event_id, &channel, DeliveryOutcome::Confirmed)
                    .await
                {
                    tracing::warn!(error = %e, "ack handling failed");
                }
            });
        }
        Ok(())
    }
}

struct ShippingService;

#[async_trait]
impl MessageConsumer for ShippingService {
    async fn consume(&self, message: &Message) -> anyhow::Result<()> {
        let order: OrderPlaced = message.decode()?;
        info!(order_id = %order.order_id, amount = order.amount, "shipping order");
        Ok(())
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,outbox_domain=debug")),
        )
        .init();

    let config = OutboxConfig::from_properties([
        ("outbox.retry.autoStart", "false"),
        ("outbox.retry.message.expired.seconds", "60"),
        ("outbox.consumer.ignoreDuplicate", "true"),
        ("outbox.eventstore.collectionPrefix", "DemoStore"),
    ])?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let broker = Arc::new(InMemoryBroker {
        mode: AtomicU8::new(Mode::Healthy as u8),
        acks: OnceLock::new(),
        deliveries: tx,
    });
    let clock = Arc::new(ManualClock::starting_now());

    let runtime = OutboxRuntime::builder()
        .config(config)
        .dispatcher(broker.clone())
        .codec(Arc::new(JsonCodec::new().register::<OrderPlaced>()))
        .clock(clock.clone())
        .build()?;
    let _ = broker.acks.set(runtime.ack_handler());
    // autoStart 关闭，由下方手动执行补偿扫描
    let _engine = runtime.start(&StaticChannels::new([ORDERS])).await?;

    let consumer = Arc::new(runtime.consumer(ShippingService));
    let consumer_task = {
        let consumer = consumer.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match consumer.handle(&message).await {
                    Ok(outcome) => info!(event_id = ?message.event_id(), ?outcome, "delivery handled"),
                    Err(e) => tracing::warn!(error = %e, "delivery failed"),
                }
            }
        })
    };

    let publisher = runtime.publisher();
    let order = |id: &str, amount| {
        Message::from_payload(&OrderPlaced {
            order_id: id.to_string(),
            amount,
        })
    };

    // 1. 正常发送并同步等待确认
    let event_id = publisher
        .publish_confirmed(ORDERS, order("A-1", 100)?, "checkout-A-1")
        .await?;
    info!(%event_id, "order A-1 confirmed");
    settle().await;

    // 2. 重复投递：消费端只处理一次
    broker.set_mode(Mode::Duplicate);
    publisher
        .publish_confirmed(ORDERS, order("B-2", 250)?, "checkout-B-2")
        .await?;
    settle().await;

    // 3. 消息丢失：超过过期时间后由补偿扫描重发
    broker.set_mode(Mode::LoseMessage);
    publisher.publish(ORDERS, order("C-3", 75)?).await?;
    broker.set_mode(Mode::Healthy);

    clock.advance(chrono::Duration::seconds(61));
    for report in runtime.engine().run_once().await {
        let report = report?;
        info!(
            channel = %report.channel,
            candidates = report.candidates,
            resent = report.resent,
            "reconciliation finished"
        );
    }
    settle().await;

    for record in runtime.store().find_all(ORDERS).await? {
        info!(
            event_id = %record.id(),
            attempts = record.attempt_count(),
            produced = record.producer_ack_on().is_some(),
            consumed = record.is_consumed(),
            "outbox record"
        );
    }

    consumer_task.abort();
    Ok(())
}
