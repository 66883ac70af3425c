use crate::error::AppError;
use outbox_domain::domain_event::{AckSignal, DeliveryOutcome};
use outbox_domain::eventing::{CallbackCorrelator, DeliveryTracker};
use std::sync::Arc;
use tracing::debug;

/// 把具体 broker 的原始回调信号归类为统一的 `AckSignal`，每种 broker 实现一次
pub trait BrokerAdapter: Send + Sync {
    type Signal: Send;

    /// 无法识别（或不属于 Outbox 的）信号返回 `None`
    fn classify(&self, signal: Self::Signal) -> Option<AckSignal>;
}

/// broker 异步答复的处理入口：推进记录状态并解析等待中的回调
#[derive(Clone)]
pub struct DeliveryAckHandler {
    tracker: Arc<DeliveryTracker>,
    correlator: CallbackCorrelator,
}

impl DeliveryAckHandler {
    pub fn new(tracker: Arc<DeliveryTracker>, correlator: CallbackCorrelator) -> Self {
        Self {
            tracker,
            correlator,
        }
    }

    pub async fn on_outcome(
        &self,
        event_id: &str,
        channel: &str,
        outcome: DeliveryOutcome,
    ) -> Result<(), AppError> {
        if event_id.trim().is_empty() || channel.trim().is_empty() {
            debug!(event_id = %event_id, channel = %channel, "ack without event id or channel ignored");
            return Ok(());
        }

        let marked = match &outcome {
            DeliveryOutcome::Confirmed => self.tracker.mark_as_produced(event_id, channel).await,
            DeliveryOutcome::Returned(_) | DeliveryOutcome::Declined(_) => {
                self.tracker.mark_as_returned(event_id, channel).await
            }
        };

        // 记录状态写入失败也要唤醒等待方
        match outcome {
            DeliveryOutcome::Confirmed => self.correlator.resolve_success(event_id),
            DeliveryOutcome::Returned(reason) | DeliveryOutcome::Declined(reason) => {
                self.correlator.resolve_failure(event_id, reason)
            }
        };

        marked?;
        Ok(())
    }

    pub async fn on_producer_confirm(&self, event_id: &str, channel: &str) -> Result<(), AppError> {
        self.on_outcome(event_id, channel, DeliveryOutcome::Confirmed)
            .await
    }

    pub async fn on_returned(
        &self,
        event_id: &str,
        channel: &str,
        reason: impl Into<String>,
    ) -> Result<(), AppError> {
        self.on_outcome(event_id, channel, DeliveryOutcome::Returned(reason.into()))
            .await
    }

    pub async fn on_ack(&self, ack: AckSignal) -> Result<(), AppError> {
        self.on_outcome(&ack.event_id, &ack.channel, ack.outcome)
            .await
    }

    /// 经由适配器处理原始信号；返回该信号是否被识别
    pub async fn on_signal<A>(&self, adapter: &A, signal: A::Signal) -> Result<bool, AppError>
    where
        A: BrokerAdapter,
    {
        match adapter.classify(signal) {
            Some(ack) => {
                self.on_ack(ack).await?;
                Ok(true)
            }
            None => {
                debug!("unrecognized broker signal ignored");
                Ok(false)
            }
        }
    }
}
