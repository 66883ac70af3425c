//! 补偿扫描（ReconciliationScanner）
//!
//! 每个通道一轮扫描对应一次事务会话：
//! 1. 以 `now - 过期时长` 为截止时间筛选候选（按写入时间倒序，截断到批量上限）；
//! 2. 逐条原子认领，认领成功才重建消息并重发；
//! 3. 单条失败记录日志后跳过，事务失败则中止本轮并向上返回。
//!
//! 同一通道的扫描是单飞的：并发进入的扫描立即返回 `busy` 报告。
//!
use super::broker::BrokerDispatcher;
use crate::clock::{Clock, Timestamp};
use crate::codec::MessageCodec;
use crate::config::OutboxConfig;
use crate::domain_event::{DomainEvent, Message};
use crate::error::{OutboxError, OutboxResult, require_non_empty};
use crate::persist::{EventRecordStore, ResendCriteria, ResendSession};
use bon::Builder;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// 单通道单轮扫描的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub channel: String,
    pub candidates: usize,
    pub resent: usize,
    pub failed: usize,
    /// 认领时条件已不成立（被并发确认/消费）的候选数
    pub lost_races: usize,
    /// 同通道已有扫描在进行，本次未执行
    pub busy: bool,
}

impl ScanReport {
    fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            ..Default::default()
        }
    }

    fn busy(channel: &str) -> Self {
        Self {
            busy: true,
            ..Self::new(channel)
        }
    }
}

enum CandidateOutcome {
    Resent,
    LostRace,
}

#[derive(Builder)]
pub struct ReconciliationScanner {
    store: Arc<dyn EventRecordStore>,
    codec: Arc<dyn MessageCodec>,
    dispatcher: Arc<dyn BrokerDispatcher>,
    clock: Arc<dyn Clock>,
    #[builder(default)]
    config: OutboxConfig,
    #[builder(skip)]
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl ReconciliationScanner {
    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// 当前时刻对应的候选筛选条件
    pub fn criteria(&self) -> OutboxResult<ResendCriteria> {
        let now = self.clock.now();
        let written_before = cutoff(now, self.config.message_expiry())?;
        let producer_ack_before = self
            .config
            .consumer_expiry()
            .map(|expiry| cutoff(now, expiry))
            .transpose()?;

        Ok(ResendCriteria {
            written_before,
            producer_ack_before,
            limit: self.config.retry.message_batch_size,
        })
    }

    pub async fn scan_channel(&self, channel: &str) -> OutboxResult<ScanReport> {
        require_non_empty("channel", channel)?;

        let gate = self
            .in_flight
            .entry(channel.to_string())
            .or_default()
            .value()
            .clone();
        let Ok(_guard) = gate.try_lock() else {
            debug!(channel = %channel, "scan already running, skipped");
            return Ok(ScanReport::busy(channel));
        };

        let max_attempts = self.config.retry.transaction_max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let criteria = self.criteria()?;
            match self.resend_batch(channel, &criteria).await {
                Ok(report) => {
                    debug!(
                        channel = %channel,
                        candidates = report.candidates,
                        resent = report.resent,
                        failed = report.failed,
                        lost_races = report.lost_races,
                        "scan finished"
                    );
                    return Ok(report);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(channel = %channel, attempt, error = %e, "retryable transaction failure");
                }
                Err(e) => {
                    error!(channel = %channel, attempt, error = %e, "scan transaction failed");
                    return Err(e);
                }
            }
        }
    }

    async fn resend_batch(
        &self,
        channel: &str,
        criteria: &ResendCriteria,
    ) -> OutboxResult<ScanReport> {
        let mut session = self.store.begin_resend(channel).await?;
        let mut report = ScanReport::new(channel);

        let candidates = match session.candidates(criteria).await {
            Ok(candidates) => candidates,
            Err(e) => return Err(abort(session, e).await),
        };
        report.candidates = candidates.len();

        for candidate in &candidates {
            let outcome = self
                .resend_one(session.as_mut(), channel, candidate, criteria)
                .await;
            match outcome {
                Ok(CandidateOutcome::Resent) => report.resent += 1,
                Ok(CandidateOutcome::LostRace) => report.lost_races += 1,
                Err(e @ OutboxError::Transaction { .. }) => return Err(abort(session, e).await),
                Err(e) => {
                    warn!(
                        event_id = %candidate.id(),
                        channel = %channel,
                        error = %e,
                        "resend failed, skipping event"
                    );
                    report.failed += 1;
                }
            }
        }

        session.commit().await?;
        Ok(report)
    }

    async fn resend_one(
        &self,
        session: &mut dyn ResendSession,
        channel: &str,
        candidate: &DomainEvent,
        criteria: &ResendCriteria,
    ) -> OutboxResult<CandidateOutcome> {
        let Some(claimed) = session.claim(candidate.id(), criteria).await? else {
            debug!(event_id = %candidate.id(), channel = %channel, "claim lost, event skipped");
            return Ok(CandidateOutcome::LostRace);
        };

        let message = Message::from_record(&claimed, self.codec.as_ref())?;
        self.dispatcher
            .send(channel, message)
            .await
            .map_err(|e| OutboxError::Dispatch {
                event_id: claimed.id().to_string(),
                reason: format!("{e:#}"),
            })?;

        debug!(
            event_id = %claimed.id(),
            channel = %channel,
            attempt = claimed.attempt_count(),
            "event resent"
        );
        Ok(CandidateOutcome::Resent)
    }
}

fn cutoff(now: Timestamp, window: chrono::Duration) -> OutboxResult<Timestamp> {
    now.checked_sub_signed(window).ok_or_else(|| OutboxError::Config {
        reason: format!("expiry window out of range: {window}"),
    })
}

async fn abort(session: Box<dyn ResendSession>, cause: OutboxError) -> OutboxError {
    if let Err(e) = session.abort().await {
        warn!(error = %e, "failed to abort resend session");
    }
    cause
}
