//! 内存版事件记录存储
//!
//! 每个通道一个分区（`{prefix}-{channel}`），所有分区置于同一把读写锁下，
//! 每次状态迁移在一个临界区内完成。重发会话记录撤销日志，
//! 中止或未提交即丢弃时回滚已认领的记录。
//!
use super::{EventRecordStore, ResendCriteria, ResendSession};
use crate::clock::{Clock, SystemClock};
use crate::domain_event::DomainEvent;
use crate::error::{OutboxError, OutboxResult, require_non_empty};
use async_trait::async_trait;
use bon::Builder;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

type Partition = HashMap<String, DomainEvent>;
type Partitions = Arc<RwLock<HashMap<String, Partition>>>;

fn default_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock::utc())
}

#[derive(Builder)]
pub struct InMemoryEventRecordStore {
    #[builder(default = default_clock())]
    clock: Arc<dyn Clock>,
    #[builder(into, default = "DefaultEventStore".to_string())]
    collection_prefix: String,
    #[builder(skip)]
    partitions: Partitions,
}

impl Default for InMemoryEventRecordStore {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn read(partitions: &Partitions) -> RwLockReadGuard<'_, HashMap<String, Partition>> {
    partitions.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write(partitions: &Partitions) -> RwLockWriteGuard<'_, HashMap<String, Partition>> {
    partitions.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryEventRecordStore {
    pub fn partition_name(&self, channel: &str) -> String {
        format!("{}-{}", self.collection_prefix, channel)
    }

    /// 已准备好的分区名（排序后）
    pub fn partition_names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.partitions).keys().cloned().collect();
        names.sort();
        names
    }

    /// 单条记录的原子查找并更新；记录不存在时返回 `None`
    fn update<F>(&self, id: &str, channel: &str, f: F) -> OutboxResult<Option<DomainEvent>>
    where
        F: FnOnce(&mut DomainEvent),
    {
        require_non_empty("id", id)?;
        require_non_empty("channel", channel)?;

        let name = self.partition_name(channel);
        let mut partitions = write(&self.partitions);
        let Some(event) = partitions.get_mut(&name).and_then(|p| p.get_mut(id)) else {
            return Ok(None);
        };
        f(event);
        Ok(Some(event.clone()))
    }
}

#[async_trait]
impl EventRecordStore for InMemoryEventRecordStore {
    async fn initialize(&self, channels: &[String]) -> OutboxResult<()> {
        for channel in channels {
            require_non_empty("channel", channel)?;
        }

        let mut partitions = write(&self.partitions);
        for channel in channels {
            let name = self.partition_name(channel);
            if !partitions.contains_key(&name) {
                debug!(partition = %name, "event store partition created");
                partitions.insert(name, Partition::new());
            }
        }
        Ok(())
    }

    async fn create(
        &self,
        id: &str,
        header: &str,
        payload: &str,
        payload_type: &str,
        channel: &str,
    ) -> OutboxResult<DomainEvent> {
        let event = DomainEvent::builder()
            .id(id)
            .channel(channel)
            .header(header)
            .payload(payload)
            .payload_type(payload_type)
            .written_on(self.clock.now())
            .build()?;

        let name = self.partition_name(channel);
        let mut partitions = write(&self.partitions);
        let partition = partitions.entry(name).or_default();
        if partition.contains_key(id) {
            return Err(OutboxError::DuplicateId {
                event_id: id.to_string(),
                channel: channel.to_string(),
            });
        }
        partition.insert(id.to_string(), event.clone());
        Ok(event)
    }

    async fn mark_returned(&self, id: &str, channel: &str) -> OutboxResult<Option<DomainEvent>> {
        let now = self.clock.now();
        self.update(id, channel, |event| {
            if !event.is_consumed() {
                event.set_returned_on(now);
            }
        })
    }

    async fn mark_produced(&self, id: &str, channel: &str) -> OutboxResult<Option<DomainEvent>> {
        let now = self.clock.now();
        self.update(id, channel, |event| {
            if !event.is_consumed() {
                event.set_producer_ack_on(now);
            }
        })
    }

    async fn mark_consumed(&self, id: &str, channel: &str) -> OutboxResult<Option<DomainEvent>> {
        let now = self.clock.now();
        self.update(id, channel, |event| event.set_consumer_ack_on(now))
    }

    async fn has_consumed_timestamp(&self, id: &str, channel: &str) -> OutboxResult<bool> {
        require_non_empty("id", id)?;
        require_non_empty("channel", channel)?;

        let partitions = read(&self.partitions);
        Ok(partitions
            .get(&self.partition_name(channel))
            .and_then(|p| p.get(id))
            .is_some_and(DomainEvent::is_consumed))
    }

    async fn begin_resend(&self, channel: &str) -> OutboxResult<Box<dyn ResendSession>> {
        require_non_empty("channel", channel)?;
        Ok(Box::new(InMemoryResendSession {
            partitions: self.partitions.clone(),
            partition: self.partition_name(channel),
            clock: self.clock.clone(),
            undo: Vec::new(),
            finished: false,
        }))
    }

    async fn delete_all(&self, channel: &str) -> OutboxResult<()> {
        let mut partitions = write(&self.partitions);
        if let Some(partition) = partitions.get_mut(&self.partition_name(channel)) {
            partition.clear();
        }
        Ok(())
    }

    async fn find_all(&self, channel: &str) -> OutboxResult<Vec<DomainEvent>> {
        let partitions = read(&self.partitions);
        let mut events: Vec<DomainEvent> = partitions
            .get(&self.partition_name(channel))
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default();
        events.sort_by(|a, b| {
            a.created_on()
                .cmp(&b.created_on())
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(events)
    }
}

struct InMemoryResendSession {
    partitions: Partitions,
    partition: String,
    clock: Arc<dyn Clock>,
    // (认领前, 认领后) 快照，用于回滚
    undo: Vec<(DomainEvent, DomainEvent)>,
    finished: bool,
}

impl InMemoryResendSession {
    fn rollback(&mut self) {
        if self.undo.is_empty() {
            return;
        }

        let mut partitions = write(&self.partitions);
        if let Some(partition) = partitions.get_mut(&self.partition) {
            for (previous, claimed) in self.undo.drain(..).rev() {
                if let Some(event) = partition.get_mut(previous.id()) {
                    event.restore_resend_state(&previous, &claimed);
                }
            }
        }
    }
}

#[async_trait]
impl ResendSession for InMemoryResendSession {
    async fn candidates(&mut self, criteria: &ResendCriteria) -> OutboxResult<Vec<DomainEvent>> {
        let partitions = read(&self.partitions);
        Ok(partitions
            .get(&self.partition)
            .map(|p| criteria.select(p.values()))
            .unwrap_or_default())
    }

    async fn claim(
        &mut self,
        id: &str,
        criteria: &ResendCriteria,
    ) -> OutboxResult<Option<DomainEvent>> {
        let now = self.clock.now();
        let mut partitions = write(&self.partitions);
        let Some(event) = partitions.get_mut(&self.partition).and_then(|p| p.get_mut(id)) else {
            return Ok(None);
        };
        if !criteria.matches(event) {
            return Ok(None);
        }

        let previous = event.clone();
        event.reset_for_resend(now);
        let claimed = event.clone();
        self.undo.push((previous, claimed.clone()));
        Ok(Some(claimed))
    }

    async fn commit(self: Box<Self>) -> OutboxResult<()> {
        let mut this = self;
        this.undo.clear();
        this.finished = true;
        Ok(())
    }

    async fn abort(self: Box<Self>) -> OutboxResult<()> {
        let mut this = self;
        this.rollback();
        this.finished = true;
        Ok(())
    }
}

impl Drop for InMemoryResendSession {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;

    fn store_with_clock() -> (InMemoryEventRecordStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = InMemoryEventRecordStore::builder()
            .clock(clock.clone())
            .collection_prefix("Test")
            .build();
        (store, clock)
    }

    async fn seed(store: &InMemoryEventRecordStore, id: &str) -> DomainEvent {
        store
            .create(id, "{}", r#"{"n":1}"#, "Ping", "orders")
            .await
            .unwrap()
    }

    fn criteria(clock: &ManualClock) -> ResendCriteria {
        ResendCriteria {
            written_before: clock.now() - Duration::seconds(60),
            producer_ack_before: None,
            limit: 100,
        }
    }

    #[tokio::test]
    async fn initialize_is_idempotent_and_uses_prefix() {
        let (store, _) = store_with_clock();
        let channels = vec!["orders".to_string(), "payments".to_string()];
        store.initialize(&channels).await.unwrap();
        seed(&store, "e-1").await;
        store.initialize(&channels).await.unwrap();

        assert_eq!(store.partition_names(), vec!["Test-orders", "Test-payments"]);
        assert_eq!(store.find_all("orders").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_rejects_duplicates_and_lazily_provisions() {
        let (store, _) = store_with_clock();
        let ev = seed(&store, "e-1").await;
        assert_eq!(ev.attempt_count(), 1);
        assert_eq!(store.partition_names(), vec!["Test-orders"]);

        let err = store
            .create("e-1", "{}", "{}", "Ping", "orders")
            .await
            .unwrap_err();
        assert!(matches!(err, OutboxError::DuplicateId { .. }));

        // 不同通道可复用同一 ID
        assert!(store.create("e-1", "{}", "{}", "Ping", "payments").await.is_ok());
    }

    #[tokio::test]
    async fn transitions_return_updated_record_or_none() {
        let (store, clock) = store_with_clock();
        seed(&store, "e-1").await;

        clock.advance(Duration::seconds(1));
        let produced = store.mark_produced("e-1", "orders").await.unwrap().unwrap();
        assert_eq!(produced.producer_ack_on(), Some(clock.now()));

        let returned = store.mark_returned("e-1", "orders").await.unwrap().unwrap();
        assert!(returned.returned_on().is_some());

        assert!(store.mark_produced("missing", "orders").await.unwrap().is_none());
        assert!(store.mark_consumed("e-1", "unknown").await.unwrap().is_none());
        assert!(store.mark_consumed("", "orders").await.is_err());
    }

    #[tokio::test]
    async fn marks_after_consumption_are_noops() {
        let (store, clock) = store_with_clock();
        seed(&store, "e-1").await;

        let consumed = store.mark_consumed("e-1", "orders").await.unwrap().unwrap();
        assert!(store.has_consumed_timestamp("e-1", "orders").await.unwrap());

        clock.advance(Duration::seconds(5));
        let after = store.mark_produced("e-1", "orders").await.unwrap().unwrap();
        assert_eq!(after, consumed);
        let after = store.mark_returned("e-1", "orders").await.unwrap().unwrap();
        assert_eq!(after, consumed);
    }

    #[tokio::test]
    async fn claim_resets_and_commit_keeps_it() {
        let (store, clock) = store_with_clock();
        let original = seed(&store, "e-1").await;
        clock.advance(Duration::seconds(61));

        let mut session = store.begin_resend("orders").await.unwrap();
        let criteria = criteria(&clock);
        let candidates = session.candidates(&criteria).await.unwrap();
        assert_eq!(candidates.len(), 1);

        let claimed = session.claim("e-1", &criteria).await.unwrap().unwrap();
        assert_eq!(claimed.attempt_count(), 2);
        assert_eq!(claimed.written_on(), clock.now());
        assert_eq!(claimed.created_on(), original.created_on());

        // 同一会话内再次认领不再满足条件
        assert!(session.claim("e-1", &criteria).await.unwrap().is_none());
        session.commit().await.unwrap();

        let stored = store.find_all("orders").await.unwrap();
        assert_eq!(stored[0].attempt_count(), 2);
    }

    #[tokio::test]
    async fn abort_and_drop_roll_back_claims() {
        let (store, clock) = store_with_clock();
        let original = seed(&store, "e-1").await;
        clock.advance(Duration::seconds(61));
        let criteria = criteria(&clock);

        let mut session = store.begin_resend("orders").await.unwrap();
        session.claim("e-1", &criteria).await.unwrap().unwrap();
        session.abort().await.unwrap();
        assert_eq!(store.find_all("orders").await.unwrap()[0], original);

        {
            let mut session = store.begin_resend("orders").await.unwrap();
            session.claim("e-1", &criteria).await.unwrap().unwrap();
        }
        assert_eq!(store.find_all("orders").await.unwrap()[0], original);
    }

    #[tokio::test]
    async fn rollback_keeps_acks_written_after_the_claim() {
        let (store, clock) = store_with_clock();
        let original = seed(&store, "e-1").await;
        seed(&store, "e-2").await;
        clock.advance(Duration::seconds(61));
        let criteria = criteria(&clock);

        let mut session = store.begin_resend("orders").await.unwrap();
        session.claim("e-1", &criteria).await.unwrap().unwrap();
        session.claim("e-2", &criteria).await.unwrap().unwrap();

        clock.advance(Duration::seconds(1));
        let acked = store.mark_produced("e-1", "orders").await.unwrap().unwrap();
        let returned = store.mark_returned("e-2", "orders").await.unwrap().unwrap();
        session.abort().await.unwrap();

        let stored = store.find_all("orders").await.unwrap();
        let e1 = stored.iter().find(|e| e.id() == "e-1").unwrap();
        assert_eq!(e1.producer_ack_on(), acked.producer_ack_on());
        assert_eq!(e1.attempt_count(), original.attempt_count());
        assert_eq!(e1.written_on(), original.written_on());

        let e2 = stored.iter().find(|e| e.id() == "e-2").unwrap();
        assert_eq!(e2.returned_on(), returned.returned_on());
        assert!(e2.producer_ack_on().is_none());
        assert_eq!(e2.attempt_count(), 1);
    }

    #[tokio::test]
    async fn initialize_rejects_blank_channel_before_provisioning() {
        let (store, _) = store_with_clock();
        let err = store
            .initialize(&["orders".to_string(), " ".to_string()])
            .await
            .unwrap_err();

        assert!(matches!(err, OutboxError::Validation { .. }));
        assert!(store.partition_names().is_empty());
    }

    #[tokio::test]
    async fn delete_all_clears_one_channel() {
        let (store, _) = store_with_clock();
        seed(&store, "e-1").await;
        store
            .create("e-2", "{}", "{}", "Ping", "payments")
            .await
            .unwrap();

        store.delete_all("orders").await.unwrap();
        assert!(store.find_all("orders").await.unwrap().is_empty());
        assert_eq!(store.find_all("payments").await.unwrap().len(), 1);
    }
}
