//! In-process backends.
//!
//! Each backend guards its state with one async mutex, so every conditional
//! write is evaluated and applied under the same lock. That is the same
//! atomicity a conditional-write store gives per item, just coarser.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use pyrolysis_contracts::collaborators::{ArtifactStore, CollaboratorFailure};
use pyrolysis_contracts::queue::{
    BatchSendFailure, BatchSendReport, QueueError, TileQueue,
};
use pyrolysis_contracts::store::{
    ConditionalWrite, RunCondition, RunStore, RunUpdate, StoreError,
    TileJobCondition, TileJobStore, TileJobUpdate,
};
use pyrolysis_model::{
    ArtifactRef, Run, RunId, TileId, TileJob, TileJobKey, TileJobMessage,
};

use crate::clock::Clock;

/// Run and tile job tables held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecordStore {
    tile_jobs: Arc<Mutex<BTreeMap<TileJobKey, TileJob>>>,
    runs: Arc<Mutex<HashMap<RunId, Run>>>,
    unavailable: Arc<Mutex<bool>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with `StoreError::Unavailable` until reset.
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().await = unavailable;
    }

    async fn check_available(&self) -> Result<(), StoreError> {
        if *self.unavailable.lock().await {
            return Err(StoreError::Unavailable(
                "in-memory store switched off".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TileJobStore for InMemoryRecordStore {
    async fn get_tile_job(
        &self,
        key: &TileJobKey,
    ) -> Result<Option<TileJob>, StoreError> {
        self.check_available().await?;
        Ok(self.tile_jobs.lock().await.get(key).cloned())
    }

    async fn put_tile_job(
        &self,
        job: TileJob,
        condition: TileJobCondition,
    ) -> Result<ConditionalWrite<TileJob>, StoreError> {
        self.check_available().await?;
        let mut jobs = self.tile_jobs.lock().await;
        let key = job.key();
        let current = jobs.get(&key);
        if !condition.evaluate(current) {
            return Ok(ConditionalWrite::Rejected(current.cloned()));
        }
        jobs.insert(key, job.clone());
        Ok(ConditionalWrite::Applied(job))
    }

    async fn update_tile_job(
        &self,
        key: &TileJobKey,
        update: TileJobUpdate,
        condition: TileJobCondition,
    ) -> Result<ConditionalWrite<TileJob>, StoreError> {
        self.check_available().await?;
        let mut jobs = self.tile_jobs.lock().await;
        let Some(current) = jobs.get_mut(key) else {
            return Ok(ConditionalWrite::Rejected(None));
        };
        if !condition.evaluate(Some(current)) {
            return Ok(ConditionalWrite::Rejected(Some(current.clone())));
        }
        update.apply(current);
        Ok(ConditionalWrite::Applied(current.clone()))
    }

    async fn list_tile_jobs(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<TileJob>, StoreError> {
        self.check_available().await?;
        Ok(self
            .tile_jobs
            .lock()
            .await
            .values()
            .filter(|job| &job.run_id == run_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RunStore for InMemoryRecordStore {
    async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, StoreError> {
        self.check_available().await?;
        Ok(self.runs.lock().await.get(run_id).cloned())
    }

    async fn put_run(
        &self,
        run: Run,
        condition: RunCondition,
    ) -> Result<ConditionalWrite<Run>, StoreError> {
        self.check_available().await?;
        let mut runs = self.runs.lock().await;
        let current = runs.get(&run.run_id);
        if !condition.evaluate(current) {
            return Ok(ConditionalWrite::Rejected(current.cloned()));
        }
        runs.insert(run.run_id.clone(), run.clone());
        Ok(ConditionalWrite::Applied(run))
    }

    async fn update_run(
        &self,
        run_id: &RunId,
        update: RunUpdate,
        condition: RunCondition,
    ) -> Result<ConditionalWrite<Run>, StoreError> {
        self.check_available().await?;
        let mut runs = self.runs.lock().await;
        let Some(current) = runs.get_mut(run_id) else {
            return Ok(ConditionalWrite::Rejected(None));
        };
        if !condition.evaluate(Some(current)) {
            return Ok(ConditionalWrite::Rejected(Some(current.clone())));
        }
        update.apply(current);
        Ok(ConditionalWrite::Applied(current.clone()))
    }
}

/// A message handed to a consumer, invisible to others until acked or its
/// visibility timeout lapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub receipt: u64,
    pub body: String,
    /// Deliveries so far, including this one.
    pub receive_count: u32,
}

#[derive(Debug, Clone)]
struct Envelope {
    body: String,
    visible_at: DateTime<Utc>,
    receive_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Envelope>,
    in_flight: HashMap<u64, Envelope>,
    next_receipt: u64,
    fail_next_sends: usize,
    rejected_tiles: HashSet<TileId>,
    sent_total: u64,
}

impl QueueState {
    /// Returns lapsed in-flight messages to the ready set.
    fn reclaim_lapsed(&mut self, now: DateTime<Utc>) {
        let lapsed: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, envelope)| envelope.visible_at <= now)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in lapsed {
            if let Some(envelope) = self.in_flight.remove(&receipt) {
                self.ready.push_back(envelope);
            }
        }
    }
}

/// At-least-once queue with delayed delivery and visibility timeouts.
#[derive(Debug, Clone)]
pub struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            clock,
        }
    }

    /// The next `count` send calls fail as if the queue were down.
    pub async fn fail_next_sends(&self, count: usize) {
        self.state.lock().await.fail_next_sends = count;
    }

    /// Batch entries for this tile are refused as malformed.
    pub async fn reject_tile(&self, tile_id: TileId) {
        self.state.lock().await.rejected_tiles.insert(tile_id);
    }

    /// Pushes a raw body, bypassing encoding. Lets tests deliver garbage.
    pub async fn push_raw(&self, body: impl Into<String>) {
        let now = self.clock.now();
        self.state.lock().await.ready.push_back(Envelope {
            body: body.into(),
            visible_at: now,
            receive_count: 0,
        });
    }

    pub async fn receive(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Vec<ReceivedMessage> {
        let now = self.clock.now();
        let hidden_until = now
            + chrono::Duration::from_std(visibility_timeout)
                .unwrap_or(chrono::Duration::zero());
        let mut state = self.state.lock().await;
        state.reclaim_lapsed(now);

        let mut received = Vec::new();
        let mut deferred = VecDeque::new();
        while received.len() < max {
            let Some(mut envelope) = state.ready.pop_front() else {
                break;
            };
            if envelope.visible_at > now {
                deferred.push_back(envelope);
                continue;
            }
            envelope.receive_count += 1;
            envelope.visible_at = hidden_until;
            state.next_receipt += 1;
            let receipt = state.next_receipt;
            received.push(ReceivedMessage {
                receipt,
                body: envelope.body.clone(),
                receive_count: envelope.receive_count,
            });
            state.in_flight.insert(receipt, envelope);
        }
        deferred.append(&mut state.ready);
        state.ready = deferred;
        received
    }

    /// Deletes an in-flight message. Returns `false` for stale receipts.
    pub async fn ack(&self, receipt: u64) -> bool {
        self.state.lock().await.in_flight.remove(&receipt).is_some()
    }

    /// Messages not yet deleted, visible or not.
    pub async fn outstanding(&self) -> usize {
        let state = self.state.lock().await;
        state.ready.len() + state.in_flight.len()
    }

    pub async fn sent_total(&self) -> u64 {
        self.state.lock().await.sent_total
    }

    /// Earliest instant any outstanding message becomes deliverable.
    pub async fn next_visible_at(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().await;
        state
            .ready
            .iter()
            .chain(state.in_flight.values())
            .map(|envelope| envelope.visible_at)
            .min()
    }

    fn encode(message: &TileJobMessage) -> Result<String, QueueError> {
        message
            .to_json()
            .map_err(|e| QueueError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl TileQueue for InMemoryQueue {
    async fn send_message(
        &self,
        message: &TileJobMessage,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let body = Self::encode(message)?;
        let now = self.clock.now();
        let visible_at = now
            + chrono::Duration::from_std(delay)
                .map_err(|e| QueueError::Rejected(e.to_string()))?;
        let mut state = self.state.lock().await;
        if state.fail_next_sends > 0 {
            state.fail_next_sends -= 1;
            return Err(QueueError::Unavailable("injected send failure".into()));
        }
        if state.rejected_tiles.contains(&message.tile_id) {
            return Err(QueueError::Rejected(format!(
                "message for tile {} refused",
                message.tile_id
            )));
        }
        state.ready.push_back(Envelope {
            body,
            visible_at,
            receive_count: 0,
        });
        state.sent_total += 1;
        Ok(())
    }

    async fn send_message_batch(
        &self,
        messages: &[TileJobMessage],
    ) -> Result<BatchSendReport, QueueError> {
        if messages.len() > self.max_batch_size() {
            return Err(QueueError::Rejected(format!(
                "batch of {} exceeds the limit of {}",
                messages.len(),
                self.max_batch_size()
            )));
        }
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if state.fail_next_sends > 0 {
            state.fail_next_sends -= 1;
            return Err(QueueError::Unavailable("injected send failure".into()));
        }

        let mut report = BatchSendReport::default();
        for message in messages {
            if state.rejected_tiles.contains(&message.tile_id) {
                report.failures.push(BatchSendFailure {
                    tile_id: message.tile_id.clone(),
                    sender_fault: true,
                    reason: "message refused by queue".into(),
                });
                continue;
            }
            match Self::encode(message) {
                Ok(body) => {
                    state.ready.push_back(Envelope {
                        body,
                        visible_at: now,
                        receive_count: 0,
                    });
                    state.sent_total += 1;
                    report.sent += 1;
                }
                Err(err) => report.failures.push(BatchSendFailure {
                    tile_id: message.tile_id.clone(),
                    sender_fault: true,
                    reason: err.to_string(),
                }),
            }
        }
        Ok(report)
    }
}

/// Artifact bucket held in memory.
#[derive(Debug, Clone)]
pub struct InMemoryArtifactStore {
    bucket: String,
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemoryArtifactStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.lock().await.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
    ) -> Result<ArtifactRef, CollaboratorFailure> {
        self.objects
            .lock()
            .await
            .insert(key.to_string(), bytes.to_vec());
        Ok(ArtifactRef {
            bucket: self.bucket.clone(),
            key: key.to_string(),
        })
    }

    async fn get(
        &self,
        artifact: &ArtifactRef,
    ) -> Result<Vec<u8>, CollaboratorFailure> {
        if artifact.bucket != self.bucket {
            return Err(CollaboratorFailure::ArtifactGet {
                message: format!("unknown bucket {}", artifact.bucket),
            });
        }
        self.objects
            .lock()
            .await
            .get(&artifact.key)
            .cloned()
            .ok_or_else(|| CollaboratorFailure::ArtifactGet {
                message: format!("no object at {}", artifact.key),
            })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use pyrolysis_model::TileJobKey;

    use super::*;
    use crate::clock::ManualClock;

    fn message(tile: &str) -> TileJobMessage {
        TileJobMessage::new(
            TileJobKey::new(RunId::new("run_q"), TileId::from_raw(tile)),
            DateTime::<Utc>::UNIX_EPOCH,
        )
    }

    #[tokio::test]
    async fn delayed_messages_wait_for_visibility() {
        let clock = ManualClock::at_epoch();
        let queue = InMemoryQueue::new(Arc::new(clock.clone()));
        queue
            .send_message(&message("1/0/0"), Duration::from_secs(5))
            .await
            .expect("send");

        assert!(queue.receive(10, Duration::from_secs(30)).await.is_empty());
        clock.advance(ChronoDuration::seconds(5));
        let received = queue.receive(10, Duration::from_secs(30)).await;
        assert_eq!(received.len(), 1);
        assert!(queue.ack(received[0].receipt).await);
        assert_eq!(queue.outstanding().await, 0);
    }

    #[tokio::test]
    async fn unacked_messages_are_redelivered() {
        let clock = ManualClock::at_epoch();
        let queue = InMemoryQueue::new(Arc::new(clock.clone()));
        queue
            .send_message_batch(&[message("1/0/0")])
            .await
            .expect("batch");

        let first = queue.receive(1, Duration::from_secs(30)).await;
        assert_eq!(first.len(), 1);
        assert!(queue.receive(1, Duration::from_secs(30)).await.is_empty());

        clock.advance(ChronoDuration::seconds(31));
        let second = queue.receive(1, Duration::from_secs(30)).await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].receive_count, 2);
        assert!(!queue.ack(first[0].receipt).await);
        assert!(queue.ack(second[0].receipt).await);
    }

    #[tokio::test]
    async fn batch_reports_rejected_entries() {
        let queue = InMemoryQueue::new(Arc::new(ManualClock::at_epoch()));
        queue.reject_tile(TileId::from_raw("1/1/1")).await;
        let report = queue
            .send_message_batch(&[message("1/0/0"), message("1/1/1")])
            .await
            .expect("batch");
        assert_eq!(report.sent, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].sender_fault);
    }

    #[tokio::test]
    async fn artifacts_round_trip_by_reference() {
        let store = InMemoryArtifactStore::new("artifacts");
        let artifact = store.put("runs/a.png", b"png").await.expect("put");
        assert_eq!(store.get(&artifact).await.expect("get"), b"png".to_vec());
        let missing = ArtifactRef {
            bucket: "artifacts".into(),
            key: "runs/b.png".into(),
        };
        assert!(store.get(&missing).await.is_err());
    }
}
