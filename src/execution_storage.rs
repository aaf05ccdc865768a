//! Bounded in-memory execution history plus a broadcast fan-out of
//! execution lifecycle events, backing the `/executions` listing endpoints
//! and the `/executions/stream` WebSocket route (SPEC_FULL.md §10.5).

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::content_hash::ContentHash;

/// Outcome of a completed (non-suspended) execution.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ExecutionOutcome {
    Succeeded { outputs: std::collections::BTreeMap<String, crate::value::CValue> },
    Failed { error_kind: String, message: String },
    Suspended { handle: String },
}

/// One entry in the execution history ring buffer.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub pipeline_hash: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub outcome: Option<ExecutionOutcome>,
}

/// A lifecycle event broadcast to `/executions/stream` subscribers.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ExecutionEvent {
    Started { execution_id: String, pipeline_hash: String },
    Finished { execution_id: String, outcome: ExecutionOutcome },
}

/// Fixed-capacity ring buffer of recent executions, with a broadcast
/// channel of lifecycle events. The channel has its own independent
/// capacity (`broadcast::channel` drops the oldest unread message for slow
/// subscribers); drops are counted via `dropped_events`, exposed as
/// `constellation_execution_events_dropped_total`.
pub struct ExecutionStorage {
    records: RwLock<VecDeque<ExecutionRecord>>,
    capacity: usize,
    events: broadcast::Sender<ExecutionEvent>,
    dropped_events: std::sync::atomic::AtomicU64,
}

impl ExecutionStorage {
    pub fn new(capacity: usize, event_channel_capacity: usize) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(event_channel_capacity.max(1));
        Arc::new(Self {
            records: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
            events: tx,
            dropped_events: std::sync::atomic::AtomicU64::new(0),
        })
    }

    pub async fn record_started(&self, execution_id: &str, pipeline_hash: &ContentHash) {
        let record = ExecutionRecord {
            execution_id: execution_id.to_string(),
            pipeline_hash: pipeline_hash.to_string(),
            started_at: chrono::Utc::now(),
            finished_at: None,
            outcome: None,
        };
        self.push(record).await;
        self.publish(ExecutionEvent::Started {
            execution_id: execution_id.to_string(),
            pipeline_hash: pipeline_hash.to_string(),
        });
    }

    pub async fn record_finished(&self, execution_id: &str, outcome: ExecutionOutcome) {
        let mut records = self.records.write().await;
        if let Some(record) = records.iter_mut().find(|r| r.execution_id == execution_id) {
            record.finished_at = Some(chrono::Utc::now());
            record.outcome = Some(outcome.clone());
        }
        drop(records);
        self.publish(ExecutionEvent::Finished { execution_id: execution_id.to_string(), outcome });
    }

    async fn push(&self, record: ExecutionRecord) {
        let mut records = self.records.write().await;
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    fn publish(&self, event: ExecutionEvent) {
        // `send` only errors when there are zero receivers, which isn't a
        // drop (nothing was waiting to read it) — only count actual lag
        // drops, which `Sender::send` doesn't surface directly, so callers
        // reading via `subscribe()` observe `RecvError::Lagged(n)` and
        // should call `note_dropped(n)`.
        let _ = self.events.send(event);
    }

    pub fn note_dropped(&self, n: u64) {
        self.dropped_events.fetch_add(n, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn dropped_event_count(&self) -> u64 {
        self.dropped_events.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    pub async fn get(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.records.read().await.iter().find(|r| r.execution_id == execution_id).cloned()
    }

    /// Most recent first.
    pub async fn list(&self, limit: usize) -> Vec<ExecutionRecord> {
        self.records.read().await.iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ring_buffer_evicts_oldest_beyond_capacity() {
        let storage = ExecutionStorage::new(2, 8);
        for i in 0..3 {
            storage.record_started(&format!("e{i}"), &ContentHash::from_bytes(b"h")).await;
        }
        let listed = storage.list(10).await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].execution_id, "e2");
    }

    #[tokio::test]
    async fn subscriber_observes_started_and_finished_events() {
        let storage = ExecutionStorage::new(8, 8);
        let mut rx = storage.subscribe();
        storage.record_started("e1", &ContentHash::from_bytes(b"h")).await;
        storage
            .record_finished("e1", ExecutionOutcome::Succeeded { outputs: Default::default() })
            .await;
        assert!(matches!(rx.recv().await.unwrap(), ExecutionEvent::Started { .. }));
        assert!(matches!(rx.recv().await.unwrap(), ExecutionEvent::Finished { .. }));
    }
}
