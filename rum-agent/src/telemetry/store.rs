//! Bounded, durable FIFO of spans awaiting export.
//!
//! # Accounting
//! ```text
//! enqueue:  append → occupied += size → while occupied > max: evict oldest
//! drain:    pop up to N oldest, in insertion order (rows stay on disk)
//! requeue:  push a failed batch back to the front, original order kept
//! ack:      delete the exported batch's rows from disk
//! ```
//! The queue and its occupancy counter live under one lock, so the bound holds
//! after every operation regardless of how many producers race.
//!
//! A record whose row could not be written is kept in memory only and marked
//! degraded. When a requeued batch pushes the queue over capacity, degraded
//! records from that batch are evicted before anything else.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::attributes::normalize_attributes;
use super::span::SpanRecord;
use crate::error::{AgentError, AgentResult};

/// Row identifier handed out by the persistence layer.
pub type RecordHandle = i64;

/// Durable side of the queue. Implementations must be crash-consistent:
/// a partially written payload must never be returned by `read_all`.
pub trait SpanPersistence: Send + Sync {
    fn append(&self, payload: &[u8]) -> AgentResult<RecordHandle>;
    /// Every stored payload, oldest first.
    fn read_all(&self) -> AgentResult<Vec<(RecordHandle, Vec<u8>)>>;
    fn delete(&self, handles: &[RecordHandle]) -> AgentResult<usize>;
    fn delete_oldest(&self, count: usize) -> AgentResult<usize>;
    fn total_bytes_used(&self) -> AgentResult<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Durability {
    Persisted(RecordHandle),
    /// Disk buffering is off
    MemoryOnly,
    /// Disk buffering is on but the write failed
    Degraded,
}

#[derive(Debug, Clone)]
struct BufferedSpan {
    record: SpanRecord,
    size: u64,
    durability: Durability,
}

impl BufferedSpan {
    fn handle(&self) -> Option<RecordHandle> {
        match self.durability {
            Durability::Persisted(handle) => Some(handle),
            _ => None,
        }
    }
}

/// Records removed by `drain_batch`, owned by the flush cycle until they are
/// acknowledged or requeued.
#[derive(Debug, Default)]
pub struct SpanBatch {
    entries: Vec<BufferedSpan>,
}

impl SpanBatch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &SpanRecord> {
        self.entries.iter().map(|e| &e.record)
    }

    pub fn to_records(&self) -> Vec<SpanRecord> {
        self.records().cloned().collect()
    }

    pub fn size_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

/// How the enqueued record was retained.
#[derive(Debug)]
pub enum PersistenceStatus {
    Persisted,
    MemoryOnly,
    /// Kept in memory because the write failed
    Degraded(AgentError),
}

#[derive(Debug)]
pub struct EnqueueOutcome {
    /// Records evicted to make room (possibly including this one)
    pub evicted: usize,
    pub persistence: PersistenceStatus,
}

impl EnqueueOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self.persistence, PersistenceStatus::Degraded(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub queued: usize,
    pub occupied_bytes: u64,
    pub max_capacity_bytes: u64,
    /// Records evicted under capacity pressure since start
    pub dropped_total: u64,
    /// Records that could not be persisted since start
    pub degraded_total: u64,
}

#[derive(Debug, Default)]
struct BufferQueue {
    records: VecDeque<BufferedSpan>,
    occupied_bytes: u64,
}

impl BufferQueue {
    fn push_back(&mut self, entry: BufferedSpan) {
        self.occupied_bytes += entry.size;
        self.records.push_back(entry);
    }

    fn pop_front(&mut self) -> Option<BufferedSpan> {
        let entry = self.records.pop_front()?;
        self.occupied_bytes -= entry.size;
        Some(entry)
    }

    fn remove(&mut self, index: usize) -> Option<BufferedSpan> {
        let entry = self.records.remove(index)?;
        self.occupied_bytes -= entry.size;
        Some(entry)
    }

    /// Evict until the bound holds. Degraded records among the first
    /// `degraded_window` entries go first, then strict oldest-first.
    fn enforce(&mut self, max_bytes: u64, degraded_window: usize) -> Vec<BufferedSpan> {
        let mut evicted = Vec::new();
        while self.occupied_bytes > max_bytes {
            let window = degraded_window.min(self.records.len());
            let degraded = self
                .records
                .iter()
                .take(window)
                .position(|e| e.durability == Durability::Degraded);
            let victim = match degraded {
                Some(idx) => self.remove(idx),
                None => self.pop_front(),
            };
            match victim {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        evicted
    }
}

pub struct BufferedSpanStore {
    max_capacity_bytes: u64,
    queue: Mutex<BufferQueue>,
    persistence: Option<Arc<dyn SpanPersistence>>,
    dropped_total: AtomicU64,
    degraded_total: AtomicU64,
}

impl BufferedSpanStore {
    /// A store that keeps records in memory only.
    pub fn in_memory(max_capacity_bytes: u64) -> Self {
        Self {
            max_capacity_bytes,
            queue: Mutex::new(BufferQueue::default()),
            persistence: None,
            dropped_total: AtomicU64::new(0),
            degraded_total: AtomicU64::new(0),
        }
    }

    /// A durable store, reloading whatever a previous run left behind.
    ///
    /// Undecodable rows are deleted; the capacity bound is re-applied to the
    /// reloaded records.
    pub fn open(persistence: Arc<dyn SpanPersistence>, max_capacity_bytes: u64) -> AgentResult<Self> {
        let rows = persistence.read_all()?;

        let mut queue = BufferQueue::default();
        let mut corrupt = Vec::new();
        for (handle, payload) in rows {
            match serde_json::from_slice::<SpanRecord>(&payload) {
                Ok(record) => queue.push_back(BufferedSpan {
                    size: record_size(&record),
                    record,
                    durability: Durability::Persisted(handle),
                }),
                Err(e) => {
                    log::warn!("[BUFFER] Discarding undecodable span row {}: {}", handle, e);
                    corrupt.push(handle);
                }
            }
        }

        if !corrupt.is_empty() {
            if let Err(e) = persistence.delete(&corrupt) {
                log::warn!("[BUFFER] Failed to delete {} corrupt span rows: {}", corrupt.len(), e);
            }
        }
        // reloaded evictions are always the oldest remaining rows
        let evicted = queue.enforce(max_capacity_bytes, 0);
        if !evicted.is_empty() {
            if let Err(e) = persistence.delete_oldest(evicted.len()) {
                log::warn!("[BUFFER] Failed to delete {} evicted span rows: {}", evicted.len(), e);
            }
        }

        log::info!(
            "[BUFFER] Restored {} buffered spans ({} bytes, {} bytes on disk)",
            queue.records.len(),
            queue.occupied_bytes,
            persistence.total_bytes_used().unwrap_or(0)
        );

        Ok(Self {
            max_capacity_bytes,
            queue: Mutex::new(queue),
            persistence: Some(persistence),
            dropped_total: AtomicU64::new(evicted.len() as u64),
            degraded_total: AtomicU64::new(0),
        })
    }

    /// Append a record, evicting the oldest records while over capacity.
    ///
    /// Never fails: a storage error leaves the record in memory and is
    /// reported through the outcome.
    pub fn enqueue(&self, mut record: SpanRecord) -> EnqueueOutcome {
        // a non-finite double would be written as null and fail to reload
        normalize_attributes(&mut record.attributes);
        let size = record_size(&record);

        let mut queue = self.queue.lock();

        let (durability, persistence) = match &self.persistence {
            None => (Durability::MemoryOnly, PersistenceStatus::MemoryOnly),
            Some(store) => match serde_json::to_vec(&record)
                .map_err(AgentError::from)
                .and_then(|payload| store.append(&payload))
            {
                Ok(handle) => (Durability::Persisted(handle), PersistenceStatus::Persisted),
                Err(e) => {
                    self.degraded_total.fetch_add(1, Ordering::Relaxed);
                    log::warn!("[BUFFER] Span '{}' kept in memory only: {}", record.name, e);
                    let reason = match e {
                        AgentError::PersistenceDegraded(_) => e,
                        other => AgentError::PersistenceDegraded(other.to_string()),
                    };
                    (Durability::Degraded, PersistenceStatus::Degraded(reason))
                }
            },
        };

        queue.push_back(BufferedSpan {
            record,
            size,
            durability,
        });
        let evicted = queue.enforce(self.max_capacity_bytes, 0);
        self.discard(&evicted);

        EnqueueOutcome {
            evicted: evicted.len(),
            persistence,
        }
    }

    /// Remove and return up to `max_count` of the oldest records.
    pub fn drain_batch(&self, max_count: usize) -> SpanBatch {
        let mut queue = self.queue.lock();
        let take = max_count.min(queue.records.len());
        let mut entries = Vec::with_capacity(take);
        while entries.len() < take {
            match queue.pop_front() {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }
        SpanBatch { entries }
    }

    /// Put a drained batch back at the front, ahead of anything enqueued since.
    pub fn requeue(&self, batch: SpanBatch) {
        if batch.is_empty() {
            return;
        }
        let window = batch.len();

        let mut queue = self.queue.lock();
        for entry in batch.entries.into_iter().rev() {
            queue.occupied_bytes += entry.size;
            queue.records.push_front(entry);
        }
        let evicted = queue.enforce(self.max_capacity_bytes, window);
        self.discard(&evicted);
    }

    /// Forget an exported batch, deleting its rows. Returns the number of rows removed.
    pub fn acknowledge(&self, batch: SpanBatch) -> usize {
        let handles: Vec<RecordHandle> = batch.entries.iter().filter_map(|e| e.handle()).collect();
        match (&self.persistence, handles.is_empty()) {
            (Some(store), false) => match store.delete(&handles) {
                Ok(deleted) => deleted,
                Err(e) => {
                    // rows left behind are re-sent after a restart
                    log::warn!("[BUFFER] Failed to delete {} exported rows: {}", handles.len(), e);
                    0
                }
            },
            _ => 0,
        }
    }

    pub fn current_usage_bytes(&self) -> u64 {
        self.queue.lock().occupied_bytes
    }

    pub fn max_capacity_bytes(&self) -> u64 {
        self.max_capacity_bytes
    }

    pub fn len(&self) -> usize {
        self.queue.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().records.is_empty()
    }

    pub fn is_durable(&self) -> bool {
        self.persistence.is_some()
    }

    pub fn stats(&self) -> StoreStats {
        let queue = self.queue.lock();
        StoreStats {
            queued: queue.records.len(),
            occupied_bytes: queue.occupied_bytes,
            max_capacity_bytes: self.max_capacity_bytes,
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
            degraded_total: self.degraded_total.load(Ordering::Relaxed),
        }
    }

    /// Count evicted records and delete their rows. Runs under the queue lock
    /// so row deletes stay ordered with appends.
    fn discard(&self, evicted: &[BufferedSpan]) {
        if evicted.is_empty() {
            return;
        }
        self.dropped_total
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        log::debug!("[BUFFER] Evicted {} oldest spans under capacity pressure", evicted.len());

        if let Some(store) = &self.persistence {
            let handles: Vec<RecordHandle> = evicted.iter().filter_map(|e| e.handle()).collect();
            if !handles.is_empty() {
                if let Err(e) = store.delete(&handles) {
                    log::warn!("[BUFFER] Failed to delete {} evicted rows: {}", handles.len(), e);
                }
            }
        }
    }
}

fn record_size(record: &SpanRecord) -> u64 {
    if record.size_bytes > 0 {
        record.size_bytes
    } else {
        record.estimated_size()
    }
}
