//! Batch flushing from the buffer to the persistent store.
//!
//! The flusher drains one lane at a time, applies the drained records as a
//! batch, and acknowledges the journal rows the store confirmed. A batch
//! that fails wholesale (store unreachable, transaction-level error) is
//! restored to the front of its lane and retried on the next cycle; records
//! that fail individually inside a batch are reported by the applier,
//! logged, and dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chronicle_core::{BufferedRecord, RecordKind, FLUSH_INTERVAL_SECS, MAX_BATCH_SIZE};
use tokio::sync::mpsc;

use crate::buffer::{BufferEntry, EventBuffer};
use crate::error::Result;
use crate::scheduler::Shutdown;

/// Outcome of applying one batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotReport {
    /// Rows newly inserted or upserted.
    pub inserted: usize,
    /// Rows skipped because the store already had them.
    pub duplicates: usize,
    /// Rows that failed individually and were dropped.
    pub failures: usize,
}

impl SnapshotReport {
    pub fn merge(&mut self, other: SnapshotReport) {
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.failures += other.failures;
    }
}

/// Applies a batch of records to some destination.
///
/// The production implementation is the Postgres-backed store; tests use an
/// in-memory applier. Contract: the call succeeds as a whole or fails as a
/// whole — per-record problems are absorbed into the report, and a returned
/// `Err` means nothing in the batch should be acknowledged.
#[async_trait]
pub trait RecordApplier: Send + Sync {
    async fn apply_snapshot(&self, records: &[BufferedRecord]) -> Result<SnapshotReport>;
}

/// Drains buffer lanes into a [`RecordApplier`].
pub struct BatchFlusher {
    buffer: Arc<EventBuffer>,
    applier: Arc<dyn RecordApplier>,
}

impl BatchFlusher {
    pub fn new(buffer: Arc<EventBuffer>, applier: Arc<dyn RecordApplier>) -> Self {
        Self { buffer, applier }
    }

    /// Flush one lane completely, in chunks of at most `MAX_BATCH_SIZE`.
    ///
    /// Returns the merged report. On a batch-level failure the unapplied
    /// remainder goes back to the lane and the error is returned.
    pub async fn flush_kind(&self, kind: RecordKind) -> Result<SnapshotReport> {
        let mut entries = self.buffer.swap(kind);
        if entries.is_empty() {
            return Ok(SnapshotReport::default());
        }

        let mut total = SnapshotReport::default();
        while !entries.is_empty() {
            let batch: Vec<BufferEntry> = if entries.len() > MAX_BATCH_SIZE {
                let rest = entries.split_off(MAX_BATCH_SIZE);
                std::mem::replace(&mut entries, rest)
            } else {
                std::mem::take(&mut entries)
            };

            let records: Vec<BufferedRecord> =
                batch.iter().map(|e| e.record.clone()).collect();

            let started = Instant::now();
            match self.applier.apply_snapshot(&records).await {
                Ok(report) => {
                    let ids: Vec<i64> = batch.iter().filter_map(|e| e.journal_id).collect();
                    if let Err(e) = self.buffer.journal().ack(&ids) {
                        // Rows will be re-applied after a restart; dedup
                        // constraints make that harmless.
                        tracing::warn!(kind = %kind, "journal ack failed: {}", e);
                    }

                    metrics::counter!("flush_batches_total").increment(1);
                    metrics::counter!("flush_records_inserted_total", "kind" => kind.as_str())
                        .increment(report.inserted as u64);
                    metrics::counter!("flush_records_duplicate_total", "kind" => kind.as_str())
                        .increment(report.duplicates as u64);
                    metrics::counter!("flush_records_failed_total", "kind" => kind.as_str())
                        .increment(report.failures as u64);
                    metrics::histogram!("flush_duration_seconds")
                        .record(started.elapsed().as_secs_f64());

                    if report.failures > 0 {
                        tracing::warn!(
                            kind = %kind,
                            failures = report.failures,
                            "dropped records that failed to apply"
                        );
                    }
                    total.merge(report);
                }
                Err(e) => {
                    metrics::counter!("store_insert_errors_total").increment(1);
                    tracing::warn!(
                        kind = %kind,
                        batch = batch.len(),
                        pending = entries.len(),
                        "flush failed, restoring batch: {}",
                        e
                    );
                    // Unapplied remainder first, then what producers added.
                    let mut restore = batch;
                    restore.extend(entries);
                    self.buffer.restore(kind, restore);
                    return Err(e);
                }
            }
        }

        if let Ok(depth) = self.buffer.journal().depth() {
            metrics::gauge!("buffer_journal_depth").set(depth as f64);
        }

        Ok(total)
    }

    /// Flush every lane once. Lane errors are logged, not propagated, so one
    /// failing table never starves the others.
    pub async fn flush_all(&self) -> SnapshotReport {
        let mut total = SnapshotReport::default();
        for kind in RecordKind::ALL {
            match self.flush_kind(kind).await {
                Ok(report) => total.merge(report),
                Err(e) => {
                    tracing::debug!(kind = %kind, "lane flush deferred: {}", e);
                }
            }
        }
        total
    }

    /// Run the flush loop: a periodic full flush, plus immediate flushes for
    /// lanes that cross the batch-size threshold.
    pub async fn run(&self, mut trigger: mpsc::Receiver<RecordKind>, mut shutdown: Shutdown) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(FLUSH_INTERVAL_SECS));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_all().await;
                }
                Some(kind) = trigger.recv() => {
                    if let Err(e) = self.flush_kind(kind).await {
                        tracing::debug!(kind = %kind, "threshold flush deferred: {}", e);
                    }
                }
                _ = shutdown.triggered() => {
                    tracing::info!("flush loop stopping");
                    return;
                }
            }
        }
    }
}

/// Writes records straight to the applier when buffering is unavailable.
///
/// Used when the journal cannot accept writes: better a synchronous store
/// round trip than a silently dropped event. Records that fail here are lost
/// and counted.
pub struct DirectWriteFallback {
    applier: Arc<dyn RecordApplier>,
}

impl DirectWriteFallback {
    pub fn new(applier: Arc<dyn RecordApplier>) -> Self {
        Self { applier }
    }

    pub async fn write(&self, record: BufferedRecord) -> Result<SnapshotReport> {
        let report = self.applier.apply_snapshot(std::slice::from_ref(&record)).await?;
        metrics::counter!("flush_direct_writes_total").increment(1);
        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory applier with the same dedup semantics as the real store,
    //! used to exercise the flusher without a database.

    use super::*;
    use chronicle_core::{EventRecord, MessageRecord};
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    pub struct MemoryApplier {
        /// First-seen message per id; later deliveries are duplicates.
        pub messages: Mutex<HashMap<i64, MessageRecord>>,
        pub seen_mentions: Mutex<HashSet<(i64, i64)>>,
        /// (tenant, user, channel, flags) -> accumulated seconds.
        pub aggregates: Mutex<HashMap<(i64, i64, i64, u8), i64>>,
        pub appended: Mutex<Vec<BufferedRecord>>,
        /// message_ids that should fail individually.
        pub poison: Mutex<HashSet<i64>>,
        /// When true, every call fails wholesale.
        pub offline: Mutex<bool>,
    }

    #[async_trait]
    impl RecordApplier for MemoryApplier {
        async fn apply_snapshot(&self, records: &[BufferedRecord]) -> Result<SnapshotReport> {
            if *self.offline.lock() {
                return Err(crate::error::Error::Config("store offline".to_string()));
            }
            let mut report = SnapshotReport::default();
            for buffered in records {
                match &buffered.record {
                    EventRecord::Message(m) => {
                        if self.poison.lock().contains(&m.message_id) {
                            report.failures += 1;
                        } else {
                            let mut messages = self.messages.lock();
                            if messages.contains_key(&m.message_id) {
                                report.duplicates += 1;
                            } else {
                                messages.insert(m.message_id, m.clone());
                                report.inserted += 1;
                            }
                        }
                    }
                    EventRecord::Mention(m) => {
                        let key = (m.message_id, m.mentioned_user_id);
                        if self.seen_mentions.lock().insert(key) {
                            report.inserted += 1;
                        } else {
                            report.duplicates += 1;
                        }
                    }
                    EventRecord::VoiceAggregate(a) => {
                        let key = (a.tenant_id, a.user_id, a.channel_id, a.state_flags);
                        *self.aggregates.lock().entry(key).or_insert(0) +=
                            a.duration_seconds;
                        report.inserted += 1;
                    }
                    _ => {
                        self.appended.lock().push(buffered.clone());
                        report.inserted += 1;
                    }
                }
            }
            Ok(report)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryApplier;
    use super::*;
    use crate::journal::Journal;
    use chrono::Utc;
    use chronicle_core::{EventRecord, MentionRecord, MessageRecord, VoiceTimeAggregate};

    fn message(message_id: i64) -> EventRecord {
        EventRecord::Message(MessageRecord {
            tenant_id: 1,
            user_id: 2,
            channel_id: 3,
            category_id: None,
            message_id,
            display_name: "hsh:aa".to_string(),
            length: 4,
            mention_ids: vec![],
            has_attachment: false,
            has_embed: false,
            created_at: Utc::now(),
            is_bot: false,
        })
    }

    fn mention(message_id: i64, mentioned: i64) -> EventRecord {
        EventRecord::Mention(MentionRecord {
            tenant_id: 1,
            mentioned_user_id: mentioned,
            mentioner_user_id: 2,
            channel_id: 3,
            category_id: None,
            message_id,
            display_name: "hsh:aa".to_string(),
            created_at: Utc::now(),
        })
    }

    fn aggregate(seconds: i64) -> EventRecord {
        EventRecord::VoiceAggregate(VoiceTimeAggregate {
            tenant_id: 1,
            user_id: 2,
            channel_id: 3,
            category_id: None,
            state_flags: 0,
            state_category: "active".to_string(),
            duration_seconds: seconds,
            last_updated: Utc::now(),
        })
    }

    fn setup() -> (Arc<EventBuffer>, Arc<MemoryApplier>, BatchFlusher) {
        let journal = Arc::new(Journal::open_in_memory().unwrap());
        let (buffer, _rx) = EventBuffer::new(journal);
        let applier = Arc::new(MemoryApplier::default());
        let flusher = BatchFlusher::new(buffer.clone(), applier.clone());
        (buffer, applier, flusher)
    }

    #[tokio::test]
    async fn test_flush_acks_journal() {
        let (buffer, _applier, flusher) = setup();
        buffer.enqueue(message(1)).unwrap();
        buffer.enqueue(message(2)).unwrap();

        let report = flusher.flush_kind(RecordKind::Message).await.unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(buffer.depth(RecordKind::Message), 0);
        assert_eq!(buffer.journal().depth().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_redelivery_deduplicated_by_store() {
        let (buffer, _applier, flusher) = setup();
        buffer.enqueue(message(1)).unwrap();
        flusher.flush_kind(RecordKind::Message).await.unwrap();

        // Same message delivered again in a later batch.
        buffer.enqueue(message(1)).unwrap();
        let report = flusher.flush_kind(RecordKind::Message).await.unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(report.duplicates, 1);
    }

    #[tokio::test]
    async fn test_mention_dedup_key_is_message_and_user() {
        let (buffer, _applier, flusher) = setup();
        buffer.enqueue(mention(1, 10)).unwrap();
        buffer.enqueue(mention(1, 11)).unwrap();
        buffer.enqueue(mention(1, 10)).unwrap();

        let report = flusher.flush_kind(RecordKind::Mention).await.unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.duplicates, 1);
    }

    #[tokio::test]
    async fn test_aggregate_deltas_accumulate() {
        let (buffer, applier, flusher) = setup();
        buffer.enqueue(aggregate(60)).unwrap();
        buffer.enqueue(aggregate(30)).unwrap();
        flusher.flush_kind(RecordKind::VoiceAggregate).await.unwrap();

        let totals = applier.aggregates.lock();
        assert_eq!(totals.get(&(1, 2, 3, 0)), Some(&90));
    }

    #[tokio::test]
    async fn test_per_record_failure_does_not_sink_batch() {
        let (buffer, applier, flusher) = setup();
        applier.poison.lock().insert(2);
        buffer.enqueue(message(1)).unwrap();
        buffer.enqueue(message(2)).unwrap();
        buffer.enqueue(message(3)).unwrap();

        let report = flusher.flush_kind(RecordKind::Message).await.unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.failures, 1);
        // Batch acked: nothing left to retry.
        assert_eq!(buffer.journal().depth().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batch_failure_restores_lane_and_journal() {
        let (buffer, applier, flusher) = setup();
        *applier.offline.lock() = true;
        buffer.enqueue(message(1)).unwrap();

        assert!(flusher.flush_kind(RecordKind::Message).await.is_err());
        assert_eq!(buffer.depth(RecordKind::Message), 1);
        assert_eq!(buffer.journal().depth().unwrap(), 1);

        // Store comes back; retry succeeds and clears everything.
        *applier.offline.lock() = false;
        let report = flusher.flush_kind(RecordKind::Message).await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(buffer.journal().depth().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_flush_all_covers_every_lane() {
        let (buffer, _applier, flusher) = setup();
        buffer.enqueue(message(1)).unwrap();
        buffer.enqueue(mention(1, 10)).unwrap();
        buffer.enqueue(aggregate(5)).unwrap();

        let report = flusher.flush_all().await;
        assert_eq!(report.inserted, 3);
        assert_eq!(buffer.total_depth(), 0);
    }

    #[tokio::test]
    async fn test_large_lane_flushed_in_chunks() {
        let (buffer, _applier, flusher) = setup();
        for i in 0..(MAX_BATCH_SIZE as i64 + 50) {
            buffer.enqueue(message(i + 1)).unwrap();
        }
        let report = flusher.flush_kind(RecordKind::Message).await.unwrap();
        assert_eq!(report.inserted, MAX_BATCH_SIZE + 50);
        assert_eq!(buffer.depth(RecordKind::Message), 0);
    }

    #[tokio::test]
    async fn test_direct_write_fallback() {
        let applier = Arc::new(MemoryApplier::default());
        let fallback = DirectWriteFallback::new(applier.clone());
        let report = fallback
            .write(BufferedRecord::new(message(77)))
            .await
            .unwrap();
        assert_eq!(report.inserted, 1);
        assert!(applier.messages.lock().contains_key(&77));
    }

    #[tokio::test]
    async fn test_first_seen_payload_wins() {
        let (buffer, applier, flusher) = setup();
        let mut first = message(1);
        let mut second = message(1);
        if let EventRecord::Message(m) = &mut first {
            m.length = 5;
        }
        if let EventRecord::Message(m) = &mut second {
            m.length = 9;
        }

        buffer.enqueue(first).unwrap();
        flusher.flush_kind(RecordKind::Message).await.unwrap();
        buffer.enqueue(second).unwrap();
        let report = flusher.flush_kind(RecordKind::Message).await.unwrap();

        assert_eq!(report.duplicates, 1);
        // The redelivered payload must not overwrite the stored row.
        assert_eq!(applier.messages.lock().get(&1).unwrap().length, 5);
    }
}
