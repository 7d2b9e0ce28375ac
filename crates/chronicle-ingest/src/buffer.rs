//! In-memory event buffer with per-kind accumulator lanes.
//!
//! Each record kind gets its own lane so flushes are independent: a slow or
//! failing `voice_session` batch never blocks `message` flushes. A lane is a
//! plain `Vec` behind a `parking_lot` mutex; the flusher swaps the whole
//! vector out under the lock and applies it outside, so producers are never
//! blocked by a database round trip.
//!
//! Every accepted record is journaled before it lands in a lane. The lane
//! entry remembers its journal row id so the flusher can acknowledge exactly
//! the rows it persisted.

use std::sync::Arc;

use chronicle_core::{BufferedRecord, EventRecord, RecordKind, MAX_BATCH_SIZE};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::journal::Journal;

/// One buffered record plus its journal row id.
///
/// `journal_id` is `None` only for records recovered from a journal that was
/// subsequently acked, which cannot happen in practice; it stays an `Option`
/// so tests can build entries without a journal.
#[derive(Debug)]
pub struct BufferEntry {
    pub journal_id: Option<i64>,
    pub record: BufferedRecord,
}

struct Lane {
    kind: RecordKind,
    entries: Mutex<Vec<BufferEntry>>,
}

/// Accumulates validated records until the flusher drains them.
pub struct EventBuffer {
    lanes: Vec<Lane>,
    journal: Arc<Journal>,
    /// Signals the flusher when a lane crosses the batch-size threshold.
    flush_tx: mpsc::Sender<RecordKind>,
}

impl EventBuffer {
    /// Create a buffer over the given journal.
    ///
    /// Returns the buffer and the receiver the flusher listens on for
    /// size-triggered flush requests.
    pub fn new(journal: Arc<Journal>) -> (Arc<Self>, mpsc::Receiver<RecordKind>) {
        let (flush_tx, flush_rx) = mpsc::channel(RecordKind::ALL.len() * 2);
        let lanes = RecordKind::ALL
            .iter()
            .map(|&kind| Lane {
                kind,
                entries: Mutex::new(Vec::new()),
            })
            .collect();
        (
            Arc::new(Self {
                lanes,
                journal,
                flush_tx,
            }),
            flush_rx,
        )
    }

    fn lane(&self, kind: RecordKind) -> &Lane {
        // RecordKind::ALL ordering matches lane construction.
        self.lanes
            .iter()
            .find(|l| l.kind == kind)
            .expect("lane exists for every kind")
    }

    /// Validate, journal, and buffer a record.
    ///
    /// Returns `Err` if validation fails (record is dropped) or if the
    /// journal append fails (caller should route to the direct-write
    /// fallback).
    pub fn enqueue(&self, record: EventRecord) -> Result<()> {
        record.validate().map_err(|e| {
            metrics::counter!("buffer_events_invalid_total").increment(1);
            Error::Core(e)
        })?;

        let kind = record.kind();
        let buffered = BufferedRecord::new(record);
        let journal_id = self.journal.append(&buffered)?;

        let depth = {
            let mut entries = self.lane(kind).entries.lock();
            entries.push(BufferEntry {
                journal_id: Some(journal_id),
                record: buffered,
            });
            entries.len()
        };

        metrics::counter!("buffer_events_total", "kind" => kind.as_str()).increment(1);
        metrics::gauge!("buffer_depth", "kind" => kind.as_str()).set(depth as f64);

        if depth >= MAX_BATCH_SIZE {
            // Channel is small and the flusher drains fast; if the signal is
            // dropped the periodic tick covers it.
            let _ = self.flush_tx.try_send(kind);
        }

        Ok(())
    }

    /// Take everything from one lane, leaving it empty.
    pub fn swap(&self, kind: RecordKind) -> Vec<BufferEntry> {
        let drained = {
            let mut entries = self.lane(kind).entries.lock();
            std::mem::take(&mut *entries)
        };
        metrics::gauge!("buffer_depth", "kind" => kind.as_str()).set(0.0);
        drained
    }

    /// Put entries back at the front of a lane after a failed flush.
    ///
    /// Preserves original order relative to records enqueued meanwhile.
    pub fn restore(&self, kind: RecordKind, mut entries: Vec<BufferEntry>) {
        let depth = {
            let mut lane = self.lane(kind).entries.lock();
            let newer = std::mem::take(&mut *lane);
            entries.extend(newer);
            *lane = entries;
            lane.len()
        };
        metrics::gauge!("buffer_depth", "kind" => kind.as_str()).set(depth as f64);
    }

    /// Number of records currently waiting in one lane.
    pub fn depth(&self, kind: RecordKind) -> usize {
        self.lane(kind).entries.lock().len()
    }

    /// Total records waiting across all lanes.
    pub fn total_depth(&self) -> usize {
        self.lanes.iter().map(|l| l.entries.lock().len()).sum()
    }

    /// Reload unflushed journal rows into the lanes.
    ///
    /// Called once at startup, before any producers run.
    pub fn recover(&self) -> Result<usize> {
        let entries = self.journal.load_all()?;
        let count = entries.len();
        for entry in entries {
            let kind = entry.record.kind();
            self.lane(kind).entries.lock().push(BufferEntry {
                journal_id: Some(entry.id),
                record: entry.record,
            });
        }
        for kind in RecordKind::ALL {
            let depth = self.depth(kind);
            metrics::gauge!("buffer_depth", "kind" => kind.as_str()).set(depth as f64);
        }
        if count > 0 {
            tracing::info!(count, "recovered unflushed records from journal");
        }
        Ok(count)
    }

    /// The journal backing this buffer.
    pub fn journal(&self) -> &Journal {
        &self.journal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use chronicle_core::MessageRecord;

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

    fn buffer() -> (Arc<EventBuffer>, mpsc::Receiver<RecordKind>) {
        let journal = Arc::new(Journal::open_in_memory().unwrap());
        EventBuffer::new(journal)
    }

    #[test]
    fn test_enqueue_journals_and_buffers() {
        let (buf, _rx) = buffer();
        buf.enqueue(message(1)).unwrap();
        buf.enqueue(message(2)).unwrap();

        assert_eq!(buf.depth(RecordKind::Message), 2);
        assert_eq!(buf.journal().depth().unwrap(), 2);
    }

    #[test]
    fn test_enqueue_rejects_invalid() {
        let (buf, _rx) = buffer();
        let mut bad = match message(1) {
            EventRecord::Message(m) => m,
            _ => unreachable!(),
        };
        bad.tenant_id = 0;
        assert!(buf.enqueue(EventRecord::Message(bad)).is_err());
        // Nothing journaled, nothing buffered.
        assert_eq!(buf.depth(RecordKind::Message), 0);
        assert_eq!(buf.journal().depth().unwrap(), 0);
    }

    #[test]
    fn test_swap_empties_lane() {
        let (buf, _rx) = buffer();
        buf.enqueue(message(1)).unwrap();
        let drained = buf.swap(RecordKind::Message);
        assert_eq!(drained.len(), 1);
        assert!(drained[0].journal_id.is_some());
        assert_eq!(buf.depth(RecordKind::Message), 0);
    }

    #[test]
    fn test_restore_preserves_order() {
        let (buf, _rx) = buffer();
        buf.enqueue(message(1)).unwrap();
        let drained = buf.swap(RecordKind::Message);
        // A newer record arrives while the flush is failing.
        buf.enqueue(message(2)).unwrap();
        buf.restore(RecordKind::Message, drained);

        let all = buf.swap(RecordKind::Message);
        let ids: Vec<i64> = all
            .iter()
            .map(|e| match &e.record.record {
                EventRecord::Message(m) => m.message_id,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_lanes_are_independent() {
        let (buf, _rx) = buffer();
        buf.enqueue(message(1)).unwrap();
        assert_eq!(buf.depth(RecordKind::Message), 1);
        assert_eq!(buf.depth(RecordKind::Emoji), 0);
        assert_eq!(buf.total_depth(), 1);
    }

    #[test]
    fn test_recover_reloads_journal() {
        let journal = Arc::new(Journal::open_in_memory().unwrap());
        // Journal a record directly, as if a previous process crashed.
        journal
            .append(&BufferedRecord::new(message(42)))
            .unwrap();

        let (buf, _rx) = EventBuffer::new(journal);
        let recovered = buf.recover().unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(buf.depth(RecordKind::Message), 1);
    }

    #[tokio::test]
    async fn test_size_threshold_signals_flusher() {
        let (buf, mut rx) = buffer();
        for i in 0..MAX_BATCH_SIZE as i64 {
            buf.enqueue(message(i + 1)).unwrap();
        }
        let kind = rx.recv().await.unwrap();
        assert_eq!(kind, RecordKind::Message);
    }

    #[tokio::test]
    async fn test_below_threshold_does_not_signal() {
        let (buf, mut rx) = buffer();
        for i in 0..(MAX_BATCH_SIZE as i64 - 1) {
            buf.enqueue(message(i + 1)).unwrap();
        }
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));
        // The periodic flush covers these.
        assert_eq!(buf.depth(RecordKind::Message), MAX_BATCH_SIZE - 1);
    }
}
