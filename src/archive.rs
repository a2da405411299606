// Best-effort archival of raw vendor traffic.
// `record` never waits: on a full queue the record is dropped and counted.
// Archiver failures are logged and never reach the rate results.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::error::ArchiveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficKind {
    Request,
    Response,
}

#[derive(Debug, Clone)]
pub struct TrafficRecord {
    pub hotel_id: String,
    pub kind: TrafficKind,
    pub captured_at: DateTime<Utc>,
    pub body: Bytes,
}

impl TrafficRecord {
    pub fn new(hotel_id: impl Into<String>, kind: TrafficKind, body: impl Into<Bytes>) -> Self {
        Self {
            hotel_id: hotel_id.into(),
            kind,
            captured_at: Utc::now(),
            body: body.into(),
        }
    }
}

// Storage backend for archived traffic (object store, log shipper, ...)
#[async_trait]
pub trait Archiver: Send + Sync + 'static {
    async fn store(&self, record: TrafficRecord) -> Result<(), ArchiveError>;
}

#[derive(Clone)]
pub struct ArchiveSink {
    tx: mpsc::Sender<TrafficRecord>,
    dropped: Arc<AtomicUsize>,
}

impl ArchiveSink {
    // The drain task exits once every clone of the sink is dropped
    pub fn start(archiver: Arc<dyn Archiver>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<TrafficRecord>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let hotel_id = record.hotel_id.clone();
                if let Err(e) = archiver.store(record).await {
                    tracing::warn!(hotel_id = %hotel_id, error = %e, "failed to archive vendor traffic");
                }
            }
            tracing::debug!("archive sink drained");
        });

        (
            Self {
                tx,
                dropped: Arc::new(AtomicUsize::new(0)),
            },
            handle,
        )
    }

    // Returns false if the record was dropped
    pub fn record(&self, record: TrafficRecord) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

// In-process archive, keyed by hotel id
#[derive(Debug, Default)]
pub struct MemoryArchive {
    records: DashMap<String, Vec<(TrafficKind, Bytes)>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records_for(&self, hotel_id: &str) -> Vec<(TrafficKind, Bytes)> {
        self.records
            .get(hotel_id)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.iter().map(|r| r.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Archiver for MemoryArchive {
    async fn store(&self, record: TrafficRecord) -> Result<(), ArchiveError> {
        self.records
            .entry(record.hotel_id)
            .or_default()
            .push((record.kind, record.body));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct FailingArchive;

    #[async_trait]
    impl Archiver for FailingArchive {
        async fn store(&self, _record: TrafficRecord) -> Result<(), ArchiveError> {
            Err(ArchiveError::Backend("bucket unavailable".to_string()))
        }
    }

    // Holds every store call until released
    struct GatedArchive {
        gate: Notify,
        inner: MemoryArchive,
    }

    #[async_trait]
    impl Archiver for GatedArchive {
        async fn store(&self, record: TrafficRecord) -> Result<(), ArchiveError> {
            self.gate.notified().await;
            self.inner.store(record).await
        }
    }

    #[tokio::test]
    async fn test_records_reach_archiver() {
        let archive = Arc::new(MemoryArchive::new());
        let (sink, handle) = ArchiveSink::start(archive.clone(), 8);

        assert!(sink.record(TrafficRecord::new("hotel1", TrafficKind::Request, "GET /rates")));
        assert!(sink.record(TrafficRecord::new("hotel1", TrafficKind::Response, "{\"price\":10}")));
        drop(sink);
        handle.await.unwrap();

        let records = archive.records_for("hotel1");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, TrafficKind::Request);
        assert_eq!(records[1].1, Bytes::from_static(b"{\"price\":10}"));
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let archive = Arc::new(GatedArchive {
            gate: Notify::new(),
            inner: MemoryArchive::new(),
        });
        let (sink, _handle) = ArchiveSink::start(archive.clone(), 1);

        // first record is taken by the drain task and parks on the gate
        assert!(sink.record(TrafficRecord::new("h", TrafficKind::Request, "a")));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(sink.record(TrafficRecord::new("h", TrafficKind::Request, "b")));
        assert!(!sink.record(TrafficRecord::new("h", TrafficKind::Request, "c")));
        assert_eq!(sink.dropped(), 1);
    }

    #[tokio::test]
    async fn test_archiver_failure_is_contained() {
        let (sink, handle) = ArchiveSink::start(Arc::new(FailingArchive), 4);
        assert!(sink.record(TrafficRecord::new("h", TrafficKind::Response, "x")));
        drop(sink);

        // drain task survives the error and exits normally
        tokio_test::assert_ok!(handle.await);
    }
}
