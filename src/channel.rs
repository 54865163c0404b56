//! Bounded snapshot delivery from the sampler to its consumers.
//!
//! Every buffer in the pipeline drops the newest snapshot when full, so a
//! slow reader never blocks the writer in front of it.

use crate::metrics::Metrics;
use crate::snapshot::Snapshot;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    Dropped,
    Closed,
}

/// Producing end of a distribution channel. Publishing never waits.
#[derive(Debug, Clone)]
pub struct Publisher {
    tx: mpsc::Sender<Arc<Snapshot>>,
}

impl Publisher {
    pub fn publish(&self, snapshot: Arc<Snapshot>) -> PublishOutcome {
        try_deliver(&self.tx, snapshot)
    }
}

/// Consuming end of a distribution channel. Has exactly one reader.
#[derive(Debug)]
pub struct SnapshotStream {
    rx: mpsc::Receiver<Arc<Snapshot>>,
}

impl SnapshotStream {
    /// Next snapshot in publish order, or `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<Arc<Snapshot>> {
        self.rx.recv().await
    }

    fn closed() -> Self {
        let (_, rx) = mpsc::channel(1);
        Self { rx }
    }
}

pub fn channel(capacity: usize) -> (Publisher, SnapshotStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Publisher { tx }, SnapshotStream { rx })
}

fn try_deliver(tx: &mpsc::Sender<Arc<Snapshot>>, snapshot: Arc<Snapshot>) -> PublishOutcome {
    match tx.try_send(snapshot) {
        Ok(()) => PublishOutcome::Delivered,
        Err(TrySendError::Full(_)) => PublishOutcome::Dropped,
        Err(TrySendError::Closed(_)) => PublishOutcome::Closed,
    }
}

#[derive(Default)]
struct Branches {
    senders: Vec<mpsc::Sender<Arc<Snapshot>>>,
    closed: bool,
}

/// Reads one stream and copies every snapshot into each subscriber's private branch.
#[derive(Clone)]
pub struct Fanout {
    branches: Arc<Mutex<Branches>>,
    branch_capacity: usize,
    metrics: Arc<Metrics>,
}

impl Fanout {
    pub fn new(branch_capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            branches: Arc::new(Mutex::new(Branches::default())),
            branch_capacity: branch_capacity.max(1),
            metrics,
        }
    }

    /// Adds a branch. After the source has ended the returned stream is already closed.
    pub fn subscribe(&self) -> SnapshotStream {
        let mut branches = self.lock();
        if branches.closed {
            return SnapshotStream::closed();
        }
        let (tx, rx) = mpsc::channel(self.branch_capacity);
        branches.senders.push(tx);
        SnapshotStream { rx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().senders.len()
    }

    pub fn spawn(&self, source: SnapshotStream) -> JoinHandle<()> {
        let fanout = self.clone();
        tokio::spawn(async move { fanout.run(source).await })
    }

    pub async fn run(&self, mut source: SnapshotStream) {
        while let Some(snapshot) = source.next().await {
            self.forward(snapshot);
        }
        let mut branches = self.lock();
        branches.closed = true;
        branches.senders.clear();
        info!("snapshot source closed, fan-out stopped");
    }

    fn forward(&self, snapshot: Arc<Snapshot>) {
        let mut branches = self.lock();
        branches
            .senders
            .retain(|tx| match try_deliver(tx, snapshot.clone()) {
                PublishOutcome::Delivered => true,
                PublishOutcome::Dropped => {
                    self.metrics.inc_dropped("fanout");
                    debug!(sequence = snapshot.sequence, "fan-out branch full, snapshot dropped");
                    true
                }
                PublishOutcome::Closed => false,
            });
    }

    fn lock(&self) -> MutexGuard<'_, Branches> {
        self.branches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::DeviceReading;
    use std::time::{Duration, Instant, UNIX_EPOCH};

    fn snap(sequence: u64) -> Arc<Snapshot> {
        Arc::new(Snapshot::from_reading(
            sequence,
            UNIX_EPOCH,
            DeviceReading::default(),
        ))
    }

    #[tokio::test]
    async fn full_channel_drops_newest_without_blocking() {
        let (publisher, mut stream) = channel(2);
        let started = Instant::now();
        assert_eq!(publisher.publish(snap(1)), PublishOutcome::Delivered);
        assert_eq!(publisher.publish(snap(2)), PublishOutcome::Delivered);
        for seq in 3..1000 {
            assert_eq!(publisher.publish(snap(seq)), PublishOutcome::Dropped);
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(stream.next().await.unwrap().sequence, 1);
        assert_eq!(stream.next().await.unwrap().sequence, 2);
        drop(publisher);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn publish_after_reader_gone_reports_closed() {
        let (publisher, stream) = channel(4);
        drop(stream);
        assert_eq!(publisher.publish(snap(1)), PublishOutcome::Closed);
    }

    #[tokio::test]
    async fn fanout_copies_in_order_to_every_branch() {
        let metrics = Metrics::new().unwrap();
        let (publisher, source) = channel(16);
        let fanout = Fanout::new(16, metrics);
        let mut a = fanout.subscribe();
        let mut b = fanout.subscribe();
        let task = fanout.spawn(source);

        for seq in 1..=5 {
            publisher.publish(snap(seq));
        }
        drop(publisher);
        task.await.unwrap();

        for stream in [&mut a, &mut b] {
            let mut seen = Vec::new();
            while let Some(s) = stream.next().await {
                seen.push(s.sequence);
            }
            assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        }
        assert!(fanout.subscribe().next().await.is_none());
    }

    #[tokio::test]
    async fn slow_branch_does_not_hold_back_others() {
        let metrics = Metrics::new().unwrap();
        let fanout = Fanout::new(1, metrics);
        let mut slow = fanout.subscribe();
        let mut fast = fanout.subscribe();

        fanout.forward(snap(1));
        assert_eq!(fast.next().await.unwrap().sequence, 1);
        fanout.forward(snap(2));
        assert_eq!(fast.next().await.unwrap().sequence, 2);

        assert_eq!(slow.next().await.unwrap().sequence, 1);
        drop(slow);
        fanout.forward(snap(3));
        assert_eq!(fanout.subscriber_count(), 1);
        assert_eq!(fast.next().await.unwrap().sequence, 3);
    }
}
