use crate::channel::SnapshotStream;
use crate::error::{DeliveryError, DeliveryFailure};
use crate::metrics::Metrics;
use crate::snapshot::Snapshot;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Identity of one attached connection, assigned at attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct ConsumerHandle {
    tx: mpsc::Sender<Arc<Snapshot>>,
    peer: String,
}

/// Outbound queue of one consumer, drained by its writer.
#[derive(Debug)]
pub struct ConsumerQueue {
    id: ConsumerId,
    rx: mpsc::Receiver<Arc<Snapshot>>,
}

impl ConsumerQueue {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Next snapshot for this consumer; `None` once it was detached or the registry closed.
    pub async fn next(&mut self) -> Option<Arc<Snapshot>> {
        self.rx.recv().await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
    pub detached: usize,
}

/// Set of attached remote consumers. Cheap to clone; clones share the same set.
#[derive(Clone)]
pub struct ConsumerRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    consumers: DashMap<ConsumerId, ConsumerHandle>,
    next_id: AtomicU64,
    queue_capacity: usize,
    closed: AtomicBool,
    latest: RwLock<Option<Arc<Snapshot>>>,
    metrics: Arc<Metrics>,
}

impl ConsumerRegistry {
    pub fn new(queue_capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(Inner {
                consumers: DashMap::new(),
                next_id: AtomicU64::new(1),
                queue_capacity: queue_capacity.max(1),
                closed: AtomicBool::new(false),
                latest: RwLock::new(None),
                metrics,
            }),
        }
    }

    pub fn attach(&self, peer: impl Into<String>) -> (ConsumerId, ConsumerQueue) {
        let id = ConsumerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let peer = peer.into();

        if self.is_closed() {
            debug!(consumer = %id, peer = %peer, "registry closed, consumer not attached");
            return (id, ConsumerQueue { id, rx });
        }
        self.inner.consumers.insert(id, ConsumerHandle { tx, peer: peer.clone() });
        // A close that raced with the insert must not leave the entry behind.
        if self.is_closed() {
            self.inner.consumers.remove(&id);
        }

        self.update_gauge();
        info!(consumer = %id, peer = %peer, "consumer attached");
        (id, ConsumerQueue { id, rx })
    }

    /// Removes a consumer. Detaching an absent id is a no-op and returns `false`.
    pub fn detach(&self, id: ConsumerId) -> bool {
        let Some((_, handle)) = self.inner.consumers.remove(&id) else {
            return false;
        };
        self.update_gauge();
        info!(consumer = %id, peer = %handle.peer, "consumer detached");
        true
    }

    /// Detaches the consumer a delivery failed for.
    pub fn report_failure(&self, err: &DeliveryError) {
        if self.detach(err.consumer) {
            self.inner.metrics.inc_detached(err.kind.as_str());
            warn!(error = %err, "consumer dropped after delivery failure");
        }
    }

    /// Queues the snapshot for every attached consumer without waiting on any of them.
    pub fn broadcast(&self, snapshot: &Arc<Snapshot>) -> BroadcastReport {
        let targets: Vec<(ConsumerId, mpsc::Sender<Arc<Snapshot>>)> = self
            .inner
            .consumers
            .iter()
            .map(|entry| (*entry.key(), entry.value().tx.clone()))
            .collect();

        let mut report = BroadcastReport::default();
        for (id, tx) in targets {
            match tx.try_send(snapshot.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    self.inner.metrics.inc_dropped("consumer");
                    debug!(consumer = %id, sequence = snapshot.sequence, "consumer queue full, snapshot dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    report.detached += 1;
                    self.report_failure(&DeliveryError {
                        consumer: id,
                        kind: DeliveryFailure::Closed,
                    });
                }
            }
        }
        report
    }

    /// Relays every snapshot of `stream` until it ends, then closes all consumer queues.
    pub async fn run(&self, mut stream: SnapshotStream) {
        while let Some(snapshot) = stream.next().await {
            self.set_latest(snapshot.clone());
            self.broadcast(&snapshot);
        }
        self.close();
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let count = self.len();
        self.inner.consumers.clear();
        self.update_gauge();
        info!(consumers = count, "registry closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.consumers.is_empty()
    }

    pub fn contains(&self, id: ConsumerId) -> bool {
        self.inner.consumers.contains_key(&id)
    }

    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.inner
            .latest
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_latest(&self, snapshot: Arc<Snapshot>) {
        let mut guard = self
            .inner
            .latest
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(snapshot);
    }

    fn update_gauge(&self) {
        self.inner.metrics.set_consumers(self.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;
    use crate::snapshot::DeviceReading;
    use std::time::UNIX_EPOCH;

    fn snap(sequence: u64) -> Arc<Snapshot> {
        Arc::new(Snapshot::from_reading(
            sequence,
            UNIX_EPOCH,
            DeviceReading {
                name: "Fake".to_string(),
                ..DeviceReading::default()
            },
        ))
    }

    fn registry(capacity: usize) -> ConsumerRegistry {
        ConsumerRegistry::new(capacity, Metrics::new().unwrap())
    }

    #[tokio::test]
    async fn failed_consumer_is_pruned_and_others_keep_receiving() {
        let registry = registry(8);
        let (first, first_queue) = registry.attach("one");
        let (second, mut second_queue) = registry.attach("two");
        assert_ne!(first, second);

        // The first consumer's connection is gone before the broadcast reaches it.
        drop(first_queue);
        let report = registry.broadcast(&snap(1));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.detached, 1);
        assert!(!registry.contains(first));
        assert!(registry.contains(second));
        assert_eq!(second_queue.next().await.unwrap().sequence, 1);

        let report = registry.broadcast(&snap(2));
        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 0, detached: 0 });
        assert_eq!(second_queue.next().await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn reported_failure_detaches_only_that_consumer() {
        let registry = registry(8);
        let (bad, _bad_queue) = registry.attach("bad");
        let (_, mut good_queue) = registry.attach("good");

        registry.report_failure(&DeliveryError {
            consumer: bad,
            kind: DeliveryFailure::Timeout,
        });
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.broadcast(&snap(1)).delivered, 1);
        assert_eq!(good_queue.next().await.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let registry = registry(8);
        let (id, mut queue) = registry.attach("peer");
        assert!(registry.detach(id));
        assert!(!registry.detach(id));
        assert!(registry.is_empty());
        assert!(queue.next().await.is_none());
    }

    #[tokio::test]
    async fn full_consumer_queue_drops_without_detaching() {
        let registry = registry(1);
        let (id, mut slow) = registry.attach("slow");
        let (_, mut fast) = registry.attach("fast");

        assert_eq!(registry.broadcast(&snap(1)).delivered, 2);
        assert_eq!(fast.next().await.unwrap().sequence, 1);
        let report = registry.broadcast(&snap(2));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 1);
        assert!(registry.contains(id));

        assert_eq!(slow.next().await.unwrap().sequence, 1);
        assert_eq!(fast.next().await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn run_relays_in_order_and_closes_queues_at_end() {
        let registry = registry(16);
        let (_, mut a) = registry.attach("a");
        let (_, mut b) = registry.attach("b");
        let (publisher, stream) = channel::channel(16);

        let relay = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.run(stream).await })
        };
        for seq in 1..=4 {
            publisher.publish(snap(seq));
        }
        drop(publisher);
        relay.await.unwrap();

        for queue in [&mut a, &mut b] {
            let mut seen = Vec::new();
            while let Some(s) = queue.next().await {
                seen.push(s.sequence);
            }
            assert_eq!(seen, vec![1, 2, 3, 4]);
        }
        assert_eq!(registry.latest().unwrap().sequence, 4);
        assert!(registry.is_closed());

        let (late, mut late_queue) = registry.attach("late");
        assert!(!registry.contains(late));
        assert!(late_queue.next().await.is_none());
    }

    #[tokio::test]
    async fn concurrent_attach_detach_during_broadcast() {
        let registry = registry(4);
        let mut workers = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            workers.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let (id, _queue) = registry.attach(format!("worker-{i}"));
                    tokio::task::yield_now().await;
                    registry.detach(id);
                }
            }));
        }
        for seq in 0..200 {
            registry.broadcast(&snap(seq));
            tokio::task::yield_now().await;
        }
        for w in workers {
            w.await.unwrap();
        }
        assert!(registry.is_empty());
    }
}
