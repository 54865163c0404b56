use crate::channel::{self, PublishOutcome, Publisher, SnapshotStream};
use crate::collectors::DeviceProvider;
use crate::error::SamplerError;
use crate::metrics::Metrics;
use crate::snapshot::Snapshot;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub interval: Duration,
    pub device_index: u32,
    pub buffer_capacity: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            device_index: 0,
            buffer_capacity: channel::DEFAULT_CAPACITY,
        }
    }
}

/// A sampler that has not been started yet.
pub struct Sampler<P> {
    provider: P,
    cfg: SamplerConfig,
    metrics: Arc<Metrics>,
}

impl<P: DeviceProvider> Sampler<P> {
    pub fn new(provider: P, cfg: SamplerConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            provider,
            cfg,
            metrics,
        }
    }

    /// Initializes the provider and spawns the polling loop.
    ///
    /// On an initialization failure nothing is spawned and the provider is dropped.
    pub fn start(mut self) -> Result<RunningSampler<P>, SamplerError> {
        self.provider.initialize()?;
        info!(
            interval_ms = self.cfg.interval.as_millis() as u64,
            device_index = self.cfg.device_index,
            buffer_capacity = self.cfg.buffer_capacity,
            "sampler started"
        );

        let (publisher, stream) = channel::channel(self.cfg.buffer_capacity);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(poll_loop(
            self.provider,
            self.cfg,
            publisher,
            self.metrics,
            stop_rx,
        ));

        Ok(RunningSampler {
            stop_tx,
            task: Some(task),
            stream: Some(stream),
        })
    }
}

/// Handle to a started sampler. Owns the polling task until [`RunningSampler::stop`].
///
/// Dropping the handle only signals the loop to exit; the provider is released
/// without `shutdown`. Await [`RunningSampler::stop`] to shut it down.
pub struct RunningSampler<P> {
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<Option<P>>>,
    stream: Option<SnapshotStream>,
}

impl<P: DeviceProvider> RunningSampler<P> {
    /// Hands out the single reader of the snapshot stream. Later calls return `None`.
    pub fn take_stream(&mut self) -> Option<SnapshotStream> {
        self.stream.take()
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_none()
    }

    /// Stops the loop, waits for it to exit, then shuts the provider down.
    /// Calling it again is a no-op.
    ///
    /// Returns without waiting on a sample that is still in flight; that provider
    /// is abandoned and never shut down.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            debug!("sampler already stopped");
            return;
        };
        let _ = self.stop_tx.send(true);

        match task.await {
            Ok(Some(mut provider)) => match provider.shutdown() {
                Ok(()) => info!("sampler stopped"),
                Err(err) => warn!(error = %err, "device provider shutdown failed"),
            },
            Ok(None) => warn!("sampler stopped with a sample in flight, provider abandoned"),
            Err(err) => error!(error = %err, "sampler task ended abnormally"),
        }
    }
}

impl<P> Drop for RunningSampler<P> {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}

/// Returns the provider on a clean exit, `None` when it was left behind in a
/// blocked or panicked sample.
async fn poll_loop<P: DeviceProvider>(
    mut provider: P,
    cfg: SamplerConfig,
    publisher: Publisher,
    metrics: Arc<Metrics>,
    mut stop: watch::Receiver<bool>,
) -> Option<P> {
    let period = cfg.interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let index = cfg.device_index;
    let mut sequence = 0_u64;

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => {
                info!("stop signal received, leaving sampling loop");
                break;
            }
            _ = ticker.tick() => {}
        }

        // Providers may block (external commands, driver calls); keep them off the runtime.
        let in_flight = tokio::task::spawn_blocking(move || {
            let result = provider.sample_device(index);
            (provider, result)
        });
        let joined = tokio::select! {
            biased;
            _ = stop.changed() => {
                warn!(index, "stop signal received while sampling, abandoning in-flight sample");
                return None;
            }
            joined = in_flight => joined,
        };
        let result = match joined {
            Ok((returned, result)) => {
                provider = returned;
                result
            }
            Err(err) => {
                error!(error = %err, "sampling task panicked");
                return None;
            }
        };

        let sample = match result {
            Ok(sample) => sample,
            Err(err) => {
                metrics.inc_sample_error(err.read.as_str());
                warn!(error = %err, "sampling failed, waiting for next tick");
                continue;
            }
        };
        for read in &sample.failed_reads {
            metrics.inc_partial_read(read.as_str());
            warn!(index, read = %read, "metric read failed, field left at zero");
        }

        sequence += 1;
        let snapshot = Arc::new(Snapshot::from_reading(
            sequence,
            SystemTime::now(),
            sample.reading,
        ));
        metrics.record_sample(&snapshot);
        match publisher.publish(snapshot) {
            PublishOutcome::Delivered => {}
            PublishOutcome::Dropped => {
                metrics.inc_dropped("channel");
                debug!(sequence, "distribution buffer full, snapshot dropped");
            }
            PublishOutcome::Closed => {
                debug!(sequence, "no reader attached to the distribution channel");
            }
        }
    }

    Some(provider)
}
