use crate::channel::{Fanout, SnapshotStream};
use crate::collectors::DeviceProvider;
use crate::error::SamplerError;
use crate::metrics::Metrics;
use crate::sampler::{RunningSampler, Sampler, SamplerConfig};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::error;

/// A running sampler plus the fan-out stage that serves its consumers.
pub struct Pipeline<P> {
    sampler: RunningSampler<P>,
    fanout: Fanout,
    fanout_task: Option<JoinHandle<()>>,
}

impl<P: DeviceProvider> Pipeline<P> {
    pub fn start(
        provider: P,
        cfg: SamplerConfig,
        branch_capacity: usize,
        metrics: Arc<Metrics>,
    ) -> Result<Self, SamplerError> {
        let mut sampler = Sampler::new(provider, cfg, metrics.clone()).start()?;
        let fanout = Fanout::new(branch_capacity, metrics);
        let fanout_task = sampler.take_stream().map(|source| fanout.spawn(source));
        Ok(Self {
            sampler,
            fanout,
            fanout_task,
        })
    }

    /// A private branch receiving every snapshot published from now on.
    pub fn subscribe(&self) -> SnapshotStream {
        self.fanout.subscribe()
    }

    /// Stops sampling and waits until every branch has seen end-of-stream.
    pub async fn stop(&mut self) {
        self.sampler.stop().await;
        if let Some(task) = self.fanout_task.take() {
            if let Err(err) = task.await {
                error!(error = %err, "fan-out task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::fake::FakeProvider;
    use crate::registry::ConsumerRegistry;
    use crate::renderer::{render_frame, Renderer};
    use crate::snapshot::DeviceReading;
    use std::time::Duration;

    fn fake_reading() -> DeviceReading {
        DeviceReading {
            device_index: 0,
            name: "Fake".to_string(),
            memory_total_bytes: 1000,
            memory_used_bytes: 250,
            memory_free_bytes: 750,
            utilization_percent: 10,
            temperature_celsius: 40,
            power_usage_milliwatts: 0,
            process_count: 0,
        }
    }

    fn cfg() -> SamplerConfig {
        SamplerConfig {
            interval: Duration::from_millis(10),
            ..SamplerConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn renderer_shows_last_snapshot_after_three_ticks() {
        let provider = FakeProvider::constant(fake_reading());
        let counters = provider.counters();
        let mut pipeline = Pipeline::start(provider, cfg(), 16, Metrics::new().unwrap()).unwrap();
        let renderer = tokio::spawn(Renderer::new(Vec::new()).run(pipeline.subscribe()));

        tokio::time::sleep(Duration::from_millis(35)).await;
        pipeline.stop().await;

        let last = renderer.await.unwrap().expect("renderer saw a snapshot");
        assert_eq!(counters.sample_calls(), 3);
        assert_eq!(last.sequence, 3);
        assert_eq!(last.reading(), fake_reading());
        assert!(render_frame(&last).contains("(25.0%)"));
        assert_eq!(counters.shutdown_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn renderer_and_registry_share_one_sampler() {
        let metrics = Metrics::new().unwrap();
        let mut pipeline =
            Pipeline::start(FakeProvider::constant(fake_reading()), cfg(), 16, metrics.clone())
                .unwrap();
        let registry = ConsumerRegistry::new(16, metrics);
        let (dropped, dropped_queue) = registry.attach("leaves-early");
        let (kept, mut kept_queue) = registry.attach("stays");

        let renderer = tokio::spawn(Renderer::new(Vec::new()).run(pipeline.subscribe()));
        let relay = {
            let registry = registry.clone();
            let stream = pipeline.subscribe();
            tokio::spawn(async move { registry.run(stream).await })
        };

        assert_eq!(kept_queue.next().await.unwrap().sequence, 1);
        drop(dropped_queue);
        assert_eq!(kept_queue.next().await.unwrap().sequence, 2);
        assert!(!registry.contains(dropped));
        assert!(registry.contains(kept));

        pipeline.stop().await;
        relay.await.unwrap();
        let last = renderer.await.unwrap().unwrap();

        let mut tail = Vec::new();
        while let Some(s) = kept_queue.next().await {
            tail.push(s.sequence);
        }
        let expected: Vec<u64> = (3..=last.sequence).collect();
        assert_eq!(tail, expected);
        assert!(registry.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn init_failure_starts_nothing() {
        let provider = FakeProvider::constant(fake_reading()).failing_init("driver not loaded");
        let counters = provider.counters();
        let result = Pipeline::start(provider, cfg(), 16, Metrics::new().unwrap());
        assert!(matches!(result, Err(SamplerError::ProviderInit(_))));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counters.sample_calls(), 0);
    }
}
