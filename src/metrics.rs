use crate::snapshot::Snapshot;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    device_labels: Arc<Mutex<Option<[String; 2]>>>,
    pub gpu_utilization_percent: GaugeVec,
    pub gpu_memory_used_bytes: GaugeVec,
    pub gpu_memory_total_bytes: GaugeVec,
    pub gpu_memory_usage_percent: GaugeVec,
    pub gpu_temperature_celsius: GaugeVec,
    pub gpu_power_usage_milliwatts: GaugeVec,
    pub gpu_process_count: GaugeVec,
    pub samples_total: Counter,
    pub sample_errors_total: CounterVec,
    pub partial_reads_total: CounterVec,
    pub snapshots_dropped_total: CounterVec,
    pub consumers_attached: Gauge,
    pub consumers_detached_total: CounterVec,
    pub messages_sent_total: Counter,
    pub scrape_count_total: Counter,
    pub uptime_seconds: Gauge,
    pub last_sample_timestamp_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();
        let gpu_labels = &["index", "name"];

        let gpu_utilization_percent = GaugeVec::new(
            opts!(
                "gpuwatch_gpu_utilization_percent",
                "GPU utilization in percent (0..100)"
            ),
            gpu_labels,
        )?;
        let gpu_memory_used_bytes = GaugeVec::new(
            opts!("gpuwatch_gpu_memory_used_bytes", "GPU memory used in bytes"),
            gpu_labels,
        )?;
        let gpu_memory_total_bytes = GaugeVec::new(
            opts!(
                "gpuwatch_gpu_memory_total_bytes",
                "GPU memory total in bytes"
            ),
            gpu_labels,
        )?;
        let gpu_memory_usage_percent = GaugeVec::new(
            opts!(
                "gpuwatch_gpu_memory_usage_percent",
                "GPU memory usage in percent"
            ),
            gpu_labels,
        )?;
        let gpu_temperature_celsius = GaugeVec::new(
            opts!(
                "gpuwatch_gpu_temperature_celsius",
                "GPU temperature in Celsius"
            ),
            gpu_labels,
        )?;
        let gpu_power_usage_milliwatts = GaugeVec::new(
            opts!(
                "gpuwatch_gpu_power_usage_milliwatts",
                "GPU power draw in milliwatts (0 if unsupported)"
            ),
            gpu_labels,
        )?;
        let gpu_process_count = GaugeVec::new(
            opts!(
                "gpuwatch_gpu_process_count",
                "Number of compute processes on the GPU"
            ),
            gpu_labels,
        )?;
        let samples_total = Counter::with_opts(opts!(
            "gpuwatch_samples_total",
            "Snapshots produced by the sampler"
        ))?;
        let sample_errors_total = CounterVec::new(
            opts!(
                "gpuwatch_sample_errors_total",
                "Sampling passes that failed, by failed read"
            ),
            &["read"],
        )?;
        let partial_reads_total = CounterVec::new(
            opts!(
                "gpuwatch_partial_reads_total",
                "Metric reads that failed inside an otherwise published snapshot"
            ),
            &["read"],
        )?;
        let snapshots_dropped_total = CounterVec::new(
            opts!(
                "gpuwatch_snapshots_dropped_total",
                "Snapshots dropped because a buffer was full, by stage"
            ),
            &["stage"],
        )?;
        let consumers_attached = Gauge::with_opts(opts!(
            "gpuwatch_consumers_attached",
            "Currently attached remote consumers"
        ))?;
        let consumers_detached_total = CounterVec::new(
            opts!(
                "gpuwatch_consumers_detached_total",
                "Consumers dropped after a delivery failure, by reason"
            ),
            &["reason"],
        )?;
        let messages_sent_total = Counter::with_opts(opts!(
            "gpuwatch_messages_sent_total",
            "Snapshot messages written to remote consumers"
        ))?;
        let scrape_count_total = Counter::with_opts(opts!(
            "gpuwatch_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let uptime_seconds =
            Gauge::with_opts(opts!("gpuwatch_uptime_seconds", "Daemon uptime in seconds"))?;
        let last_sample_timestamp_seconds = Gauge::with_opts(opts!(
            "gpuwatch_last_sample_timestamp_seconds",
            "Unix timestamp of the last published snapshot"
        ))?;

        register(&registry, &gpu_utilization_percent)?;
        register(&registry, &gpu_memory_used_bytes)?;
        register(&registry, &gpu_memory_total_bytes)?;
        register(&registry, &gpu_memory_usage_percent)?;
        register(&registry, &gpu_temperature_celsius)?;
        register(&registry, &gpu_power_usage_milliwatts)?;
        register(&registry, &gpu_process_count)?;
        register(&registry, &samples_total)?;
        register(&registry, &sample_errors_total)?;
        register(&registry, &partial_reads_total)?;
        register(&registry, &snapshots_dropped_total)?;
        register(&registry, &consumers_attached)?;
        register(&registry, &consumers_detached_total)?;
        register(&registry, &messages_sent_total)?;
        register(&registry, &scrape_count_total)?;
        register(&registry, &uptime_seconds)?;
        register(&registry, &last_sample_timestamp_seconds)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: unix_seconds(SystemTime::now()),
            device_labels: Arc::new(Mutex::new(None)),
            gpu_utilization_percent,
            gpu_memory_used_bytes,
            gpu_memory_total_bytes,
            gpu_memory_usage_percent,
            gpu_temperature_celsius,
            gpu_power_usage_milliwatts,
            gpu_process_count,
            samples_total,
            sample_errors_total,
            partial_reads_total,
            snapshots_dropped_total,
            consumers_attached,
            consumers_detached_total,
            messages_sent_total,
            scrape_count_total,
            uptime_seconds,
            last_sample_timestamp_seconds,
        }))
    }

    pub fn record_sample(&self, snapshot: &Snapshot) {
        self.samples_total.inc();

        let index = snapshot.device_index.to_string();
        let labels = [index.as_str(), snapshot.name.as_str()];
        self.gpu_utilization_percent
            .with_label_values(&labels)
            .set(snapshot.utilization_percent as f64);
        self.gpu_memory_used_bytes
            .with_label_values(&labels)
            .set(snapshot.memory_used_bytes as f64);
        self.gpu_memory_total_bytes
            .with_label_values(&labels)
            .set(snapshot.memory_total_bytes as f64);
        self.gpu_memory_usage_percent
            .with_label_values(&labels)
            .set(snapshot.memory_usage_percent());
        self.gpu_temperature_celsius
            .with_label_values(&labels)
            .set(snapshot.temperature_celsius as f64);
        self.gpu_power_usage_milliwatts
            .with_label_values(&labels)
            .set(snapshot.power_usage_milliwatts as f64);
        self.gpu_process_count
            .with_label_values(&labels)
            .set(snapshot.process_count as f64);

        self.last_sample_timestamp_seconds
            .set(unix_seconds(snapshot.sampled_at) as f64);

        // Series are overwritten in place; only a relabelled device drops its old ones.
        let current = [index.clone(), snapshot.name.clone()];
        let previous = self
            .device_labels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(current.clone());
        if let Some(previous) = previous.filter(|p| *p != current) {
            let stale = [previous[0].as_str(), previous[1].as_str()];
            for gauge in self.device_gauges() {
                let _ = gauge.remove_label_values(&stale);
            }
        }
    }

    fn device_gauges(&self) -> [&GaugeVec; 7] {
        [
            &self.gpu_utilization_percent,
            &self.gpu_memory_used_bytes,
            &self.gpu_memory_total_bytes,
            &self.gpu_memory_usage_percent,
            &self.gpu_temperature_celsius,
            &self.gpu_power_usage_milliwatts,
            &self.gpu_process_count,
        ]
    }

    pub fn inc_sample_error(&self, read: &str) {
        self.sample_errors_total.with_label_values(&[read]).inc();
    }

    pub fn inc_partial_read(&self, read: &str) {
        self.partial_reads_total.with_label_values(&[read]).inc();
    }

    pub fn inc_dropped(&self, stage: &str) {
        self.snapshots_dropped_total
            .with_label_values(&[stage])
            .inc();
    }

    pub fn set_consumers(&self, count: usize) {
        self.consumers_attached.set(count as f64);
    }

    pub fn inc_detached(&self, reason: &str) {
        self.consumers_detached_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn inc_message_sent(&self) {
        self.messages_sent_total.inc();
    }

    pub fn inc_scrape_count(&self) {
        self.scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let uptime = unix_seconds(SystemTime::now()).saturating_sub(self.started_at_unix);
        self.uptime_seconds.set(uptime as f64);

        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn unix_seconds(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::DeviceReading;

    #[test]
    fn sample_updates_device_gauges() {
        let metrics = Metrics::new().expect("metrics registry");
        let snapshot = Snapshot::from_reading(
            1,
            SystemTime::now(),
            DeviceReading {
                name: "Fake".to_string(),
                memory_total_bytes: 1000,
                memory_used_bytes: 250,
                memory_free_bytes: 750,
                utilization_percent: 10,
                temperature_celsius: 40,
                ..DeviceReading::default()
            },
        );
        metrics.record_sample(&snapshot);
        metrics.inc_dropped("channel");
        metrics.inc_sample_error("device_lookup");

        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("gpuwatch_samples_total 1"));
        assert!(text.contains(
            "gpuwatch_gpu_memory_usage_percent{index=\"0\",name=\"Fake\"} 25"
        ));
        assert!(text.contains("gpuwatch_snapshots_dropped_total{stage=\"channel\"} 1"));
        assert!(text.contains("gpuwatch_sample_errors_total{read=\"device_lookup\"} 1"));
        assert!(text.contains("gpuwatch_uptime_seconds"));
    }

    #[test]
    fn renamed_device_replaces_its_series() {
        let metrics = Metrics::new().expect("metrics registry");
        let named = |name: &str, utilization: u32| {
            Snapshot::from_reading(
                1,
                SystemTime::now(),
                DeviceReading {
                    name: name.to_string(),
                    utilization_percent: utilization,
                    ..DeviceReading::default()
                },
            )
        };

        metrics.record_sample(&named("Old", 10));
        metrics.record_sample(&named("Old", 20));
        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("gpuwatch_gpu_utilization_percent{index=\"0\",name=\"Old\"} 20"));

        metrics.record_sample(&named("New", 30));
        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("gpuwatch_gpu_utilization_percent{index=\"0\",name=\"New\"} 30"));
        assert!(!text.contains("name=\"Old\""));
    }
}
