use crate::collectors::{DeviceProvider, DeviceSample};
use crate::error::{MetricRead, ProviderInitError, ProviderSampleError, ProviderShutdownError};
use crate::snapshot::DeviceReading;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const DEMO_MEMORY_TOTAL: u64 = 8 * 1024 * 1024 * 1024;

/// Call counters shared between a fake provider and the test that drives it.
#[derive(Debug, Default)]
pub struct FakeCounters {
    initialize: AtomicUsize,
    shutdown: AtomicUsize,
    sample: AtomicUsize,
}

impl FakeCounters {
    pub fn initialize_calls(&self) -> usize {
        self.initialize.load(Ordering::SeqCst)
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn sample_calls(&self) -> usize {
        self.sample.load(Ordering::SeqCst)
    }
}

enum Script {
    Repeat(Vec<Result<DeviceSample, ProviderSampleError>>),
    Once(VecDeque<Result<DeviceSample, ProviderSampleError>>),
    Synthetic,
}

/// In-memory provider: scripted responses for tests, a synthetic device for demo mode.
pub struct FakeProvider {
    script: Script,
    fail_init: Option<String>,
    counters: Arc<FakeCounters>,
}

impl FakeProvider {
    /// Returns the same reading on every call.
    pub fn constant(reading: DeviceReading) -> Self {
        Self::cycling(vec![Ok(reading.into())])
    }

    /// Replays `responses` in order, starting over after the last one.
    pub fn cycling(responses: Vec<Result<DeviceSample, ProviderSampleError>>) -> Self {
        Self::with_script(Script::Repeat(responses))
    }

    /// Replays `responses` once, then reports the device as missing.
    pub fn scripted(responses: Vec<Result<DeviceSample, ProviderSampleError>>) -> Self {
        Self::with_script(Script::Once(responses.into()))
    }

    /// A device whose load and temperature drift over time.
    pub fn synthetic() -> Self {
        Self::with_script(Script::Synthetic)
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            fail_init: None,
            counters: Arc::new(FakeCounters::default()),
        }
    }

    pub fn failing_init(mut self, reason: impl Into<String>) -> Self {
        self.fail_init = Some(reason.into());
        self
    }

    pub fn counters(&self) -> Arc<FakeCounters> {
        self.counters.clone()
    }
}

impl DeviceProvider for FakeProvider {
    fn initialize(&mut self) -> Result<(), ProviderInitError> {
        self.counters.initialize.fetch_add(1, Ordering::SeqCst);
        match &self.fail_init {
            Some(reason) => Err(ProviderInitError {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn shutdown(&mut self) -> Result<(), ProviderShutdownError> {
        self.counters.shutdown.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn sample_device(&mut self, index: u32) -> Result<DeviceSample, ProviderSampleError> {
        let call = self.counters.sample.fetch_add(1, Ordering::SeqCst);
        match &mut self.script {
            Script::Repeat(responses) if !responses.is_empty() => {
                responses[call % responses.len()].clone()
            }
            Script::Once(responses) => responses.pop_front().unwrap_or_else(|| {
                Err(ProviderSampleError {
                    index,
                    read: MetricRead::DeviceLookup,
                    reason: "script exhausted".to_string(),
                })
            }),
            Script::Synthetic => Ok(synthetic_reading(index, call).into()),
            Script::Repeat(_) => Err(ProviderSampleError {
                index,
                read: MetricRead::DeviceLookup,
                reason: "no responses configured".to_string(),
            }),
        }
    }
}

fn synthetic_reading(index: u32, call: usize) -> DeviceReading {
    // Triangle waves keep the values deterministic without a random source.
    let phase = (call % 40) as u64;
    let wave = if phase < 20 { phase } else { 40 - phase };
    let memory_used = DEMO_MEMORY_TOTAL / 4 + DEMO_MEMORY_TOTAL / 40 * wave;
    DeviceReading {
        device_index: index,
        name: "Demo Accelerator".to_string(),
        memory_total_bytes: DEMO_MEMORY_TOTAL,
        memory_used_bytes: memory_used,
        memory_free_bytes: DEMO_MEMORY_TOTAL - memory_used,
        utilization_percent: (wave * 5) as u32,
        temperature_celsius: 40 + wave as u32,
        power_usage_milliwatts: 30_000 + wave as u32 * 4_000,
        process_count: (wave / 5) as u32,
    }
}
