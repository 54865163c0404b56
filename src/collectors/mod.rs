pub mod fake;
pub mod nvidia_smi;

use crate::error::{MetricRead, ProviderInitError, ProviderSampleError, ProviderShutdownError};
use crate::snapshot::DeviceReading;

/// Result of one sampling pass. `failed_reads` lists the metrics that stayed zero.
#[derive(Debug, Clone, Default)]
pub struct DeviceSample {
    pub reading: DeviceReading,
    pub failed_reads: Vec<MetricRead>,
}

impl From<DeviceReading> for DeviceSample {
    fn from(reading: DeviceReading) -> Self {
        Self {
            reading,
            failed_reads: Vec::new(),
        }
    }
}

/// Source of device telemetry. Only the sampler's polling task calls into it.
pub trait DeviceProvider: Send + 'static {
    fn initialize(&mut self) -> Result<(), ProviderInitError>;

    fn shutdown(&mut self) -> Result<(), ProviderShutdownError>;

    fn sample_device(&mut self, index: u32) -> Result<DeviceSample, ProviderSampleError>;
}

impl<P: DeviceProvider + ?Sized> DeviceProvider for Box<P> {
    fn initialize(&mut self) -> Result<(), ProviderInitError> {
        (**self).initialize()
    }

    fn shutdown(&mut self) -> Result<(), ProviderShutdownError> {
        (**self).shutdown()
    }

    fn sample_device(&mut self, index: u32) -> Result<DeviceSample, ProviderSampleError> {
        (**self).sample_device(index)
    }
}
