use crate::registry::ConsumerId;
use std::fmt;
use thiserror::Error;

/// Step of a sampling pass that can fail on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricRead {
    DeviceLookup,
    Name,
    Memory,
    Utilization,
    Temperature,
    Power,
    Processes,
}

impl MetricRead {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeviceLookup => "device_lookup",
            Self::Name => "name",
            Self::Memory => "memory",
            Self::Utilization => "utilization",
            Self::Temperature => "temperature",
            Self::Power => "power",
            Self::Processes => "processes",
        }
    }
}

impl fmt::Display for MetricRead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("device provider failed to initialize: {reason}")]
pub struct ProviderInitError {
    pub reason: String,
}

#[derive(Debug, Clone, Error)]
#[error("device provider failed to shut down: {reason}")]
pub struct ProviderShutdownError {
    pub reason: String,
}

#[derive(Debug, Clone, Error)]
#[error("sampling device {index} failed at {read}: {reason}")]
pub struct ProviderSampleError {
    pub index: u32,
    pub read: MetricRead,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error(transparent)]
    ProviderInit(#[from] ProviderInitError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    Timeout,
    Transport,
    Closed,
}

impl DeliveryFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("delivery to consumer {consumer} failed: {}", .kind.as_str())]
pub struct DeliveryError {
    pub consumer: ConsumerId,
    pub kind: DeliveryFailure,
}
