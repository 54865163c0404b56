use serde::Serialize;
use std::time::SystemTime;

/// Raw values read from a device in one pass. Fields whose read failed stay zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceReading {
    pub device_index: u32,
    pub name: String,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub memory_free_bytes: u64,
    pub utilization_percent: u32,
    pub temperature_celsius: u32,
    pub power_usage_milliwatts: u32,
    pub process_count: u32,
}

/// One immutable sampled measurement. Published behind an `Arc` and never mutated.
///
/// Serializes to the broadcast wire format; `sequence` and `sampled_at` are local only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    #[serde(skip)]
    pub sequence: u64,
    #[serde(skip)]
    pub sampled_at: SystemTime,
    #[serde(rename = "index")]
    pub device_index: u32,
    pub name: String,
    #[serde(rename = "memory_total")]
    pub memory_total_bytes: u64,
    #[serde(rename = "memory_used")]
    pub memory_used_bytes: u64,
    #[serde(rename = "memory_free")]
    pub memory_free_bytes: u64,
    #[serde(rename = "utilization")]
    pub utilization_percent: u32,
    #[serde(rename = "temperature")]
    pub temperature_celsius: u32,
    #[serde(rename = "power_usage")]
    pub power_usage_milliwatts: u32,
    pub process_count: u32,
}

impl Snapshot {
    pub fn from_reading(sequence: u64, sampled_at: SystemTime, reading: DeviceReading) -> Self {
        Self {
            sequence,
            sampled_at,
            device_index: reading.device_index,
            name: reading.name,
            memory_total_bytes: reading.memory_total_bytes,
            memory_used_bytes: reading.memory_used_bytes,
            memory_free_bytes: reading.memory_free_bytes,
            utilization_percent: reading.utilization_percent,
            temperature_celsius: reading.temperature_celsius,
            power_usage_milliwatts: reading.power_usage_milliwatts,
            process_count: reading.process_count,
        }
    }

    pub fn memory_usage_percent(&self) -> f64 {
        if self.memory_total_bytes == 0 {
            return 0.0;
        }
        (self.memory_used_bytes as f64 / self.memory_total_bytes as f64) * 100.0
    }

    /// Device values only, without the local sequence and timestamp.
    pub fn reading(&self) -> DeviceReading {
        DeviceReading {
            device_index: self.device_index,
            name: self.name.clone(),
            memory_total_bytes: self.memory_total_bytes,
            memory_used_bytes: self.memory_used_bytes,
            memory_free_bytes: self.memory_free_bytes,
            utilization_percent: self.utilization_percent,
            temperature_celsius: self.temperature_celsius,
            power_usage_milliwatts: self.power_usage_milliwatts,
            process_count: self.process_count,
        }
    }
}

/// Encodes a snapshot as one broadcast message.
pub fn encode_snapshot(snapshot: &Snapshot) -> Result<String, serde_json::Error> {
    serde_json::to_string(snapshot)
}
