use crate::collectors::{DeviceProvider, DeviceSample};
use crate::error::{MetricRead, ProviderInitError, ProviderSampleError, ProviderShutdownError};
use crate::snapshot::DeviceReading;
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const GPU_QUERY: &str = "--query-gpu=index,name,uuid,memory.total,memory.used,memory.free,utilization.gpu,temperature.gpu,power.draw";
const APPS_QUERY: &str = "--query-compute-apps=gpu_uuid,pid";
const CSV_FORMAT: &str = "--format=csv,noheader,nounits";
const MIB: u64 = 1024 * 1024;
const POLL_STEP: Duration = Duration::from_millis(10);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Reads device telemetry through the `nvidia-smi` command line tool.
///
/// Every invocation is killed once it runs past the command timeout.
pub struct NvidiaSmiProvider {
    binary: String,
    timeout: Duration,
    initialized: bool,
}

impl NvidiaSmiProvider {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            initialized: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn run(&self, args: &[&str]) -> Result<String, String> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        run_with_deadline(&mut cmd, self.timeout)
            .map_err(|reason| format!("{}: {reason}", self.binary))
    }
}

impl DeviceProvider for NvidiaSmiProvider {
    fn initialize(&mut self) -> Result<(), ProviderInitError> {
        let text = self
            .run(&["--query-gpu=count", CSV_FORMAT])
            .map_err(|reason| ProviderInitError { reason })?;
        let count = text
            .lines()
            .next()
            .and_then(parse_u64_loose)
            .unwrap_or(0);
        if count == 0 {
            return Err(ProviderInitError {
                reason: "no devices reported".to_string(),
            });
        }
        self.initialized = true;
        info!(binary = %self.binary, devices = count, "nvidia-smi provider ready");
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), ProviderShutdownError> {
        if !self.initialized {
            return Err(ProviderShutdownError {
                reason: "provider was not initialized".to_string(),
            });
        }
        self.initialized = false;
        info!("nvidia-smi provider shut down");
        Ok(())
    }

    fn sample_device(&mut self, index: u32) -> Result<DeviceSample, ProviderSampleError> {
        let lookup_error = |reason: String| ProviderSampleError {
            index,
            read: MetricRead::DeviceLookup,
            reason,
        };
        if !self.initialized {
            return Err(lookup_error("provider is not initialized".to_string()));
        }

        let index_arg = index.to_string();
        let text = self
            .run(&[GPU_QUERY, CSV_FORMAT, "-i", &index_arg])
            .map_err(lookup_error)?;
        let line = text
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| lookup_error(format!("no output for device {index}")))?;
        let (mut sample, uuid) = parse_gpu_line(index, line)?;

        match self.run(&[APPS_QUERY, CSV_FORMAT]) {
            Ok(apps) => sample.reading.process_count = count_compute_apps(&apps, &uuid),
            Err(reason) => {
                debug!(index, reason = %reason, "compute apps query failed");
                sample.failed_reads.push(MetricRead::Processes);
            }
        }

        Ok(sample)
    }
}

/// Runs `cmd` to completion and returns its stdout, killing it after `timeout`.
fn run_with_deadline(cmd: &mut Command, timeout: Duration) -> Result<String, String> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| format!("failed to run: {err}"))?;

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if started.elapsed() >= timeout => {
                let _ = child.kill();
                let _ = child.wait();
                warn!(timeout_ms = timeout.as_millis() as u64, "command timed out, killed");
                return Err(format!("timed out after {}ms", timeout.as_millis()));
            }
            Ok(None) => thread::sleep(POLL_STEP),
            Err(err) => return Err(format!("failed to wait: {err}")),
        }
    };

    let mut stdout = Vec::new();
    if let Some(mut pipe) = child.stdout.take() {
        pipe.read_to_end(&mut stdout)
            .map_err(|err| format!("failed to read output: {err}"))?;
    }
    if !status.success() {
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        return Err(format!("exited with {status}: {}", stderr.trim()));
    }
    String::from_utf8(stdout).map_err(|err| format!("non utf-8 output: {err}"))
}

/// Parses one CSV row of the GPU query. Unreadable columns stay zero and are listed as failed.
fn parse_gpu_line(index: u32, line: &str) -> Result<(DeviceSample, String), ProviderSampleError> {
    let parts: Vec<&str> = line.split(',').map(|v| v.trim()).collect();
    if parts.len() < 9 {
        return Err(ProviderSampleError {
            index,
            read: MetricRead::DeviceLookup,
            reason: format!("expected 9 columns, got {}", parts.len()),
        });
    }

    let mut reading = DeviceReading {
        device_index: index,
        ..DeviceReading::default()
    };
    let mut failed_reads = Vec::new();

    if is_unavailable(parts[1]) {
        failed_reads.push(MetricRead::Name);
    } else {
        reading.name = parts[1].to_string();
    }

    match (
        parse_u64_loose(parts[3]),
        parse_u64_loose(parts[4]),
        parse_u64_loose(parts[5]),
    ) {
        (Some(total), Some(used), Some(free)) => {
            // Newer drivers report a reserved pool outside used/free; count it as used.
            let reserved = total.saturating_sub(used.saturating_add(free));
            reading.memory_total_bytes = total.saturating_mul(MIB);
            reading.memory_used_bytes = used.saturating_add(reserved).saturating_mul(MIB);
            reading.memory_free_bytes = free.saturating_mul(MIB);
        }
        _ => failed_reads.push(MetricRead::Memory),
    }

    match parse_u64_loose(parts[6]) {
        Some(v) => reading.utilization_percent = v.min(100) as u32,
        None => failed_reads.push(MetricRead::Utilization),
    }

    match parse_u64_loose(parts[7]) {
        Some(v) => reading.temperature_celsius = v.min(u32::MAX as u64) as u32,
        None => failed_reads.push(MetricRead::Temperature),
    }

    // Boards without power sensors report "[Not Supported]"; that is not a failure.
    if !is_unsupported(parts[8]) {
        match parse_f64_loose(parts[8]) {
            Some(watts) if watts >= 0.0 => {
                reading.power_usage_milliwatts = (watts * 1000.0).round() as u32;
            }
            _ => failed_reads.push(MetricRead::Power),
        }
    }

    Ok((
        DeviceSample {
            reading,
            failed_reads,
        },
        parts[2].to_string(),
    ))
}

fn count_compute_apps(text: &str, uuid: &str) -> u32 {
    text.lines()
        .filter_map(|line| line.split(',').next())
        .filter(|gpu_uuid| gpu_uuid.trim() == uuid)
        .count() as u32
}

fn is_unavailable(value: &str) -> bool {
    value.is_empty() || value.starts_with('[')
}

fn is_unsupported(value: &str) -> bool {
    value.eq_ignore_ascii_case("[not supported]") || value.eq_ignore_ascii_case("[n/a]")
}

fn parse_f64_loose(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }

    if let Ok(v) = trimmed.replace(',', ".").parse::<f64>() {
        return Some(v);
    }

    let filtered: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-' || *c == '+')
        .collect();
    if filtered.is_empty() {
        return None;
    }

    filtered.parse::<f64>().ok()
}

fn parse_u64_loose(input: &str) -> Option<u64> {
    parse_f64_loose(input).map(|v| if v < 0.0 { 0 } else { v as u64 })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str =
        "0, NVIDIA GeForce RTX 3080, GPU-abc, 10240, 2048, 8192, 37, 61, 112.45";

    #[test]
    fn parses_full_row() {
        let (sample, uuid) = parse_gpu_line(0, LINE).unwrap();
        assert!(sample.failed_reads.is_empty());
        assert_eq!(uuid, "GPU-abc");
        let r = sample.reading;
        assert_eq!(r.name, "NVIDIA GeForce RTX 3080");
        assert_eq!(r.memory_total_bytes, 10240 * MIB);
        assert_eq!(
            r.memory_used_bytes + r.memory_free_bytes,
            r.memory_total_bytes
        );
        assert_eq!(r.utilization_percent, 37);
        assert_eq!(r.temperature_celsius, 61);
        assert_eq!(r.power_usage_milliwatts, 112_450);
    }

    #[test]
    fn unreadable_columns_are_left_zero() {
        let line = "0, Tesla T4, GPU-x, 15360, [N/A], 15000, 5, [Unknown Error], [Not Supported]";
        let (sample, _) = parse_gpu_line(0, line).unwrap();
        assert_eq!(
            sample.failed_reads,
            vec![MetricRead::Memory, MetricRead::Temperature]
        );
        assert_eq!(sample.reading.memory_total_bytes, 0);
        assert_eq!(sample.reading.temperature_celsius, 0);
        assert_eq!(sample.reading.utilization_percent, 5);
        assert_eq!(sample.reading.power_usage_milliwatts, 0);
    }

    #[test]
    fn reserved_memory_is_counted_as_used() {
        let line = "0, NVIDIA L4, GPU-r, 23034, 0, 22563, 0, 35, 16.31";
        let (sample, _) = parse_gpu_line(0, line).unwrap();
        let r = sample.reading;
        assert!(sample.failed_reads.is_empty());
        assert_eq!(r.memory_used_bytes, 471 * MIB);
        assert_eq!(
            r.memory_used_bytes + r.memory_free_bytes,
            r.memory_total_bytes
        );
    }

    #[test]
    fn short_row_is_a_lookup_failure() {
        let err = parse_gpu_line(3, "0, Tesla").unwrap_err();
        assert_eq!(err.index, 3);
        assert_eq!(err.read, MetricRead::DeviceLookup);
    }

    #[test]
    fn counts_only_apps_on_the_sampled_device() {
        let apps = "GPU-abc, 100\nGPU-def, 200\nGPU-abc, 300\n";
        assert_eq!(count_compute_apps(apps, "GPU-abc"), 2);
        assert_eq!(count_compute_apps("", "GPU-abc"), 0);
    }

    #[test]
    fn sampling_before_initialize_fails() {
        let mut provider = NvidiaSmiProvider::new("nvidia-smi");
        let err = provider.sample_device(0).unwrap_err();
        assert_eq!(err.read, MetricRead::DeviceLookup);
        assert!(provider.shutdown().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn hung_command_is_killed_at_deadline() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let started = Instant::now();
        let err = run_with_deadline(&mut cmd, Duration::from_millis(200)).unwrap_err();
        assert!(err.contains("timed out"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_reports_exit_status() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo broken >&2; exit 3"]);
        let err = run_with_deadline(&mut cmd, Duration::from_secs(5)).unwrap_err();
        assert!(err.contains("broken"), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn finished_command_returns_stdout() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo 1"]);
        let out = run_with_deadline(&mut cmd, Duration::from_secs(5)).unwrap();
        assert_eq!(out.trim(), "1");
    }

    #[test]
    fn missing_binary_fails_initialize() {
        let mut provider = NvidiaSmiProvider::new("/nonexistent/nvidia-smi");
        assert!(provider.initialize().is_err());
    }
}
