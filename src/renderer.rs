use crate::channel::SnapshotStream;
use crate::snapshot::Snapshot;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, warn};

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

/// Repaints a full-screen view for every snapshot it receives.
pub struct Renderer<W> {
    out: W,
    last: Option<Arc<Snapshot>>,
}

impl<W: Write> Renderer<W> {
    pub fn new(out: W) -> Self {
        Self { out, last: None }
    }

    /// Renders until the stream ends and returns the last snapshot shown.
    pub async fn run(mut self, mut stream: SnapshotStream) -> Option<Arc<Snapshot>> {
        while let Some(snapshot) = stream.next().await {
            self.show(snapshot);
        }
        debug!("snapshot stream ended, renderer stopped");
        self.last
    }

    pub fn show(&mut self, snapshot: Arc<Snapshot>) {
        let frame = render_frame(&snapshot);
        if let Err(err) = self
            .out
            .write_all(frame.as_bytes())
            .and_then(|_| self.out.flush())
        {
            warn!(error = %err, "failed to paint terminal frame");
        }
        self.last = Some(snapshot);
    }

    pub fn last(&self) -> Option<&Arc<Snapshot>> {
        self.last.as_ref()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

pub fn render_frame(s: &Snapshot) -> String {
    let name = if s.name.is_empty() {
        "n/a"
    } else {
        s.name.as_str()
    };
    format!(
        "{CLEAR_SCREEN}\
╔══════════════════════════════════════════╗\n\
║             GPU WATCH MONITOR            ║\n\
╚══════════════════════════════════════════╝\n\
\n\
GPU {}: {}\n\
Memory Usage: {:.2}/{:.2} GB ({:.1}%)\n\
GPU Utilization: {}%\n\
Temperature: {}°C\n\
Power Draw: {:.1} W\n\
Process Count: {}\n\
\n\
Sampled at {}\n\
Press Ctrl+C to exit\n",
        s.device_index,
        name,
        bytes_to_gb(s.memory_used_bytes),
        bytes_to_gb(s.memory_total_bytes),
        s.memory_usage_percent(),
        s.utilization_percent,
        s.temperature_celsius,
        s.power_usage_milliwatts as f64 / 1000.0,
        s.process_count,
        humantime::format_rfc3339_seconds(s.sampled_at),
    )
}

fn bytes_to_gb(bytes: u64) -> f64 {
    (bytes as f64) / 1024.0 / 1024.0 / 1024.0
}
