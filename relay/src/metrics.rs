//! Metrics Collection for the Mirrorgate Relay
//!
//! Provides atomic counters, latency histograms, and a
//! Prometheus-compatible /metrics endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::inline::InlineReport;

/// Which path served a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Page,
    Media,
    Iframe,
    Assemble,
    Tunnel,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Page => "page",
            Mode::Media => "media",
            Mode::Iframe => "iframe",
            Mode::Assemble => "assemble",
            Mode::Tunnel => "tunnel",
        }
    }

    const ALL: [Mode; 5] = [Mode::Page, Mode::Media, Mode::Iframe, Mode::Assemble, Mode::Tunnel];
}

/// Relay-wide metrics
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    /// Total requests processed
    total_requests: AtomicU64,
    /// Open tunnel connections
    active_tunnels: AtomicU64,
    /// Status code counts
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    /// Body bytes sent to clients
    bytes_out: AtomicU64,
    /// Inline resources scheduled vs embedded
    inline_requested: AtomicU64,
    inline_embedded: AtomicU64,
    /// Latency tracking
    latencies: Mutex<LatencyHistogram>,
    /// Per-mode metrics
    mode_metrics: Mutex<HashMap<Mode, ModeMetrics>>,
}

/// Latency histogram for percentile calculation
struct LatencyHistogram {
    /// Recent latencies (ring buffer, microseconds)
    values: Vec<u64>,
    /// Write position
    pos: usize,
    /// Total count
    count: u64,
    /// Sum for average
    sum: u64,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self {
            values: vec![0; capacity],
            pos: 0,
            count: 0,
            sum: 0,
        }
    }

    fn record(&mut self, latency_us: u64) {
        self.values[self.pos] = latency_us;
        self.pos = (self.pos + 1) % self.values.len();
        self.count += 1;
        self.sum += latency_us;
    }

    fn percentile(&self, p: f64) -> u64 {
        let count = self.count.min(self.values.len() as u64) as usize;
        if count == 0 {
            return 0;
        }

        let mut sorted: Vec<u64> = self.values[..count].to_vec();
        sorted.sort_unstable();

        let idx = ((count as f64 * p / 100.0) as usize).min(count - 1);
        sorted[idx]
    }

    fn average(&self) -> u64 {
        if self.count == 0 { 0 } else { self.sum / self.count }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModeMetrics {
    pub requests: u64,
    pub errors: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                total_requests: AtomicU64::new(0),
                active_tunnels: AtomicU64::new(0),
                status_2xx: AtomicU64::new(0),
                status_3xx: AtomicU64::new(0),
                status_4xx: AtomicU64::new(0),
                status_5xx: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                inline_requested: AtomicU64::new(0),
                inline_embedded: AtomicU64::new(0),
                latencies: Mutex::new(LatencyHistogram::new(10000)),
                mode_metrics: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Record a completed request
    pub async fn record_request(&self, mode: Mode, status: u16, latency_us: u64) {
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);

        match status / 100 {
            2 => { self.inner.status_2xx.fetch_add(1, Ordering::Relaxed); }
            3 => { self.inner.status_3xx.fetch_add(1, Ordering::Relaxed); }
            4 => { self.inner.status_4xx.fetch_add(1, Ordering::Relaxed); }
            5 => { self.inner.status_5xx.fetch_add(1, Ordering::Relaxed); }
            _ => {}
        }

        self.inner.latencies.lock().await.record(latency_us);

        let mut modes = self.inner.mode_metrics.lock().await;
        let entry = modes.entry(mode).or_default();
        entry.requests += 1;
        if status >= 400 {
            entry.errors += 1;
        }
    }

    pub fn add_bytes_out(&self, bytes: u64) {
        self.inner.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_inline(&self, report: &InlineReport) {
        self.inner.inline_requested.fetch_add(report.requested as u64, Ordering::Relaxed);
        self.inner.inline_embedded.fetch_add(report.embedded as u64, Ordering::Relaxed);
    }

    /// Increment active tunnel count
    pub fn tunnel_opened(&self) {
        self.inner.active_tunnels.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active tunnel count
    pub fn tunnel_closed(&self) {
        self.inner.active_tunnels.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_tunnels(&self) -> u64 {
        self.inner.active_tunnels.load(Ordering::Relaxed)
    }

    pub async fn mode(&self, mode: Mode) -> ModeMetrics {
        self.inner.mode_metrics.lock().await.get(&mode).cloned().unwrap_or_default()
    }

    /// Generate Prometheus-format metrics text
    pub async fn to_prometheus(&self) -> String {
        let lat = self.inner.latencies.lock().await;
        let p50 = lat.percentile(50.0);
        let p95 = lat.percentile(95.0);
        let p99 = lat.percentile(99.0);
        let avg = lat.average();
        drop(lat);

        let modes = self.inner.mode_metrics.lock().await;
        let mut by_mode = String::new();
        for mode in Mode::ALL {
            let m = modes.get(&mode).cloned().unwrap_or_default();
            by_mode.push_str(&format!(
                "mirrorgate_requests_by_mode{{mode=\"{0}\"}} {1}\nmirrorgate_errors_by_mode{{mode=\"{0}\"}} {2}\n",
                mode.as_str(),
                m.requests,
                m.errors
            ));
        }
        drop(modes);

        format!(
r#"# HELP mirrorgate_requests_total Total number of requests processed
# TYPE mirrorgate_requests_total counter
mirrorgate_requests_total {}

# HELP mirrorgate_active_tunnels Number of open tunnel connections
# TYPE mirrorgate_active_tunnels gauge
mirrorgate_active_tunnels {}

# HELP mirrorgate_requests_by_status Requests by HTTP status class
# TYPE mirrorgate_requests_by_status counter
mirrorgate_requests_by_status{{status="2xx"}} {}
mirrorgate_requests_by_status{{status="3xx"}} {}
mirrorgate_requests_by_status{{status="4xx"}} {}
mirrorgate_requests_by_status{{status="5xx"}} {}

# HELP mirrorgate_requests_by_mode Requests and errors by serving mode
# TYPE mirrorgate_requests_by_mode counter
{}
# HELP mirrorgate_bytes_out_total Body bytes sent to clients
# TYPE mirrorgate_bytes_out_total counter
mirrorgate_bytes_out_total {}

# HELP mirrorgate_inline_resources_total Inline resources by outcome
# TYPE mirrorgate_inline_resources_total counter
mirrorgate_inline_resources_total{{outcome="requested"}} {}
mirrorgate_inline_resources_total{{outcome="embedded"}} {}

# HELP mirrorgate_latency_us Request latency in microseconds
# TYPE mirrorgate_latency_us summary
mirrorgate_latency_us{{quantile="0.5"}} {}
mirrorgate_latency_us{{quantile="0.95"}} {}
mirrorgate_latency_us{{quantile="0.99"}} {}
mirrorgate_latency_us_avg {}
"#,
            self.inner.total_requests.load(Ordering::Relaxed),
            self.inner.active_tunnels.load(Ordering::Relaxed),
            self.inner.status_2xx.load(Ordering::Relaxed),
            self.inner.status_3xx.load(Ordering::Relaxed),
            self.inner.status_4xx.load(Ordering::Relaxed),
            self.inner.status_5xx.load(Ordering::Relaxed),
            by_mode,
            self.inner.bytes_out.load(Ordering::Relaxed),
            self.inner.inline_requested.load(Ordering::Relaxed),
            self.inner.inline_embedded.load(Ordering::Relaxed),
            p50, p95, p99, avg,
        )
    }
}
