//! Prometheus-compatible metrics endpoint
//!
//! Exposes replication metrics in Prometheus format.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Samples kept for tick-time percentiles
const TICK_HISTORY: usize = 1000;

/// Metrics registry for the replication core
#[derive(Debug)]
pub struct PvsMetrics {
    // Population
    pub sessions: AtomicU64,
    pub tracked_entities: AtomicU64,
    pub chunks: AtomicU64,

    // Per-tick work, cumulative
    pub chunks_rebuilt: AtomicU64,
    pub states_sent: AtomicU64,
    pub entities_entered: AtomicU64,
    pub budget_deferred: AtomicU64,
    pub leave_notices: AtomicU64,
    pub empty_diffs: AtomicU64,
    pub bytes_sent: AtomicU64,

    // Acknowledgement
    pub acks_applied: AtomicU64,
    pub acks_dropped: AtomicU64,
    pub full_states: AtomicU64,
    pub reliable_states: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    start_time: Instant,

    // Rolling tick times for percentile calculation
    tick_history: RwLock<VecDeque<u64>>,
}

impl PvsMetrics {
    pub fn new() -> Self {
        Self {
            sessions: AtomicU64::new(0),
            tracked_entities: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
            chunks_rebuilt: AtomicU64::new(0),
            states_sent: AtomicU64::new(0),
            entities_entered: AtomicU64::new(0),
            budget_deferred: AtomicU64::new(0),
            leave_notices: AtomicU64::new(0),
            empty_diffs: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            acks_applied: AtomicU64::new(0),
            acks_dropped: AtomicU64::new(0),
            full_states: AtomicU64::new(0),
            reliable_states: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY)),
        }
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: usize) {
        if n > 0 {
            counter.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.tick_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("sightline_sessions", "Connected sessions", "gauge",
            self.sessions.load(Ordering::Relaxed));
        metric!("sightline_tracked_entities", "Entities with a history handle", "gauge",
            self.tracked_entities.load(Ordering::Relaxed));
        metric!("sightline_chunks", "Allocated PVS chunks", "gauge",
            self.chunks.load(Ordering::Relaxed));

        metric!("sightline_chunks_rebuilt_total", "Chunk content rebuilds", "counter",
            self.chunks_rebuilt.load(Ordering::Relaxed));
        metric!("sightline_entity_states_total", "Entity states sent", "counter",
            self.states_sent.load(Ordering::Relaxed));
        metric!("sightline_entities_entered_total", "Entities that entered a session's view", "counter",
            self.entities_entered.load(Ordering::Relaxed));
        metric!("sightline_budget_deferred_total", "Entities deferred by the entry budget", "counter",
            self.budget_deferred.load(Ordering::Relaxed));
        metric!("sightline_leave_notices_total", "Entities reported as leaving view", "counter",
            self.leave_notices.load(Ordering::Relaxed));
        metric!("sightline_empty_diffs_total", "Dirty entities that produced an empty diff", "counter",
            self.empty_diffs.load(Ordering::Relaxed));
        metric!("sightline_bytes_sent_total", "Encoded state bytes handed to the transport", "counter",
            self.bytes_sent.load(Ordering::Relaxed));

        metric!("sightline_acks_applied_total", "Client acks matched to a sent list", "counter",
            self.acks_applied.load(Ordering::Relaxed));
        metric!("sightline_acks_dropped_total", "Client acks outside the retained history", "counter",
            self.acks_dropped.load(Ordering::Relaxed));
        metric!("sightline_full_states_total", "States sent from tick 0", "counter",
            self.full_states.load(Ordering::Relaxed));
        metric!("sightline_reliable_states_total", "States sent reliably", "counter",
            self.reliable_states.load(Ordering::Relaxed));

        metric!("sightline_tick_time_microseconds", "Last PVS update time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("sightline_tick_time_p95_microseconds", "95th percentile PVS update time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("sightline_tick_time_p99_microseconds", "99th percentile PVS update time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("sightline_tick_time_max_microseconds", "Maximum PVS update time", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("sightline_tick_count", "PVS updates processed", "counter",
            self.tick_count.load(Ordering::Relaxed));
        metric!("sightline_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// JSON snapshot for direct API access
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "population": {
                "sessions": self.sessions.load(Ordering::Relaxed),
                "tracked_entities": self.tracked_entities.load(Ordering::Relaxed),
                "chunks": self.chunks.load(Ordering::Relaxed),
            },
            "replication": {
                "chunks_rebuilt": self.chunks_rebuilt.load(Ordering::Relaxed),
                "states_sent": self.states_sent.load(Ordering::Relaxed),
                "entities_entered": self.entities_entered.load(Ordering::Relaxed),
                "budget_deferred": self.budget_deferred.load(Ordering::Relaxed),
                "leave_notices": self.leave_notices.load(Ordering::Relaxed),
                "empty_diffs": self.empty_diffs.load(Ordering::Relaxed),
                "bytes_sent": self.bytes_sent.load(Ordering::Relaxed),
            },
            "acks": {
                "applied": self.acks_applied.load(Ordering::Relaxed),
                "dropped": self.acks_dropped.load(Ordering::Relaxed),
                "full_states": self.full_states.load(Ordering::Relaxed),
                "reliable_states": self.reliable_states.load(Ordering::Relaxed),
            },
            "performance": {
                "tick_time_us": self.tick_time_us.load(Ordering::Relaxed),
                "tick_time_p95_us": self.tick_time_p95_us.load(Ordering::Relaxed),
                "tick_time_p99_us": self.tick_time_p99_us.load(Ordering::Relaxed),
                "tick_time_max_us": self.tick_time_max_us.load(Ordering::Relaxed),
                "tick_count": self.tick_count.load(Ordering::Relaxed),
                "uptime_seconds": self.uptime_seconds(),
            },
        })
        .to_string()
    }
}

impl Default for PvsMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<PvsMetrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);

                    let response = match request.split_whitespace().nth(1) {
                        Some("/metrics/json") => http_response("200 OK", "application/json", &metrics.to_json()),
                        Some("/metrics") => http_response("200 OK", "text/plain; version=0.0.4", &metrics.to_prometheus()),
                        Some("/health") => http_response("200 OK", "text/plain", "OK"),
                        _ => http_response("404 Not Found", "text/plain", ""),
                    };

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = PvsMetrics::new();
        assert_eq!(metrics.sessions.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_tick_time() {
        let metrics = PvsMetrics::new();
        for i in 0..100 {
            metrics.record_tick_time(Duration::from_micros(100 + i * 10));
        }

        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 100);
        assert!(metrics.tick_time_p95_us.load(Ordering::Relaxed) >= 1000);
        assert_eq!(metrics.tick_time_max_us.load(Ordering::Relaxed), 1090);
    }

    #[test]
    fn test_add_skips_zero() {
        let metrics = PvsMetrics::new();
        PvsMetrics::add(&metrics.states_sent, 0);
        PvsMetrics::add(&metrics.states_sent, 3);
        assert_eq!(metrics.states_sent.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = PvsMetrics::new();
        metrics.sessions.store(4, Ordering::Relaxed);
        metrics.budget_deferred.store(12, Ordering::Relaxed);

        let output = metrics.to_prometheus();

        assert!(output.contains("sightline_sessions 4"));
        assert!(output.contains("sightline_budget_deferred_total 12"));
        assert!(output.contains("# TYPE sightline_acks_applied_total counter"));
    }

    #[test]
    fn test_json_format() {
        let metrics = PvsMetrics::new();
        metrics.tracked_entities.store(100, Ordering::Relaxed);

        let parsed: serde_json::Value = serde_json::from_str(&metrics.to_json()).unwrap();
        assert_eq!(parsed["population"]["tracked_entities"], 100);
        assert!(parsed["performance"].is_object());
    }

    #[test]
    fn test_http_response_length() {
        let response = http_response("200 OK", "text/plain", "OK");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Length: 2\r\n"));
        assert!(response.ends_with("\r\n\r\nOK"));
    }
}
