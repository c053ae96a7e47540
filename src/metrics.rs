#![forbid(unsafe_code)]

// Process-wide instrumentation: enum-indexed atomic counters, an
// open-connections gauge, and an exponential dispatch-latency histogram,
// exposed in Prometheus text format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Monotonic counters the server maintains. The discriminant doubles as the
/// storage index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    ConnectionsOpened,
    EventsIn,
    EventsOut,
    EventErrors,
    RoomsOpened,
    Joins,
    Leaves,
    ProducersStarted,
    ConsumersStarted,
}

impl Counter {
    const ALL: [Counter; 9] = [
        Counter::ConnectionsOpened,
        Counter::EventsIn,
        Counter::EventsOut,
        Counter::EventErrors,
        Counter::RoomsOpened,
        Counter::Joins,
        Counter::Leaves,
        Counter::ProducersStarted,
        Counter::ConsumersStarted,
    ];

    fn descriptor(self) -> (&'static str, &'static str) {
        match self {
            Counter::ConnectionsOpened => (
                "videoroom_connections_opened_total",
                "Signaling connections accepted",
            ),
            Counter::EventsIn => ("videoroom_events_in_total", "Client events received"),
            Counter::EventsOut => ("videoroom_events_out_total", "Server events delivered"),
            Counter::EventErrors => (
                "videoroom_event_errors_total",
                "Client events rejected or failed",
            ),
            Counter::RoomsOpened => ("videoroom_rooms_opened_total", "Rooms created"),
            Counter::Joins => ("videoroom_joins_total", "Completed room joins"),
            Counter::Leaves => ("videoroom_leaves_total", "Room leaves"),
            Counter::ProducersStarted => ("videoroom_producers_total", "Producers created"),
            Counter::ConsumersStarted => ("videoroom_consumers_total", "Consumers created"),
        }
    }
}

/// Dispatch latency buckets double from 1ms until they pass the 10s engine
/// handshake deadline, so a dispatch that ran into the timeout still lands
/// in a finite bucket (1ms << 14 = 16.384s).
const LATENCY_FLOOR_US: u64 = 1_000;
const LATENCY_BUCKETS: usize = 15;

const fn latency_bound_us(bucket: usize) -> u64 {
    LATENCY_FLOOR_US << bucket
}

/// Latency histogram storing per-bucket hits; the cumulative counts
/// Prometheus expects are produced at render time.
struct LatencyHistogram {
    hits: [AtomicU64; LATENCY_BUCKETS],
    samples: AtomicU64,
    total_us: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            hits: [const { AtomicU64::new(0) }; LATENCY_BUCKETS],
            samples: AtomicU64::new(0),
            total_us: AtomicU64::new(0),
        }
    }

    fn record(&self, elapsed: Duration) {
        let us = elapsed.as_micros() as u64;
        self.samples.fetch_add(1, Relaxed);
        self.total_us.fetch_add(us, Relaxed);
        // A sample above the last bound counts only toward +Inf
        if let Some(bucket) = (0..LATENCY_BUCKETS).find(|b| us <= latency_bound_us(*b)) {
            self.hits[bucket].fetch_add(1, Relaxed);
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");

        let mut below = 0;
        for bucket in 0..LATENCY_BUCKETS {
            below += self.hits[bucket].load(Relaxed);
            let bound = seconds(latency_bound_us(bucket));
            let _ = writeln!(out, "{name}_bucket{{le=\"{bound}\"}} {below}");
        }
        let samples = self.samples.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {samples}");
        let _ = writeln!(out, "{name}_sum {}", seconds(self.total_us.load(Relaxed)));
        let _ = writeln!(out, "{name}_count {samples}");
    }
}

/// Microseconds as a decimal seconds string, trailing zeros trimmed
/// ("0.001", "8.192").
fn seconds(us: u64) -> String {
    let mut text = format!("{}.{:06}", us / 1_000_000, us % 1_000_000);
    while text.ends_with('0') {
        text.pop();
    }
    if text.ends_with('.') {
        text.push('0');
    }
    text
}

struct Inner {
    counters: [AtomicU64; Counter::ALL.len()],
    connections_open: AtomicU64,
    dispatch: LatencyHistogram,
}

/// Cheap-to-clone handle to the process metrics.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                counters: [const { AtomicU64::new(0) }; Counter::ALL.len()],
                connections_open: AtomicU64::new(0),
                dispatch: LatencyHistogram::new(),
            }),
        }
    }

    /// Adds one to a monotonic counter.
    pub fn bump(&self, counter: Counter) {
        self.inner.counters[counter as usize].fetch_add(1, Relaxed);
    }

    /// Marks a connection open until the returned token drops. The token
    /// pays the gauge back even if the connection handler panics.
    pub fn track_connection(&self) -> ConnectionToken {
        self.inner.connections_open.fetch_add(1, Relaxed);
        ConnectionToken {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Records how long one inbound event took to dispatch.
    pub fn record_dispatch(&self, elapsed: Duration) {
        self.inner.dispatch.record(elapsed);
    }

    /// Prometheus text exposition. The room and peer gauges are sampled by
    /// the caller, which owns the registries.
    pub fn render(&self, rooms_live: usize, peers_live: usize) -> String {
        let mut out = String::with_capacity(2048);

        for counter in Counter::ALL {
            let (name, help) = counter.descriptor();
            let value = self.inner.counters[counter as usize].load(Relaxed);
            expose(&mut out, name, "counter", help, value);
        }

        let gauges = [
            (
                "videoroom_connections_open",
                "Signaling connections currently open",
                self.inner.connections_open.load(Relaxed),
            ),
            (
                "videoroom_rooms_live",
                "Rooms currently live",
                rooms_live as u64,
            ),
            (
                "videoroom_peers_live",
                "Peers currently registered",
                peers_live as u64,
            ),
        ];
        for (name, help, value) in gauges {
            expose(&mut out, name, "gauge", help, value);
        }

        self.inner.dispatch.render(
            "videoroom_dispatch_seconds",
            "Inbound event dispatch latency in seconds",
            &mut out,
        );

        out
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Open-connections gauge token; see [`ServerMetrics::track_connection`].
pub struct ConnectionToken {
    inner: Arc<Inner>,
}

impl Drop for ConnectionToken {
    fn drop(&mut self) {
        self.inner.connections_open.fetch_sub(1, Relaxed);
    }
}

fn expose(out: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_cumulates_exponential_buckets() {
        let histogram = LatencyHistogram::new();
        histogram.record(Duration::from_millis(3)); // first bound past 3ms is 4ms
        histogram.record(Duration::from_millis(30)); // 32ms bucket

        let mut out = String::new();
        histogram.render("lat_seconds", "latency", &mut out);
        assert!(out.contains("lat_seconds_bucket{le=\"0.002\"} 0"));
        assert!(out.contains("lat_seconds_bucket{le=\"0.004\"} 1"));
        assert!(out.contains("lat_seconds_bucket{le=\"0.032\"} 2"));
        assert!(out.contains("lat_seconds_count 2"));
    }

    #[test]
    fn samples_past_the_last_bound_reach_only_inf() {
        let histogram = LatencyHistogram::new();
        histogram.record(Duration::from_secs(20)); // past the 16.384s ceiling

        let mut out = String::new();
        histogram.render("lat_seconds", "latency", &mut out);
        assert!(out.contains("lat_seconds_bucket{le=\"16.384\"} 0"));
        assert!(out.contains("lat_seconds_bucket{le=\"+Inf\"} 1"));
        assert!(out.contains("lat_seconds_count 1"));
    }

    #[test]
    fn connection_token_pays_the_gauge_back() {
        let metrics = ServerMetrics::new();
        {
            let _token = metrics.track_connection();
            assert_eq!(metrics.inner.connections_open.load(Relaxed), 1);
        }
        assert_eq!(metrics.inner.connections_open.load(Relaxed), 0);
    }

    #[test]
    fn counters_land_in_the_rendered_output() {
        let metrics = ServerMetrics::new();
        metrics.bump(Counter::Joins);
        metrics.bump(Counter::Joins);

        let out = metrics.render(1, 2);
        assert!(out.contains("videoroom_joins_total 2"));
        assert!(out.contains("videoroom_rooms_live 1"));
        assert!(out.contains("videoroom_peers_live 2"));
    }
}
