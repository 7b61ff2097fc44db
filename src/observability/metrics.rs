//! Per-client coordination counters
//!
//! Every [`crate::coordination::CoordinationClient`] owns one
//! [`CoordinationMetrics`]; there is no process-wide instance. Counters are
//! relaxed atomics bumped from the transport and queue threads; handler
//! latencies sit behind a mutex because they need percentiles.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MAX_LATENCY_SAMPLES: usize = 1000;

#[derive(Debug, Default)]
pub struct CoordinationMetrics {
    // Inbound path
    frames_received: AtomicU64,
    decode_failures: AtomicU64,
    inbound_filtered: AtomicU64,
    commands_dispatched: AtomicU64,
    handler_failures: AtomicU64,
    state_errors: AtomicU64,

    // Outbound path
    responses_enqueued: AtomicU64,
    outbound_filtered: AtomicU64,
    messages_published: AtomicU64,
    publish_retries: AtomicU64,
    messages_dropped: AtomicU64,
    metric_samples_published: AtomicU64,

    handler_latencies_ms: Mutex<VecDeque<u64>>,
}

impl CoordinationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_failed(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inbound_filtered(&self) {
        self.inbound_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_dispatched(&self, duration: Duration) {
        self.commands_dispatched.fetch_add(1, Ordering::Relaxed);
        self.record_latency(duration);
    }

    pub fn handler_failed(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn state_error(&self) {
        self.state_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_enqueued(&self) {
        self.responses_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outbound_filtered(&self) {
        self.outbound_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_retried(&self) {
        self.publish_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn metric_samples_published(&self, count: usize) {
        self.metric_samples_published
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    fn record_latency(&self, duration: Duration) {
        let mut samples = self.handler_latencies_ms.lock();
        samples.push_back(duration.as_millis() as u64);
        if samples.len() > MAX_LATENCY_SAMPLES {
            samples.pop_front();
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut latencies: Vec<u64> = self.handler_latencies_ms.lock().iter().copied().collect();
        latencies.sort_unstable();

        let avg = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
        };

        MetricsSnapshot {
            timestamp: current_timestamp(),
            inbound: InboundMetrics {
                frames_received: self.frames_received.load(Ordering::Relaxed),
                decode_failures: self.decode_failures.load(Ordering::Relaxed),
                filtered: self.inbound_filtered.load(Ordering::Relaxed),
                dispatched: self.commands_dispatched.load(Ordering::Relaxed),
                handler_failures: self.handler_failures.load(Ordering::Relaxed),
                state_errors: self.state_errors.load(Ordering::Relaxed),
                handler_time_avg_ms: avg,
                handler_time_p50_ms: percentile(&latencies, 50.0),
                handler_time_p95_ms: percentile(&latencies, 95.0),
                handler_time_p99_ms: percentile(&latencies, 99.0),
            },
            outbound: OutboundMetrics {
                enqueued: self.responses_enqueued.load(Ordering::Relaxed),
                filtered: self.outbound_filtered.load(Ordering::Relaxed),
                published: self.messages_published.load(Ordering::Relaxed),
                retries: self.publish_retries.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
                metric_samples: self.metric_samples_published.load(Ordering::Relaxed),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Seconds since the Unix epoch
    pub timestamp: u64,
    pub inbound: InboundMetrics,
    pub outbound: OutboundMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundMetrics {
    pub frames_received: u64,
    pub decode_failures: u64,
    pub filtered: u64,
    pub dispatched: u64,
    pub handler_failures: u64,
    pub state_errors: u64,
    pub handler_time_avg_ms: f64,
    pub handler_time_p50_ms: f64,
    pub handler_time_p95_ms: f64,
    pub handler_time_p99_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMetrics {
    pub enqueued: u64,
    pub filtered: u64,
    pub published: u64,
    pub retries: u64,
    pub dropped: u64,
    pub metric_samples: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Linear interpolation between closest ranks
fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }

    let rank = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;

    sorted[lower] as f64 * (1.0 - weight) + sorted[upper] as f64 * weight
}
