//! Simulation metrics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

/// Simulation metrics, shared by all workers.
#[derive(Debug)]
pub struct SimulationMetrics {
    total_transfers: AtomicU64,
    successful_transfers: AtomicU64,
    failed_transfers: AtomicU64,
    /// Failure count per error code.
    failures: DashMap<&'static str, u64>,
    /// Latency samples (µs) of successful transfers.
    latency_samples: Mutex<VecDeque<u64>>,
    /// Maximum samples to keep.
    max_samples: usize,
}

/// Point-in-time copy of [`SimulationMetrics`].
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsReport {
    pub total_transfers: u64,
    pub successful_transfers: u64,
    pub failed_transfers: u64,
    /// Sorted by error code.
    pub failures: Vec<(&'static str, u64)>,
    pub average_latency_us: u64,
    pub p50_latency_us: u64,
    pub p99_latency_us: u64,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            total_transfers: AtomicU64::new(0),
            successful_transfers: AtomicU64::new(0),
            failed_transfers: AtomicU64::new(0),
            failures: DashMap::new(),
            latency_samples: Mutex::new(VecDeque::with_capacity(10000)),
            max_samples: 10000,
        }
    }

    /// Record a committed transfer.
    pub fn record_success(&self, latency_us: u64) {
        self.total_transfers.fetch_add(1, Ordering::Relaxed);
        self.successful_transfers.fetch_add(1, Ordering::Relaxed);

        let mut samples = self.latency_samples.lock();
        if samples.len() >= self.max_samples {
            samples.pop_front();
        }
        samples.push_back(latency_us);
    }

    /// Record a failed transfer under its error code.
    pub fn record_failure(&self, code: &'static str) {
        self.total_transfers.fetch_add(1, Ordering::Relaxed);
        self.failed_transfers.fetch_add(1, Ordering::Relaxed);
        *self.failures.entry(code).or_insert(0) += 1;
    }

    /// Failures recorded under `code`.
    pub fn failures_for(&self, code: &str) -> u64 {
        self.failures.get(code).map(|count| *count).unwrap_or(0)
    }

    /// Get success rate.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_transfers.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }

        self.successful_transfers.load(Ordering::Relaxed) as f64 / total as f64
    }

    /// Get throughput (transfers per second).
    pub fn throughput(&self, elapsed_secs: f64) -> f64 {
        if elapsed_secs <= 0.0 {
            return 0.0;
        }

        self.total_transfers.load(Ordering::Relaxed) as f64 / elapsed_secs
    }

    pub fn report(&self) -> MetricsReport {
        let mut sorted: Vec<u64> = self.latency_samples.lock().iter().copied().collect();
        sorted.sort_unstable();

        let average_latency_us = if sorted.is_empty() {
            0
        } else {
            sorted.iter().sum::<u64>() / sorted.len() as u64
        };

        let mut failures: Vec<(&'static str, u64)> =
            self.failures.iter().map(|e| (*e.key(), *e.value())).collect();
        failures.sort_unstable();

        MetricsReport {
            total_transfers: self.total_transfers.load(Ordering::Relaxed),
            successful_transfers: self.successful_transfers.load(Ordering::Relaxed),
            failed_transfers: self.failed_transfers.load(Ordering::Relaxed),
            failures,
            average_latency_us,
            p50_latency_us: percentile(&sorted, 50),
            p99_latency_us: percentile(&sorted, 99),
        }
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Percentile of an ascending sample.
fn percentile(sorted: &[u64], percentile: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }

    let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
    sorted[idx]
}
