//! Rolling per-gateway outcome metrics.
//!
//! Each gateway gets a bounded ring buffer of recent samples; memory stays
//! fixed no matter how long the process runs. Percentiles are computed from
//! a sorted copy on demand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::GatewayType;

/// Default ring-buffer capacity per gateway.
pub const DEFAULT_WINDOW: usize = 256;

#[derive(Debug, Clone, Copy)]
struct Sample {
    success: bool,
    latency: Duration,
}

/// Point-in-time metrics snapshot for one gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayMetrics {
    /// The gateway these numbers describe.
    pub gateway: GatewayType,
    /// Lifetime success count.
    pub success_count: u64,
    /// Lifetime failure count.
    pub failure_count: u64,
    /// Success rate over the rolling window, in [0, 1].
    pub success_rate: f64,
    /// Mean latency over the rolling window.
    pub avg_latency: Duration,
    /// 95th-percentile latency over the rolling window.
    pub p95_latency: Duration,
    /// Configured cost per transaction, in minor units of the merchant's
    /// settlement currency.
    pub cost_per_transaction: f64,
    /// Number of samples currently in the window.
    pub sample_count: usize,
}

/// Collects outcomes for a single gateway.
pub struct MetricsCollector {
    gateway: GatewayType,
    window: Mutex<VecDeque<Sample>>,
    capacity: usize,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    cost_per_transaction: f64,
}

impl MetricsCollector {
    /// New collector with the default window size.
    pub fn new(gateway: GatewayType, cost_per_transaction: f64) -> Self {
        Self::with_capacity(gateway, cost_per_transaction, DEFAULT_WINDOW)
    }

    /// New collector with an explicit window size.
    pub fn with_capacity(
        gateway: GatewayType,
        cost_per_transaction: f64,
        capacity: usize,
    ) -> Self {
        Self {
            gateway,
            window: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            cost_per_transaction,
        }
    }

    /// Record one call outcome.
    pub fn record(&self, success: bool, latency: Duration) {
        if success {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        }

        let mut window = self.window.lock();
        if window.len() == self.capacity {
            window.pop_front();
        }
        window.push_back(Sample { success, latency });
    }

    /// Samples currently held in the rolling window.
    pub fn sample_count(&self) -> usize {
        self.window.lock().len()
    }

    /// Snapshot the rolling metrics.
    pub fn snapshot(&self) -> GatewayMetrics {
        let window = self.window.lock();
        let sample_count = window.len();

        let (success_rate, avg_latency, p95_latency) = if sample_count == 0 {
            (0.0, Duration::ZERO, Duration::ZERO)
        } else {
            let successes = window.iter().filter(|s| s.success).count();
            let total: Duration = window.iter().map(|s| s.latency).sum();

            let mut latencies: Vec<Duration> = window.iter().map(|s| s.latency).collect();
            latencies.sort_unstable();
            let p95_index = ((sample_count as f64 * 0.95).ceil() as usize)
                .saturating_sub(1)
                .min(sample_count - 1);

            (
                successes as f64 / sample_count as f64,
                total / sample_count as u32,
                latencies[p95_index],
            )
        };

        GatewayMetrics {
            gateway: self.gateway,
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            success_rate,
            avg_latency,
            p95_latency,
            cost_per_transaction: self.cost_per_transaction,
            sample_count,
        }
    }
}

/// Per-orchestrator registry of metric collectors.
#[derive(Default)]
pub struct MetricsRegistry {
    collectors: DashMap<GatewayType, Arc<MetricsCollector>>,
}

impl MetricsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the collector for a gateway.
    pub fn get_or_create(&self, gateway: GatewayType, cost_per_transaction: f64) -> Arc<MetricsCollector> {
        self.collectors
            .entry(gateway)
            .or_insert_with(|| Arc::new(MetricsCollector::new(gateway, cost_per_transaction)))
            .clone()
    }

    /// Look up a collector without creating one.
    pub fn get(&self, gateway: GatewayType) -> Option<Arc<MetricsCollector>> {
        self.collectors.get(&gateway).map(|c| c.clone())
    }

    /// Snapshot every gateway, sorted by name.
    pub fn snapshot_all(&self) -> Vec<GatewayMetrics> {
        let mut all: Vec<GatewayMetrics> = self
            .collectors
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        all.sort_by_key(|m| m.gateway.name());
        all
    }
}
