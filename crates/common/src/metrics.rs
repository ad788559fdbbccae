//! Metrics collection for RKServe
//!
//! This module provides Prometheus metrics for observability.
//! Only counters and gauges that are cheap to update sit on the request path.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for RKServe
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub http: HttpMetrics,
    pub generation: GenerationMetrics,
}

/// Request-level metrics
#[derive(Debug, Clone)]
pub struct HttpMetrics {
    /// Total number of chat requests received
    pub requests_total: IntCounter,

    /// Requests rejected because a generation was in flight
    pub rejected_busy: IntCounter,

    /// Requests rejected for a malformed body
    pub rejected_invalid: IntCounter,

    /// Streaming requests
    pub streaming_requests: IntCounter,

    /// Request duration histogram (admission to last byte)
    pub request_duration: Histogram,
}

/// Generation-level metrics
#[derive(Debug, Clone)]
pub struct GenerationMetrics {
    /// Generations started
    pub generations_total: IntCounter,

    /// Generations that ended in a native error
    pub generations_failed: IntCounter,

    /// Fragments delivered by the native callback
    pub fragments_total: IntCounter,

    /// Duration of a single prompt generation
    pub generation_duration: Histogram,

    /// 1 while the admission slot is held
    pub slot_occupied: IntGauge,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let requests_total = IntCounter::new(
            "rkserve_requests_total",
            "Total number of chat requests",
        )
        .unwrap();

        let rejected_busy = IntCounter::new(
            "rkserve_requests_rejected_busy_total",
            "Requests rejected because a generation was in flight",
        )
        .unwrap();

        let rejected_invalid = IntCounter::new(
            "rkserve_requests_rejected_invalid_total",
            "Requests rejected for a malformed body",
        )
        .unwrap();

        let streaming_requests = IntCounter::new(
            "rkserve_streaming_requests_total",
            "Chat requests served in streaming mode",
        )
        .unwrap();

        let request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "rkserve_request_duration_seconds",
                "Chat request duration in seconds",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )
        .unwrap();

        let generations_total = IntCounter::new(
            "rkserve_generations_total",
            "Total number of prompt generations started",
        )
        .unwrap();

        let generations_failed = IntCounter::new(
            "rkserve_generations_failed_total",
            "Generations that ended with a native error",
        )
        .unwrap();

        let fragments_total = IntCounter::new(
            "rkserve_fragments_total",
            "Text fragments delivered by the native engine",
        )
        .unwrap();

        let generation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "rkserve_generation_duration_seconds",
                "Single prompt generation duration in seconds",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )
        .unwrap();

        let slot_occupied = IntGauge::new(
            "rkserve_admission_slot_occupied",
            "1 while a generation holds the admission slot",
        )
        .unwrap();

        // Register all metrics
        registry.register(Box::new(requests_total.clone())).unwrap();
        registry.register(Box::new(rejected_busy.clone())).unwrap();
        registry.register(Box::new(rejected_invalid.clone())).unwrap();
        registry.register(Box::new(streaming_requests.clone())).unwrap();
        registry.register(Box::new(request_duration.clone())).unwrap();

        registry.register(Box::new(generations_total.clone())).unwrap();
        registry.register(Box::new(generations_failed.clone())).unwrap();
        registry.register(Box::new(fragments_total.clone())).unwrap();
        registry.register(Box::new(generation_duration.clone())).unwrap();
        registry.register(Box::new(slot_occupied.clone())).unwrap();

        let http = HttpMetrics {
            requests_total,
            rejected_busy,
            rejected_invalid,
            streaming_requests,
            request_duration,
        };

        let generation = GenerationMetrics {
            generations_total,
            generations_failed,
            fragments_total,
            generation_duration,
            slot_occupied,
        };

        MetricsRegistry {
            registry,
            http,
            generation,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# failed to encode metrics: {}\n", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn observe_closure<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn observe_closure<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}
