//! Per-cycle Prometheus metrics, following `transactional-outbox`'s
//! `OutboxMetrics` shape: one struct per worker, registered against the
//! default registry at construction, `const_label("service", ...)` so
//! multiple instances of the same service distinguish their series.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct WorkerMetrics {
    pub published: IntCounter,
    pub failed: IntCounter,
    pub claimed_pending: IntGauge,
    pub flush_latency: Histogram,
}

impl WorkerMetrics {
    pub fn new(service: &str, worker: &str) -> Self {
        let registry = prometheus::default_registry();

        let published = IntCounter::with_opts(
            Opts::new(
                format!("wc_{worker}_published_total"),
                format!("Total items successfully processed by the {worker} worker"),
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts");

        let failed = IntCounter::with_opts(
            Opts::new(
                format!("wc_{worker}_failed_total"),
                format!("Total items that failed processing in the {worker} worker"),
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts");

        let claimed_pending = IntGauge::with_opts(
            Opts::new(
                format!("wc_{worker}_claimed_pending"),
                format!("Items claimed by this instance still awaiting the {worker} worker"),
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts");

        let flush_latency = Histogram::with_opts(
            HistogramOpts::new(
                format!("wc_{worker}_flush_latency_seconds"),
                format!("Latency of one {worker} worker flush cycle"),
            )
            .const_label("service", service.to_string()),
        )
        .expect("valid metric opts");

        for metric in [
            Box::new(published.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(failed.clone()),
            Box::new(claimed_pending.clone()),
            Box::new(flush_latency.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("failed to register {worker} metric: {e}");
            }
        }

        Self {
            published,
            failed,
            claimed_pending,
            flush_latency,
        }
    }
}
