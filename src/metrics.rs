use prometheus::{CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Plugin metrics collector
pub struct PluginMetrics {
    registry: Arc<Registry>,
    /// Volume-plugin requests, by verb
    pub requests_total: CounterVec,
    /// Request duration in seconds
    pub request_duration: HistogramVec,
    /// Requests answered with an `Err`
    pub request_errors: CounterVec,
    pub gc_runs: IntCounter,
    pub gc_unmounts: IntCounter,
    pub gc_failures: IntCounter,
    /// Managed mounts known to the container tracker
    pub tracked_mounts: Gauge,
}

impl PluginMetrics {
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let requests_total = CounterVec::new(
            Opts::new("cattle_storage_requests_total", "Total volume plugin requests"),
            &["verb"],
        )?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "cattle_storage_request_duration_seconds",
                "Volume plugin request duration in seconds",
            ),
            &["verb"],
        )?;

        let request_errors = CounterVec::new(
            Opts::new("cattle_storage_request_errors_total", "Volume plugin request errors"),
            &["verb"],
        )?;

        let gc_runs = IntCounter::new("cattle_storage_gc_runs_total", "Mount GC passes")?;
        let gc_unmounts =
            IntCounter::new("cattle_storage_gc_unmounts_total", "Mounts released by GC")?;
        let gc_failures =
            IntCounter::new("cattle_storage_gc_failures_total", "Mounts GC failed to release")?;

        let tracked_mounts =
            Gauge::new("cattle_storage_tracked_mounts", "Managed mounts known to the tracker")?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(request_errors.clone()))?;
        registry.register(Box::new(gc_runs.clone()))?;
        registry.register(Box::new(gc_unmounts.clone()))?;
        registry.register(Box::new(gc_failures.clone()))?;
        registry.register(Box::new(tracked_mounts.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            request_errors,
            gc_runs,
            gc_unmounts,
            gc_failures,
            tracked_mounts,
        })
    }

    /// Record a request
    pub fn record_request(&self, verb: &str, duration_secs: f64, success: bool) {
        self.requests_total.with_label_values(&[verb]).inc();
        self.request_duration.with_label_values(&[verb]).observe(duration_secs);
        if !success {
            self.request_errors.with_label_values(&[verb]).inc();
        }
    }

    pub fn record_gc(&self, unmounted: usize, failed: usize, tracked: usize) {
        self.gc_runs.inc();
        self.gc_unmounts.inc_by(unmounted as u64);
        self.gc_failures.inc_by(failed as u64);
        self.tracked_mounts.set(tracked as f64);
    }

    /// Prometheus text exposition of everything in the registry.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
