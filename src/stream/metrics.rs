// =============================================================================
// Stream metrics — per-stream event counters and latency histograms
// =============================================================================

use std::time::Instant;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

/// Prometheus instruments shared by every source stream. Constructed once at
/// startup and injected; the registry is exposed at `GET /metrics`.
#[derive(Clone)]
pub struct StreamMetrics {
    events_total: IntCounterVec,
    processing_duration: HistogramVec,
}

impl StreamMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let events_total = IntCounterVec::new(
            Opts::new("stream_events_total", "Events emitted per stream and result"),
            &["stream", "result"],
        )?;
        registry.register(Box::new(events_total.clone()))?;

        let processing_duration = HistogramVec::new(
            HistogramOpts::new(
                "stream_processing_duration_seconds",
                "Per-event processing latency by stream",
            ),
            &["stream"],
        )?;
        registry.register(Box::new(processing_duration.clone()))?;

        Ok(Self {
            events_total,
            processing_duration,
        })
    }

    pub fn record_success(&self, stream: &str, started: Instant) {
        self.events_total.with_label_values(&[stream, "success"]).inc();
        self.processing_duration
            .with_label_values(&[stream])
            .observe(started.elapsed().as_secs_f64());
    }

    pub fn record_error(&self, stream: &str, started: Instant) {
        self.events_total.with_label_values(&[stream, "error"]).inc();
        self.processing_duration
            .with_label_values(&[stream])
            .observe(started.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_by_stream_and_result() {
        let registry = Registry::new();
        let metrics = StreamMetrics::new(&registry).unwrap();

        let started = Instant::now();
        metrics.record_success("fills", started);
        metrics.record_success("fills", started);
        metrics.record_error("fills", started);
        metrics.record_success("positions", started);

        assert_eq!(
            metrics
                .events_total
                .with_label_values(&["fills", "success"])
                .get(),
            2
        );
        assert_eq!(
            metrics
                .events_total
                .with_label_values(&["fills", "error"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .events_total
                .with_label_values(&["positions", "success"])
                .get(),
            1
        );

        // Both families are registered for exposition.
        let families = registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"stream_events_total".to_string()));
        assert!(names.contains(&"stream_processing_duration_seconds".to_string()));
    }
}
