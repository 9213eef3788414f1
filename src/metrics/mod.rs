use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::sync::Arc;

/// Prometheus metrics for the context store
#[derive(Clone)]
pub struct ContextMetrics {
    // Counters
    pub segments_ingested: Counter,
    pub segments_spilled: Counter,
    pub segments_stashed: Counter,
    pub segments_deleted: Counter,
    pub segments_retrieved: Counter,
    pub gc_passes: Counter,
    pub tokens_freed: Counter,
    pub over_capacity_events: Counter,
    pub index_rebuilds: CounterVec,
    pub storage_errors: Counter,

    // Gauges
    pub tier_segments: GaugeVec,
    pub open_projects: Gauge,

    // Histograms
    pub search_latency: HistogramVec,
    pub shard_write_latency: Histogram,
    pub gc_candidates: Histogram,

    registry: Arc<Registry>,
}

impl ContextMetrics {
    /// Create a new ContextMetrics instance with its own registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let segments_ingested = Counter::with_opts(Opts::new(
            "ctxheap_segments_ingested_total",
            "Total number of segments ingested",
        ))?;
        registry.register(Box::new(segments_ingested.clone()))?;

        let segments_spilled = Counter::with_opts(Opts::new(
            "ctxheap_segments_spilled_total",
            "Segments moved to the archive by LRU eviction",
        ))?;
        registry.register(Box::new(segments_spilled.clone()))?;

        let segments_stashed = Counter::with_opts(Opts::new(
            "ctxheap_segments_stashed_total",
            "Segments moved to the archive by stash or GC execution",
        ))?;
        registry.register(Box::new(segments_stashed.clone()))?;

        let segments_deleted = Counter::with_opts(Opts::new(
            "ctxheap_segments_deleted_total",
            "Segments permanently deleted",
        ))?;
        registry.register(Box::new(segments_deleted.clone()))?;

        let segments_retrieved = Counter::with_opts(Opts::new(
            "ctxheap_segments_retrieved_total",
            "Segments promoted from the archive back to the working set",
        ))?;
        registry.register(Box::new(segments_retrieved.clone()))?;

        let gc_passes = Counter::with_opts(Opts::new(
            "ctxheap_gc_passes_total",
            "Total number of GC analysis passes",
        ))?;
        registry.register(Box::new(gc_passes.clone()))?;

        let tokens_freed = Counter::with_opts(Opts::new(
            "ctxheap_tokens_freed_total",
            "Working-set tokens freed by stash, GC and delete",
        ))?;
        registry.register(Box::new(tokens_freed.clone()))?;

        let over_capacity_events = Counter::with_opts(Opts::new(
            "ctxheap_over_capacity_total",
            "Inserts accepted into a scope whose members are all pinned",
        ))?;
        registry.register(Box::new(over_capacity_events.clone()))?;

        let index_rebuilds = CounterVec::new(
            Opts::new("ctxheap_index_rebuilds_total", "Full index rebuilds by cause"),
            &["cause"],
        )?;
        registry.register(Box::new(index_rebuilds.clone()))?;

        let storage_errors = Counter::with_opts(Opts::new(
            "ctxheap_storage_errors_total",
            "Shard or snapshot writes that failed after retry",
        ))?;
        registry.register(Box::new(storage_errors.clone()))?;

        let tier_segments = GaugeVec::new(
            Opts::new("ctxheap_tier_segments", "Current segment count per tier"),
            &["tier"],
        )?;
        registry.register(Box::new(tier_segments.clone()))?;

        let open_projects = Gauge::with_opts(Opts::new(
            "ctxheap_open_projects",
            "Projects currently loaded",
        ))?;
        registry.register(Box::new(open_projects.clone()))?;

        let search_latency = HistogramVec::new(
            HistogramOpts::new("ctxheap_search_latency_seconds", "Search and retrieve latency")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0]),
            &["op"],
        )?;
        registry.register(Box::new(search_latency.clone()))?;

        let shard_write_latency = Histogram::with_opts(
            HistogramOpts::new(
                "ctxheap_shard_write_latency_seconds",
                "Time to persist dirty shards after a mutation",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        )?;
        registry.register(Box::new(shard_write_latency.clone()))?;

        let gc_candidates = Histogram::with_opts(
            HistogramOpts::new("ctxheap_gc_candidates", "Candidates evaluated per GC pass")
                .buckets(vec![1.0, 10.0, 100.0, 1000.0, 10000.0]),
        )?;
        registry.register(Box::new(gc_candidates.clone()))?;

        Ok(Self {
            segments_ingested,
            segments_spilled,
            segments_stashed,
            segments_deleted,
            segments_retrieved,
            gc_passes,
            tokens_freed,
            over_capacity_events,
            index_rebuilds,
            storage_errors,
            tier_segments,
            open_projects,
            search_latency,
            shard_write_latency,
            gc_candidates,
            registry: Arc::new(registry),
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn record_ingest(&self, spilled: usize, over_capacity: bool) {
        self.segments_ingested.inc();
        self.record_spills(spilled);
        if over_capacity {
            self.over_capacity_events.inc();
        }
    }

    pub fn record_spills(&self, count: usize) {
        self.segments_spilled.inc_by(count as f64);
    }

    pub fn record_stash(&self, count: usize, tokens: u64) {
        self.segments_stashed.inc_by(count as f64);
        self.tokens_freed.inc_by(tokens as f64);
    }

    pub fn record_delete(&self, count: usize, tokens: u64) {
        self.segments_deleted.inc_by(count as f64);
        self.tokens_freed.inc_by(tokens as f64);
    }

    pub fn record_retrieve(&self, moved: usize, duration_secs: f64) {
        self.segments_retrieved.inc_by(moved as f64);
        self.search_latency
            .with_label_values(&["retrieve"])
            .observe(duration_secs);
    }

    pub fn record_search(&self, duration_secs: f64) {
        self.search_latency
            .with_label_values(&["search"])
            .observe(duration_secs);
    }

    pub fn record_gc_pass(&self, candidates: usize) {
        self.gc_passes.inc();
        self.gc_candidates.observe(candidates as f64);
    }

    pub fn record_rebuild(&self, cause: &str) {
        self.index_rebuilds.with_label_values(&[cause]).inc();
    }

    pub fn record_shard_write(&self, duration_secs: f64, ok: bool) {
        self.shard_write_latency.observe(duration_secs);
        if !ok {
            self.storage_errors.inc();
        }
    }

    /// Add a signed delta to a tier gauge
    pub fn adjust_tier(&self, tier: &str, delta: f64) {
        self.tier_segments.with_label_values(&[tier]).add(delta);
    }

    pub fn set_open_projects(&self, count: usize) {
        self.open_projects.set(count as f64);
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_render() {
        let metrics = ContextMetrics::new().unwrap();
        metrics.record_ingest(2, true);
        metrics.record_stash(3, 120);
        metrics.record_rebuild("marker_mismatch");
        metrics.adjust_tier("working", 5.0);
        metrics.adjust_tier("working", -2.0);

        assert_eq!(metrics.segments_ingested.get(), 1.0);
        assert_eq!(metrics.segments_spilled.get(), 2.0);
        assert_eq!(metrics.over_capacity_events.get(), 1.0);
        assert_eq!(metrics.tokens_freed.get(), 120.0);
        assert_eq!(metrics.tier_segments.with_label_values(&["working"]).get(), 3.0);

        let text = metrics.render().unwrap();
        assert!(text.contains("ctxheap_segments_ingested_total 1"));
        assert!(text.contains("marker_mismatch"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = ContextMetrics::new().unwrap();
        let b = ContextMetrics::new().unwrap();
        a.record_delete(1, 10);
        assert_eq!(b.segments_deleted.get(), 0.0);
    }
}
