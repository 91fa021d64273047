//! Prometheus-compatible counters for the dedupe index.
//!
//! All counters are `AtomicU64` so the engine and coordinator can record
//! events without taking the engine lock.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// The type of metric: counter or gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up or down.
    Gauge,
}

/// The value of a metric.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// A counter value.
    Counter(u64),
    /// A gauge value.
    Gauge(f64),
}

/// A single metric with metadata and value.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupMetric {
    /// The metric name.
    pub name: String,
    /// Help text describing the metric.
    pub help: String,
    /// The kind of metric.
    pub kind: MetricKind,
    /// The metric value.
    pub value: MetricValue,
}

/// Point-in-time copy of [`DedupMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupMetricsSnapshot {
    /// Entries linked into the index.
    pub inserts: u64,
    /// Adds dropped because the hash was already indexed.
    pub duplicate_hashes: u64,
    /// Adds dropped because the extent was already indexed.
    pub duplicate_locators: u64,
    /// Entries evicted from the LRU tail (capacity or disable).
    pub evictions: u64,
    /// Entries removed by locator.
    pub removals: u64,
    /// Lookups started.
    pub lookups: u64,
    /// Lookups that claimed an extent.
    pub hits: u64,
    /// Lookups that found nothing or could not confirm a candidate.
    pub misses: u64,
    /// Hits confirmed without a pending reference head.
    pub fast_path: u64,
    /// Candidates that needed the reference head lock.
    pub slow_path: u64,
    /// Protocol restarts after a head was retired.
    pub retries: u64,
    /// Candidates that disappeared while the engine lock was released.
    pub vanished: u64,
}

impl DedupMetricsSnapshot {
    /// Fraction of lookups that deduplicated. 0.0 when nothing was looked up.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Thread-safe dedupe counters.
#[derive(Debug, Default)]
pub struct DedupMetrics {
    inserts: AtomicU64,
    duplicate_hashes: AtomicU64,
    duplicate_locators: AtomicU64,
    evictions: AtomicU64,
    removals: AtomicU64,
    lookups: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    fast_path: AtomicU64,
    slow_path: AtomicU64,
    retries: AtomicU64,
    vanished: AtomicU64,
}

macro_rules! recorder {
    ($(#[$doc:meta] $fn_name:ident => $field:ident),* $(,)?) => {
        $(
            #[$doc]
            #[inline]
            pub fn $fn_name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl DedupMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    recorder! {
        /// Record a new index entry.
        record_insert => inserts,
        /// Record an add dropped on a duplicate hash.
        record_duplicate_hash => duplicate_hashes,
        /// Record an add dropped on a duplicate extent.
        record_duplicate_locator => duplicate_locators,
        /// Record a removal by locator.
        record_removal => removals,
        /// Record the start of a lookup.
        record_lookup => lookups,
        /// Record a confirmed dedupe hit.
        record_hit => hits,
        /// Record a lookup that did not deduplicate.
        record_miss => misses,
        /// Record a hit confirmed on the fast path.
        record_fast_path => fast_path,
        /// Record a candidate taking the slow path.
        record_slow_path => slow_path,
        /// Record a protocol restart.
        record_retry => retries,
        /// Record a candidate that vanished during the slow path.
        record_vanished => vanished,
    }

    /// Record `count` evictions.
    #[inline]
    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> DedupMetricsSnapshot {
        DedupMetricsSnapshot {
            inserts: self.inserts.load(Ordering::Relaxed),
            duplicate_hashes: self.duplicate_hashes.load(Ordering::Relaxed),
            duplicate_locators: self.duplicate_locators.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fast_path: self.fast_path.load(Ordering::Relaxed),
            slow_path: self.slow_path.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            vanished: self.vanished.load(Ordering::Relaxed),
        }
    }

    /// Collect all metrics with Prometheus names and help text.
    ///
    /// `live_entries` is reported as a gauge since it is owned by the engine.
    pub fn collect(&self, live_entries: u64) -> Vec<DedupMetric> {
        self.snapshot().collect(live_entries)
    }
}

impl DedupMetricsSnapshot {
    /// Prometheus view of this snapshot plus the live entry gauge.
    pub fn collect(&self, live_entries: u64) -> Vec<DedupMetric> {
        let s = self;
        let counter = |name: &str, help: &str, v: u64| DedupMetric {
            name: format!("dedupfs_{}_total", name),
            help: help.to_string(),
            kind: MetricKind::Counter,
            value: MetricValue::Counter(v),
        };
        vec![
            counter("inserts", "Entries linked into the dedupe index", s.inserts),
            counter("duplicate_hashes", "Adds dropped on an already indexed hash", s.duplicate_hashes),
            counter("duplicate_locators", "Adds dropped on an already indexed extent", s.duplicate_locators),
            counter("evictions", "Entries evicted from the LRU tail", s.evictions),
            counter("removals", "Entries removed by extent locator", s.removals),
            counter("lookups", "Dedupe lookups started", s.lookups),
            counter("hits", "Lookups that added a reference to an existing extent", s.hits),
            counter("misses", "Lookups that fell back to a new allocation", s.misses),
            counter("fast_path", "Hits confirmed without a pending reference head", s.fast_path),
            counter("slow_path", "Candidates that locked a pending reference head", s.slow_path),
            counter("retries", "Lookup restarts after a reference head was retired", s.retries),
            counter("vanished", "Candidates evicted while the index lock was released", s.vanished),
            DedupMetric {
                name: "dedupfs_live_entries".to_string(),
                help: "Entries currently held by the dedupe index".to_string(),
                kind: MetricKind::Gauge,
                value: MetricValue::Gauge(live_entries as f64),
            },
            DedupMetric {
                name: "dedupfs_hit_ratio".to_string(),
                help: "Dedupe hit ratio (hits / (hits + misses))".to_string(),
                kind: MetricKind::Gauge,
                value: MetricValue::Gauge(s.hit_ratio()),
            },
        ]
    }
}

/// Render metrics in the Prometheus text exposition format.
pub fn render_prometheus(metrics: &[DedupMetric]) -> String {
    let mut out = String::new();
    for m in metrics {
        let kind = match m.kind {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        };
        out.push_str(&format!("# HELP {} {}\n", m.name, m.help));
        out.push_str(&format!("# TYPE {} {}\n", m.name, kind));
        match m.value {
            MetricValue::Counter(v) => out.push_str(&format!("{} {}\n", m.name, v)),
            MetricValue::Gauge(v) => out.push_str(&format!("{} {}\n", m.name, v)),
        }
    }
    out
}
