//! Per-upstream request metrics and derived quality scores.
//!
//! The store keeps one [`MetricsRecord`] per upstream plus a paired
//! [`QualityScore`] recomputed on every mutation. Request handlers record
//! outcomes; the health monitor flips the health bit and nothing else — a
//! failed liveness probe is not a failed request, so probes must never
//! touch `error_count`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Weight of the newest sample when smoothing response times.
const SMOOTHING_NEW_WEIGHT: f64 = 0.7;

/// Window over which request rate is measured for the load factor.
const LOAD_WINDOW: Duration = Duration::from_secs(60);

/// Requests per minute at which an upstream counts as fully loaded.
const LOAD_SATURATION_RPM: f64 = 100.0;

/// Weight of the newest sample when blending the load factor.
const LOAD_NEW_WEIGHT: f64 = 0.7;

/// Multiplier applied to the load factor when the upstream sat idle past
/// the window.
const LOAD_IDLE_DECAY: f64 = 0.9;

/// Response time (ms) at which the performance score bottoms out at 0.
const PERFORMANCE_FLOOR_MS: f64 = 5000.0;

/// How often the cleanup pass runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Rolling statistics for one upstream.
#[derive(Debug, Clone)]
pub struct MetricsRecord {
    /// Exponentially smoothed response time in milliseconds.
    pub response_time_ms: f64,
    pub total_requests: u64,
    pub error_count: u64,
    /// `1 − error_count / total_requests`.
    pub success_rate: f64,
    pub last_used: Instant,
    pub is_healthy: bool,
    /// Observed request-rate pressure, 0 (idle) to 1 (saturated).
    pub load_factor: f64,
    /// Externally supplied fit score, defaults to 1.0.
    pub capability_score: f64,
}

impl MetricsRecord {
    fn new() -> Self {
        Self {
            response_time_ms: 0.0,
            total_requests: 0,
            error_count: 0,
            success_rate: 1.0,
            last_used: Instant::now(),
            is_healthy: true,
            load_factor: 0.0,
            capability_score: 1.0,
        }
    }

    /// Seconds since this upstream last served a request.
    pub fn idle_secs(&self) -> f64 {
        self.last_used.elapsed().as_secs_f64()
    }
}

/// Composite quality breakdown, each component in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct QualityScore {
    pub performance: f64,
    pub reliability: f64,
    pub capability: f64,
    pub load: f64,
    pub overall: f64,
}

impl QualityScore {
    fn derive(record: &MetricsRecord) -> Self {
        let performance = (1.0 - record.response_time_ms / PERFORMANCE_FLOOR_MS).max(0.0);
        let reliability = if record.is_healthy {
            record.success_rate
        } else {
            0.0
        };
        let load = 1.0 - record.load_factor;
        let capability = record.capability_score;
        let overall =
            0.30 * performance + 0.30 * reliability + 0.20 * capability + 0.20 * load;
        Self {
            performance,
            reliability,
            capability,
            load,
            overall,
        }
    }
}

/// A named metrics snapshot handed to selection strategies.
#[derive(Debug, Clone)]
pub struct UpstreamScore {
    pub name: String,
    pub record: MetricsRecord,
    pub quality: QualityScore,
}

struct ServerMetrics {
    record: MetricsRecord,
    quality: QualityScore,
}

impl ServerMetrics {
    fn new() -> Self {
        let record = MetricsRecord::new();
        let quality = QualityScore::derive(&record);
        Self { record, quality }
    }
}

/// Shared store of per-upstream metrics, referenced by name everywhere.
#[derive(Default)]
pub struct MetricsStore {
    inner: RwLock<HashMap<String, ServerMetrics>>,
}

/// Smoothed response time: first sample is assigned directly, later
/// samples dominate the running value.
fn smooth_response_time(previous_ms: f64, sample_ms: f64, first_sample: bool) -> f64 {
    if first_sample {
        sample_ms
    } else {
        previous_ms * (1.0 - SMOOTHING_NEW_WEIGHT) + sample_ms * SMOOTHING_NEW_WEIGHT
    }
}

/// Load factor update for a request arriving `gap` after the previous one.
///
/// Inside the window the observed rate is normalized against the
/// saturation point and blended in; past the window the old value decays.
fn update_load_factor(previous: f64, total_requests: u64, gap: Duration, first_sample: bool) -> f64 {
    if gap > LOAD_WINDOW {
        return (previous * LOAD_IDLE_DECAY).clamp(0.0, 1.0);
    }
    let window_fraction = (gap.as_secs_f64() / LOAD_WINDOW.as_secs_f64()).max(1e-3);
    let rpm = total_requests as f64 / window_fraction;
    let new_load = (rpm / LOAD_SATURATION_RPM).min(1.0);
    if first_sample {
        new_load
    } else {
        (previous * (1.0 - LOAD_NEW_WEIGHT) + new_load * LOAD_NEW_WEIGHT).clamp(0.0, 1.0)
    }
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a fresh record: success rate 1.0, zero load, healthy.
    pub async fn initialize(&self, name: &str) {
        let mut inner = self.inner.write().await;
        inner.insert(name.to_string(), ServerMetrics::new());
    }

    /// Record one completed request attempt against an upstream.
    pub async fn record_request(&self, name: &str, elapsed_ms: f64, success: bool) {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entry(name.to_string())
            .or_insert_with(ServerMetrics::new);
        let record = &mut entry.record;

        record.total_requests += 1;
        if !success {
            record.error_count += 1;
        }
        record.success_rate = 1.0 - record.error_count as f64 / record.total_requests as f64;

        let first_sample = record.total_requests == 1;
        record.response_time_ms =
            smooth_response_time(record.response_time_ms, elapsed_ms, first_sample);

        let gap = record.last_used.elapsed();
        record.load_factor =
            update_load_factor(record.load_factor, record.total_requests, gap, first_sample);

        record.last_used = Instant::now();
        entry.quality = QualityScore::derive(record);
    }

    /// Flip the health bit on. Never touches request counters.
    pub async fn mark_healthy(&self, name: &str) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.get_mut(name) {
            entry.record.is_healthy = true;
            entry.quality = QualityScore::derive(&entry.record);
        }
    }

    /// Flip the health bit off. Never touches request counters.
    pub async fn mark_unhealthy(&self, name: &str, reason: Option<&str>) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.get_mut(name) {
            if entry.record.is_healthy {
                tracing::debug!(
                    server = %name,
                    reason = reason.unwrap_or("unspecified"),
                    "marking upstream unhealthy"
                );
            }
            entry.record.is_healthy = false;
            entry.quality = QualityScore::derive(&entry.record);
        }
    }

    /// Set the externally supplied capability score, clamped to [0, 1].
    pub async fn update_capability_score(&self, name: &str, score: f64) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.get_mut(name) {
            entry.record.capability_score = score.clamp(0.0, 1.0);
            entry.quality = QualityScore::derive(&entry.record);
        }
    }

    /// Current record and quality for one upstream.
    pub async fn snapshot(&self, name: &str) -> Option<(MetricsRecord, QualityScore)> {
        let inner = self.inner.read().await;
        inner
            .get(name)
            .map(|e| (e.record.clone(), e.quality))
    }

    /// Snapshots for every tracked upstream.
    pub async fn snapshot_all(&self) -> Vec<UpstreamScore> {
        let inner = self.inner.read().await;
        inner
            .iter()
            .map(|(name, e)| UpstreamScore {
                name: name.clone(),
                record: e.record.clone(),
                quality: e.quality,
            })
            .collect()
    }

    /// Snapshots restricted to upstreams whose health bit is set.
    pub async fn healthy_scores(&self) -> Vec<UpstreamScore> {
        let mut scores = self.snapshot_all().await;
        scores.retain(|s| s.record.is_healthy);
        scores
    }

    /// Drop the record (and its paired quality score) for a removed upstream.
    pub async fn remove(&self, name: &str) {
        self.inner.write().await.remove(name);
    }

    /// Evict records idle past `retention`. Returns the eviction count.
    pub async fn evict_idle(&self, retention: Duration) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.len();
        inner.retain(|_, e| e.record.last_used.elapsed() <= retention);
        before - inner.len()
    }
}

/// Periodic cleanup loop, one task per store, cancelled on shutdown.
pub async fn run_metrics_cleanup(
    store: std::sync::Arc<MetricsStore>,
    retention: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let evicted = store.evict_idle(retention).await;
                if evicted > 0 {
                    tracing::debug!(evicted, "evicted idle metrics records");
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!("metrics cleanup cancelled");
                return;
            }
        }
    }
}
