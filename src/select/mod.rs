//! Server-selection strategies.
//!
//! Strategies operate over strictly-healthy metrics snapshots and return a
//! ranked decision. Because entity names pin their owning upstream, the
//! selector is a policy/diagnostics layer: it governs tie-breaks and feeds
//! the observability API rather than overriding the routing tables.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::StrategyKind;
use crate::metrics::UpstreamScore;

mod adaptive;
mod load_balanced;
mod performance;
mod quality;
mod round_robin;

pub use adaptive::AdaptiveStrategy;
pub use load_balanced::LoadBalancedStrategy;
pub use performance::PerformanceStrategy;
pub use quality::QualityStrategy;
pub use round_robin::RoundRobinStrategy;

/// Core trait for selection strategies.
pub trait SelectionStrategy: Send + Sync {
    /// Pick one upstream from the healthy candidates, or `None` when the
    /// candidate set is empty.
    fn select(
        &self,
        request: &serde_json::Value,
        candidates: &[UpstreamScore],
    ) -> Option<SelectionResult>;

    /// Strategy name for config keys, logs, and the observability API.
    fn name(&self) -> &'static str;
}

/// A strategy's decision with its ranking context.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SelectionResult {
    pub selected_server: String,
    /// `1 − rank / |healthy|` where rank is the pick's position in
    /// overall-score order.
    pub confidence: f64,
    pub reason: String,
    /// Up to three runners-up in overall-score order.
    pub alternatives: Vec<String>,
    pub estimated_response_time_ms: f64,
    pub strategy_name: &'static str,
}

/// Assemble a [`SelectionResult`] for `chosen` against the candidate set.
pub(crate) fn build_result(
    strategy_name: &'static str,
    reason: String,
    chosen: &UpstreamScore,
    candidates: &[UpstreamScore],
) -> SelectionResult {
    let mut by_overall: Vec<&UpstreamScore> = candidates.iter().collect();
    by_overall.sort_by(|a, b| {
        b.quality
            .overall
            .partial_cmp(&a.quality.overall)
            .unwrap_or(Ordering::Equal)
    });
    let rank = by_overall
        .iter()
        .position(|s| s.name == chosen.name)
        .unwrap_or(0);
    let confidence = 1.0 - rank as f64 / candidates.len() as f64;
    let alternatives = by_overall
        .iter()
        .filter(|s| s.name != chosen.name)
        .take(3)
        .map(|s| s.name.clone())
        .collect();
    SelectionResult {
        selected_server: chosen.name.clone(),
        confidence,
        reason,
        alternatives,
        estimated_response_time_ms: chosen.record.response_time_ms,
        strategy_name,
    }
}

/// Build the name-keyed strategy registry used by the registry at startup.
pub fn build_strategies() -> HashMap<&'static str, Arc<dyn SelectionStrategy>> {
    let all: Vec<Arc<dyn SelectionStrategy>> = vec![
        Arc::new(QualityStrategy),
        Arc::new(PerformanceStrategy),
        Arc::new(LoadBalancedStrategy),
        Arc::new(RoundRobinStrategy::new()),
        Arc::new(AdaptiveStrategy::new()),
    ];
    all.into_iter().map(|s| (s.name(), s)).collect()
}

/// Resolve a configured kind to its registered name.
pub fn strategy_key(kind: StrategyKind) -> &'static str {
    kind.as_str()
}

#[cfg(test)]
pub(crate) mod test_util {
    use crate::metrics::{MetricsRecord, QualityScore, UpstreamScore};
    use std::time::Instant;

    /// Healthy snapshot with derived quality, for strategy tests.
    pub(crate) fn score(
        name: &str,
        response_time_ms: f64,
        success_rate: f64,
        load_factor: f64,
    ) -> UpstreamScore {
        let record = MetricsRecord {
            response_time_ms,
            total_requests: 100,
            error_count: ((1.0 - success_rate) * 100.0).round() as u64,
            success_rate,
            last_used: Instant::now(),
            is_healthy: true,
            load_factor,
            capability_score: 1.0,
        };
        let performance = (1.0 - response_time_ms / 5000.0).max(0.0);
        let load = 1.0 - load_factor;
        let overall = 0.30 * performance + 0.30 * success_rate + 0.20 * 1.0 + 0.20 * load;
        let quality = QualityScore {
            performance,
            reliability: success_rate,
            capability: 1.0,
            load,
            overall,
        };
        UpstreamScore {
            name: name.to_string(),
            record,
            quality,
        }
    }
}
