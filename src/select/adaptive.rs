//! Adaptive strategy — routes by request shape.
//!
//! Tight deadlines go to the fastest upstream, high-priority work to the
//! most reliable one, and everything else to the best overall quality.

use super::{build_result, PerformanceStrategy, QualityStrategy, SelectionResult, SelectionStrategy};
use crate::metrics::UpstreamScore;

/// Deadline below which latency outweighs everything else.
const TIGHT_TIMEOUT_MS: f64 = 1000.0;

pub struct AdaptiveStrategy {
    performance: PerformanceStrategy,
    quality: QualityStrategy,
}

impl AdaptiveStrategy {
    pub fn new() -> Self {
        Self {
            performance: PerformanceStrategy,
            quality: QualityStrategy,
        }
    }

    fn select_most_reliable(
        &self,
        candidates: &[UpstreamScore],
    ) -> Option<SelectionResult> {
        let chosen = candidates.iter().max_by(|a, b| {
            a.record
                .success_rate
                .partial_cmp(&b.record.success_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        Some(build_result(
            self.name(),
            format!(
                "high priority routed to success rate {:.3}",
                chosen.record.success_rate
            ),
            chosen,
            candidates,
        ))
    }
}

impl Default for AdaptiveStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for AdaptiveStrategy {
    fn select(
        &self,
        request: &serde_json::Value,
        candidates: &[UpstreamScore],
    ) -> Option<SelectionResult> {
        let timeout_ms = request.get("timeout").and_then(|v| v.as_f64());
        if timeout_ms.is_some_and(|t| t < TIGHT_TIMEOUT_MS) {
            let mut result = self.performance.select(request, candidates)?;
            result.strategy_name = self.name();
            result.reason = format!("tight deadline: {}", result.reason);
            return Some(result);
        }

        let priority = request.get("priority").and_then(|v| v.as_str());
        if priority == Some("high") {
            return self.select_most_reliable(candidates);
        }

        let mut result = self.quality.select(request, candidates)?;
        result.strategy_name = self.name();
        Some(result)
    }

    fn name(&self) -> &'static str {
        "adaptive"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::select::test_util::score;
    use serde_json::json;

    fn candidates() -> Vec<UpstreamScore> {
        vec![
            // x: fast but less reliable; y: slow but nearly perfect.
            score("x", 100.0, 0.95, 0.2),
            score("y", 800.0, 0.999, 0.2),
        ]
    }

    #[test]
    fn test_tight_timeout_takes_performance_path() {
        let result = AdaptiveStrategy::new()
            .select(&json!({"timeout": 500}), &candidates())
            .unwrap();
        assert_eq!(result.selected_server, "x");
        assert_eq!(result.strategy_name, "adaptive");
        assert!(result.reason.contains("tight deadline"));
    }

    #[test]
    fn test_high_priority_takes_reliability_path() {
        let result = AdaptiveStrategy::new()
            .select(&json!({"priority": "high"}), &candidates())
            .unwrap();
        assert_eq!(result.selected_server, "y");
    }

    #[test]
    fn test_default_path_uses_overall_quality() {
        let set = candidates();
        let expected = set
            .iter()
            .max_by(|a, b| {
                a.quality
                    .overall
                    .partial_cmp(&b.quality.overall)
                    .unwrap()
            })
            .unwrap()
            .name
            .clone();
        let result = AdaptiveStrategy::new().select(&json!({}), &set).unwrap();
        assert_eq!(result.selected_server, expected);
    }

    #[test]
    fn test_generous_timeout_skips_performance_path() {
        let result = AdaptiveStrategy::new()
            .select(&json!({"timeout": 30000}), &candidates())
            .unwrap();
        assert!(!result.reason.contains("tight deadline"));
    }

    #[test]
    fn test_empty_candidates_yield_none() {
        assert!(AdaptiveStrategy::new().select(&json!({}), &[]).is_none());
    }
}
