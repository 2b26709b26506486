//! Performance strategy — lowest smoothed response time wins.

use super::{build_result, SelectionResult, SelectionStrategy};
use crate::metrics::UpstreamScore;

#[derive(Debug, Default)]
pub struct PerformanceStrategy;

impl SelectionStrategy for PerformanceStrategy {
    fn select(
        &self,
        _request: &serde_json::Value,
        candidates: &[UpstreamScore],
    ) -> Option<SelectionResult> {
        let chosen = candidates.iter().min_by(|a, b| {
            a.record
                .response_time_ms
                .partial_cmp(&b.record.response_time_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        Some(build_result(
            self.name(),
            format!(
                "lowest response time {:.0} ms",
                chosen.record.response_time_ms
            ),
            chosen,
            candidates,
        ))
    }

    fn name(&self) -> &'static str {
        "performance"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::select::test_util::score;

    #[test]
    fn test_picks_fastest() {
        let candidates = vec![
            score("x", 100.0, 0.95, 0.2),
            score("y", 800.0, 0.999, 0.2),
        ];
        let result = PerformanceStrategy
            .select(&serde_json::Value::Null, &candidates)
            .unwrap();
        assert_eq!(result.selected_server, "x");
        assert!((result.estimated_response_time_ms - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_candidates_yield_none() {
        assert!(PerformanceStrategy
            .select(&serde_json::Value::Null, &[])
            .is_none());
    }
}
