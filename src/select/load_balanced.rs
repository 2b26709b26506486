//! Load-balanced strategy — least-loaded upstream wins.

use super::{build_result, SelectionResult, SelectionStrategy};
use crate::metrics::UpstreamScore;

#[derive(Debug, Default)]
pub struct LoadBalancedStrategy;

impl SelectionStrategy for LoadBalancedStrategy {
    fn select(
        &self,
        _request: &serde_json::Value,
        candidates: &[UpstreamScore],
    ) -> Option<SelectionResult> {
        let chosen = candidates.iter().min_by(|a, b| {
            a.record
                .load_factor
                .partial_cmp(&b.record.load_factor)
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        Some(build_result(
            self.name(),
            format!("lowest load factor {:.2}", chosen.record.load_factor),
            chosen,
            candidates,
        ))
    }

    fn name(&self) -> &'static str {
        "load-balanced"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::select::test_util::score;

    #[test]
    fn test_picks_least_loaded() {
        let candidates = vec![
            score("busy", 100.0, 1.0, 0.9),
            score("idle", 400.0, 1.0, 0.1),
        ];
        let result = LoadBalancedStrategy
            .select(&serde_json::Value::Null, &candidates)
            .unwrap();
        assert_eq!(result.selected_server, "idle");
    }

    #[test]
    fn test_empty_candidates_yield_none() {
        assert!(LoadBalancedStrategy
            .select(&serde_json::Value::Null, &[])
            .is_none());
    }
}
