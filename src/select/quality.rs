//! Quality strategy — highest composite score wins.

use super::{build_result, SelectionResult, SelectionStrategy};
use crate::metrics::UpstreamScore;

#[derive(Debug, Default)]
pub struct QualityStrategy;

impl SelectionStrategy for QualityStrategy {
    fn select(
        &self,
        _request: &serde_json::Value,
        candidates: &[UpstreamScore],
    ) -> Option<SelectionResult> {
        let chosen = candidates.iter().max_by(|a, b| {
            a.quality
                .overall
                .partial_cmp(&b.quality.overall)
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        Some(build_result(
            self.name(),
            format!("highest overall quality score {:.3}", chosen.quality.overall),
            chosen,
            candidates,
        ))
    }

    fn name(&self) -> &'static str {
        "quality"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::select::test_util::score;

    #[test]
    fn test_picks_highest_overall() {
        let candidates = vec![
            score("slow", 4000.0, 0.9, 0.8),
            score("fast", 100.0, 0.99, 0.1),
        ];
        let result = QualityStrategy
            .select(&serde_json::Value::Null, &candidates)
            .unwrap();
        assert_eq!(result.selected_server, "fast");
        assert_eq!(result.strategy_name, "quality");
        assert_eq!(result.alternatives, vec!["slow".to_string()]);
    }

    #[test]
    fn test_empty_candidates_yield_none() {
        assert!(QualityStrategy
            .select(&serde_json::Value::Null, &[])
            .is_none());
    }
}
