//! Round-robin strategy — stateful index over the healthy set.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::{build_result, SelectionResult, SelectionStrategy};
use crate::metrics::UpstreamScore;

/// Cycles through healthy upstreams in name order, advancing the counter
/// after every selection.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl SelectionStrategy for RoundRobinStrategy {
    fn select(
        &self,
        _request: &serde_json::Value,
        candidates: &[UpstreamScore],
    ) -> Option<SelectionResult> {
        if candidates.is_empty() {
            return None;
        }
        // Candidate order follows map iteration; sort for a stable cycle.
        let mut ordered: Vec<&UpstreamScore> = candidates.iter().collect();
        ordered.sort_by(|a, b| a.name.cmp(&b.name));

        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        let chosen = ordered[count % ordered.len()];
        Some(build_result(
            self.name(),
            format!("round-robin slot {}", count % ordered.len()),
            chosen,
            candidates,
        ))
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::select::test_util::score;

    #[test]
    fn test_cycles_in_order() {
        let strategy = RoundRobinStrategy::new();
        let candidates = vec![
            score("c", 100.0, 1.0, 0.0),
            score("a", 100.0, 1.0, 0.0),
            score("b", 100.0, 1.0, 0.0),
        ];
        let picks: Vec<String> = (0..4)
            .map(|_| {
                strategy
                    .select(&serde_json::Value::Null, &candidates)
                    .unwrap()
                    .selected_server
            })
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_counter_survives_shrinking_set() {
        let strategy = RoundRobinStrategy::new();
        let three = vec![
            score("a", 100.0, 1.0, 0.0),
            score("b", 100.0, 1.0, 0.0),
            score("c", 100.0, 1.0, 0.0),
        ];
        strategy.select(&serde_json::Value::Null, &three);
        strategy.select(&serde_json::Value::Null, &three);
        // Set shrinks to two; selection keeps cycling without panicking.
        let two = vec![score("a", 100.0, 1.0, 0.0), score("b", 100.0, 1.0, 0.0)];
        let pick = strategy
            .select(&serde_json::Value::Null, &two)
            .unwrap()
            .selected_server;
        assert!(pick == "a" || pick == "b");
    }

    #[test]
    fn test_empty_candidates_yield_none() {
        let strategy = RoundRobinStrategy::new();
        assert!(strategy.select(&serde_json::Value::Null, &[]).is_none());
    }
}
