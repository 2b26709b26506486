//! Periodic liveness inspection and health bookkeeping.
//!
//! The monitor catches silent connection loss the transport callbacks
//! missed and keeps the metrics store's health bit authoritative. It never
//! reconnects, never removes an upstream, and a probe never counts as a
//! request — the health bit is the only metrics field it touches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::metrics::MetricsStore;

/// Consecutive connection-class failures at which an upstream is demoted.
const UNHEALTHY_FAILURE_THRESHOLD: u32 = 5;

/// A demoted upstream may be rechecked once its last check is this old.
const RECOVERY_AGE: Duration = Duration::from_secs(60);

/// Outcome of one liveness check, overwritten per upstream on each sweep.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub server_name: String,
    pub is_healthy: bool,
    pub last_check: Instant,
    pub error_message: Option<String>,
    /// Smoothed response time at check time, if the upstream has metrics.
    pub response_time_ms: Option<f64>,
}

/// Fleet-level rollup for the observability API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub avg_response_time_ms: f64,
}

/// Tracks the latest check per upstream and flips the metrics health bit.
pub struct HealthMonitor {
    checks: RwLock<HashMap<String, HealthCheck>>,
    metrics: Arc<MetricsStore>,
}

impl HealthMonitor {
    pub fn new(metrics: Arc<MetricsStore>) -> Self {
        Self {
            checks: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Run the liveness logic for one upstream from its observed
    /// connection state, store the check, and update the health bit.
    ///
    /// Also the manual trigger: management callers invoke it directly for
    /// a synchronous recheck.
    pub async fn check_upstream(
        &self,
        name: &str,
        is_connected: bool,
        last_error: Option<String>,
    ) -> HealthCheck {
        let (is_healthy, error_message) = if !is_connected {
            (
                false,
                Some(last_error.unwrap_or_else(|| "not connected".to_string())),
            )
        } else if let Some(err) = last_error {
            // Connected but with a standing error — the SSE readiness path.
            (false, Some(err))
        } else {
            (true, None)
        };

        let response_time_ms = self
            .metrics
            .snapshot(name)
            .await
            .map(|(record, _)| record.response_time_ms);

        let check = HealthCheck {
            server_name: name.to_string(),
            is_healthy,
            last_check: Instant::now(),
            error_message: error_message.clone(),
            response_time_ms,
        };

        if is_healthy {
            self.metrics.mark_healthy(name).await;
        } else {
            self.metrics
                .mark_unhealthy(name, error_message.as_deref())
                .await;
        }

        self.checks
            .write()
            .await
            .insert(name.to_string(), check.clone());
        check
    }

    /// Sweep every upstream concurrently. One upstream's check cannot
    /// abort another's; results land as they complete.
    pub async fn check_all(
        &self,
        states: Vec<(String, bool, Option<String>)>,
    ) -> Vec<HealthCheck> {
        let checks = states
            .into_iter()
            .map(|(name, connected, error)| async move {
                self.check_upstream(&name, connected, error).await
            });
        futures::future::join_all(checks).await
    }

    /// Latest check for one upstream, if any sweep has covered it.
    pub async fn last_check(&self, name: &str) -> Option<HealthCheck> {
        self.checks.read().await.get(name).cloned()
    }

    pub async fn healthy_names(&self) -> Vec<String> {
        let checks = self.checks.read().await;
        let mut names: Vec<String> = checks
            .values()
            .filter(|c| c.is_healthy)
            .map(|c| c.server_name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn unhealthy_names(&self) -> Vec<String> {
        let checks = self.checks.read().await;
        let mut names: Vec<String> = checks
            .values()
            .filter(|c| !c.is_healthy)
            .map(|c| c.server_name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn summary(&self) -> HealthSummary {
        let checks = self.checks.read().await;
        let total = checks.len();
        let healthy = checks.values().filter(|c| c.is_healthy).count();
        let times: Vec<f64> = checks.values().filter_map(|c| c.response_time_ms).collect();
        let avg_response_time_ms = if times.is_empty() {
            0.0
        } else {
            times.iter().sum::<f64>() / times.len() as f64
        };
        HealthSummary {
            total,
            healthy,
            unhealthy: total - healthy,
            avg_response_time_ms,
        }
    }

    /// Policy knob for the retry wrapper: demote at the failure threshold.
    pub fn should_mark_unhealthy(&self, _name: &str, consecutive_failures: u32) -> bool {
        consecutive_failures >= UNHEALTHY_FAILURE_THRESHOLD
    }

    /// Policy knob: a demoted upstream is eligible for recovery once its
    /// last check has aged out (or it was never checked).
    pub async fn can_recover(&self, name: &str) -> bool {
        match self.checks.read().await.get(name) {
            Some(check) => check.last_check.elapsed() > RECOVERY_AGE,
            None => true,
        }
    }

    /// Drop the stored check for a removed upstream.
    pub async fn remove(&self, name: &str) {
        self.checks.write().await.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor_with_store() -> (HealthMonitor, Arc<MetricsStore>) {
        let metrics = Arc::new(MetricsStore::new());
        (HealthMonitor::new(metrics.clone()), metrics)
    }

    #[tokio::test]
    async fn test_disconnected_upstream_is_unhealthy() {
        let (monitor, metrics) = monitor_with_store();
        metrics.initialize("a").await;
        let check = monitor
            .check_upstream("a", false, Some("Connection closed".to_string()))
            .await;
        assert!(!check.is_healthy);
        assert_eq!(check.error_message.as_deref(), Some("Connection closed"));
        let (record, _) = metrics.snapshot("a").await.unwrap();
        assert!(!record.is_healthy);
    }

    #[tokio::test]
    async fn test_standing_error_while_connected_is_unhealthy() {
        let (monitor, _metrics) = monitor_with_store();
        let check = monitor
            .check_upstream("a", true, Some("SSE stream closed".to_string()))
            .await;
        assert!(!check.is_healthy);
    }

    #[tokio::test]
    async fn test_connected_without_error_is_healthy() {
        let (monitor, metrics) = monitor_with_store();
        metrics.initialize("a").await;
        metrics.mark_unhealthy("a", None).await;
        let check = monitor.check_upstream("a", true, None).await;
        assert!(check.is_healthy);
        let (record, _) = metrics.snapshot("a").await.unwrap();
        assert!(record.is_healthy, "health self-heals on a clean probe");
    }

    #[tokio::test]
    async fn test_probe_never_mutates_error_count() {
        let (monitor, metrics) = monitor_with_store();
        metrics.initialize("a").await;
        metrics.record_request("a", 12.0, false).await;
        let (before, _) = metrics.snapshot("a").await.unwrap();

        monitor
            .check_upstream("a", false, Some("Connection refused".to_string()))
            .await;
        monitor.check_upstream("a", true, None).await;

        let (after, _) = metrics.snapshot("a").await.unwrap();
        assert_eq!(after.error_count, before.error_count);
        assert_eq!(after.total_requests, before.total_requests);
    }

    #[tokio::test]
    async fn test_check_all_isolates_outcomes() {
        let (monitor, _metrics) = monitor_with_store();
        let checks = monitor
            .check_all(vec![
                ("up".to_string(), true, None),
                ("down".to_string(), false, Some("timeout".to_string())),
            ])
            .await;
        assert_eq!(checks.len(), 2);
        assert_eq!(monitor.healthy_names().await, vec!["up".to_string()]);
        assert_eq!(monitor.unhealthy_names().await, vec!["down".to_string()]);
    }

    #[tokio::test]
    async fn test_summary_counts_and_average() {
        let (monitor, metrics) = monitor_with_store();
        metrics.initialize("a").await;
        metrics.record_request("a", 100.0, true).await;
        monitor.check_upstream("a", true, None).await;
        monitor.check_upstream("b", false, None).await;

        let summary = monitor.summary().await;
        assert_eq!(summary.total, 2);
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.unhealthy, 1);
        assert!((summary.avg_response_time_ms - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_should_mark_unhealthy_threshold() {
        let (monitor, _) = monitor_with_store();
        assert!(!monitor.should_mark_unhealthy("a", 4));
        assert!(monitor.should_mark_unhealthy("a", 5));
        assert!(monitor.should_mark_unhealthy("a", 9));
    }

    #[tokio::test]
    async fn test_can_recover_requires_aged_check() {
        let (monitor, _) = monitor_with_store();
        assert!(
            monitor.can_recover("never-checked").await,
            "unchecked upstreams may always recover"
        );
        monitor.check_upstream("a", false, None).await;
        assert!(!monitor.can_recover("a").await, "fresh check blocks recovery");
    }
}
