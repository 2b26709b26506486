//! Relay configuration — `config.json` deserialization and validation.

use crate::error::RelayError;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

/// Resolve an environment allowlist to a name→value map.
///
/// Only the listed variable names are inherited from the current process
/// environment; variables that are not set resolve to the empty string.
pub fn resolve_env_allowlist(names: &[String]) -> HashMap<String, String> {
    names
        .iter()
        .map(|name| (name.clone(), std::env::var(name).unwrap_or_default()))
        .collect()
}

/// Top-level relay configuration, parsed from `config.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    #[serde(default)]
    pub servers: Vec<UpstreamConfig>,
    #[serde(default)]
    pub selection_strategy: SelectionStrategyConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Configuration for a single upstream MCP server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    pub name: String,
    pub transport: TransportConfig,
    /// 1 = highest, 10 = lowest.
    pub priority: Option<u8>,
    /// Declared capability tags, surfaced through the observability API.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Soft ceiling on in-flight requests to this upstream.
    pub max_concurrent_requests: Option<usize>,
}

/// Supported upstream transports.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Child process speaking MCP over stdio.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        /// Allowlist of environment variable names to inherit.
        #[serde(default)]
        env: Vec<String>,
    },
    /// Server-sent events over HTTP with a POST back-channel.
    Sse { url: String },
}

/// Selection-strategy names accepted in config.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Adaptive,
    Quality,
    Performance,
    LoadBalanced,
    RoundRobin,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Adaptive => "adaptive",
            StrategyKind::Quality => "quality",
            StrategyKind::Performance => "performance",
            StrategyKind::LoadBalanced => "load-balanced",
            StrategyKind::RoundRobin => "round-robin",
        }
    }
}

/// Strategy selection, retry budget, and per-operation timeouts.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionStrategyConfig {
    #[serde(default = "default_strategy")]
    pub default: StrategyKind,
    #[serde(default = "default_fallback_strategy")]
    pub fallback: StrategyKind,
    /// General request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,
    /// Retry budget for non-tool-call operations; tool calls always use 1.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Health monitor cadence in milliseconds.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval: u64,
    #[serde(default)]
    pub timeouts: OperationTimeouts,
}

impl Default for SelectionStrategyConfig {
    fn default() -> Self {
        Self {
            default: default_strategy(),
            fallback: default_fallback_strategy(),
            timeout: default_timeout_ms(),
            max_retries: default_max_retries(),
            health_check_interval: default_health_check_interval_ms(),
            timeouts: OperationTimeouts::default(),
        }
    }
}

/// Per-operation timeouts in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationTimeouts {
    #[serde(default = "default_list_timeout_ms")]
    pub tools_list: u64,
    #[serde(default = "default_tools_call_timeout_ms")]
    pub tools_call: u64,
    #[serde(default = "default_targeted_timeout_ms")]
    pub prompts_get: u64,
    #[serde(default = "default_list_timeout_ms")]
    pub prompts_list: u64,
    #[serde(default = "default_list_timeout_ms")]
    pub resources_list: u64,
    #[serde(default = "default_targeted_timeout_ms")]
    pub resources_read: u64,
    #[serde(default = "default_list_timeout_ms")]
    pub resource_templates_list: u64,
    #[serde(default = "default_reinitialize_timeout_ms")]
    pub reinitialize: u64,
    /// Spacing between connect attempts.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay: u64,
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        Self {
            tools_list: default_list_timeout_ms(),
            tools_call: default_tools_call_timeout_ms(),
            prompts_get: default_targeted_timeout_ms(),
            prompts_list: default_list_timeout_ms(),
            resources_list: default_list_timeout_ms(),
            resources_read: default_targeted_timeout_ms(),
            resource_templates_list: default_list_timeout_ms(),
            reinitialize: default_reinitialize_timeout_ms(),
            reconnect_delay: default_reconnect_delay_ms(),
        }
    }
}

/// Metrics retention and alerting thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_retention_hours")]
    pub metrics_retention_hours: u64,
    #[serde(default)]
    pub alert_thresholds: AlertThresholds,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            metrics_retention_hours: default_retention_hours(),
            alert_thresholds: AlertThresholds::default(),
        }
    }
}

/// Thresholds the dashboard alerts on.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertThresholds {
    /// Milliseconds of smoothed response time.
    #[serde(default = "default_timeout_ms")]
    pub response_time: u64,
    #[serde(default = "default_error_rate")]
    pub error_rate: f64,
    /// Fraction of the fleet allowed to be unhealthy.
    #[serde(default = "default_unhealthy_fraction")]
    pub unhealthy_servers: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            response_time: default_timeout_ms(),
            error_rate: default_error_rate(),
            unhealthy_servers: default_unhealthy_fraction(),
        }
    }
}

fn default_strategy() -> StrategyKind {
    StrategyKind::Adaptive
}

fn default_fallback_strategy() -> StrategyKind {
    StrategyKind::Quality
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_max_retries() -> u32 {
    2
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_list_timeout_ms() -> u64 {
    10_000
}

fn default_tools_call_timeout_ms() -> u64 {
    60_000
}

fn default_targeted_timeout_ms() -> u64 {
    15_000
}

fn default_reinitialize_timeout_ms() -> u64 {
    30_000
}

fn default_reconnect_delay_ms() -> u64 {
    2500
}

fn default_enabled() -> bool {
    true
}

fn default_retention_hours() -> u64 {
    24
}

fn default_error_rate() -> f64 {
    0.1
}

fn default_unhealthy_fraction() -> f64 {
    0.5
}

impl RelayConfig {
    /// Parse a `config.json` document.
    pub fn from_json(content: &str) -> crate::Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| RelayError::InvalidConfig("config".to_string(), e.to_string()))
    }

    /// Validate the config, failing fast before any upstream is spawned.
    pub fn validate(&self) -> crate::Result<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        for upstream in &self.servers {
            if !seen.insert(upstream.name.as_str()) {
                return Err(RelayError::DuplicateName(upstream.name.clone()));
            }
        }

        for upstream in &self.servers {
            let name = &upstream.name;

            if name.is_empty()
                || !name
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
            {
                return Err(RelayError::InvalidConfig(
                    name.clone(),
                    "name must be non-empty alphanumeric with hyphens or underscores".to_string(),
                ));
            }

            match &upstream.transport {
                TransportConfig::Stdio { command, .. } => {
                    if command.is_empty() {
                        return Err(RelayError::InvalidConfig(
                            name.clone(),
                            "stdio transport requires a non-empty 'command'".to_string(),
                        ));
                    }
                }
                TransportConfig::Sse { url } => {
                    if !url.starts_with("http://") && !url.starts_with("https://") {
                        return Err(RelayError::InvalidConfig(
                            name.clone(),
                            format!("sse transport requires an http(s) 'url', got '{}'", url),
                        ));
                    }
                }
            }

            if let Some(priority) = upstream.priority {
                if !(1..=10).contains(&priority) {
                    return Err(RelayError::InvalidConfig(
                        name.clone(),
                        format!("priority must be between 1 and 10, got {}", priority),
                    ));
                }
            }

            if upstream.max_concurrent_requests == Some(0) {
                return Err(RelayError::InvalidConfig(
                    name.clone(),
                    "maxConcurrentRequests must be at least 1".to_string(),
                ));
            }
        }

        Ok(())
    }
}
