//! RelayRegistry — the single owner of all proxy state.
//!
//! The registry owns the upstream handles, the routing tables, the metrics
//! store, the health monitor, and the strategy registry. Listing requests
//! delegate to the aggregator; targeted requests resolve through the
//! routing tables (rebuilding on a miss) and dispatch through the
//! classified retry wrapper. Everything else — metrics, health, selection
//! — references upstreams by name only.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rmcp::model::{
    CallToolRequestParam, CallToolResult, GetPromptRequestParam, GetPromptResult,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult,
    PaginatedRequestParam, ReadResourceRequestParam, ReadResourceResult,
};
use tokio_util::sync::CancellationToken;

use crate::aggregate::{
    aggregate_prompts, aggregate_resource_templates, aggregate_resources, aggregate_tools,
};
use crate::config::{MonitoringConfig, RelayConfig, SelectionStrategyConfig, TransportConfig};
use crate::error::{classify_error, is_not_found, ErrorClass, ErrorClassifier, RelayError, Result};
use crate::health::{HealthCheck, HealthMonitor};
use crate::metrics::{run_metrics_cleanup, MetricsStore};
use crate::retry::{dispatch_with_retry, RetryContext};
use crate::routing::{EntityKind, RoutingTables};
use crate::select::{build_strategies, strategy_key, SelectionResult, SelectionStrategy};
use crate::upstream::{spawn_upstream, ConnectionState, UpstreamHandle};

/// Tool calls retry once; other targeted operations use the config budget.
const TOOL_CALL_MAX_RETRIES: u32 = 1;

/// Per-upstream status snapshot for the observability API.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamOverview {
    pub name: String,
    pub transport: &'static str,
    pub priority: Option<u8>,
    pub capabilities: Vec<String>,
    pub is_connected: bool,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

/// The aggregating proxy core.
pub struct RelayRegistry {
    upstreams: tokio::sync::RwLock<HashMap<String, Arc<UpstreamHandle>>>,
    routing: RoutingTables,
    metrics: Arc<MetricsStore>,
    monitor: Arc<HealthMonitor>,
    strategies: HashMap<&'static str, Arc<dyn SelectionStrategy>>,
    selection: SelectionStrategyConfig,
    monitoring: MonitoringConfig,
    classifier: ErrorClassifier,
    /// Root token for this registry's actors and periodic tasks.
    cancel: CancellationToken,
}

impl RelayRegistry {
    /// Build a registry from validated config, spawning all upstream
    /// actors and the periodic health/cleanup tasks.
    pub async fn from_config(config: RelayConfig) -> Result<Arc<Self>> {
        Self::from_config_with_classifier(config, classify_error).await
    }

    /// Same as [`Self::from_config`] but with a caller-supplied error
    /// classifier replacing the default substring predicate.
    pub async fn from_config_with_classifier(
        config: RelayConfig,
        classifier: ErrorClassifier,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let metrics = Arc::new(MetricsStore::new());
        let monitor = Arc::new(HealthMonitor::new(metrics.clone()));
        let reconnect_delay =
            Duration::from_millis(config.selection_strategy.timeouts.reconnect_delay);

        let mut upstreams = HashMap::new();
        for upstream_config in config.servers {
            let name = upstream_config.name.clone();
            metrics.initialize(&name).await;
            let handle = spawn_upstream(upstream_config, reconnect_delay, cancel.child_token());
            upstreams.insert(name, handle);
        }

        let registry = Arc::new(Self {
            upstreams: tokio::sync::RwLock::new(upstreams),
            routing: RoutingTables::new(),
            metrics: metrics.clone(),
            monitor,
            strategies: build_strategies(),
            selection: config.selection_strategy,
            monitoring: config.monitoring.clone(),
            classifier,
            cancel: cancel.clone(),
        });

        tokio::spawn(run_health_loop(
            registry.clone(),
            Duration::from_millis(registry.selection.health_check_interval.max(1)),
            cancel.child_token(),
        ));
        if config.monitoring.enabled {
            tokio::spawn(run_metrics_cleanup(
                metrics,
                Duration::from_secs(config.monitoring.metrics_retention_hours * 3600),
                cancel.child_token(),
            ));
        }

        Ok(registry)
    }

    // --- Listing operations ---------------------------------------------

    pub async fn list_tools(&self, params: Option<PaginatedRequestParam>) -> ListToolsResult {
        let handles = self.connected_handles().await;
        if handles.is_empty() {
            tracing::debug!("no connected upstreams for tools/list");
            return ListToolsResult {
                tools: vec![],
                next_cursor: None,
            };
        }
        aggregate_tools(
            &handles,
            &self.routing,
            &self.monitor,
            params,
            Duration::from_millis(self.selection.timeouts.tools_list),
        )
        .await
    }

    pub async fn list_prompts(&self, params: Option<PaginatedRequestParam>) -> ListPromptsResult {
        let handles = self.connected_handles().await;
        if handles.is_empty() {
            tracing::debug!("no connected upstreams for prompts/list");
            return ListPromptsResult {
                prompts: vec![],
                next_cursor: None,
            };
        }
        aggregate_prompts(
            &handles,
            &self.routing,
            &self.monitor,
            params,
            Duration::from_millis(self.selection.timeouts.prompts_list),
        )
        .await
    }

    pub async fn list_resources(
        &self,
        params: Option<PaginatedRequestParam>,
    ) -> ListResourcesResult {
        let handles = self.connected_handles().await;
        if handles.is_empty() {
            tracing::debug!("no connected upstreams for resources/list");
            return ListResourcesResult {
                resources: vec![],
                next_cursor: None,
            };
        }
        aggregate_resources(
            &handles,
            &self.routing,
            &self.monitor,
            params,
            Duration::from_millis(self.selection.timeouts.resources_list),
        )
        .await
    }

    pub async fn list_resource_templates(
        &self,
        params: Option<PaginatedRequestParam>,
    ) -> ListResourceTemplatesResult {
        let handles = self.connected_handles().await;
        if handles.is_empty() {
            tracing::debug!("no connected upstreams for resources/templates/list");
            return ListResourceTemplatesResult {
                resource_templates: vec![],
                next_cursor: None,
            };
        }
        aggregate_resource_templates(
            &handles,
            &self.monitor,
            params,
            Duration::from_millis(self.selection.timeouts.resource_templates_list),
        )
        .await
    }

    // --- Targeted operations --------------------------------------------

    pub async fn call_tool(&self, params: CallToolRequestParam) -> Result<CallToolResult> {
        let tool_name = params.name.to_string();
        let handle = self.resolve(EntityKind::Tool, &tool_name).await?;

        if tracing::enabled!(tracing::Level::DEBUG) {
            let request = serde_json::Value::Object(params.arguments.clone().unwrap_or_default());
            if let Some(decision) = self.select_upstream(&request).await {
                tracing::debug!(
                    tool = %tool_name,
                    pinned = %handle.name,
                    strategy = decision.strategy_name,
                    would_select = %decision.selected_server,
                    confidence = decision.confidence,
                    "selection diagnostics"
                );
            }
        }

        let timeout = Duration::from_millis(self.selection.timeouts.tools_call);
        let result = self
            .dispatch(&handle, TOOL_CALL_MAX_RETRIES, move |h| {
                let params = params.clone();
                async move {
                    match tokio::time::timeout(timeout, h.call_tool(params)).await {
                        Ok(result) => result,
                        Err(_) => Err(RelayError::CallTimeout(h.name.clone())),
                    }
                }
            })
            .await;

        self.evict_if_not_found(EntityKind::Tool, &tool_name, &result)
            .await;
        result
    }

    pub async fn get_prompt(&self, params: GetPromptRequestParam) -> Result<GetPromptResult> {
        let prompt_name = params.name.clone();
        let handle = self.resolve(EntityKind::Prompt, &prompt_name).await?;

        let timeout = Duration::from_millis(self.selection.timeouts.prompts_get);
        let result = self
            .dispatch(&handle, self.selection.max_retries, move |h| {
                let params = params.clone();
                async move {
                    match tokio::time::timeout(timeout, h.get_prompt(params)).await {
                        Ok(result) => result,
                        Err(_) => Err(RelayError::CallTimeout(h.name.clone())),
                    }
                }
            })
            .await;

        self.evict_if_not_found(EntityKind::Prompt, &prompt_name, &result)
            .await;
        result
    }

    pub async fn read_resource(
        &self,
        params: ReadResourceRequestParam,
    ) -> Result<ReadResourceResult> {
        let uri = params.uri.clone();
        let handle = self.resolve(EntityKind::Resource, &uri).await?;

        let timeout = Duration::from_millis(self.selection.timeouts.resources_read);
        let result = self
            .dispatch(&handle, self.selection.max_retries, move |h| {
                let params = params.clone();
                async move {
                    match tokio::time::timeout(timeout, h.read_resource(params)).await {
                        Ok(result) => result,
                        Err(_) => Err(RelayError::CallTimeout(h.name.clone())),
                    }
                }
            })
            .await;

        self.evict_if_not_found(EntityKind::Resource, &uri, &result)
            .await;
        result
    }

    /// Lookup with self-repair: a miss rebuilds just the affected table
    /// from all connected upstreams, then retries the lookup once.
    async fn resolve(&self, kind: EntityKind, name: &str) -> Result<Arc<UpstreamHandle>> {
        let owner = match self.routing.lookup(kind, name).await {
            Some(owner) => owner,
            None => {
                tracing::debug!(kind = kind.as_str(), name, "routing miss, rebuilding table");
                self.rebuild_table(kind).await;
                self.routing
                    .lookup(kind, name)
                    .await
                    .ok_or_else(|| RelayError::NotAvailable {
                        kind: kind.as_str(),
                        name: name.to_string(),
                    })?
            }
        };

        self.handle_for(&owner)
            .await
            .ok_or_else(|| RelayError::NotAvailable {
                kind: kind.as_str(),
                name: name.to_string(),
            })
    }

    async fn rebuild_table(&self, kind: EntityKind) {
        let handles = self.connected_handles().await;
        match kind {
            EntityKind::Tool => {
                aggregate_tools(
                    &handles,
                    &self.routing,
                    &self.monitor,
                    None,
                    Duration::from_millis(self.selection.timeouts.tools_list),
                )
                .await;
            }
            EntityKind::Prompt => {
                aggregate_prompts(
                    &handles,
                    &self.routing,
                    &self.monitor,
                    None,
                    Duration::from_millis(self.selection.timeouts.prompts_list),
                )
                .await;
            }
            EntityKind::Resource => {
                aggregate_resources(
                    &handles,
                    &self.routing,
                    &self.monitor,
                    None,
                    Duration::from_millis(self.selection.timeouts.resources_list),
                )
                .await;
            }
        }
    }

    async fn dispatch<T, F, Fut>(
        &self,
        handle: &Arc<UpstreamHandle>,
        max_retries: u32,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(Arc<UpstreamHandle>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let ctx = RetryContext {
            upstream: &handle.name,
            metrics: &self.metrics,
            monitor: &self.monitor,
            failures: &handle.failures,
            classifier: self.classifier,
            max_retries,
        };
        dispatch_with_retry(ctx, || op(handle.clone())).await
    }

    /// Business-class "not found" on a table hit means the entry is stale:
    /// evict it and let the error surface unchanged.
    async fn evict_if_not_found<T>(&self, kind: EntityKind, name: &str, result: &Result<T>) {
        if let Err(err) = result {
            let message = err.to_string();
            if (self.classifier)(&message) == ErrorClass::Business && is_not_found(&message) {
                if self.routing.remove(kind, name).await {
                    tracing::info!(
                        kind = kind.as_str(),
                        name,
                        "evicted stale routing entry after not-found"
                    );
                }
            }
        }
    }

    // --- Selection ------------------------------------------------------

    /// Dry-run the configured strategy (falling back when it abstains)
    /// over the strictly-healthy candidate set.
    pub async fn select_upstream(&self, request: &serde_json::Value) -> Option<SelectionResult> {
        let candidates = self.metrics.healthy_scores().await;
        let primary = self.strategies.get(strategy_key(self.selection.default))?;
        if let Some(result) = primary.select(request, &candidates) {
            return Some(result);
        }
        let fallback = self.strategies.get(strategy_key(self.selection.fallback))?;
        fallback.select(request, &candidates)
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.strategies.keys().copied().collect();
        names.sort();
        names
    }

    // --- Upstream views and management ----------------------------------

    async fn connected_handles(&self) -> Vec<Arc<UpstreamHandle>> {
        let upstreams = self.upstreams.read().await;
        let mut connected = Vec::with_capacity(upstreams.len());
        for handle in upstreams.values() {
            if handle.is_connected().await {
                connected.push(handle.clone());
            }
        }
        connected
    }

    pub async fn handle_for(&self, name: &str) -> Option<Arc<UpstreamHandle>> {
        self.upstreams.read().await.get(name).cloned()
    }

    pub async fn upstream_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.upstreams.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn upstream_count(&self) -> usize {
        self.upstreams.read().await.len()
    }

    /// Status rows for the observability API.
    pub async fn upstream_overview(&self) -> Vec<UpstreamOverview> {
        let upstreams = self.upstreams.read().await;
        let mut rows = Vec::with_capacity(upstreams.len());
        for handle in upstreams.values() {
            let state = handle.connection_state().await;
            rows.push(UpstreamOverview {
                name: handle.name.clone(),
                transport: match handle.config.transport {
                    TransportConfig::Stdio { .. } => "stdio",
                    TransportConfig::Sse { .. } => "sse",
                },
                priority: handle.config.priority,
                capabilities: handle.config.capabilities.clone(),
                is_connected: state.is_connected,
                last_error: state.last_error,
                consecutive_failures: handle.failures.load(Ordering::Relaxed),
            });
        }
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    /// Run the health sweep immediately over the current fleet.
    pub async fn check_health_now(&self) -> Vec<HealthCheck> {
        let states = self.connection_states().await;
        self.monitor.check_all(states).await
    }

    async fn connection_states(&self) -> Vec<(String, bool, Option<String>)> {
        let upstreams = self.upstreams.read().await;
        let mut states = Vec::with_capacity(upstreams.len());
        for handle in upstreams.values() {
            let ConnectionState {
                is_connected,
                last_error,
                ..
            } = handle.connection_state().await;
            states.push((handle.name.clone(), is_connected, last_error));
        }
        states
    }

    /// Respawn a dead upstream (or refresh a live one) and repopulate its
    /// tool routing entries.
    pub async fn reinitialize_upstream(&self, name: &str) -> Result<usize> {
        let existing = self
            .handle_for(name)
            .await
            .ok_or_else(|| RelayError::UnknownUpstream(name.to_string()))?;

        let handle = if existing.channel_closed() || !existing.is_connected().await {
            tracing::info!(server = %name, "respawning upstream for reinitialization");
            existing.shutdown();
            let reconnect_delay =
                Duration::from_millis(self.selection.timeouts.reconnect_delay);
            let fresh = spawn_upstream(
                existing.config.clone(),
                reconnect_delay,
                self.cancel.child_token(),
            );
            self.metrics.initialize(name).await;
            self.upstreams
                .write()
                .await
                .insert(name.to_string(), fresh.clone());
            fresh
        } else {
            existing
        };

        let timeout = Duration::from_millis(self.selection.timeouts.reinitialize);
        let listing = tokio::time::timeout(timeout, handle.list_tools(None))
            .await
            .map_err(|_| RelayError::CallTimeout(name.to_string()))??;

        let tool_names: Vec<String> = listing.tools.iter().map(|t| t.name.to_string()).collect();
        let count = tool_names.len();
        self.routing.remove_upstream(name).await;
        self.routing
            .insert_many(EntityKind::Tool, name, tool_names)
            .await;
        tracing::info!(server = %name, tools = count, "upstream reinitialized");
        Ok(count)
    }

    /// Remove an upstream entirely: actor, routing entries, metrics,
    /// health record.
    pub async fn remove_upstream(&self, name: &str) -> Result<()> {
        let handle = self
            .upstreams
            .write()
            .await
            .remove(name)
            .ok_or_else(|| RelayError::UnknownUpstream(name.to_string()))?;
        handle.shutdown();
        self.routing.remove_upstream(name).await;
        self.metrics.remove(name).await;
        self.monitor.remove(name).await;
        tracing::info!(server = %name, "upstream removed");
        Ok(())
    }

    pub fn metrics(&self) -> &Arc<MetricsStore> {
        &self.metrics
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn selection_config(&self) -> &SelectionStrategyConfig {
        &self.selection
    }

    pub fn monitoring_config(&self) -> &MonitoringConfig {
        &self.monitoring
    }

    pub async fn routing_entries(&self, kind: EntityKind) -> Vec<(String, String)> {
        self.routing.entries(kind).await
    }

    /// Cancel every actor and periodic task, initiating clean shutdown.
    pub async fn shutdown(&self) {
        tracing::info!("relay registry shutting down all upstreams");
        self.cancel.cancel();
    }

    #[cfg(test)]
    pub(crate) async fn insert_handle(&self, handle: Arc<UpstreamHandle>) {
        self.upstreams
            .write()
            .await
            .insert(handle.name.clone(), handle);
    }

    #[cfg(test)]
    pub(crate) fn routing(&self) -> &RoutingTables {
        &self.routing
    }
}

/// Periodic health sweep across the whole fleet.
async fn run_health_loop(
    registry: Arc<RelayRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The immediate first tick would check upstreams that are still
    // connecting; skip it.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let checks = registry.check_health_now().await;
                let unhealthy = checks.iter().filter(|c| !c.is_healthy).count();
                tracing::debug!(
                    total = checks.len(),
                    unhealthy,
                    "health sweep complete"
                );
            }
            _ = cancel.cancelled() => {
                tracing::debug!("health loop cancelled");
                return;
            }
        }
    }
}
