//! Fan-out/fan-in aggregation of listing operations.
//!
//! Listings fan out across connected upstreams with a per-call timeout and
//! all-settled collection: one upstream's failure never aborts its
//! siblings and never fails the aggregate. The matching routing table is
//! cleared up front and rebuilt from successful responses only, so a
//! failed upstream contributes nothing and duplicate names resolve
//! last-writer-wins. A connection-class listing failure demotes the
//! upstream and triggers an immediate health check; business failures are
//! logged and skipped.

use std::sync::Arc;
use std::time::Duration;

use rmcp::model::{
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult,
    PaginatedRequestParam,
};

use crate::error::{classify_error, ErrorClass, RelayError, Result};
use crate::health::HealthMonitor;
use crate::namespace::{namespace_prompt, namespace_resource, namespace_template, namespace_tool};
use crate::routing::{EntityKind, RoutingTables};
use crate::upstream::UpstreamHandle;

/// One upstream's settled listing outcome.
pub struct FanOutOutcome<T> {
    pub handle: Arc<UpstreamHandle>,
    pub result: Result<T>,
}

/// Race `op` against `timeout` on every handle and collect all outcomes.
///
/// A timed-out call resolves to a failure for the aggregate but does not
/// cancel the underlying transport request; the late completion lands in a
/// dropped responder and is discarded.
pub async fn fan_out<T, F, Fut>(
    handles: &[Arc<UpstreamHandle>],
    timeout: Duration,
    op: F,
) -> Vec<FanOutOutcome<T>>
where
    F: Fn(Arc<UpstreamHandle>) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let calls = handles.iter().cloned().map(|handle| {
        let fut = op(handle.clone());
        async move {
            let result = match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(RelayError::CallTimeout(handle.name.clone())),
            };
            FanOutOutcome { handle, result }
        }
    });
    futures::future::join_all(calls).await
}

/// Log a failed listing and, for connection-class errors, demote the
/// upstream and run an immediate health check.
async fn handle_listing_failure(
    monitor: &HealthMonitor,
    operation: &'static str,
    handle: &Arc<UpstreamHandle>,
    err: &RelayError,
) {
    let message = err.to_string();
    match classify_error(&message) {
        ErrorClass::Connection => {
            handle.mark_disconnected(&message).await;
            let state = handle.connection_state().await;
            monitor
                .check_upstream(&handle.name, state.is_connected, state.last_error)
                .await;
            tracing::warn!(
                server = %handle.name,
                operation,
                error = %message,
                "listing failed, upstream demoted"
            );
        }
        ErrorClass::Business => {
            tracing::warn!(
                server = %handle.name,
                operation,
                error = %message,
                "listing failed with business-class error"
            );
        }
    }
}

/// Aggregate `tools/list` and rebuild the tool routing table.
pub async fn aggregate_tools(
    handles: &[Arc<UpstreamHandle>],
    routing: &RoutingTables,
    monitor: &HealthMonitor,
    params: Option<PaginatedRequestParam>,
    timeout: Duration,
) -> ListToolsResult {
    routing.clear(EntityKind::Tool).await;

    let outcomes = fan_out(handles, timeout, |h| {
        let params = params.clone();
        async move { h.list_tools(params).await }
    })
    .await;

    let mut tools = Vec::new();
    for outcome in outcomes {
        match outcome.result {
            Ok(listing) => {
                let upstream = &outcome.handle.name;
                routing
                    .insert_many(
                        EntityKind::Tool,
                        upstream,
                        listing.tools.iter().map(|t| t.name.to_string()),
                    )
                    .await;
                tools.extend(
                    listing
                        .tools
                        .into_iter()
                        .map(|t| namespace_tool(upstream, t)),
                );
            }
            Err(err) => {
                handle_listing_failure(monitor, "tools/list", &outcome.handle, &err).await;
            }
        }
    }

    ListToolsResult {
        tools,
        next_cursor: None,
    }
}

/// Aggregate `prompts/list` and rebuild the prompt routing table.
pub async fn aggregate_prompts(
    handles: &[Arc<UpstreamHandle>],
    routing: &RoutingTables,
    monitor: &HealthMonitor,
    params: Option<PaginatedRequestParam>,
    timeout: Duration,
) -> ListPromptsResult {
    routing.clear(EntityKind::Prompt).await;

    let outcomes = fan_out(handles, timeout, |h| {
        let params = params.clone();
        async move { h.list_prompts(params).await }
    })
    .await;

    let mut prompts = Vec::new();
    for outcome in outcomes {
        match outcome.result {
            Ok(listing) => {
                let upstream = &outcome.handle.name;
                routing
                    .insert_many(
                        EntityKind::Prompt,
                        upstream,
                        listing.prompts.iter().map(|p| p.name.clone()),
                    )
                    .await;
                prompts.extend(
                    listing
                        .prompts
                        .into_iter()
                        .map(|p| namespace_prompt(upstream, p)),
                );
            }
            Err(err) => {
                handle_listing_failure(monitor, "prompts/list", &outcome.handle, &err).await;
            }
        }
    }

    ListPromptsResult {
        prompts,
        next_cursor: None,
    }
}

/// Aggregate `resources/list` and rebuild the resource routing table.
pub async fn aggregate_resources(
    handles: &[Arc<UpstreamHandle>],
    routing: &RoutingTables,
    monitor: &HealthMonitor,
    params: Option<PaginatedRequestParam>,
    timeout: Duration,
) -> ListResourcesResult {
    routing.clear(EntityKind::Resource).await;

    let outcomes = fan_out(handles, timeout, |h| {
        let params = params.clone();
        async move { h.list_resources(params).await }
    })
    .await;

    let mut resources = Vec::new();
    for outcome in outcomes {
        match outcome.result {
            Ok(listing) => {
                let upstream = &outcome.handle.name;
                routing
                    .insert_many(
                        EntityKind::Resource,
                        upstream,
                        listing.resources.iter().map(|r| r.uri.to_string()),
                    )
                    .await;
                resources.extend(
                    listing
                        .resources
                        .into_iter()
                        .map(|r| namespace_resource(upstream, r)),
                );
            }
            Err(err) => {
                handle_listing_failure(monitor, "resources/list", &outcome.handle, &err).await;
            }
        }
    }

    ListResourcesResult {
        resources,
        next_cursor: None,
    }
}

/// Aggregate `resources/templates/list`.
///
/// Templates are display surface only — reads route by concrete URI — so
/// this listing namespaces and merges without touching the resource table.
pub async fn aggregate_resource_templates(
    handles: &[Arc<UpstreamHandle>],
    monitor: &HealthMonitor,
    params: Option<PaginatedRequestParam>,
    timeout: Duration,
) -> ListResourceTemplatesResult {
    let outcomes = fan_out(handles, timeout, |h| {
        let params = params.clone();
        async move { h.list_resource_templates(params).await }
    })
    .await;

    let mut resource_templates = Vec::new();
    for outcome in outcomes {
        match outcome.result {
            Ok(listing) => {
                let upstream = &outcome.handle.name;
                resource_templates.extend(
                    listing
                        .resource_templates
                        .into_iter()
                        .map(|t| namespace_template(upstream, t)),
                );
            }
            Err(err) => {
                handle_listing_failure(monitor, "resources/templates/list", &outcome.handle, &err)
                    .await;
            }
        }
    }

    ListResourceTemplatesResult {
        resource_templates,
        next_cursor: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsStore;
    use crate::upstream::testing::{
        mock_upstream, prompt, prompts_result, resource, resources_result, template,
        templates_result, tool, tools_result,
    };
    use crate::upstream::UpstreamRequest;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(Arc::new(MetricsStore::new()))
    }

    fn tools_upstream(name: &'static str, tools: Vec<(&'static str, &'static str)>) -> Arc<UpstreamHandle> {
        mock_upstream(name, true, move |req| {
            if let UpstreamRequest::ListTools { respond, .. } = req {
                let listing = tools_result(tools.iter().map(|(n, d)| tool(n, d)).collect());
                let _ = respond.send(Ok(listing));
            }
        })
    }

    fn hanging_upstream(name: &'static str) -> Arc<UpstreamHandle> {
        mock_upstream(name, true, |req| {
            if let UpstreamRequest::ListTools { respond, .. } = req {
                // Never respond: the caller's timeout must fire.
                std::mem::forget(respond);
            }
        })
    }

    #[tokio::test]
    async fn test_partial_failure_listing() {
        // A and C respond, B times out: three tools, B demoted.
        let a = tools_upstream("A", vec![("t1", "does one"), ("t2", "does two")]);
        let b = hanging_upstream("B");
        let c = tools_upstream("C", vec![("t3", "does three")]);
        let handles = vec![a, b.clone(), c];
        let routing = RoutingTables::new();
        let monitor = monitor();

        let merged = aggregate_tools(
            &handles,
            &routing,
            &monitor,
            None,
            Duration::from_millis(100),
        )
        .await;

        assert_eq!(merged.tools.len(), 3);
        assert_eq!(
            routing.lookup(EntityKind::Tool, "t1").await,
            Some("A".to_string())
        );
        assert_eq!(
            routing.lookup(EntityKind::Tool, "t2").await,
            Some("A".to_string())
        );
        assert_eq!(
            routing.lookup(EntityKind::Tool, "t3").await,
            Some("C".to_string())
        );
        assert!(!b.is_connected().await, "timed-out upstream is demoted");
        assert_eq!(monitor.unhealthy_names().await, vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn test_table_contains_exactly_successful_union() {
        let a = tools_upstream("A", vec![("t1", "x")]);
        let b = mock_upstream("B", true, |req| {
            if let UpstreamRequest::ListTools { respond, .. } = req {
                let _ = respond.send(Err(RelayError::Transport(
                    "B".to_string(),
                    "Connection reset".to_string(),
                )));
            }
        });
        let routing = RoutingTables::new();

        aggregate_tools(
            &[a, b],
            &routing,
            &monitor(),
            None,
            Duration::from_millis(200),
        )
        .await;

        let mut entries = routing.entries(EntityKind::Tool).await;
        entries.sort();
        assert_eq!(entries, vec![("t1".to_string(), "A".to_string())]);
    }

    #[tokio::test]
    async fn test_namespacing_applied_exactly_once() {
        let a = tools_upstream("A", vec![("t1", "does X")]);
        let routing = RoutingTables::new();
        let monitor = monitor();

        let first = aggregate_tools(&[a.clone()], &routing, &monitor, None, Duration::from_millis(200)).await;
        assert_eq!(first.tools[0].description.as_deref(), Some("[A] does X"));

        // A second listing produces the same string, never a double prefix.
        let second = aggregate_tools(&[a], &routing, &monitor, None, Duration::from_millis(200)).await;
        assert_eq!(second.tools[0].description.as_deref(), Some("[A] does X"));
    }

    #[tokio::test]
    async fn test_business_listing_failure_does_not_demote() {
        let a = mock_upstream("A", true, |req| {
            if let UpstreamRequest::ListTools { respond, .. } = req {
                let _ = respond.send(Err(RelayError::Upstream(
                    "A".to_string(),
                    "Invalid parameters".to_string(),
                )));
            }
        });
        let routing = RoutingTables::new();
        let monitor = monitor();

        aggregate_tools(
            &[a.clone()],
            &routing,
            &monitor,
            None,
            Duration::from_millis(200),
        )
        .await;

        assert!(a.is_connected().await, "business errors never demote");
        assert!(monitor.unhealthy_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_clears_previous_entries() {
        let routing = RoutingTables::new();
        routing
            .insert_many(EntityKind::Tool, "stale", vec!["old".to_string()])
            .await;

        let a = tools_upstream("A", vec![("t1", "x")]);
        aggregate_tools(
            &[a],
            &routing,
            &monitor(),
            None,
            Duration::from_millis(200),
        )
        .await;

        assert_eq!(routing.lookup(EntityKind::Tool, "old").await, None);
    }

    #[tokio::test]
    async fn test_prompt_aggregation_routes_by_name() {
        let a = mock_upstream("docs", true, |req| {
            if let UpstreamRequest::ListPrompts { respond, .. } = req {
                let _ = respond.send(Ok(prompts_result(vec![prompt("summarize", "Summarize")])));
            }
        });
        let routing = RoutingTables::new();

        let merged = aggregate_prompts(
            &[a],
            &routing,
            &monitor(),
            None,
            Duration::from_millis(200),
        )
        .await;

        assert_eq!(merged.prompts.len(), 1);
        assert_eq!(
            merged.prompts[0].description.as_deref(),
            Some("[docs] Summarize")
        );
        assert_eq!(
            routing.lookup(EntityKind::Prompt, "summarize").await,
            Some("docs".to_string())
        );
    }

    #[tokio::test]
    async fn test_resource_aggregation_routes_by_uri() {
        let a = mock_upstream("fs", true, |req| {
            if let UpstreamRequest::ListResources { respond, .. } = req {
                let _ = respond.send(Ok(resources_result(vec![resource(
                    "file:///notes.md",
                    "notes",
                )])));
            }
        });
        let routing = RoutingTables::new();

        let merged = aggregate_resources(
            &[a],
            &routing,
            &monitor(),
            None,
            Duration::from_millis(200),
        )
        .await;

        assert_eq!(merged.resources[0].name, "[fs] notes");
        assert_eq!(
            routing.lookup(EntityKind::Resource, "file:///notes.md").await,
            Some("fs".to_string())
        );
    }

    #[tokio::test]
    async fn test_template_aggregation_leaves_resource_table_alone() {
        let routing = RoutingTables::new();
        routing
            .insert_many(
                EntityKind::Resource,
                "fs",
                vec!["file:///notes.md".to_string()],
            )
            .await;

        let a = mock_upstream("fs", true, |req| {
            if let UpstreamRequest::ListResourceTemplates { respond, .. } = req {
                let _ = respond.send(Ok(templates_result(vec![template(
                    "file:///{path}",
                    "files",
                )])));
            }
        });

        let merged =
            aggregate_resource_templates(&[a], &monitor(), None, Duration::from_millis(200)).await;

        assert_eq!(merged.resource_templates[0].name, "[fs] files");
        assert_eq!(
            routing.lookup(EntityKind::Resource, "file:///notes.md").await,
            Some("fs".to_string()),
            "template listing must not clear the resource table"
        );
    }
}
