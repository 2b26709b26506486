//! Observability HTTP API.
//!
//! JSON surface behind the dashboard: fleet status, metrics, health,
//! selection strategies, routing-table contents, and per-upstream
//! management actions (manual health check, reinitialize, removal).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::error::RelayError;
use crate::routing::EntityKind;
use crate::RelayRegistry;

/// Build the `/api` router over a shared registry.
pub fn observability_router(registry: Arc<RelayRegistry>) -> Router {
    Router::new()
        .route("/servers/status", get(servers_status))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .route("/selection/strategies", get(selection_strategies))
        .route("/tools/status", get(tools_status))
        .route("/servers/{name}/details", get(server_details))
        .route("/servers/{name}/health-check", post(server_health_check))
        .route("/servers/{name}/reinitialize-tools", post(server_reinitialize))
        .route("/servers/{name}", delete(server_delete))
        .with_state(registry)
}

fn not_found(name: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("no upstream named '{}'", name)})),
    )
}

async fn servers_status(State(registry): State<Arc<RelayRegistry>>) -> Json<Value> {
    let overview = registry.upstream_overview().await;
    Json(json!({"servers": overview}))
}

async fn metrics(State(registry): State<Arc<RelayRegistry>>) -> Json<Value> {
    let scores = registry.metrics().snapshot_all().await;
    let servers: Vec<Value> = scores
        .into_iter()
        .map(|score| {
            json!({
                "name": score.name,
                "responseTime": score.record.response_time_ms,
                "totalRequests": score.record.total_requests,
                "errorCount": score.record.error_count,
                "successRate": score.record.success_rate,
                "idleSeconds": score.record.idle_secs(),
                "isHealthy": score.record.is_healthy,
                "loadFactor": score.record.load_factor,
                "capabilityScore": score.record.capability_score,
                "quality": score.quality,
            })
        })
        .collect();
    Json(json!({"servers": servers}))
}

async fn health(State(registry): State<Arc<RelayRegistry>>) -> Json<Value> {
    let summary = registry.monitor().summary().await;
    let thresholds = &registry.monitoring_config().alert_thresholds;
    Json(json!({
        "summary": summary,
        "healthy": registry.monitor().healthy_names().await,
        "unhealthy": registry.monitor().unhealthy_names().await,
        "alertThresholds": {
            "responseTime": thresholds.response_time,
            "errorRate": thresholds.error_rate,
            "unhealthyServers": thresholds.unhealthy_servers,
        },
    }))
}

async fn selection_strategies(State(registry): State<Arc<RelayRegistry>>) -> Json<Value> {
    let selection = registry.selection_config();
    Json(json!({
        "default": selection.default.as_str(),
        "fallback": selection.fallback.as_str(),
        "available": registry.strategy_names(),
        "timeout": selection.timeout,
        "maxRetries": selection.max_retries,
    }))
}

async fn tools_status(State(registry): State<Arc<RelayRegistry>>) -> Json<Value> {
    let table = |entries: Vec<(String, String)>| -> Value {
        Value::Object(
            entries
                .into_iter()
                .map(|(name, upstream)| (name, Value::String(upstream)))
                .collect(),
        )
    };
    Json(json!({
        "tools": table(registry.routing_entries(EntityKind::Tool).await),
        "prompts": table(registry.routing_entries(EntityKind::Prompt).await),
        "resources": table(registry.routing_entries(EntityKind::Resource).await),
    }))
}

async fn server_details(
    State(registry): State<Arc<RelayRegistry>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let overview = registry.upstream_overview().await;
    let Some(row) = overview.into_iter().find(|r| r.name == name) else {
        return not_found(&name).into_response();
    };

    let metrics = registry.metrics().snapshot(&name).await.map(|(record, quality)| {
        json!({
            "responseTime": record.response_time_ms,
            "totalRequests": record.total_requests,
            "errorCount": record.error_count,
            "successRate": record.success_rate,
            "loadFactor": record.load_factor,
            "quality": quality,
        })
    });
    let last_check = registry.monitor().last_check(&name).await.map(|check| {
        json!({
            "isHealthy": check.is_healthy,
            "secondsSinceCheck": check.last_check.elapsed().as_secs_f64(),
            "errorMessage": check.error_message,
            "responseTime": check.response_time_ms,
        })
    });

    Json(json!({
        "server": row,
        "metrics": metrics,
        "lastHealthCheck": last_check,
        "canRecover": registry.monitor().can_recover(&name).await,
    }))
    .into_response()
}

async fn server_health_check(
    State(registry): State<Arc<RelayRegistry>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let Some(handle) = registry.handle_for(&name).await else {
        return not_found(&name).into_response();
    };
    let state = handle.connection_state().await;
    let check = registry
        .monitor()
        .check_upstream(&name, state.is_connected, state.last_error)
        .await;
    Json(json!({
        "server": name,
        "isHealthy": check.is_healthy,
        "errorMessage": check.error_message,
        "responseTime": check.response_time_ms,
    }))
    .into_response()
}

async fn server_reinitialize(
    State(registry): State<Arc<RelayRegistry>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match registry.reinitialize_upstream(&name).await {
        Ok(tool_count) => Json(json!({"server": name, "tools": tool_count})).into_response(),
        Err(RelayError::UnknownUpstream(_)) => not_found(&name).into_response(),
        Err(err) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

async fn server_delete(
    State(registry): State<Arc<RelayRegistry>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match registry.remove_upstream(&name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(_) => not_found(&name).into_response(),
    }
}
