//! Upstream client management.
//!
//! Each configured upstream is driven by one actor task that owns the MCP
//! RPC channel. The externally visible [`UpstreamHandle`] exposes typed
//! request methods backed by an mpsc channel with oneshot responders, the
//! observed [`ConnectionState`], and the consecutive-failure counter the
//! retry policy maintains. The actor spawns one semaphore-gated sub-task
//! per request so a slow tool call cannot starve concurrent listings.

pub mod sse;
pub mod stdio;

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;

use rmcp::model::{
    CallToolRequestParam, CallToolResult, GetPromptRequestParam, GetPromptResult,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult,
    PaginatedRequestParam, ReadResourceRequestParam, ReadResourceResult,
};
use rmcp::service::RunningService;
use rmcp::{Peer, RoleClient};
use tokio::sync::{mpsc, oneshot, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::{TransportConfig, UpstreamConfig};
use crate::error::{RelayError, Result};

/// Connect attempts before the upstream is left disconnected.
const CONNECT_ATTEMPTS: u32 = 3;

/// In-flight request ceiling when the config does not set one.
const DEFAULT_MAX_CONCURRENT: usize = 32;

/// Queue depth between the handle and its actor.
const REQUEST_CHANNEL_CAPACITY: usize = 32;

/// Observed transport state for one upstream.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub is_connected: bool,
    pub last_error: Option<String>,
    /// Edge-trigger flag: the disconnect transition is logged once per
    /// epoch and the flag clears on the next successful connect.
    pub error_logged: bool,
}

/// One MCP request forwarded to the actor, with its response channel.
pub(crate) enum UpstreamRequest {
    ListTools {
        params: Option<PaginatedRequestParam>,
        respond: oneshot::Sender<Result<ListToolsResult>>,
    },
    CallTool {
        params: CallToolRequestParam,
        respond: oneshot::Sender<Result<CallToolResult>>,
    },
    ListPrompts {
        params: Option<PaginatedRequestParam>,
        respond: oneshot::Sender<Result<ListPromptsResult>>,
    },
    GetPrompt {
        params: GetPromptRequestParam,
        respond: oneshot::Sender<Result<GetPromptResult>>,
    },
    ListResources {
        params: Option<PaginatedRequestParam>,
        respond: oneshot::Sender<Result<ListResourcesResult>>,
    },
    ListResourceTemplates {
        params: Option<PaginatedRequestParam>,
        respond: oneshot::Sender<Result<ListResourceTemplatesResult>>,
    },
    ReadResource {
        params: ReadResourceRequestParam,
        respond: oneshot::Sender<Result<ReadResourceResult>>,
    },
}

/// External-facing handle for one managed upstream.
pub struct UpstreamHandle {
    pub name: String,
    /// Retained for respawn and the observability API.
    pub config: UpstreamConfig,
    state: Arc<RwLock<ConnectionState>>,
    call_tx: mpsc::Sender<UpstreamRequest>,
    /// Consecutive connection-class failures, reset on success.
    pub failures: AtomicU32,
    cancel: CancellationToken,
}

impl UpstreamHandle {
    pub async fn is_connected(&self) -> bool {
        self.state.read().await.is_connected
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    /// True once the actor task has stopped accepting requests.
    pub(crate) fn channel_closed(&self) -> bool {
        self.call_tx.is_closed()
    }

    /// Demote the connection, logging the transition once per epoch.
    pub async fn mark_disconnected(&self, reason: &str) {
        let mut state = self.state.write().await;
        state.is_connected = false;
        state.last_error = Some(reason.to_string());
        if !state.error_logged {
            state.error_logged = true;
            tracing::warn!(server = %self.name, error = %reason, "upstream disconnected");
        }
    }

    /// Stop the actor (and any transport it owns).
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> UpstreamRequest,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.call_tx.send(build(tx)).await.map_err(|_| {
            if self.cancel.is_cancelled() {
                RelayError::ShuttingDown(self.name.clone())
            } else {
                RelayError::Transport(
                    self.name.clone(),
                    "Connection closed: upstream is not accepting requests".to_string(),
                )
            }
        })?;
        rx.await.map_err(|_| {
            RelayError::Transport(
                self.name.clone(),
                "Connection closed: response channel dropped".to_string(),
            )
        })?
    }

    pub async fn list_tools(
        &self,
        params: Option<PaginatedRequestParam>,
    ) -> Result<ListToolsResult> {
        self.request(|respond| UpstreamRequest::ListTools { params, respond })
            .await
    }

    pub async fn call_tool(&self, params: CallToolRequestParam) -> Result<CallToolResult> {
        self.request(|respond| UpstreamRequest::CallTool { params, respond })
            .await
    }

    pub async fn list_prompts(
        &self,
        params: Option<PaginatedRequestParam>,
    ) -> Result<ListPromptsResult> {
        self.request(|respond| UpstreamRequest::ListPrompts { params, respond })
            .await
    }

    pub async fn get_prompt(&self, params: GetPromptRequestParam) -> Result<GetPromptResult> {
        self.request(|respond| UpstreamRequest::GetPrompt { params, respond })
            .await
    }

    pub async fn list_resources(
        &self,
        params: Option<PaginatedRequestParam>,
    ) -> Result<ListResourcesResult> {
        self.request(|respond| UpstreamRequest::ListResources { params, respond })
            .await
    }

    pub async fn list_resource_templates(
        &self,
        params: Option<PaginatedRequestParam>,
    ) -> Result<ListResourceTemplatesResult> {
        self.request(|respond| UpstreamRequest::ListResourceTemplates { params, respond })
            .await
    }

    pub async fn read_resource(
        &self,
        params: ReadResourceRequestParam,
    ) -> Result<ReadResourceResult> {
        self.request(|respond| UpstreamRequest::ReadResource { params, respond })
            .await
    }
}

/// Spawn the actor (and, for SSE, its readiness probe) for one upstream.
pub fn spawn_upstream(
    config: UpstreamConfig,
    reconnect_delay: Duration,
    cancel: CancellationToken,
) -> Arc<UpstreamHandle> {
    let name = config.name.clone();
    let state = Arc::new(RwLock::new(ConnectionState::default()));
    let (call_tx, call_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
    let child = cancel.child_token();
    let is_sse = matches!(config.transport, TransportConfig::Sse { .. });

    let handle = Arc::new(UpstreamHandle {
        name: name.clone(),
        config: config.clone(),
        state: state.clone(),
        call_tx,
        failures: AtomicU32::new(0),
        cancel: child.clone(),
    });

    tokio::spawn(run_upstream(
        config,
        name,
        state,
        call_rx,
        reconnect_delay,
        child.clone(),
    ));

    if is_sse {
        tokio::spawn(sse::run_readiness_probe(handle.clone(), child));
    }

    handle
}

/// Actor task: bounded connect, then request forwarding until the
/// transport closes, the channel drops, or shutdown cancels it.
async fn run_upstream(
    config: UpstreamConfig,
    name: String,
    state: Arc<RwLock<ConnectionState>>,
    mut call_rx: mpsc::Receiver<UpstreamRequest>,
    reconnect_delay: Duration,
    cancel: CancellationToken,
) {
    let max_concurrent = config
        .max_concurrent_requests
        .unwrap_or(DEFAULT_MAX_CONCURRENT);

    // --- Bounded connect: CONNECT_ATTEMPTS tries, reconnect_delay apart ---
    let mut attempt: u32 = 0;
    let running: RunningService<RoleClient, ()> = loop {
        attempt += 1;
        tracing::info!(server = %name, attempt, "connecting to upstream");
        let connected = match &config.transport {
            TransportConfig::Stdio { command, args, env } => {
                stdio::connect(&name, command, args, env, cancel.child_token()).await
            }
            TransportConfig::Sse { url } => sse::connect(&name, url, cancel.child_token()).await,
        };
        match connected {
            Ok(running) => break running,
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                tracing::warn!(server = %name, attempt, error = %e, "connect attempt failed");
                state.write().await.last_error = Some(e.to_string());
                tokio::select! {
                    _ = tokio::time::sleep(reconnect_delay) => {}
                    _ = cancel.cancelled() => {
                        tracing::info!(server = %name, "cancelled while waiting to reconnect");
                        return;
                    }
                }
            }
            Err(e) => {
                let mut s = state.write().await;
                s.is_connected = false;
                s.last_error = Some(e.to_string());
                if !s.error_logged {
                    s.error_logged = true;
                    tracing::error!(
                        server = %name,
                        attempts = attempt,
                        error = %e,
                        "upstream connection failed"
                    );
                }
                return;
            }
        }
    };

    {
        let mut s = state.write().await;
        s.is_connected = true;
        s.last_error = None;
        s.error_logged = false;
    }
    tracing::info!(server = %name, "upstream connected");

    let peer = running.peer().clone();

    // Watch for the transport closing underneath us.
    let (exit_tx, mut exit_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = running.waiting().await;
        let _ = exit_tx.send(());
    });

    let semaphore = Arc::new(Semaphore::new(max_concurrent));

    loop {
        tokio::select! {
            maybe_req = call_rx.recv() => {
                match maybe_req {
                    None => {
                        tracing::info!(server = %name, "request channel closed, stopping upstream");
                        return;
                    }
                    Some(req) => {
                        let peer = peer.clone();
                        let semaphore = semaphore.clone();
                        let name = name.clone();
                        tokio::spawn(async move {
                            match semaphore.acquire_owned().await {
                                Ok(_permit) => serve_request(&name, &peer, req).await,
                                Err(_) => {
                                    // Semaphore closed during shutdown; the
                                    // caller sees a dropped responder.
                                }
                            }
                        });
                    }
                }
            }
            _ = &mut exit_rx => {
                let mut s = state.write().await;
                s.is_connected = false;
                if s.last_error.is_none() {
                    s.last_error = Some("Connection closed".to_string());
                }
                if !s.error_logged {
                    s.error_logged = true;
                    tracing::warn!(server = %name, "upstream connection closed");
                }
                return;
            }
            _ = cancel.cancelled() => {
                tracing::info!(server = %name, "upstream cancelled, shutting down");
                return;
            }
        }
    }
}

/// Forward one request to the peer and send back the mapped result.
async fn serve_request(name: &str, peer: &Peer<RoleClient>, req: UpstreamRequest) {
    match req {
        UpstreamRequest::ListTools { params, respond } => {
            let result = peer
                .list_tools(params)
                .await
                .map_err(|e| map_service_error(name, e));
            let _ = respond.send(result);
        }
        UpstreamRequest::CallTool { params, respond } => {
            let result = peer
                .call_tool(params)
                .await
                .map_err(|e| map_service_error(name, e));
            let _ = respond.send(result);
        }
        UpstreamRequest::ListPrompts { params, respond } => {
            let result = peer
                .list_prompts(params)
                .await
                .map_err(|e| map_service_error(name, e));
            let _ = respond.send(result);
        }
        UpstreamRequest::GetPrompt { params, respond } => {
            let result = peer
                .get_prompt(params)
                .await
                .map_err(|e| map_service_error(name, e));
            let _ = respond.send(result);
        }
        UpstreamRequest::ListResources { params, respond } => {
            let result = peer
                .list_resources(params)
                .await
                .map_err(|e| map_service_error(name, e));
            let _ = respond.send(result);
        }
        UpstreamRequest::ListResourceTemplates { params, respond } => {
            let result = peer
                .list_resource_templates(params)
                .await
                .map_err(|e| map_service_error(name, e));
            let _ = respond.send(result);
        }
        UpstreamRequest::ReadResource { params, respond } => {
            let result = peer
                .read_resource(params)
                .await
                .map_err(|e| map_service_error(name, e));
            let _ = respond.send(result);
        }
    }
}

/// Map rmcp service errors so transport failures carry the connection
/// tokens the classifier keys on, while upstream JSON-RPC errors keep
/// their original message.
fn map_service_error(name: &str, err: rmcp::ServiceError) -> RelayError {
    match err {
        rmcp::ServiceError::Timeout { .. } => RelayError::CallTimeout(name.to_string()),
        rmcp::ServiceError::TransportClosed => {
            RelayError::Transport(name.to_string(), "Connection closed".to_string())
        }
        other => RelayError::Upstream(name.to_string(), other.to_string()),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Mock upstream actors for aggregator and registry tests.

    use super::*;
    use rmcp::model::{Prompt, Resource, ResourceTemplate, Tool};
    use serde_json::json;

    /// Spawn a scripted actor: `handler` receives every request and may
    /// respond through the embedded oneshot (or drop/forget it).
    pub(crate) fn mock_upstream<F>(name: &str, connected: bool, mut handler: F) -> Arc<UpstreamHandle>
    where
        F: FnMut(UpstreamRequest) + Send + 'static,
    {
        let (call_tx, mut call_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let state = Arc::new(RwLock::new(ConnectionState {
            is_connected: connected,
            last_error: None,
            error_logged: false,
        }));
        tokio::spawn(async move {
            while let Some(req) = call_rx.recv().await {
                handler(req);
            }
        });
        Arc::new(UpstreamHandle {
            name: name.to_string(),
            config: UpstreamConfig {
                name: name.to_string(),
                transport: TransportConfig::Stdio {
                    command: "mock".to_string(),
                    args: vec![],
                    env: vec![],
                },
                priority: None,
                capabilities: vec![],
                max_concurrent_requests: None,
            },
            state,
            call_tx,
            failures: AtomicU32::new(0),
            cancel: CancellationToken::new(),
        })
    }

    pub(crate) fn tool(name: &str, description: &str) -> Tool {
        serde_json::from_value(json!({
            "name": name,
            "description": description,
            "inputSchema": {"type": "object", "properties": {}},
        }))
        .expect("valid tool descriptor")
    }

    pub(crate) fn prompt(name: &str, description: &str) -> Prompt {
        serde_json::from_value(json!({"name": name, "description": description}))
            .expect("valid prompt descriptor")
    }

    pub(crate) fn resource(uri: &str, name: &str) -> Resource {
        serde_json::from_value(json!({"uri": uri, "name": name}))
            .expect("valid resource descriptor")
    }

    pub(crate) fn template(uri_template: &str, name: &str) -> ResourceTemplate {
        serde_json::from_value(json!({"uriTemplate": uri_template, "name": name}))
            .expect("valid template descriptor")
    }

    pub(crate) fn tools_result(tools: Vec<Tool>) -> ListToolsResult {
        ListToolsResult {
            tools,
            next_cursor: None,
        }
    }

    pub(crate) fn prompts_result(prompts: Vec<Prompt>) -> ListPromptsResult {
        ListPromptsResult {
            prompts,
            next_cursor: None,
        }
    }

    pub(crate) fn resources_result(resources: Vec<Resource>) -> ListResourcesResult {
        ListResourcesResult {
            resources,
            next_cursor: None,
        }
    }

    pub(crate) fn templates_result(
        resource_templates: Vec<ResourceTemplate>,
    ) -> ListResourceTemplatesResult {
        ListResourceTemplatesResult {
            resource_templates,
            next_cursor: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_config(name: &str, command: &str) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            transport: TransportConfig::Stdio {
                command: command.to_string(),
                args: vec![],
                env: vec![],
            },
            priority: None,
            capabilities: vec![],
            max_concurrent_requests: None,
        }
    }

    /// Handle whose actor never existed: the receiver half is dropped.
    fn dead_handle(name: &str) -> UpstreamHandle {
        let (call_tx, call_rx) = mpsc::channel(1);
        drop(call_rx);
        UpstreamHandle {
            name: name.to_string(),
            config: make_config(name, "true"),
            state: Arc::new(RwLock::new(ConnectionState::default())),
            call_tx,
            failures: AtomicU32::new(0),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_dead_actor_yields_connection_class_error() {
        let handle = dead_handle("a");
        let result = handle
            .call_tool(
                serde_json::from_value(json!({"name": "t1"})).expect("valid call params"),
            )
            .await;
        match result {
            Err(RelayError::Transport(name, msg)) => {
                assert_eq!(name, "a");
                assert!(msg.contains("Connection closed"));
                assert_eq!(
                    crate::error::classify_error(&msg),
                    crate::error::ErrorClass::Connection
                );
            }
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mark_disconnected_logs_once_per_epoch() {
        let handle = dead_handle("a");
        handle.mark_disconnected("Connection refused").await;
        let state = handle.connection_state().await;
        assert!(!state.is_connected);
        assert!(state.error_logged);
        assert_eq!(state.last_error.as_deref(), Some("Connection refused"));

        // Second demotion in the same epoch keeps the flag set.
        handle.mark_disconnected("still down").await;
        let state = handle.connection_state().await;
        assert!(state.error_logged);
        assert_eq!(state.last_error.as_deref(), Some("still down"));
    }

    #[tokio::test]
    async fn test_channel_closed_reflects_actor_liveness() {
        let handle = dead_handle("a");
        assert!(handle.channel_closed());
    }

    #[tokio::test]
    async fn test_spawn_with_bad_command_records_failure() {
        let cancel = CancellationToken::new();
        let handle = spawn_upstream(
            make_config("ghost", "/this/command/does/not/exist-relay"),
            Duration::from_millis(10),
            cancel.clone(),
        );

        // Three fast attempts, then the actor gives up.
        let mut state = handle.connection_state().await;
        for _ in 0..100 {
            if state.last_error.is_some() && handle.channel_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            state = handle.connection_state().await;
        }
        assert!(!state.is_connected);
        assert!(state.last_error.is_some());
        cancel.cancel();
    }

    #[test]
    fn test_connection_state_default() {
        let state = ConnectionState::default();
        assert!(!state.is_connected);
        assert!(state.last_error.is_none());
        assert!(!state.error_logged);
    }
}
