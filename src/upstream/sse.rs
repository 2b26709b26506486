//! Server-sent-events transport for upstream MCP servers.
//!
//! Connects to the configured SSE endpoint (with its POST back-channel)
//! and runs a periodic readiness probe: transport callbacks can miss a
//! silently dropped stream, so every 30 s the probe inspects the actor's
//! request channel and demotes the connection when it is observed closed.

use std::sync::Arc;
use std::time::Duration;

use rmcp::service::RunningService;
use rmcp::transport::SseClientTransport;
use rmcp::{RoleClient, ServiceExt};
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result};
use crate::upstream::UpstreamHandle;

/// MCP handshake budget per connect attempt.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Readiness probe cadence.
const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Open the SSE stream and perform the MCP handshake.
pub(crate) async fn connect(
    name: &str,
    url: &str,
    cancel: CancellationToken,
) -> Result<RunningService<RoleClient, ()>> {
    let transport = SseClientTransport::start(url.to_string())
        .await
        .map_err(|e| {
            RelayError::Transport(name.to_string(), format!("Connection failed: {}", e))
        })?;

    let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, ().serve_with_ct(transport, cancel));
    match handshake.await {
        Err(_elapsed) => Err(RelayError::InitializationFailed(
            name.to_string(),
            format!(
                "SSE MCP handshake timed out after {}s",
                HANDSHAKE_TIMEOUT.as_secs()
            ),
        )),
        Ok(Err(e)) => Err(RelayError::InitializationFailed(
            name.to_string(),
            e.to_string(),
        )),
        Ok(Ok(running)) => Ok(running),
    }
}

/// Demote `is_connected` when the stream has closed under the actor.
pub(crate) async fn run_readiness_probe(handle: Arc<UpstreamHandle>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(PROBE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if handle.channel_closed() && handle.is_connected().await {
                    handle.mark_disconnected("SSE stream closed").await;
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!(server = %handle.name, "SSE readiness probe cancelled");
                return;
            }
        }
    }
}
