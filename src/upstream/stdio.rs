//! Child-process stdio transport for upstream MCP servers.
//!
//! Spawns the configured command and speaks MCP over its stdin/stdout.
//! Only the allowlisted environment variable names are inherited from the
//! relay's own environment; everything else is withheld from the child.

use std::time::Duration;

use rmcp::service::RunningService;
use rmcp::transport::{ConfigureCommandExt, TokioChildProcess};
use rmcp::{RoleClient, ServiceExt};
use tokio_util::sync::CancellationToken;

use crate::config::resolve_env_allowlist;
use crate::error::{RelayError, Result};

/// MCP handshake budget per connect attempt.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Spawn the child process and perform the MCP handshake.
pub(crate) async fn connect(
    name: &str,
    command: &str,
    args: &[String],
    env: &[String],
    cancel: CancellationToken,
) -> Result<RunningService<RoleClient, ()>> {
    let envs = resolve_env_allowlist(env);

    let transport = TokioChildProcess::new(tokio::process::Command::new(command).configure(
        |cmd| {
            cmd.args(args)
                .env_clear()
                .envs(envs)
                .stderr(std::process::Stdio::inherit());
        },
    ))
    .map_err(|e| RelayError::Transport(name.to_string(), e.to_string()))?;

    let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, ().serve_with_ct(transport, cancel));
    match handshake.await {
        Err(_elapsed) => Err(RelayError::InitializationFailed(
            name.to_string(),
            format!(
                "MCP handshake timed out after {}s",
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_missing_binary_fails() {
        let result = connect(
            "ghost",
            "/this/command/does/not/exist-relay",
            &[],
            &[],
            CancellationToken::new(),
        )
        .await;
        assert!(
            matches!(result, Err(RelayError::Transport(name, _)) if name == "ghost"),
            "expected transport error for a missing binary"
        );
    }

    #[tokio::test]
    async fn test_connect_non_mcp_binary_fails_handshake() {
        // /bin/true exits immediately without ever speaking MCP. Absolute
        // path because the child env is cleared down to the allowlist.
        let result = connect("noop", "/bin/true", &[], &[], CancellationToken::new()).await;
        assert!(
            matches!(result, Err(RelayError::InitializationFailed(name, _)) if name == "noop"),
            "expected handshake failure for a non-MCP binary"
        );
    }
}
