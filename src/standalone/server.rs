//! RelayMcpServer — rmcp ServerHandler backed by a RelayRegistry.
//!
//! The downstream client sees one MCP server whose tool, prompt, and
//! resource surfaces are the union of every connected upstream. Listing
//! handlers delegate to the aggregator; targeted handlers resolve through
//! the routing tables and the retry policy. Upstream error messages are
//! preserved on the way out.

use std::sync::Arc;

use rmcp::handler::server::ServerHandler;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, GetPromptRequestParam, GetPromptResult,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult,
    PaginatedRequestParam, ReadResourceRequestParam, ReadResourceResult, ServerCapabilities,
    ServerInfo,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::ErrorData as McpError;

use crate::error::RelayError;
use crate::RelayRegistry;

/// MCP server facade over the registry, cloned per downstream session.
#[derive(Clone)]
pub struct RelayMcpServer {
    registry: Arc<RelayRegistry>,
}

impl RelayMcpServer {
    pub fn new(registry: Arc<RelayRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> Arc<RelayRegistry> {
        self.registry.clone()
    }
}

fn to_mcp_error(err: RelayError) -> McpError {
    McpError::internal_error(err.to_string(), None)
}

impl ServerHandler for RelayMcpServer {
    fn get_info(&self) -> ServerInfo {
        let mut capabilities = ServerCapabilities::builder()
            .enable_tools()
            .enable_prompts()
            .enable_resources()
            .build();
        if let Some(resources) = capabilities.resources.as_mut() {
            resources.subscribe = Some(true);
        }
        ServerInfo {
            server_info: rmcp::model::Implementation {
                name: "mcp-relay".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Aggregating MCP proxy — tools, prompts, and resources from every \
                 configured upstream behind one endpoint."
                    .into(),
            ),
            capabilities,
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(self.registry.list_tools(request).await)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.registry.call_tool(request).await.map_err(to_mcp_error)
    }

    async fn list_prompts(
        &self,
        request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        Ok(self.registry.list_prompts(request).await)
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        self.registry.get_prompt(request).await.map_err(to_mcp_error)
    }

    async fn list_resources(
        &self,
        request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        Ok(self.registry.list_resources(request).await)
    }

    async fn list_resource_templates(
        &self,
        request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        Ok(self.registry.list_resource_templates(request).await)
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        self.registry
            .read_resource(request)
            .await
            .map_err(to_mcp_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;

    async fn make_server() -> RelayMcpServer {
        let registry = RelayRegistry::from_config(RelayConfig::default())
            .await
            .expect("empty config builds");
        RelayMcpServer::new(registry)
    }

    #[tokio::test]
    async fn test_get_info_advertises_all_surfaces() {
        let server = make_server().await;
        let info = server.get_info();
        assert_eq!(info.server_info.name, "mcp-relay");
        assert!(info.capabilities.tools.is_some());
        assert!(info.capabilities.prompts.is_some());
        let resources = info.capabilities.resources.expect("resources enabled");
        assert_eq!(resources.subscribe, Some(true));
    }

    #[tokio::test]
    async fn test_empty_fleet_yields_empty_listing() {
        let server = make_server().await;
        let tools = server.registry.list_tools(None).await;
        assert!(tools.tools.is_empty());
        server.registry.shutdown().await;
    }
}
