//! Descriptor namespacing for aggregated listings.
//!
//! Prepends `[<upstream>] ` to the human-readable field of each descriptor
//! so the downstream client can see which upstream owns it. The
//! machine-identifying field (tool name, prompt name, resource URI) passes
//! through unchanged — routing happens through the tables, not the name.
//! Descriptors are namespaced from the upstream's fresh response on every
//! listing, so the prefix is applied exactly once per call.

use rmcp::model::{Prompt, Resource, ResourceTemplate, Tool};

/// Prefix a tool's description with its owning upstream.
pub fn namespace_tool(upstream: &str, mut tool: Tool) -> Tool {
    if let Some(desc) = tool.description.as_mut() {
        let prefixed = format!("[{}] {}", upstream, desc);
        *desc = prefixed.into();
    }
    tool
}

/// Prefix a prompt's description with its owning upstream.
pub fn namespace_prompt(upstream: &str, mut prompt: Prompt) -> Prompt {
    if let Some(desc) = prompt.description.as_mut() {
        let prefixed = format!("[{}] {}", upstream, desc);
        *desc = prefixed.into();
    }
    prompt
}

/// Prefix a resource's display name with its owning upstream. The URI is
/// the routing key and stays untouched.
pub fn namespace_resource(upstream: &str, mut resource: Resource) -> Resource {
    let prefixed = format!("[{}] {}", upstream, resource.name);
    resource.name = prefixed.into();
    resource
}

/// Prefix a resource template's display name with its owning upstream.
pub fn namespace_template(upstream: &str, mut template: ResourceTemplate) -> ResourceTemplate {
    let prefixed = format!("[{}] {}", upstream, template.name);
    template.name = prefixed.into();
    template
}
