//! Tool name resolution across servers
//!
//! Built once at startup by listing every server; read-only afterwards.

use super::ToolServer;
use crate::llm::ToolDefinition;
use crate::runtime::{ResolvedTool, ToolResolver};
use std::collections::HashMap;
use std::sync::Arc;

pub struct ToolServerRegistry {
    routes: HashMap<String, Arc<dyn ToolServer>>,
    definitions: Vec<ToolDefinition>,
}

impl ToolServerRegistry {
    /// Build the registry by listing every server.
    ///
    /// The first server to declare a tool name owns it. Servers that fail to
    /// list are skipped.
    pub async fn build(servers: Vec<Arc<dyn ToolServer>>) -> Self {
        let mut routes: HashMap<String, Arc<dyn ToolServer>> = HashMap::new();
        let mut definitions = Vec::new();

        for server in servers {
            let tools = match server.list_tools().await {
                Ok(tools) => tools,
                Err(e) => {
                    tracing::warn!(server = server.id(), error = %e, "Tool server unavailable, skipping");
                    continue;
                }
            };

            let mut registered = 0usize;
            for tool in tools {
                if let Some(owner) = routes.get(&tool.name) {
                    tracing::warn!(
                        tool = %tool.name,
                        server = server.id(),
                        owner = owner.id(),
                        "Duplicate tool name ignored"
                    );
                    continue;
                }
                routes.insert(tool.name.clone(), server.clone());
                definitions.push(tool);
                registered += 1;
            }
            tracing::info!(server = server.id(), tools = registered, "Registered tool server");
        }

        Self {
            routes,
            definitions,
        }
    }
}

impl ToolResolver for ToolServerRegistry {
    fn resolve(&self, name: &str) -> Option<ResolvedTool> {
        self.routes.get(name).map(|server| ResolvedTool {
            server_id: server.id().to_string(),
            server: server.clone(),
        })
    }

    fn list_tools(&self) -> Vec<ToolDefinition> {
        self.definitions.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::MockToolServer;
    use crate::tools::BuiltinToolServer;
    use serde_json::json;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_first_server_wins_duplicates() {
        let builtin: Arc<dyn ToolServer> = Arc::new(BuiltinToolServer::standard(PathBuf::from("/tmp")));
        let remote: Arc<dyn ToolServer> = Arc::new(
            MockToolServer::new("remote")
                .with_tool("think", Ok(json!("remote thoughts")))
                .with_tool("weather", Ok(json!("sunny"))),
        );

        let registry = ToolServerRegistry::build(vec![builtin, remote]).await;

        assert_eq!(registry.resolve("think").unwrap().server_id, "builtin");
        assert_eq!(registry.resolve("weather").unwrap().server_id, "remote");
        assert!(registry.resolve("bash").is_none());

        let names: Vec<_> = registry.list_tools().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["list_files", "read_file", "think", "weather"]);
    }

    #[tokio::test]
    async fn test_unavailable_server_is_skipped() {
        let down: Arc<dyn ToolServer> = Arc::new(MockToolServer::new("down").unavailable());
        let up: Arc<dyn ToolServer> =
            Arc::new(MockToolServer::new("up").with_tool("weather", Ok(json!("sunny"))));

        let registry = ToolServerRegistry::build(vec![down, up]).await;

        assert_eq!(registry.resolve("weather").unwrap().server_id, "up");
        assert_eq!(registry.list_tools().len(), 1);
    }
}
