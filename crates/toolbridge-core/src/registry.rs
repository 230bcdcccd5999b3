//! Namespaced tool registry
//!
//! Tools are stored under `{app}:{tool}`. Registration is append-or-replace:
//! the last write for a name wins.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::protocol::{namespaced_name, ToolArgs, ToolDefinition, ToolInvocation, ToolResult};

/// An async tool body. `Ok` is the success payload, `Err` the error message.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Option<ToolArgs>) -> Result<Value, String>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(Option<ToolArgs>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    async fn call(&self, args: Option<ToolArgs>) -> Result<Value, String> {
        (self)(args).await
    }
}

struct RegisteredTool {
    definition: ToolDefinition,
    handler: Arc<dyn ToolHandler>,
}

/// Catalog of tools owned by one application
pub struct ToolRegistry {
    app_name: String,
    tools: RwLock<HashMap<String, RegisteredTool>>,
}

impl ToolRegistry {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            tools: RwLock::new(HashMap::new()),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Qualify a local name with this registry's prefix. Names that already
    /// carry the prefix are kept as-is.
    pub fn qualify(&self, name: &str) -> String {
        match name.strip_prefix(&self.app_name) {
            Some(rest) if rest.starts_with(crate::protocol::NAMESPACE_SEPARATOR) => {
                name.to_string()
            }
            _ => namespaced_name(&self.app_name, name),
        }
    }

    /// Register or replace a tool backed by an async closure. Returns the
    /// namespaced name.
    pub fn register_tool<F, Fut>(
        &self,
        name: &str,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> String
    where
        F: Fn(Option<ToolArgs>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.register_handler(name, description, input_schema, Arc::new(handler))
    }

    /// Register or replace a tool backed by any [`ToolHandler`]
    pub fn register_handler(
        &self,
        name: &str,
        description: impl Into<String>,
        input_schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> String {
        let qualified = self.qualify(name);
        let tool = RegisteredTool {
            definition: ToolDefinition {
                name: qualified.clone(),
                description: description.into(),
                input_schema,
            },
            handler,
        };

        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        if tools.insert(qualified.clone(), tool).is_some() {
            info!("Replaced tool registration: {}", qualified);
        } else {
            debug!("Registered tool: {}", qualified);
        }
        qualified
    }

    /// Snapshot of all definitions, sorted by name
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        let mut definitions: Vec<ToolDefinition> =
            tools.values().map(|t| t.definition.clone()).collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the named tool. Never fails: unknown tools, tool errors and
    /// panics all come back as a failed [`ToolResult`].
    pub async fn execute(&self, invocation: &ToolInvocation) -> ToolResult {
        let handler = {
            let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
            tools
                .get(&invocation.tool)
                .map(|t| Arc::clone(&t.handler))
        };
        let Some(handler) = handler else {
            warn!("Invocation of unknown tool: {}", invocation.tool);
            return ToolResult::not_found(&invocation.tool);
        };

        let args = invocation.parameters.clone();
        // Run on a separate task so a panicking tool surfaces as a JoinError
        let outcome = tokio::spawn(async move { handler.call(args).await }).await;

        match outcome {
            Ok(Ok(payload)) => ToolResult::success(payload),
            Ok(Err(message)) => {
                debug!("Tool {} failed: {}", invocation.tool, message);
                ToolResult::failure(message)
            }
            Err(join_error) => {
                warn!("Tool {} panicked: {}", invocation.tool, join_error);
                ToolResult::failure(format!("Tool execution panicked: {}", invocation.tool))
            }
        }
    }
}
