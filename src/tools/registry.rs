//! Name-keyed tool registry

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::builtin::{
    CurrentTimeTool, HandoffTool, LogoutTool, NavigateTool, TerminateSessionTool, UnlockBadgeTool,
};
use super::{Tool, ToolExecutor, ToolOutcome};
use crate::channel::FunctionDeclaration;
use crate::events::EventBus;
use crate::{Error, Result};

/// Tools resolved once at startup and looked up by name per call
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    // Registration order, so declarations are stable across runs
    order: Vec<String>,
}

impl ToolRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in tool
    #[must_use]
    pub fn with_builtins(bus: &EventBus) -> Self {
        let mut registry = Self::new();
        registry.register(TerminateSessionTool);
        registry.register(LogoutTool);
        registry.register(HandoffTool);
        registry.register(NavigateTool::new(bus.clone()));
        registry.register(UnlockBadgeTool::new(bus.clone()));
        registry.register(CurrentTimeTool);
        registry
    }

    /// Register a tool, replacing any tool with the same name
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.declaration().name;
        if self.tools.insert(name.clone(), Arc::new(tool)).is_some() {
            tracing::warn!(tool = %name, "replacing previously registered tool");
        } else {
            self.order.push(name);
        }
    }

    /// Registered tool names in registration order
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Number of registered tools
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(&self, name: &str, args: &serde_json::Value) -> Result<ToolOutcome> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| Error::Tool(format!("unknown tool: {name}")))?;
        tool.call(args).await
    }

    fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.declaration())
            .collect()
    }
}
