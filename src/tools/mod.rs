//! Tool calls requested by the remote agent
//!
//! The engine does not know what tools do. It only needs an executor that maps a
//! name and JSON arguments to either a textual result (sent back to the agent) or a
//! control signal that the session controller acts on.

mod builtin;
mod dispatch;
mod registry;

use async_trait::async_trait;
use serde::Serialize;

pub use builtin::{
    CurrentTimeTool, HandoffTool, LogoutTool, NavigateTool, TerminateSessionTool, UnlockBadgeTool,
};
pub use dispatch::{DEFAULT_TOOL_TIMEOUT, TOOL_FAILURE_RESULT, dispatch};
pub use registry::ToolRegistry;

use crate::Result;
use crate::channel::FunctionDeclaration;

/// A single function call requested by the agent
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    /// Correlation id echoed in the response
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// Signals a tool can raise instead of returning text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    /// End the voice session
    Terminate,
    /// End the session and log the user out
    Logout,
    /// End the session and continue the conversation elsewhere
    Handoff,
}

/// Result of executing a tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Text(String),
    Control(ControlSignal),
}

impl ToolOutcome {
    /// Shorthand for a textual result
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }
}

/// A single named tool
#[async_trait]
pub trait Tool: Send + Sync {
    /// Schema advertised to the agent
    fn declaration(&self) -> FunctionDeclaration;

    /// Run the tool
    ///
    /// # Errors
    ///
    /// Returns error if the tool fails
    async fn call(&self, args: &serde_json::Value) -> Result<ToolOutcome>;
}

/// Executes tool calls by name
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute `name` with `args`
    ///
    /// # Errors
    ///
    /// Returns error if the tool is unknown or fails
    async fn execute(&self, name: &str, args: &serde_json::Value) -> Result<ToolOutcome>;

    /// Declarations for every tool this executor handles
    fn declarations(&self) -> Vec<FunctionDeclaration>;
}
