//! Bounded execution of a single tool invocation

use std::time::Duration;

use super::{ToolExecutor, ToolInvocation, ToolOutcome};

/// Default upper bound on one tool call
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(15);

/// Result sent to the agent when a tool fails or times out
pub const TOOL_FAILURE_RESULT: &str = "The tool failed to run. Let the user know and carry on.";

/// Execute one invocation, never failing
///
/// Errors and timeouts are logged and replaced by [`TOOL_FAILURE_RESULT`] so the
/// remote turn always receives a response.
pub async fn dispatch(
    executor: &dyn ToolExecutor,
    invocation: &ToolInvocation,
    timeout: Duration,
) -> ToolOutcome {
    tracing::debug!(tool = %invocation.name, call_id = %invocation.id, "executing tool");

    match tokio::time::timeout(timeout, executor.execute(&invocation.name, &invocation.args)).await
    {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            tracing::warn!(
                tool = %invocation.name,
                call_id = %invocation.id,
                error = %e,
                "tool execution failed"
            );
            ToolOutcome::text(TOOL_FAILURE_RESULT)
        }
        Err(_) => {
            tracing::warn!(
                tool = %invocation.name,
                call_id = %invocation.id,
                ?timeout,
                "tool execution timed out"
            );
            ToolOutcome::text(TOOL_FAILURE_RESULT)
        }
    }
}
