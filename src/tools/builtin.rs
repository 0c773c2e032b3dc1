//! Built-in tools available to every session

use async_trait::async_trait;
use serde_json::json;

use super::{ControlSignal, Tool, ToolOutcome};
use crate::channel::FunctionDeclaration;
use crate::events::{BusEvent, EventBus};
use crate::{Error, Result};

fn declaration(
    name: &str,
    description: &str,
    parameters: Option<serde_json::Value>,
) -> FunctionDeclaration {
    FunctionDeclaration {
        name: name.to_string(),
        description: description.to_string(),
        parameters,
    }
}

/// Read a required string argument
fn string_arg<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| Error::Tool(format!("missing required argument: {key}")))
}

/// Ends the voice session
pub struct TerminateSessionTool;

#[async_trait]
impl Tool for TerminateSessionTool {
    fn declaration(&self) -> FunctionDeclaration {
        declaration(
            "terminate_voice_session",
            "End the current voice conversation when the user says goodbye or asks to stop",
            None,
        )
    }

    async fn call(&self, _args: &serde_json::Value) -> Result<ToolOutcome> {
        Ok(ToolOutcome::Control(ControlSignal::Terminate))
    }
}

/// Logs the user out
pub struct LogoutTool;

#[async_trait]
impl Tool for LogoutTool {
    fn declaration(&self) -> FunctionDeclaration {
        declaration("logout", "Log the user out of the application", None)
    }

    async fn call(&self, _args: &serde_json::Value) -> Result<ToolOutcome> {
        Ok(ToolOutcome::Control(ControlSignal::Logout))
    }
}

/// Moves the conversation to the text chat
pub struct HandoffTool;

#[async_trait]
impl Tool for HandoffTool {
    fn declaration(&self) -> FunctionDeclaration {
        declaration(
            "handoff_to_chat",
            "Continue this conversation in the text chat instead of by voice",
            None,
        )
    }

    async fn call(&self, _args: &serde_json::Value) -> Result<ToolOutcome> {
        Ok(ToolOutcome::Control(ControlSignal::Handoff))
    }
}

/// Asks the host application to open a page
pub struct NavigateTool {
    bus: EventBus,
}

impl NavigateTool {
    #[must_use]
    pub const fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Tool for NavigateTool {
    fn declaration(&self) -> FunctionDeclaration {
        declaration(
            "navigate",
            "Open a page in the application, such as a recipe, the chat or the rewards screen",
            Some(json!({
                "type": "object",
                "properties": {
                    "destination": {
                        "type": "string",
                        "description": "Page or route to open"
                    }
                },
                "required": ["destination"]
            })),
        )
    }

    async fn call(&self, args: &serde_json::Value) -> Result<ToolOutcome> {
        let destination = string_arg(args, "destination")?;
        tracing::info!(destination, "navigation requested");
        self.bus.publish(BusEvent::NavStart {
            destination: destination.to_string(),
        });
        Ok(ToolOutcome::text(format!("Opened {destination}")))
    }
}

/// Awards a badge to the user
pub struct UnlockBadgeTool {
    bus: EventBus,
}

impl UnlockBadgeTool {
    #[must_use]
    pub const fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Tool for UnlockBadgeTool {
    fn declaration(&self) -> FunctionDeclaration {
        declaration(
            "unlock_badge",
            "Unlock an achievement badge for the user",
            Some(json!({
                "type": "object",
                "properties": {
                    "badge": {
                        "type": "string",
                        "description": "Identifier of the badge to unlock"
                    }
                },
                "required": ["badge"]
            })),
        )
    }

    async fn call(&self, args: &serde_json::Value) -> Result<ToolOutcome> {
        let badge = string_arg(args, "badge")?;
        tracing::info!(badge, "badge unlocked");
        self.bus.publish(BusEvent::BadgeUnlock {
            badge: badge.to_string(),
        });
        Ok(ToolOutcome::text(format!("Badge {badge} unlocked")))
    }
}

/// Reports the local time
pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn declaration(&self) -> FunctionDeclaration {
        declaration("get_current_time", "Get the current local date and time", None)
    }

    async fn call(&self, _args: &serde_json::Value) -> Result<ToolOutcome> {
        let now = chrono::Local::now();
        Ok(ToolOutcome::text(now.format("%A, %B %-d %Y, %H:%M").to_string()))
    }
}
