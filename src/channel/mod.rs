//! Duplex channel to the remote conversational agent
//!
//! The engine only depends on [`ConversationTransport`] and
//! [`ConversationChannel`]; [`LiveTransport`] is the WebSocket implementation.

mod live;
pub mod protocol;

use std::sync::Arc;

use async_trait::async_trait;

pub use live::LiveTransport;
pub use protocol::{FunctionDeclaration, FunctionResponse, LiveSetup, MediaChunk};

use crate::Result;
use crate::session::TranscriptFragment;
use crate::tools::ToolInvocation;

/// Event emitted by an open channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Remote acknowledged the setup handshake
    Open,
    /// Batch of tool invocations, to be resolved in order
    ToolCall(Vec<ToolInvocation>),
    /// Synthesized PCM16 mono audio at 24 kHz
    Audio(Vec<u8>),
    /// Live transcription
    Transcript(TranscriptFragment),
    /// Remote detected user speech during playback
    Interrupted,
    /// Remote finished its turn
    TurnComplete,
    /// Transport or protocol failure
    Error(String),
    /// Channel closed, expectedly or not
    Closed,
}

/// Callback receiving channel events; invoked from the channel's reader task
pub type EventSink = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// Opens conversation channels
#[async_trait]
pub trait ConversationTransport: Send + Sync {
    /// Connect and send the setup handshake
    ///
    /// The returned channel reports [`ChannelEvent::Open`] through `events` once the
    /// remote acknowledges the setup.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ChannelOpen`] if the connection cannot be established
    async fn connect(
        &self,
        setup: LiveSetup,
        events: EventSink,
    ) -> Result<Box<dyn ConversationChannel>>;
}

/// An open duplex channel
///
/// Sends are fire-and-forget: they return `false` once the channel is closed and the
/// message was dropped.
pub trait ConversationChannel: Send {
    /// Send one encoded capture window
    fn send_audio(&self, chunk: MediaChunk) -> bool;

    /// Send the result of a tool invocation
    fn send_tool_response(&self, response: FunctionResponse) -> bool;

    /// Close the channel without waiting for the remote
    fn close(&mut self);
}
