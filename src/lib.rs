//! voxlink - real-time voice-agent session engine
//!
//! Streams microphone audio to a remote conversational model over a duplex
//! WebSocket, plays the synthesized reply gaplessly, executes the tool calls the
//! model makes, and supports barge-in. A passive wake word detector starts
//! sessions hands-free and a process-wide microphone lock arbitrates the device
//! between the detector, the session and the host application.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   start(context)   ┌────────────────────┐
//! │  Wake word   │ ─────────────────▶ │ Session controller │◀── control API
//! │  supervisor  │                    │      (actor)       │
//! └──────┬───────┘                    └──┬──────┬──────┬───┘
//!        │ rearm / mic-lock              │      │      │
//! ┌──────▼───────┐              capture ─┘  channel  playback
//! │  Event bus   │◀── session-state, nav-start, badge-unlock, logout, handoff
//! └──────────────┘
//! ```

pub mod api;
pub mod channel;
pub mod config;
pub mod daemon;
pub mod error;
pub mod events;
pub mod mic_lock;
pub mod session;
pub mod tools;
pub mod voice;

pub use config::Config;
pub use daemon::{Daemon, Engine};
pub use error::{Error, Result};
pub use events::{BusEvent, EventBus};
pub use mic_lock::{MicHolder, MicLock, MicLockState};
pub use session::{SessionHandle, SessionSnapshot, SessionState, StartOutcome};
pub use tools::{Tool, ToolExecutor, ToolRegistry};
