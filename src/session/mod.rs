//! Live voice session lifecycle
//!
//! The [`SessionController`] runs as a single task and is driven through a
//! [`SessionHandle`]. Observers read [`SessionSnapshot`]s from a watch channel.

mod controller;
mod state;

pub use controller::{
    SessionController, SessionDeps, SessionHandle, SessionSettings, StartOutcome,
};
pub use state::{
    Session, SessionSnapshot, SessionState, Speaker, TranscriptBuffers, TranscriptFragment,
    TranscriptLine,
};
