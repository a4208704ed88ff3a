//! AI assistant chat: streamed replies and stored history.

mod client;
mod history;
mod reassembler;

pub use client::{ApiEnvelope, ChatClient, FAILURE_NOTICE, LONG_MESSAGE_THRESHOLD};
pub use history::{parse_history, ChatRole, ChatTurn, SYSTEM_TAG};
pub use reassembler::{
    clean_frame, reassemble, ReplyEvent, ReplySink, StreamAccumulator, StreamOutcome,
    END_MARKER, FRAME_SEPARATOR,
};
