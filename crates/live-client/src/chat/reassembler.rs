//! Rebuilds a streamed chat reply from an event-stream response body.
//!
//! The body arrives as arbitrary byte chunks. Frames are separated by a blank
//! line, each frame line may carry a `data:` marker, and the upstream proxy
//! sprinkles `[DONE]` and runs of `"` through the content. Every complete frame
//! with visible text grows the reply, and the whole reply so far is published.

use std::fmt::Display;

use futures_util::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::error::ApiError;

pub const FRAME_SEPARATOR: &str = "\n\n";
pub const END_MARKER: &str = "[DONE]";
const DATA_MARKER: &str = "data:";

/// What the reply sink observes while a reply streams in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEvent {
    /// The complete reply text so far; replaces any earlier value.
    Text(String),
    /// The stream broke off. Published at most once; the last `Text` stays valid.
    Failed(String),
    Completed,
}

pub trait ReplySink {
    fn publish(&mut self, event: ReplyEvent);
}

impl<F> ReplySink for F
where
    F: FnMut(ReplyEvent),
{
    fn publish(&mut self, event: ReplyEvent) {
        self(event)
    }
}

#[derive(Debug)]
pub enum StreamOutcome {
    Completed { text: String },
    Failed { partial: String, error: ApiError },
}

impl StreamOutcome {
    pub fn text(&self) -> &str {
        match self {
            StreamOutcome::Completed { text } => text,
            StreamOutcome::Failed { partial, .. } => partial,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, StreamOutcome::Completed { .. })
    }
}

/// Visible text of one complete frame, or `None` when nothing is left after cleaning.
pub fn clean_frame(frame: &str) -> Option<String> {
    let joined: String = frame
        .lines()
        .map(strip_data_marker)
        .filter(|line| !line.trim().is_empty())
        .collect();
    let cleaned: String = joined
        .replace(END_MARKER, "")
        .chars()
        .filter(|ch| *ch != '"')
        .collect();
    if cleaned.trim().is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn strip_data_marker(line: &str) -> &str {
    match line.strip_prefix(DATA_MARKER) {
        Some(rest) => rest.strip_prefix(char::is_whitespace).unwrap_or(rest),
        None => line,
    }
}

/// Incremental state of one reply.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    /// Bytes of a character split across chunks.
    carry: Vec<u8>,
    /// Text after the last frame separator.
    buffer: String,
    accumulated: String,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.accumulated
    }

    pub fn into_text(self) -> String {
        self.accumulated
    }

    /// Feeds one chunk and returns the reply value after each frame that added text.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let decoded = self.decode(chunk);
        self.buffer.push_str(&decoded);

        let Some(last_separator) = self.buffer.rfind(FRAME_SEPARATOR) else {
            return Vec::new();
        };
        let remainder = self.buffer.split_off(last_separator + FRAME_SEPARATOR.len());
        let complete = std::mem::replace(&mut self.buffer, remainder);

        let mut published = Vec::new();
        for frame in complete.split(FRAME_SEPARATOR) {
            if let Some(content) = clean_frame(frame) {
                self.accumulated.push_str(&content);
                published.push(self.accumulated.clone());
            }
        }
        published
    }

    fn decode(&mut self, chunk: &[u8]) -> String {
        self.carry.extend_from_slice(chunk);
        let mut text = String::with_capacity(self.carry.len());
        let mut start = 0;
        while start < self.carry.len() {
            match std::str::from_utf8(&self.carry[start..]) {
                Ok(valid) => {
                    text.push_str(valid);
                    start = self.carry.len();
                }
                Err(err) => {
                    let valid_end = start + err.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.carry[start..valid_end]));
                    match err.error_len() {
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + bad;
                        }
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }
        self.carry.drain(..start);
        text
    }
}

/// Drives `body` to completion, publishing to `sink` as frames complete.
///
/// A body error publishes [`ReplyEvent::Failed`] once and stops reading; the
/// text gathered so far is returned with the error. An unterminated trailing
/// frame is discarded on completion.
pub async fn reassemble<S, B, E, K>(body: S, sink: &mut K) -> StreamOutcome
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
    K: ReplySink + ?Sized,
{
    let mut body = std::pin::pin!(body);
    let mut accumulator = StreamAccumulator::new();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                for text in accumulator.push(bytes.as_ref()) {
                    sink.publish(ReplyEvent::Text(text));
                }
            }
            Err(err) => {
                let error = ApiError::Stream(err.to_string());
                warn!(
                    target = "live.chat",
                    error = %error,
                    received = accumulator.text().len(),
                    "reply stream broke off"
                );
                sink.publish(ReplyEvent::Failed(error.to_string()));
                return StreamOutcome::Failed {
                    partial: accumulator.into_text(),
                    error,
                };
            }
        }
    }
    debug!(
        target = "live.chat",
        length = accumulator.text().len(),
        "reply stream completed"
    );
    sink.publish(ReplyEvent::Completed);
    StreamOutcome::Completed {
        text: accumulator.into_text(),
    }
}
