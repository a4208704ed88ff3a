use serde_json::Value;
use tracing::trace;

use crate::channel::Channel;
use crate::error::{LiveError, LiveResult};
use crate::events::DomainEvent;

pub const HEARTBEAT_ACK_TYPE: &str = "pong";
pub const HEARTBEAT_TYPE: &str = "ping";

pub fn heartbeat_frame() -> String {
    serde_json::json!({ "type": HEARTBEAT_TYPE }).to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoutedFrame {
    /// `{"type":"pong"}`; consumed here, never dispatched.
    HeartbeatAck,
    Domain(DomainEvent),
}

/// Classifies inbound frames for one channel.
#[derive(Debug, Clone, Copy)]
pub struct EventRouter {
    channel: Channel,
}

impl EventRouter {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn route_text(&self, text: &str) -> LiveResult<RoutedFrame> {
        let value: Value = serde_json::from_str(text).map_err(LiveError::MalformedFrame)?;
        Ok(self.route_value(value))
    }

    pub fn route_value(&self, value: Value) -> RoutedFrame {
        if value.get("type").and_then(Value::as_str) == Some(HEARTBEAT_ACK_TYPE) {
            trace!(target = "live.router", channel = %self.channel, "heartbeat ack");
            return RoutedFrame::HeartbeatAck;
        }
        RoutedFrame::Domain(DomainEvent::new(self.channel, value))
    }
}
