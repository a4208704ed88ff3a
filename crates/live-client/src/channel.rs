//! Channel identities and the per-channel parameters a supervisor runs with.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::LiveResult;
use crate::session::SubjectId;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const FIXED_RECONNECT_DELAY: Duration = Duration::from_secs(3);
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const BACKOFF_CEILING: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Judge,
    Notification,
    Message,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Judge, Channel::Notification, Channel::Message];

    pub fn path(self) -> &'static str {
        match self {
            Channel::Judge => "ws/judge",
            Channel::Notification => "ws/notification",
            Channel::Message => "ws/message",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Judge => "judge",
            Channel::Notification => "notification",
            Channel::Message => "message",
        }
    }

    /// Reconnect policy the deployed client uses for this channel.
    pub fn default_backoff(self) -> BackoffPolicy {
        match self {
            Channel::Judge | Channel::Message => BackoffPolicy::Fixed(FIXED_RECONNECT_DELAY),
            Channel::Notification => BackoffPolicy::exponential(BACKOFF_BASE, BACKOFF_CEILING),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay between a close and the next connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    Fixed(Duration),
    Exponential { base: Duration, max: Duration },
}

impl BackoffPolicy {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        BackoffPolicy::Exponential {
            base,
            max: max.max(base),
        }
    }

    /// `attempt` counts failures since the last successful open, starting at 0.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed(delay) => delay,
            BackoffPolicy::Exponential { base, max } => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Reconnect bookkeeping owned by one supervisor.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    backoff: BackoffPolicy,
    attempt: u32,
    desired: bool,
}

impl ReconnectPolicy {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            backoff,
            attempt: 0,
            desired: false,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn desired(&self) -> bool {
        self.desired
    }

    pub fn set_desired(&mut self, desired: bool) {
        self.desired = desired;
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay for the current attempt; advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.backoff.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }
}

/// Host a channel address is built against. `secure` mirrors the transport
/// security of the surrounding application (wss/https vs ws/http).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub secure: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, secure: bool) -> Self {
        Self {
            host: host.into(),
            secure,
        }
    }

    pub fn ws_scheme(&self) -> &'static str {
        if self.secure {
            "wss"
        } else {
            "ws"
        }
    }

    pub fn http_scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    pub fn http_base(&self) -> LiveResult<Url> {
        Ok(Url::parse(&format!("{}://{}/", self.http_scheme(), self.host))?)
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub channel: Channel,
    pub endpoint: Endpoint,
    pub heartbeat_interval: Duration,
    /// Upper bound on dial plus handshake; expiry counts as a failed attempt.
    pub connect_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Whether a server close with the normal close code (1000) is followed by a
    /// reconnect. Explicit `stop()` never reconnects regardless.
    pub reconnect_on_normal_close: bool,
}

impl ChannelConfig {
    pub fn new(channel: Channel, endpoint: Endpoint) -> Self {
        Self {
            channel,
            endpoint,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            backoff: channel.default_backoff(),
            reconnect_on_normal_close: !matches!(channel, Channel::Notification),
        }
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, limit: Duration) -> Self {
        self.connect_timeout = limit;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// `{scheme}://{host}/{channel-path}?uid={subject}`
    pub fn address(&self, subject: &SubjectId) -> LiveResult<Url> {
        let mut url = Url::parse(&format!(
            "{}://{}/{}",
            self.endpoint.ws_scheme(),
            self.endpoint.host,
            self.channel.path()
        ))?;
        url.query_pairs_mut().append_pair("uid", subject.as_str());
        Ok(url)
    }
}
