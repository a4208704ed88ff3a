use std::env;
use std::time::Duration;

use url::Url;

use crate::channel::{
    BackoffPolicy, Channel, ChannelConfig, Endpoint, BACKOFF_BASE, BACKOFF_CEILING,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL,
};
use crate::error::LiveResult;

pub const DEFAULT_HOST: &str = "127.0.0.1:8080";
pub const DEFAULT_REFRESH_DEBOUNCE: Duration = Duration::from_millis(500);

/// How reconnect delays are chosen across the three channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackoffMode {
    /// Flat 3s for judge and message, exponential for notification.
    #[default]
    PerChannel,
    /// Exponential with ceiling on every channel.
    Exponential,
}

impl BackoffMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "per-channel" | "per_channel" | "mixed" => Some(BackoffMode::PerChannel),
            "exponential" | "exp" => Some(BackoffMode::Exponential),
            _ => None,
        }
    }
}

/// Live client configuration
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub endpoint: Endpoint,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub backoff: BackoffMode,
    /// Delay before a terminal verdict triggers a collection reload.
    pub refresh_debounce: Duration,
}

impl LiveConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("JUDGE_LIVE_HOST")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let secure = lookup("JUDGE_LIVE_SECURE")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let heartbeat_interval = lookup("JUDGE_LIVE_HEARTBEAT_SECS")
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        let connect_timeout = lookup("JUDGE_LIVE_CONNECT_TIMEOUT_SECS")
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let backoff = lookup("JUDGE_LIVE_BACKOFF")
            .and_then(|value| BackoffMode::parse(&value))
            .unwrap_or_default();
        let refresh_debounce = lookup("JUDGE_LIVE_REFRESH_DEBOUNCE_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REFRESH_DEBOUNCE);

        Self {
            endpoint: Endpoint::new(host, secure),
            heartbeat_interval,
            connect_timeout,
            backoff,
            refresh_debounce,
        }
    }

    pub fn channel(&self, channel: Channel) -> ChannelConfig {
        let backoff = match self.backoff {
            BackoffMode::PerChannel => channel.default_backoff(),
            BackoffMode::Exponential => BackoffPolicy::exponential(BACKOFF_BASE, BACKOFF_CEILING),
        };
        ChannelConfig::new(channel, self.endpoint.clone())
            .with_heartbeat(self.heartbeat_interval)
            .with_connect_timeout(self.connect_timeout)
            .with_backoff(backoff)
    }

    /// Base URL of the request/response API on the same host.
    pub fn api_base(&self) -> LiveResult<Url> {
        self.endpoint.http_base()
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::new(DEFAULT_HOST, false),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            backoff: BackoffMode::PerChannel,
            refresh_debounce: DEFAULT_REFRESH_DEBOUNCE,
        }
    }
}
