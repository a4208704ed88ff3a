//! Live-update client for the online judge.
//!
//! Three supervised WebSocket channels (judge verdicts, notifications, private
//! messages) fan events out to in-process subscribers; reconcilers merge those
//! events into collections the UI holds; the chat module streams assistant
//! replies over an event-stream HTTP response.

pub mod channel;
pub mod chat;
pub mod config;
pub mod error;
pub mod events;
pub mod reconcile;
pub mod router;
pub mod session;
pub mod supervisor;
pub mod telemetry;

pub use channel::{BackoffPolicy, Channel, ChannelConfig, Endpoint, ReconnectPolicy};
pub use config::{BackoffMode, LiveConfig};
pub use error::{ApiError, ApiResult, LiveError, LiveResult};
pub use events::{CorrelationKey, DomainEvent, JudgeEvent, MessageEvent, NotificationEvent};
pub use live_bus::{SubscriberRegistry, Subscription};
pub use router::{EventRouter, RoutedFrame};
pub use session::{AuthSession, SessionSource, SubjectId};
pub use supervisor::{ConnectionState, ConnectionSupervisor, LiveChannels};
