use std::sync::Arc;

use crate::channel::Channel;
use crate::config::LiveConfig;
use crate::session::SessionSource;

use super::{ConnectionSupervisor, Dialer, WebSocketDialer};

/// The three independently supervised channels of one signed-in app scope.
pub struct LiveChannels {
    pub judge: ConnectionSupervisor,
    pub notification: ConnectionSupervisor,
    pub message: ConnectionSupervisor,
}

impl LiveChannels {
    pub fn new(config: &LiveConfig, session: Arc<dyn SessionSource>) -> Self {
        Self::with_dialer(config, session, Arc::new(WebSocketDialer))
    }

    pub fn with_dialer(
        config: &LiveConfig,
        session: Arc<dyn SessionSource>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let build = |channel: Channel| {
            ConnectionSupervisor::with_dialer(
                config.channel(channel),
                Arc::clone(&session),
                Arc::clone(&dialer),
            )
        };
        Self {
            judge: build(Channel::Judge),
            notification: build(Channel::Notification),
            message: build(Channel::Message),
        }
    }

    pub fn get(&self, channel: Channel) -> &ConnectionSupervisor {
        match channel {
            Channel::Judge => &self.judge,
            Channel::Notification => &self.notification,
            Channel::Message => &self.message,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionSupervisor> {
        [&self.judge, &self.notification, &self.message].into_iter()
    }

    /// Follows the session on every channel and starts any that can connect now.
    pub fn start_all(&self) {
        for supervisor in self.iter() {
            supervisor.follow_session();
            supervisor.start();
        }
    }

    pub fn stop_all(&self) {
        for supervisor in self.iter() {
            supervisor.stop();
        }
    }
}
