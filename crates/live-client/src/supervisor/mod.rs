//! Connection supervision for the live channels.
//!
//! One [`ConnectionSupervisor`] owns at most one connection to one channel. It
//! opens the connection when a subject is signed in, heartbeats while open,
//! reconnects with the channel's backoff after any close it did not ask for, and
//! tears everything down deterministically on [`ConnectionSupervisor::stop`].
//!
//! All timers (heartbeat and reconnect) live inside a single driver task per
//! connection scope, so aborting that task cancels both at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use live_bus::{SubscriberRegistry, Subscription};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::channel::{Channel, ChannelConfig, ReconnectPolicy};
use crate::error::{LiveError, LiveResult};
use crate::events::DomainEvent;
use crate::router::{heartbeat_frame, EventRouter, RoutedFrame};
use crate::session::{SessionSource, SubjectId};

pub mod dialer;
mod set;

pub use dialer::{Dialer, FrameConnection, FrameSink, FrameStream, WebSocketDialer};
pub use set::LiveChannels;

use dialer::pump_outbound;

const NORMAL_CLOSE: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug)]
enum SessionEnd {
    DialFailed,
    Closed { code: Option<u16> },
    Errored,
    Superseded,
}

struct Control {
    state: ConnectionState,
    reconnect: ReconnectPolicy,
    /// Bumped on every start/stop; work tagged with an older generation is stale.
    generation: u64,
    driver: Option<JoinHandle<()>>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    subject: Option<SubjectId>,
}

struct Shared {
    config: ChannelConfig,
    router: EventRouter,
    dialer: Arc<dyn Dialer>,
    session: Arc<dyn SessionSource>,
    registry: SubscriberRegistry<DomainEvent>,
    control: Mutex<Control>,
    state_tx: watch::Sender<ConnectionState>,
    heartbeats_sent: AtomicU64,
}

pub struct ConnectionSupervisor {
    shared: Arc<Shared>,
    session_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    pub fn new(config: ChannelConfig, session: Arc<dyn SessionSource>) -> Self {
        Self::with_dialer(config, session, Arc::new(WebSocketDialer))
    }

    pub fn with_dialer(
        config: ChannelConfig,
        session: Arc<dyn SessionSource>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let shared = Arc::new(Shared {
            router: EventRouter::new(config.channel),
            control: Mutex::new(Control {
                state: ConnectionState::Idle,
                reconnect: ReconnectPolicy::new(config.backoff),
                generation: 0,
                driver: None,
                outbound: None,
                subject: None,
            }),
            config,
            dialer,
            session,
            registry: SubscriberRegistry::new(),
            state_tx,
            heartbeats_sent: AtomicU64::new(0),
        });
        Self {
            shared,
            session_task: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> Channel {
        self.shared.config.channel
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    /// Begins connecting. Returns `false` without side effects when no subject is
    /// signed in or a connection is already open or being opened. A reconnect that
    /// is waiting out its backoff is cancelled and replaced by an immediate dial.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> bool {
        self.shared.start()
    }

    /// Stops the channel: no reconnects, heartbeat and reconnect timers cancelled
    /// before returning, live connection closed. Idempotent.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Binds the supervisor to the session's change signal: signing out stops it,
    /// signing in (or switching subject) restarts it for the new subject.
    pub fn follow_session(&self) {
        let mut changes = self.shared.session.session_changes();
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let task = tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let subject = changes.borrow_and_update().clone();
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                shared.on_session_changed(subject);
            }
        });
        if let Some(previous) = self.session_task.lock().replace(task) {
            previous.abort();
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription<DomainEvent>
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        self.shared.registry.subscribe(callback)
    }

    pub fn registry(&self) -> SubscriberRegistry<DomainEvent> {
        self.shared.registry.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.control.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.shared.control.lock().reconnect.attempt()
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.shared.heartbeats_sent.load(Ordering::Relaxed)
    }

    /// Writes one JSON frame. Only succeeds while the channel is open; frames are
    /// never queued for a later connection.
    pub fn send<T: Serialize>(&self, frame: &T) -> LiveResult<()> {
        let text = serde_json::to_string(frame).map_err(LiveError::Encode)?;
        let control = self.shared.control.lock();
        if control.state != ConnectionState::Open {
            return Err(LiveError::NotConnected);
        }
        control
            .outbound
            .as_ref()
            .ok_or(LiveError::NotConnected)?
            .send(Message::Text(text))
            .map_err(|_| LiveError::NotConnected)
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        if let Some(task) = self.session_task.lock().take() {
            task.abort();
        }
        self.shared.stop();
    }
}

impl Shared {
    fn set_state(&self, control: &mut Control, next: ConnectionState) {
        if control.state == next {
            return;
        }
        debug!(
            target = "live.supervisor",
            channel = %self.config.channel,
            from = ?control.state,
            to = ?next,
            "connection state changed"
        );
        control.state = next;
        self.state_tx.send_replace(next);
    }

    fn start(self: &Arc<Self>) -> bool {
        let channel = self.config.channel;
        let Some(subject) = self.session.current_subject() else {
            debug!(
                target = "live.supervisor",
                channel = %channel,
                "no signed-in subject; not connecting"
            );
            return false;
        };
        let url = match self.config.address(&subject) {
            Ok(url) => url,
            Err(err) => {
                warn!(
                    target = "live.supervisor",
                    channel = %channel,
                    error = %err,
                    "cannot build channel address"
                );
                return false;
            }
        };

        let mut control = self.control.lock();
        if matches!(
            control.state,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            trace!(
                target = "live.supervisor",
                channel = %channel,
                state = ?control.state,
                "start ignored; connection already active"
            );
            return false;
        }
        if let Some(pending) = control.driver.take() {
            pending.abort();
        }
        control.generation = control.generation.wrapping_add(1);
        let generation = control.generation;
        control.reconnect.set_desired(true);
        control.subject = Some(subject.clone());
        self.set_state(&mut control, ConnectionState::Connecting);
        info!(
            target = "live.supervisor",
            channel = %channel,
            subject = %subject,
            "starting live channel"
        );
        let shared = Arc::clone(self);
        control.driver = Some(tokio::spawn(async move {
            shared.drive(generation, url).await;
        }));
        true
    }

    fn stop(&self) {
        let mut control = self.control.lock();
        control.reconnect.set_desired(false);
        control.generation = control.generation.wrapping_add(1);
        if let Some(driver) = control.driver.take() {
            driver.abort();
        }
        if let Some(outbound) = control.outbound.take() {
            self.set_state(&mut control, ConnectionState::Closing);
            let _ = outbound.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "stop".into(),
            })));
        }
        if control.subject.take().is_some() {
            info!(
                target = "live.supervisor",
                channel = %self.config.channel,
                "live channel stopped"
            );
        }
        self.set_state(&mut control, ConnectionState::Closed);
    }

    fn on_session_changed(self: &Arc<Self>, subject: Option<SubjectId>) {
        match subject {
            None => {
                debug!(
                    target = "live.supervisor",
                    channel = %self.config.channel,
                    "session ended"
                );
                self.stop();
            }
            Some(subject) => {
                let (same_subject, active) = {
                    let control = self.control.lock();
                    (
                        control.subject.as_ref() == Some(&subject),
                        control.reconnect.desired(),
                    )
                };
                if same_subject && active {
                    return;
                }
                if !same_subject {
                    self.stop();
                }
                self.start();
            }
        }
    }

    async fn drive(self: Arc<Self>, generation: u64, url: Url) {
        loop {
            let limit = self.config.connect_timeout;
            let dialed = match timeout(limit, self.dialer.dial(&url)).await {
                Ok(result) => result,
                Err(_) => Err(LiveError::ConnectTimeout(limit)),
            };
            let end = match dialed {
                Ok(connection) => self.run_connection(generation, connection).await,
                Err(err) => {
                    warn!(
                        target = "live.supervisor",
                        channel = %self.config.channel,
                        url = %url,
                        error = %err,
                        "live channel connect failed"
                    );
                    SessionEnd::DialFailed
                }
            };
            let Some(delay) = self.after_close(generation, &end) else {
                return;
            };
            info!(
                target = "live.supervisor",
                channel = %self.config.channel,
                delay_ms = delay.as_millis() as u64,
                reason = ?end,
                "reconnect scheduled"
            );
            sleep(delay).await;
            if !self.begin_reconnect(generation) {
                return;
            }
        }
    }

    async fn run_connection(&self, generation: u64, connection: FrameConnection) -> SessionEnd {
        let FrameConnection { sink, mut stream } = connection;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_outbound(sink, outbound_rx));
        if !self.on_open(generation, outbound_tx) {
            return SessionEnd::Superseded;
        }

        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => self.send_heartbeat(generation),
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => self.handle_text(&text),
                        Err(_) => warn!(
                            target = "live.router",
                            channel = %self.config.channel,
                            error = %LiveError::InvalidUtf8,
                            "dropping binary frame"
                        ),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map(|frame| u16::from(frame.code));
                        debug!(
                            target = "live.supervisor",
                            channel = %self.config.channel,
                            code = ?code,
                            "server closed live channel"
                        );
                        return SessionEnd::Closed { code };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!(
                                    target = "live.supervisor",
                                    channel = %self.config.channel,
                                    "live channel closed: {err}"
                                );
                            }
                            _ => {
                                warn!(
                                    target = "live.supervisor",
                                    channel = %self.config.channel,
                                    "live channel error: {err}"
                                );
                            }
                        }
                        return SessionEnd::Errored;
                    }
                    None => return SessionEnd::Closed { code: None },
                },
            }
        }
    }

    fn on_open(&self, generation: u64, outbound: mpsc::UnboundedSender<Message>) -> bool {
        let current = self.session.current_subject();
        let mut control = self.control.lock();
        if control.generation != generation {
            return false;
        }
        if current.is_none() || current != control.subject {
            info!(
                target = "live.supervisor",
                channel = %self.config.channel,
                "subject changed while connecting; dropping connection"
            );
            control.reconnect.set_desired(false);
            return false;
        }
        control.reconnect.reset();
        control.outbound = Some(outbound);
        self.set_state(&mut control, ConnectionState::Open);
        info!(
            target = "live.supervisor",
            channel = %self.config.channel,
            "live channel open"
        );
        true
    }

    fn after_close(&self, generation: u64, end: &SessionEnd) -> Option<Duration> {
        let mut control = self.control.lock();
        if control.generation != generation {
            return None;
        }
        control.outbound = None;
        self.set_state(&mut control, ConnectionState::Closed);
        if !control.reconnect.desired() {
            return None;
        }
        if matches!(end, SessionEnd::Closed { code: Some(NORMAL_CLOSE) })
            && !self.config.reconnect_on_normal_close
        {
            info!(
                target = "live.supervisor",
                channel = %self.config.channel,
                "normal close; not reconnecting"
            );
            return None;
        }
        Some(control.reconnect.next_delay())
    }

    fn begin_reconnect(&self, generation: u64) -> bool {
        let current = self.session.current_subject();
        let mut control = self.control.lock();
        if control.generation != generation || !control.reconnect.desired() {
            return false;
        }
        if current.is_none() || current != control.subject {
            info!(
                target = "live.supervisor",
                channel = %self.config.channel,
                "subject changed; abandoning reconnect"
            );
            control.reconnect.set_desired(false);
            return false;
        }
        self.set_state(&mut control, ConnectionState::Connecting);
        true
    }

    fn send_heartbeat(&self, generation: u64) {
        let control = self.control.lock();
        if control.generation != generation || control.state != ConnectionState::Open {
            return;
        }
        if let Some(outbound) = &control.outbound {
            if outbound.send(Message::Text(heartbeat_frame())).is_ok() {
                self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
                trace!(
                    target = "live.supervisor",
                    channel = %self.config.channel,
                    "heartbeat sent"
                );
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match self.router.route_text(text) {
            Ok(RoutedFrame::HeartbeatAck) => {}
            Ok(RoutedFrame::Domain(event)) => {
                let delivered = self.registry.dispatch(Arc::new(event));
                trace!(
                    target = "live.router",
                    channel = %self.config.channel,
                    delivered,
                    "event dispatched"
                );
            }
            Err(err) => {
                warn!(
                    target = "live.router",
                    channel = %self.config.channel,
                    error = %err,
                    "dropping malformed frame"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests;
