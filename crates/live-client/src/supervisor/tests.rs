use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt as _, StreamExt as _};
use serde_json::{json, Value};
use tokio::time::timeout;

use super::*;
use crate::channel::{BackoffPolicy, Endpoint};
use crate::session::AuthSession;

struct ServerEnd {
    url: Url,
    to_client: fmpsc::UnboundedSender<Result<Message, WsError>>,
    from_client: fmpsc::UnboundedReceiver<Message>,
}

impl ServerEnd {
    fn push_json(&self, value: Value) {
        self.to_client
            .unbounded_send(Ok(Message::Text(value.to_string())))
            .expect("client stream alive");
    }

    fn push_text(&self, text: &str) {
        self.to_client
            .unbounded_send(Ok(Message::Text(text.to_string())))
            .expect("client stream alive");
    }

    fn close_with(&self, code: CloseCode) {
        self.to_client
            .unbounded_send(Ok(Message::Close(Some(CloseFrame {
                code,
                reason: "".into(),
            }))))
            .expect("client stream alive");
    }
}

/// Hands every accepted connection to the test; refuses dials scripted as `false`.
struct MemoryDialer {
    script: parking_lot::Mutex<VecDeque<bool>>,
    dials: parking_lot::Mutex<Vec<Instant>>,
    /// Dials that never complete, taken before the script.
    stalls: AtomicUsize,
    accepted: mpsc::UnboundedSender<ServerEnd>,
}

impl MemoryDialer {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                script: parking_lot::Mutex::new(VecDeque::new()),
                dials: parking_lot::Mutex::new(Vec::new()),
                stalls: AtomicUsize::new(0),
                accepted,
            }),
            rx,
        )
    }

    fn script(&self, outcomes: &[bool]) {
        self.script.lock().extend(outcomes.iter().copied());
    }

    fn stall_next(&self, dials: usize) {
        self.stalls.store(dials, Ordering::SeqCst);
    }

    fn dial_count(&self) -> usize {
        self.dials.lock().len()
    }

    fn dial_gaps(&self) -> Vec<Duration> {
        let dials = self.dials.lock();
        dials.windows(2).map(|pair| pair[1] - pair[0]).collect()
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, url: &Url) -> LiveResult<FrameConnection> {
        self.dials.lock().push(Instant::now());
        let stalled = self
            .stalls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if stalled {
            return futures::future::pending().await;
        }
        if self.script.lock().pop_front() == Some(false) {
            return Err(LiveError::from(WsError::ConnectionClosed));
        }
        let (c2s_tx, c2s_rx) = fmpsc::unbounded::<Message>();
        let (s2c_tx, s2c_rx) = fmpsc::unbounded::<Result<Message, WsError>>();
        let _ = self.accepted.send(ServerEnd {
            url: url.clone(),
            to_client: s2c_tx,
            from_client: c2s_rx,
        });
        Ok(FrameConnection::new(
            c2s_tx.sink_map_err(|_| WsError::ConnectionClosed),
            s2c_rx,
        ))
    }
}

fn supervisor_for(
    channel: Channel,
    session: Arc<AuthSession>,
    dialer: Arc<MemoryDialer>,
) -> ConnectionSupervisor {
    let config = ChannelConfig::new(channel, Endpoint::new("oj.test", false));
    ConnectionSupervisor::with_dialer(config, session, dialer)
}

async fn wait_for_state(supervisor: &ConnectionSupervisor, wanted: ConnectionState) {
    let mut states = supervisor.watch_state();
    timeout(Duration::from_secs(600), states.wait_for(|state| *state == wanted))
        .await
        .expect("state reached in time")
        .expect("state channel alive");
}

fn assert_gap(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual < expected + Duration::from_millis(50),
        "gap {actual:?} not close to {expected:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn does_not_connect_without_subject() {
    let session = Arc::new(AuthSession::new());
    let (dialer, _accepted) = MemoryDialer::new();
    let supervisor = supervisor_for(Channel::Judge, session, dialer.clone());

    assert!(!supervisor.start());
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(supervisor.state(), ConnectionState::Idle);
    assert_eq!(dialer.dial_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn opens_scoped_address_and_dispatches_domain_events_only() {
    let session = Arc::new(AuthSession::signed_in("42", None));
    let (dialer, mut accepted) = MemoryDialer::new();
    let supervisor = supervisor_for(Channel::Judge, session, dialer.clone());
    let (_sub, mut events) = supervisor.registry().subscribe_queue();

    assert!(supervisor.start());
    let server = accepted.recv().await.expect("dialed");
    assert_eq!(server.url.as_str(), "ws://oj.test/ws/judge?uid=42");
    wait_for_state(&supervisor, ConnectionState::Open).await;
    assert!(supervisor.is_connected());

    server.push_json(json!({"type": "pong"}));
    server.push_text("{broken");
    server.push_json(json!({"snowflakeId": "7", "status": "答案正确", "time": 3, "memory": 1}));

    let event = timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("event delivered")
        .expect("queue open");
    assert_eq!(event.channel, Channel::Judge);
    assert_eq!(event.payload["snowflakeId"], "7");
    assert!(events.try_recv().is_err(), "pong and malformed frames are not dispatched");
    assert_eq!(supervisor.state(), ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn second_start_while_open_is_a_noop() {
    let session = Arc::new(AuthSession::signed_in("1", None));
    let (dialer, mut accepted) = MemoryDialer::new();
    let supervisor = supervisor_for(Channel::Message, session, dialer.clone());

    assert!(supervisor.start());
    assert!(!supervisor.start(), "connecting blocks a second start");
    let _server = accepted.recv().await.expect("dialed");
    wait_for_state(&supervisor, ConnectionState::Open).await;
    assert!(!supervisor.start());
    assert_eq!(dialer.dial_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn heartbeats_only_while_open_and_never_change_state() {
    let session = Arc::new(AuthSession::signed_in("3", None));
    let (dialer, mut accepted) = MemoryDialer::new();
    let supervisor = supervisor_for(Channel::Notification, session, dialer);
    let (_sub, mut events) = supervisor.registry().subscribe_queue();

    supervisor.start();
    let mut server = accepted.recv().await.expect("dialed");
    wait_for_state(&supervisor, ConnectionState::Open).await;

    for _ in 0..3 {
        let frame = server.from_client.next().await.expect("heartbeat");
        match frame {
            Message::Text(text) => {
                assert_eq!(serde_json::from_str::<Value>(&text).unwrap(), json!({"type": "ping"}));
            }
            other => panic!("unexpected frame {other:?}"),
        }
        server.push_json(json!({"type": "pong"}));
        assert_eq!(supervisor.state(), ConnectionState::Open);
    }
    assert_eq!(supervisor.heartbeats_sent(), 3);
    tokio::task::yield_now().await;
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn exponential_backoff_grows_then_resets_after_open() {
    let session = Arc::new(AuthSession::signed_in("5", None));
    let (dialer, mut accepted) = MemoryDialer::new();
    // open, three refusals, open again
    dialer.script(&[true, false, false, false, true]);
    let supervisor = supervisor_for(Channel::Notification, session, dialer.clone());

    supervisor.start();
    let first = accepted.recv().await.expect("first connection");
    wait_for_state(&supervisor, ConnectionState::Open).await;
    drop(first);

    let second = accepted.recv().await.expect("connection after backoff");
    wait_for_state(&supervisor, ConnectionState::Open).await;
    assert_eq!(supervisor.reconnect_attempt(), 0);
    drop(second);

    let _third = accepted.recv().await.expect("connection after reset");
    let gaps = dialer.dial_gaps();
    assert_eq!(gaps.len(), 5);
    assert_gap(gaps[0], Duration::from_secs(1));
    assert_gap(gaps[1], Duration::from_secs(2));
    assert_gap(gaps[2], Duration::from_secs(4));
    assert_gap(gaps[3], Duration::from_secs(8));
    assert_gap(gaps[4], Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn fixed_backoff_channel_reconnects_after_flat_delay() {
    let session = Arc::new(AuthSession::signed_in("5", None));
    let (dialer, mut accepted) = MemoryDialer::new();
    dialer.script(&[true, false, false, true]);
    let supervisor = supervisor_for(Channel::Judge, session, dialer.clone());

    supervisor.start();
    let first = accepted.recv().await.expect("first connection");
    wait_for_state(&supervisor, ConnectionState::Open).await;
    first.close_with(CloseCode::Normal);

    let _second = accepted.recv().await.expect("reconnected");
    let gaps = dialer.dial_gaps();
    assert_eq!(gaps.len(), 3);
    for gap in gaps {
        assert_gap(gap, Duration::from_secs(3));
    }
}

#[tokio::test(start_paused = true)]
async fn notification_channel_stays_down_after_normal_close() {
    let session = Arc::new(AuthSession::signed_in("8", None));
    let (dialer, mut accepted) = MemoryDialer::new();
    let supervisor = supervisor_for(Channel::Notification, session, dialer.clone());

    supervisor.start();
    let server = accepted.recv().await.expect("dialed");
    wait_for_state(&supervisor, ConnectionState::Open).await;
    server.close_with(CloseCode::Normal);
    wait_for_state(&supervisor, ConnectionState::Closed).await;

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(dialer.dial_count(), 1);

    assert!(supervisor.start(), "explicit start reconnects");
    let _again = accepted.recv().await.expect("dialed again");
    assert_eq!(dialer.dial_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_heartbeat_and_closes_connection() {
    let session = Arc::new(AuthSession::signed_in("9", None));
    let (dialer, mut accepted) = MemoryDialer::new();
    let supervisor = supervisor_for(Channel::Judge, session, dialer.clone());

    supervisor.start();
    let mut server = accepted.recv().await.expect("dialed");
    wait_for_state(&supervisor, ConnectionState::Open).await;

    supervisor.stop();
    assert_eq!(supervisor.state(), ConnectionState::Closed);
    supervisor.stop();
    assert_eq!(supervisor.state(), ConnectionState::Closed);

    let closing = server.from_client.next().await.expect("close frame");
    assert!(matches!(closing, Message::Close(Some(ref frame)) if frame.code == CloseCode::Normal));
    assert!(server.from_client.next().await.is_none(), "writer finished");

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(supervisor.heartbeats_sent(), 0);
    assert_eq!(dialer.dial_count(), 1);
    drop(server);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(dialer.dial_count(), 1, "server hang-up after stop does not reconnect");
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_pending_reconnect() {
    let session = Arc::new(AuthSession::signed_in("9", None));
    let (dialer, _accepted) = MemoryDialer::new();
    dialer.script(&[false]);
    let supervisor = supervisor_for(Channel::Judge, session, dialer.clone());

    supervisor.start();
    wait_for_state(&supervisor, ConnectionState::Closed).await;
    assert_eq!(dialer.dial_count(), 1);

    supervisor.stop();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(dialer.dial_count(), 1);
    assert_eq!(supervisor.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn start_during_backoff_dials_immediately() {
    let session = Arc::new(AuthSession::signed_in("2", None));
    let (dialer, mut accepted) = MemoryDialer::new();
    dialer.script(&[false]);
    let supervisor = supervisor_for(Channel::Judge, session, dialer.clone());

    supervisor.start();
    wait_for_state(&supervisor, ConnectionState::Closed).await;
    assert!(supervisor.start());
    let _server = accepted.recv().await.expect("dialed");
    let gaps = dialer.dial_gaps();
    assert!(gaps[0] < Duration::from_secs(1));

    wait_for_state(&supervisor, ConnectionState::Open).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(dialer.dial_count(), 2, "aborted timer never fires");
}

#[tokio::test(start_paused = true)]
async fn follows_session_changes() {
    let session = Arc::new(AuthSession::signed_in("10", None));
    let (dialer, mut accepted) = MemoryDialer::new();
    let supervisor = supervisor_for(Channel::Message, session.clone(), dialer.clone());
    supervisor.follow_session();
    supervisor.start();

    let first = accepted.recv().await.expect("dialed for 10");
    assert!(first.url.as_str().ends_with("uid=10"));
    wait_for_state(&supervisor, ConnectionState::Open).await;

    session.sign_out();
    wait_for_state(&supervisor, ConnectionState::Closed).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(dialer.dial_count(), 1);

    session.sign_in("11", Some("token".into()));
    let second = accepted.recv().await.expect("dialed for 11");
    assert!(second.url.as_str().ends_with("uid=11"));
    wait_for_state(&supervisor, ConnectionState::Open).await;

    session.sign_in("12", None);
    let third = accepted.recv().await.expect("dialed for 12");
    assert!(third.url.as_str().ends_with("uid=12"));
}

#[tokio::test(start_paused = true)]
async fn reconnect_is_abandoned_when_subject_changes_without_follow() {
    let session = Arc::new(AuthSession::signed_in("20", None));
    let (dialer, mut accepted) = MemoryDialer::new();
    let supervisor = supervisor_for(Channel::Judge, session.clone(), dialer.clone());

    supervisor.start();
    let server = accepted.recv().await.expect("dialed");
    wait_for_state(&supervisor, ConnectionState::Open).await;
    session.sign_in("21", None);
    drop(server);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(dialer.dial_count(), 1);
    assert_eq!(supervisor.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn send_requires_open_channel() {
    let session = Arc::new(AuthSession::signed_in("4", None));
    let (dialer, mut accepted) = MemoryDialer::new();
    let supervisor = supervisor_for(Channel::Message, session, dialer);

    assert!(matches!(
        supervisor.send(&json!({"type": "read"})),
        Err(LiveError::NotConnected)
    ));

    supervisor.start();
    let mut server = accepted.recv().await.expect("dialed");
    wait_for_state(&supervisor, ConnectionState::Open).await;
    supervisor.send(&json!({"type": "read", "peer": 5})).expect("sent");
    match server.from_client.next().await.expect("frame") {
        Message::Text(text) => {
            assert_eq!(serde_json::from_str::<Value>(&text).unwrap()["peer"], 5);
        }
        other => panic!("unexpected frame {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn subscriber_removing_itself_mid_dispatch_does_not_starve_others() {
    let session = Arc::new(AuthSession::signed_in("6", None));
    let (dialer, mut accepted) = MemoryDialer::new();
    let supervisor = supervisor_for(Channel::Notification, session, dialer);

    let a_hits = Arc::new(AtomicUsize::new(0));
    let b_hits = Arc::new(AtomicUsize::new(0));
    let slot: Arc<Mutex<Option<Subscription<DomainEvent>>>> = Arc::new(Mutex::new(None));
    let a = {
        let a_hits = a_hits.clone();
        let slot = slot.clone();
        supervisor.subscribe(move |_| {
            a_hits.fetch_add(1, Ordering::SeqCst);
            slot.lock().take();
        })
    };
    *slot.lock() = Some(a);
    let _b = {
        let b_hits = b_hits.clone();
        supervisor.subscribe(move |_| {
            b_hits.fetch_add(1, Ordering::SeqCst);
        })
    };

    supervisor.start();
    let server = accepted.recv().await.expect("dialed");
    wait_for_state(&supervisor, ConnectionState::Open).await;
    let notification = json!({"id": 1, "title": "t", "is_read": false, "createTime": "now"});
    server.push_json(notification.clone());
    server.push_json(notification);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(a_hits.load(Ordering::SeqCst), 1);
    assert_eq!(b_hits.load(Ordering::SeqCst), 2);
}

#[test]
fn exponential_config_is_honoured() {
    let config = ChannelConfig::new(Channel::Judge, Endpoint::new("h", false))
        .with_backoff(BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(4)));
    let mut policy = ReconnectPolicy::new(config.backoff);
    let delays: Vec<_> = (0..4).map(|_| policy.next_delay().as_secs()).collect();
    assert_eq!(delays, vec![1, 2, 4, 4]);
}

#[tokio::test(start_paused = true)]
async fn stalled_handshake_times_out_and_reconnects() {
    let session = Arc::new(AuthSession::signed_in("5", None));
    let (dialer, mut accepted) = MemoryDialer::new();
    dialer.stall_next(1);
    let config = ChannelConfig::new(Channel::Judge, Endpoint::new("oj.test", false))
        .with_connect_timeout(Duration::from_secs(5))
        .with_backoff(BackoffPolicy::Fixed(Duration::from_millis(100)));
    let supervisor = ConnectionSupervisor::with_dialer(config, session, dialer.clone());

    assert!(supervisor.start());
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(supervisor.state(), ConnectionState::Connecting);
    assert_eq!(dialer.dial_count(), 1);

    let _server = accepted.recv().await.expect("second dial accepted");
    wait_for_state(&supervisor, ConnectionState::Open).await;
    assert_eq!(dialer.dial_count(), 2);
    assert_gap(dialer.dial_gaps()[0], Duration::from_millis(5_100));
    assert_eq!(supervisor.reconnect_attempt(), 0);
}
