//! Connection manager: keeps one device session alive.
//!
//! ```text
//!            start / retry
//! Disconnected ──────────▶ Connecting ──socket open──▶ Handshaking ──first frame──▶ Ready
//!      ▲                       │                            │                         │
//!      └───────────────────────┴──── failure / timeout ─────┴──── error, close, ──────┘
//!                                                               silence, shutdown
//! ```
//!
//! Each connection runs as:
//!
//! - the **manager task** (spawned by [`ConnectionManager::start`]), which
//!   owns the write half of the socket, the state transitions, the keepalive
//!   ticker and the liveness deadline, and
//! - a **reader task**, which decodes inbound messages and forwards them to
//!   the manager task over an `mpsc` channel so frames are reconciled in
//!   receive order.
//!
//! Commands reach the socket through the session's outbound channel; the
//! manager task writes them and reports each write result back to the caller.
//!
//! Failed connection attempts back off exponentially
//! (`reconnect_initial`, doubling, capped at `reconnect_max`).  When a session
//! that stayed `Ready` for at least `min_stable_session` is lost, the next
//! attempt starts immediately and the backoff resets; a session dropped
//! sooner counts as a failed attempt.  Retries continue until
//! [`ConnectionManager::shutdown`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use sonoff_core::protocol::user_online;
use sonoff_core::{decode_frame, decode_frame_bytes, encode_frame, Frame, ProtocolError};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::application::dispatcher::CommandDispatcher;
use crate::application::reconciler::EventReconciler;
use crate::domain::config::{ConnectionPolicy, DeviceConfig};
use crate::domain::events::{ConnectionState, DeviceEvent};
use crate::error::TransportError;
use crate::infrastructure::session::{OutboundFrame, Session, SessionHandle};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// Events kept for slow subscribers before the oldest are dropped.
const EVENT_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 64;

// ── Public API ────────────────────────────────────────────────────────────────

/// Maintains a self-healing session with one device host.
#[derive(Debug)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
    started: AtomicBool,
}

#[derive(Debug)]
struct Shared {
    device: DeviceConfig,
    policy: ConnectionPolicy,
    apikey: String,
    state: watch::Sender<ConnectionState>,
    sessions: watch::Sender<Option<SessionHandle>>,
    events: broadcast::Sender<DeviceEvent>,
    shutdown: watch::Sender<bool>,
    reconciler: EventReconciler,
}

impl ConnectionManager {
    /// Creates a manager in the `Disconnected` state.  Nothing happens on the
    /// network until [`start`](Self::start) is called.
    ///
    /// The policy is [normalized](ConnectionPolicy::normalized) first.
    pub fn new(device: DeviceConfig, policy: ConnectionPolicy, apikey: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (sessions, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let reconciler =
            EventReconciler::new(events.clone()).with_default_name(device.name.clone());
        Self {
            shared: Arc::new(Shared {
                device,
                policy: policy.normalized(),
                apikey: apikey.into(),
                state,
                sessions,
                events,
                shutdown,
                reconciler,
            }),
            started: AtomicBool::new(false),
        }
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.shared.device
    }

    /// Follows the connection state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receives device notifications from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.shared.events.subscribe()
    }

    /// A dispatcher bound to whichever session is ready.
    pub fn dispatcher(&self) -> CommandDispatcher {
        CommandDispatcher::new(self.shared.sessions.subscribe(), self.shared.apikey.clone())
    }

    /// Spawns the connection loop.  Calling it again has no effect besides
    /// a warning.
    pub fn start(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let first = !self.started.swap(true, Ordering::SeqCst);
        tokio::spawn(async move {
            if first {
                run(shared).await;
            } else {
                warn!(url = %shared.device.url(), "Connection manager already started");
            }
        })
    }

    /// Closes the current session and stops reconnecting.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }
}

// ── Connection loop ──────────────────────────────────────────────────────────

enum Inbound {
    Frame(Frame),
    /// Traffic that proves liveness but carries no frame (pings, pongs,
    /// dropped malformed frames).
    Activity,
    Closed,
    Failed(tungstenite::Error),
}

enum SessionEnd {
    Shutdown,
    /// `ready_for` is how long the session was ready, `None` if it never was.
    Lost {
        ready_for: Option<Duration>,
        error: TransportError,
    },
}

fn lost(error: TransportError) -> SessionEnd {
    SessionEnd::Lost {
        ready_for: None,
        error,
    }
}

async fn run(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut backoff = shared.policy.reconnect_initial;
    let url = shared.device.url();
    info!(url = %url, "Connection manager started");

    while !*shutdown.borrow() {
        let end = run_session(&shared, &url, &mut shutdown).await;
        shared.state.send_replace(ConnectionState::Disconnected);
        match end {
            SessionEnd::Shutdown => break,
            SessionEnd::Lost {
                ready_for: Some(uptime),
                error,
            } if uptime >= shared.policy.min_stable_session => {
                warn!(url = %url, ?uptime, "Session lost: {error}; reconnecting");
                backoff = shared.policy.reconnect_initial;
            }
            SessionEnd::Lost { ready_for, error } => {
                match ready_for {
                    Some(uptime) => warn!(
                        url = %url,
                        ?uptime,
                        "Session dropped soon after becoming ready: {error}; retrying in {backoff:?}"
                    ),
                    None => warn!(
                        url = %url,
                        "Connection attempt failed: {error}; retrying in {backoff:?}"
                    ),
                }
                tokio::select! {
                    _ = sleep(backoff) => {}
                    _ = shutdown.changed() => {}
                }
                backoff = shared.policy.next_backoff(backoff);
            }
        }
    }

    shared.sessions.send_replace(None);
    shared.state.send_replace(ConnectionState::Disconnected);
    info!(url = %url, "Connection manager stopped");
}

/// One connection attempt, from opening the socket to teardown.
async fn run_session(
    shared: &Shared,
    url: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    shared.state.send_replace(ConnectionState::Connecting);
    debug!(url, "Connecting");

    let connect_timeout = shared.policy.connect_timeout;
    let connected = tokio::select! {
        result = timeout(connect_timeout, connect_async(url)) => result,
        _ = shutdown.changed() => return SessionEnd::Shutdown,
    };
    let ws = match connected {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(source)) => {
            return lost(TransportError::Connect {
                url: url.to_string(),
                source,
            })
        }
        Err(_) => {
            return lost(TransportError::ConnectTimeout {
                url: url.to_string(),
                timeout: connect_timeout,
            })
        }
    };

    shared.state.send_replace(ConnectionState::Handshaking);
    let (session, outbound_rx) = Session::new(url);
    let session = Arc::new(session);
    info!(session_id = %session.id(), url, "Socket open; sending handshake");

    let (sink, source) = ws.split();
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    let reader = tokio::spawn(read_frames(source, inbound_tx, session.id()));

    let end = drive_session(shared, &session, sink, inbound_rx, outbound_rx, shutdown).await;

    reader.abort();
    teardown(shared, &session);
    end
}

async fn drive_session(
    shared: &Shared,
    session: &SessionHandle,
    mut sink: WsSink,
    mut inbound_rx: mpsc::Receiver<Inbound>,
    mut outbound_rx: mpsc::Receiver<OutboundFrame>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let keepalive = match handshake(shared, session, &mut sink, &mut inbound_rx, shutdown).await {
        Ok(keepalive) => keepalive,
        Err(end) => return end,
    };

    shared.sessions.send_replace(Some(Arc::clone(session)));
    shared.state.send_replace(ConnectionState::Ready);
    let ready_at = Instant::now();
    info!(session_id = %session.id(), ?keepalive, "Session ready");

    match serve(
        shared,
        session,
        &mut sink,
        &mut inbound_rx,
        &mut outbound_rx,
        shutdown,
        keepalive,
    )
    .await
    {
        Ok(()) => SessionEnd::Shutdown,
        Err(error) => SessionEnd::Lost {
            ready_for: Some(ready_at.elapsed()),
            error,
        },
    }
}

/// Sends `userOnline` and waits for the first decoded frame.  Returns the
/// keepalive interval for the session.
async fn handshake(
    shared: &Shared,
    session: &Session,
    sink: &mut WsSink,
    inbound_rx: &mut mpsc::Receiver<Inbound>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Duration, SessionEnd> {
    let frame = Frame::UserOnline(user_online(&shared.apikey, session.next_sequence()));
    let text = encode_frame(&frame).map_err(|e: ProtocolError| lost(e.into()))?;
    sink.send(WsMessage::Text(text))
        .await
        .map_err(|e| lost(TransportError::WebSocket(e)))?;

    let deadline = Instant::now() + shared.policy.handshake_timeout;
    loop {
        let inbound = tokio::select! {
            result = timeout_at(deadline, inbound_rx.recv()) => result,
            _ = shutdown.changed() => {
                close(sink).await;
                return Err(SessionEnd::Shutdown);
            }
        };
        match inbound {
            Err(_) => {
                return Err(lost(TransportError::HandshakeTimeout(
                    shared.policy.handshake_timeout,
                )))
            }
            Ok(Some(Inbound::Activity)) => session.touch(),
            Ok(Some(Inbound::Frame(frame))) => {
                session.touch();
                let advertised = match &frame {
                    Frame::Hello(hello) => hello.keepalive_interval(),
                    _ => None,
                };
                shared.reconciler.handle_frame(session.registry(), frame);
                return Ok(shared.device.keepalive_interval(&shared.policy, advertised));
            }
            Ok(Some(Inbound::Failed(e))) => return Err(lost(TransportError::WebSocket(e))),
            Ok(Some(Inbound::Closed) | None) => return Err(lost(TransportError::Closed)),
        }
    }
}

/// The ready-state loop.  `Ok(())` means shutdown was requested.
async fn serve(
    shared: &Shared,
    session: &Session,
    sink: &mut WsSink,
    inbound_rx: &mut mpsc::Receiver<Inbound>,
    outbound_rx: &mut mpsc::Receiver<OutboundFrame>,
    shutdown: &mut watch::Receiver<bool>,
    keepalive: Duration,
) -> Result<(), TransportError> {
    let liveness = shared.policy.liveness_timeout(keepalive);
    let mut ticker = interval_at(Instant::now() + keepalive, keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let deadline = session.last_activity() + liveness;
        tokio::select! {
            inbound = inbound_rx.recv() => match inbound {
                Some(Inbound::Frame(frame)) => {
                    session.touch();
                    trace!(session_id = %session.id(), kind = frame.kind(), "Frame received");
                    shared.reconciler.handle_frame(session.registry(), frame);
                }
                Some(Inbound::Activity) => session.touch(),
                Some(Inbound::Failed(e)) => return Err(TransportError::WebSocket(e)),
                Some(Inbound::Closed) | None => return Err(TransportError::Closed),
            },
            Some(outbound) = outbound_rx.recv() => {
                let OutboundFrame { text, on_written, ack } = outbound;
                match sink.send(WsMessage::Text(text)).await {
                    Ok(()) => {
                        // Applied before the next inbound frame is reconciled.
                        on_written.apply(session.registry());
                        let _ = ack.send(Ok(()));
                    }
                    Err(e) => {
                        warn!(session_id = %session.id(), "Write failed: {e}");
                        let _ = ack.send(Err(TransportError::WebSocket(e)));
                        return Err(TransportError::Closed);
                    }
                }
            }
            _ = ticker.tick() => {
                trace!(session_id = %session.id(), "Keepalive ping");
                sink.send(WsMessage::Ping(Vec::new())).await?;
            }
            _ = sleep_until(deadline) => {
                if session.idle_for() >= liveness {
                    return Err(TransportError::KeepaliveTimeout(liveness));
                }
            }
            _ = shutdown.changed() => {
                close(sink).await;
                return Ok(());
            }
        }
    }
}

/// Reads the socket until it closes, forwarding decoded frames in order.
async fn read_frames(mut source: WsSource, inbound: mpsc::Sender<Inbound>, session_id: Uuid) {
    while let Some(message) = source.next().await {
        let item = match message {
            Ok(WsMessage::Text(text)) => decoded(decode_frame(&text), session_id),
            Ok(WsMessage::Binary(bytes)) => decoded(decode_frame_bytes(&bytes), session_id),
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => Inbound::Activity,
            Ok(WsMessage::Close(reason)) => {
                debug!(%session_id, ?reason, "Close frame received");
                Inbound::Closed
            }
            Err(e) => Inbound::Failed(e),
        };
        let terminal = matches!(item, Inbound::Closed | Inbound::Failed(_));
        if inbound.send(item).await.is_err() || terminal {
            break;
        }
    }
    debug!(%session_id, "Reader finished");
}

fn decoded(result: Result<Frame, ProtocolError>, session_id: Uuid) -> Inbound {
    match result {
        Ok(frame) => Inbound::Frame(frame),
        Err(e) => {
            warn!(%session_id, "Dropping malformed frame: {e}");
            Inbound::Activity
        }
    }
}

async fn close(sink: &mut WsSink) {
    if let Err(e) = sink.send(WsMessage::Close(None)).await {
        debug!("Close frame not sent: {e}");
    }
}

/// Unpublishes the session and marks its devices unavailable.
fn teardown(shared: &Shared, session: &Session) {
    shared.sessions.send_if_modified(|current| match current {
        Some(published) if published.id() == session.id() => {
            *current = None;
            true
        }
        _ => false,
    });

    let registry = session.registry();
    for device in registry.list() {
        if registry.set_online(&device.id, false) == Some(true) {
            let _ = shared.events.send(DeviceEvent::AvailabilityChanged {
                device_id: device.id,
                online: false,
            });
        }
    }
    debug!(session_id = %session.id(), "Session torn down");
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CommandError;
    use sonoff_core::SwitchState;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    fn fast_policy() -> ConnectionPolicy {
        ConnectionPolicy {
            connect_timeout: Duration::from_millis(500),
            handshake_timeout: Duration::from_millis(200),
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout_factor: 2,
            reconnect_initial: Duration::from_millis(20),
            reconnect_max: Duration::from_millis(100),
            min_stable_session: Duration::from_secs(10),
        }
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_new_manager_is_disconnected_and_rejects_commands() {
        // Arrange
        let manager = ConnectionManager::new(DeviceConfig::new("127.0.0.1"), fast_policy(), "nonce");

        // Act
        let result = manager
            .dispatcher()
            .request_state("100060af40", SwitchState::On, None)
            .await;

        // Assert
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
        assert!(matches!(result, Err(CommandError::NotConnected)));
    }

    #[tokio::test]
    async fn test_refused_connection_retries_until_shutdown() {
        // Arrange
        let port = unused_port().await;
        let manager = ConnectionManager::new(
            DeviceConfig::new("127.0.0.1").with_port(port),
            fast_policy(),
            "nonce",
        );

        // Act
        let handle = manager.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_finished(), "refused connections must be retried");
        manager.shutdown();

        // Assert
        timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop must stop after shutdown")
            .unwrap();
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_upgrade_is_retried_with_backoff() {
        // Arrange: a host that accepts TCP and hangs up before the upgrade
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });
        let manager = ConnectionManager::new(
            DeviceConfig::new("127.0.0.1").with_port(port),
            fast_policy(),
            "nonce",
        );

        // Act
        let handle = manager.start();
        tokio::time::sleep(Duration::from_millis(500)).await;
        manager.shutdown();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        // Assert: 20, 40, 80, 100, 100 ms delays fit at least three attempts
        assert!(accepted.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_silent_device_hits_handshake_timeout_and_is_retried() {
        // Arrange: a device that upgrades the socket but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    sockets.push(ws);
                }
            }
        });
        let manager = ConnectionManager::new(
            DeviceConfig::new("127.0.0.1").with_port(port),
            fast_policy(),
            "nonce",
        );

        // Act
        let handle = manager.start();
        tokio::time::sleep(Duration::from_millis(900)).await;
        manager.shutdown();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        // Assert
        assert!(
            accepted.load(Ordering::SeqCst) >= 2,
            "handshake timeout must trigger a reconnect"
        );
        assert!(manager.dispatcher().session().is_none());
    }

    #[tokio::test]
    async fn test_session_dropped_right_after_hello_backs_off() {
        // Arrange: a device that answers the handshake and hangs up at once
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                let _ = ws.next().await;
                let hello = r#"{"error":0,"deviceid":"100060af40","apikey":"k","sequence":"1"}"#;
                let _ = ws.send(WsMessage::Text(hello.to_string())).await;
                drop(ws);
            }
        });
        let policy = ConnectionPolicy {
            reconnect_initial: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(1),
            ..fast_policy()
        };
        let manager =
            ConnectionManager::new(DeviceConfig::new("127.0.0.1").with_port(port), policy, "nonce");

        // Act
        let handle = manager.start();
        tokio::time::sleep(Duration::from_millis(500)).await;
        manager.shutdown();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        // Assert: 100 and 200 ms delays leave room for about three attempts
        let attempts = accepted.load(Ordering::SeqCst);
        assert!(
            (2..=4).contains(&attempts),
            "short sessions must back off, saw {attempts} attempts"
        );
    }

    #[tokio::test]
    async fn test_second_start_is_ignored() {
        let port = unused_port().await;
        let manager = ConnectionManager::new(
            DeviceConfig::new("127.0.0.1").with_port(port),
            fast_policy(),
            "nonce",
        );

        let first = manager.start();
        let second = manager.start();

        timeout(Duration::from_secs(1), second).await.unwrap().unwrap();
        assert!(!first.is_finished());
        manager.shutdown();
        timeout(Duration::from_secs(2), first).await.unwrap().unwrap();
    }
}
