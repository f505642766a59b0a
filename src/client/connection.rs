//! WebSocket connection to the relay, with keepalive and reconnect.
//!
//! ## State machine:
//! `Connecting → Open → (ClosedNormal | ClosedAbnormal)`. A normal close
//! (code 1000) ends [`ClientConnection::run`]. Anything else, including a
//! stream that just stops, schedules a reconnect with exponential backoff.
//! After `max_retries` consecutive failures the connection gives up in the
//! `Failed` state. A connection only resets the failure count once the
//! server has sent at least one frame on it, so a relay that accepts and
//! immediately drops still runs into the limit.
//!
//! Envelopes queued on the outbound channel while disconnected are sent once
//! the next connection opens. An envelope whose send failed is kept and sent
//! first on the next connection.

use crate::relay::ClientMessage;
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

const RECONNECT_BASE_MS: u64 = 3_000;
const RECONNECT_MAX_MS: u64 = 30_000;
const RECONNECT_MAX_RETRIES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Connecting,
    Open,
    ClosedNormal,
    ClosedAbnormal,
    /// Gave up after too many failed reconnects, or the relay refused us
    Failed,
}

impl ConnectionState {
    pub fn describe(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Open => "Connected to server",
            ConnectionState::ClosedNormal => "Connection closed normally",
            ConnectionState::ClosedAbnormal => "Connection lost - reconnecting...",
            ConnectionState::Failed => "Connection failed",
        }
    }
}

/// Close code 1000 is a normal close; any other code, or none, is abnormal.
pub fn classify_close(frame: Option<&CloseFrame<'_>>) -> ConnectionState {
    match frame {
        Some(frame) if frame.code == CloseCode::Normal => ConnectionState::ClosedNormal,
        _ => ConnectionState::ClosedAbnormal,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(RECONNECT_BASE_MS),
            max: Duration::from_millis(RECONNECT_MAX_MS),
            max_retries: RECONNECT_MAX_RETRIES,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max: Duration, max_retries: u32) -> Self {
        Self { base, max, max_retries }
    }

    /// Delay before retry number `retry` (1-based): base, 2×base, 4×base, …
    /// capped at `max`.
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(10);
        let factor = 1u32 << exp;
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Every allowed reconnect failed
    RetriesExhausted { attempts: u32, last_error: String },
    /// The relay answered in a way retrying cannot fix (bad URL, auth)
    Rejected(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::RetriesExhausted { attempts, last_error } => write!(
                f,
                "Connection failed after {} attempts: {}",
                attempts, last_error
            ),
            ClientError::Rejected(msg) => write!(f, "Connection rejected: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {}

fn is_permanent_connect_error(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::Url(_) | tungstenite::Error::HttpFormat(_) => true,
        tungstenite::Error::Http(resp) => {
            let code = resp.status().as_u16();
            code == 401 || code == 403 || code == 404
        }
        _ => false,
    }
}

/// How one open connection ended.
enum SessionEnd {
    /// Server closed with 1000
    Normal,
    /// We closed because the local side went away
    Local,
    Abnormal {
        reason: String,
        /// The server sent at least one frame before the connection ended
        established: bool,
    },
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct ClientConnection {
    url: String,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    keepalive: Duration,
    state: watch::Sender<ConnectionState>,
}

impl ClientConnection {
    pub fn new(url: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            url: url.into(),
            policy: ReconnectPolicy::default(),
            connect_timeout: CONNECT_TIMEOUT,
            keepalive: KEEPALIVE_INTERVAL,
            state,
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration, keepalive: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.keepalive = keepalive;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(state = ?state, "Connection state");
        self.state.send_replace(state);
    }

    /// Drive the connection until a normal close, the outbound side is
    /// dropped, or reconnecting gives up. Inbound text frames are forwarded
    /// untouched; parsing is the controller's job.
    pub async fn run(
        &self,
        mut outbound: mpsc::Receiver<ClientMessage>,
        inbound: mpsc::Sender<String>,
    ) -> Result<(), ClientError> {
        let mut failures = 0u32;
        let mut pending: Option<ClientMessage> = None;

        loop {
            self.set_state(ConnectionState::Connecting);

            let last_error =
                match tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
                    .await
                {
                    Ok(Ok((socket, _))) => {
                        info!(url = %self.url, "WebSocket connected");
                        self.set_state(ConnectionState::Open);

                        match self.pump(socket, &mut outbound, &inbound, &mut pending).await {
                            SessionEnd::Normal | SessionEnd::Local => {
                                self.set_state(ConnectionState::ClosedNormal);
                                return Ok(());
                            }
                            SessionEnd::Abnormal { reason, established } => {
                                if established {
                                    failures = 0;
                                }
                                reason
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        if is_permanent_connect_error(&e) {
                            error!(url = %self.url, "Connection rejected: {}", e);
                            self.set_state(ConnectionState::Failed);
                            return Err(ClientError::Rejected(e.to_string()));
                        }
                        e.to_string()
                    }
                    Err(_) => "connection timeout".to_string(),
                };

            self.set_state(ConnectionState::ClosedAbnormal);
            failures += 1;

            if failures > self.policy.max_retries {
                error!(attempts = failures, "Giving up on relay connection: {}", last_error);
                self.set_state(ConnectionState::Failed);
                return Err(ClientError::RetriesExhausted {
                    attempts: failures,
                    last_error,
                });
            }

            let delay = self.policy.delay(failures);
            warn!(
                retry = failures,
                delay_ms = delay.as_millis() as u64,
                "Connection lost ({}), reconnecting",
                last_error
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn pump(
        &self,
        socket: Socket,
        outbound: &mut mpsc::Receiver<ClientMessage>,
        inbound: &mpsc::Sender<String>,
        pending: &mut Option<ClientMessage>,
    ) -> SessionEnd {
        let (mut sink, mut source) = socket.split();
        let mut established = false;

        if let Err(reason) = send_pending(&mut sink, pending).await {
            return SessionEnd::Abnormal { reason, established };
        }

        let mut keepalive = tokio::time::interval(self.keepalive);
        // The first tick completes immediately
        keepalive.tick().await;

        loop {
            tokio::select! {
                frame = source.next() => match frame {
                    Some(Ok(message)) => {
                        if !matches!(message, Message::Close(_)) {
                            established = true;
                        }
                        if let Some(end) = forward(message, &mut sink, inbound, established).await {
                            return end;
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Abnormal { reason: e.to_string(), established },
                    None => {
                        return SessionEnd::Abnormal {
                            reason: "connection dropped".to_string(),
                            established,
                        }
                    }
                },
                message = outbound.recv() => match message {
                    Some(message) => {
                        *pending = Some(message);
                        if let Err(reason) = send_pending(&mut sink, pending).await {
                            return SessionEnd::Abnormal { reason, established };
                        }
                    }
                    None => {
                        close_normally(&mut sink).await;
                        return SessionEnd::Local;
                    }
                },
                _ = keepalive.tick() => {
                    if let Err(e) = sink.send(Message::Text(ClientMessage::Ping.to_json().into())).await {
                        return SessionEnd::Abnormal { reason: e.to_string(), established };
                    }
                }
            }
        }
    }

}

/// Handle one inbound frame; `Some` ends the connection.
async fn forward<S>(
    message: Message,
    sink: &mut S,
    inbound: &mpsc::Sender<String>,
    established: bool,
) -> Option<SessionEnd>
where
    S: futures_util::Sink<Message> + Unpin,
{
    match message {
        Message::Text(text) => {
            if inbound.send(text.to_string()).await.is_err() {
                close_normally(sink).await;
                return Some(SessionEnd::Local);
            }
            None
        }
        Message::Close(frame) => {
            info!(frame = ?frame, "WebSocket closed by server");
            Some(match classify_close(frame.as_ref()) {
                ConnectionState::ClosedNormal => SessionEnd::Normal,
                _ => SessionEnd::Abnormal {
                    reason: format!("closed with {:?}", frame),
                    established,
                },
            })
        }
        _ => None,
    }
}

/// Send the envelope held in `pending`. It stays there if the send fails.
async fn send_pending<S>(sink: &mut S, pending: &mut Option<ClientMessage>) -> Result<(), String>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let Some(message) = pending.take() else {
        return Ok(());
    };

    match sink.send(Message::Text(message.to_json().into())).await {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!("Envelope not sent, keeping it for the next connection: {}", e);
            *pending = Some(message);
            Err(e.to_string())
        }
    }
}

async fn close_normally<S>(sink: &mut S)
where
    S: futures_util::Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "client closed".into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}
