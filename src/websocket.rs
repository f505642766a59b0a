//! # WebSocket Voice Relay Handler
//!
//! One actor per connected client. Clients connect to `/ws` (or `/`) and send
//! JSON envelopes; each accepted `audio` envelope is answered by the upstream
//! AI adapter and relayed back on the same connection.
//!
//! ## Connection Lifecycle:
//! 1. **Upgrade**: refused with 503 when `max_concurrent_sessions` are open
//! 2. **Started**: a [`SessionCoordinator`] is created, heartbeat timer starts
//! 3. **Frames**: handed to the coordinator, its directives are carried out
//! 4. **Upstream completion**: delivered back to the actor as [`CallFinished`]
//! 5. **Stopped**: in-flight call aborted, session closed, slot released
//!
//! ## Why an actor:
//! Frames and completions are handled one at a time on the actor's context, so
//! the coordinator's check-and-set of `processing` never races with itself.
//! The upstream call runs on a tokio task and reports back with `do_send`,
//! which is a no-op once the actor has stopped.

use crate::error::{AppError, UpstreamError};
use crate::relay::messages::{ServerMessage, MALFORMED_INPUT_MESSAGE};
use crate::relay::{execute, Directive, SessionCoordinator, UpstreamCall};
use crate::state::{AppState, RelayEvent};
use crate::upstream::AiReply;

use actix::prelude::*;
use actix_http::ws::Item;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::time::Instant;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// Completion of an upstream call, sent from the call's task to the actor.
#[derive(Message)]
#[rtype(result = "()")]
pub struct CallFinished {
    pub sequence: u64,
    pub outcome: Result<AiReply, UpstreamError>,
}

pub struct RelayWebSocket {
    coordinator: SessionCoordinator,
    state: web::Data<AppState>,
    /// Task running the current upstream call, with its sequence
    in_flight: Option<(u64, AbortHandle)>,
    /// Last time anything arrived from the client
    last_heartbeat: Instant,
}

impl RelayWebSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        Self {
            coordinator: SessionCoordinator::on_open(),
            state,
            in_flight: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn apply(&mut self, directives: Vec<Directive>, ctx: &mut ws::WebsocketContext<Self>) {
        for directive in directives {
            match directive {
                Directive::Send(message) => {
                    match &message {
                        ServerMessage::Interrupt => {
                            self.state.record_relay_event(RelayEvent::Interrupted)
                        }
                        ServerMessage::Error { message } if message == MALFORMED_INPUT_MESSAGE => {
                            self.state.record_relay_event(RelayEvent::Malformed)
                        }
                        _ => {}
                    }
                    self.send(message, ctx);
                }
                Directive::Dispatch(call) => {
                    self.state.record_relay_event(RelayEvent::AudioAccepted);
                    self.dispatch(call, ctx);
                }
            }
        }
    }

    fn send(&self, message: ServerMessage, ctx: &mut ws::WebsocketContext<Self>) {
        debug!(
            session_id = %self.coordinator.session_id(),
            kind = message.kind(),
            "Sending envelope"
        );
        ctx.text(message.to_json());
    }

    /// Start `call`, aborting whatever call was still running.
    fn dispatch(&mut self, call: UpstreamCall, ctx: &mut ws::WebsocketContext<Self>) {
        self.abort_in_flight();

        let sequence = call.sequence;
        let adapter = self.state.adapter.clone();
        let addr = ctx.address();

        let task = tokio::spawn(async move {
            let (sequence, outcome) = execute(adapter, call).await;
            addr.do_send(CallFinished { sequence, outcome });
        });

        self.in_flight = Some((sequence, task.abort_handle()));
    }

    fn abort_in_flight(&mut self) {
        if let Some((sequence, handle)) = self.in_flight.take() {
            if !handle.is_finished() {
                debug!(
                    session_id = %self.coordinator.session_id(),
                    sequence,
                    "Aborting superseded upstream call"
                );
                handle.abort();
            }
        }
    }
}

impl Actor for RelayWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let settings = self.state.get_config().session.clone();
        info!(session_id = %self.coordinator.session_id(), "WebSocket connection started");

        let client_timeout = settings.client_timeout();
        ctx.run_interval(settings.heartbeat_interval(), move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > client_timeout {
                warn!(
                    session_id = %act.coordinator.session_id(),
                    "WebSocket heartbeat timeout, closing connection"
                );
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.abort_in_flight();
        self.coordinator.on_close();
        self.state.close_session();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelayWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                let directives = self.coordinator.on_text(&text);
                self.apply(directives, ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                let directives = self.coordinator.on_binary(data.len());
                self.apply(directives, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(
                    session_id = %self.coordinator.session_id(),
                    "WebSocket closed: {:?}", reason
                );
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(item)) => {
                self.last_heartbeat = Instant::now();
                match item {
                    Item::FirstText(_) | Item::FirstBinary(_) => {
                        let directives = self.coordinator.on_fragmented();
                        self.apply(directives, ctx);
                    }
                    Item::Continue(_) | Item::Last(_) => {}
                }
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(
                    session_id = %self.coordinator.session_id(),
                    "WebSocket protocol error: {}", err
                );
                ctx.stop();
            }
        }
    }
}

impl Handler<CallFinished> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, msg: CallFinished, ctx: &mut Self::Context) {
        if matches!(self.in_flight, Some((sequence, _)) if sequence == msg.sequence) {
            self.in_flight = None;
        }

        if let Some(message) = self.coordinator.on_call_finished(msg.sequence, msg.outcome) {
            if matches!(message, ServerMessage::Error { .. }) {
                self.state.record_relay_event(RelayEvent::UpstreamFailed);
            }
            self.send(message, ctx);
        }
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Reserves a session slot, then upgrades the request. The slot is released
/// by the actor when it stops, or right here if the handshake fails.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let peer = req.connection_info().peer_addr().map(str::to_string);

    if !app_state.try_open_session() {
        warn!(peer = ?peer, "Session limit reached, refusing connection");
        return Err(AppError::ServiceUnavailable(
            "Maximum number of concurrent sessions reached".to_string(),
        )
        .into());
    }

    info!(peer = ?peer, "New WebSocket connection request");

    let max_frame_bytes = app_state.get_config().session.max_frame_bytes;
    let actor = RelayWebSocket::new(app_state.clone());

    ws::WsResponseBuilder::new(actor, &req, stream)
        .frame_size(max_frame_bytes)
        .start()
        .map_err(|err| {
            app_state.close_session();
            warn!(peer = ?peer, "WebSocket handshake failed: {}", err);
            err
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::relay::ClientMessage;
    use crate::upstream::testing::StubAdapter;
    use crate::upstream::AiAdapter;
    use actix_web::{dev::ServerHandle, App, HttpServer};
    use futures_util::{SinkExt, StreamExt};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::{Data, OpCode};
    use tokio_tungstenite::tungstenite::protocol::frame::Frame;
    use tokio_tungstenite::tungstenite::Message;

    fn relay_config(max_sessions: usize) -> AppConfig {
        let mut config = AppConfig::default();
        config.gemini.api_key = "test-key".to_string();
        config.session.max_concurrent_sessions = max_sessions;
        config
    }

    fn spawn_relay(state: AppState) -> (String, ServerHandle) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let data = web::Data::new(state);

        let server = HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .route("/ws", web::get().to(relay_websocket))
        })
        .workers(1)
        .listen(listener)
        .unwrap()
        .run();

        let handle = server.handle();
        actix_web::rt::spawn(server);
        (format!("ws://127.0.0.1:{}/ws", port), handle)
    }

    async fn next_envelope<S>(socket: &mut S) -> ServerMessage
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("timed out waiting for envelope")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[actix_web::test]
    async fn test_audio_round_trip_over_websocket() {
        let adapter: Arc<dyn AiAdapter> = Arc::new(StubAdapter::replying("Namaste", "hi"));
        let state = AppState::new(relay_config(4), adapter);
        let (url, handle) = spawn_relay(state.clone());

        let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        socket.send(Message::Text("not json".into())).await.unwrap();
        assert_eq!(
            next_envelope(&mut socket).await,
            ServerMessage::error(MALFORMED_INPUT_MESSAGE)
        );

        let audio = ClientMessage::audio("UklGRgAAAAA=", "hi").to_json();
        socket.send(Message::Text(audio.into())).await.unwrap();
        assert_eq!(next_envelope(&mut socket).await, ServerMessage::Processing);
        assert_eq!(
            next_envelope(&mut socket).await,
            ServerMessage::AiResponse {
                text: "Namaste".to_string(),
                audio: None,
                language: "hi".to_string(),
            }
        );

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.active_sessions, 1);
        assert_eq!(metrics.audio_requests, 1);
        assert_eq!(metrics.malformed_messages, 1);

        socket.close(None).await.unwrap();
        handle.stop(true).await;
    }

    #[actix_web::test]
    async fn test_fragmented_message_is_rejected_once() {
        let adapter: Arc<dyn AiAdapter> = Arc::new(StubAdapter::replying("ok", "en"));
        let state = AppState::new(relay_config(4), adapter);
        let (url, handle) = spawn_relay(state.clone());

        let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        let first = Frame::message(br#"{"type":"au"#.to_vec(), OpCode::Data(Data::Text), false);
        let last = Frame::message(br#"dio"}"#.to_vec(), OpCode::Data(Data::Continue), true);
        socket.send(Message::Frame(first)).await.unwrap();
        socket.send(Message::Frame(last)).await.unwrap();
        assert_eq!(
            next_envelope(&mut socket).await,
            ServerMessage::error(MALFORMED_INPUT_MESSAGE)
        );

        // The channel stays usable and the rejection was sent only once
        let audio = ClientMessage::audio("UklGRgAAAAA=", "en").to_json();
        socket.send(Message::Text(audio.into())).await.unwrap();
        assert_eq!(next_envelope(&mut socket).await, ServerMessage::Processing);
        assert_eq!(state.get_metrics_snapshot().malformed_messages, 1);

        socket.close(None).await.unwrap();
        handle.stop(true).await;
    }

    #[actix_web::test]
    async fn test_upgrade_refused_at_session_limit() {
        let adapter: Arc<dyn AiAdapter> = Arc::new(StubAdapter::replying("ok", "en"));
        let state = AppState::new(relay_config(1), adapter);
        let (url, handle) = spawn_relay(state.clone());

        let (_first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        match tokio_tungstenite::connect_async(url.as_str()).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), 503);
            }
            other => panic!("expected 503 refusal, got {:?}", other.map(|_| ())),
        }
        assert_eq!(state.get_metrics_snapshot().rejected_sessions, 1);

        handle.stop(true).await;
    }
}
