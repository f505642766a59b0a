//! # Session Coordinator
//!
//! Decides what happens for every event on one channel. It owns the channel's
//! [`Session`] and turns inbound frames and upstream completions into
//! [`Directive`]s; the WebSocket actor carries them out. Keeping the decisions
//! here, free of actor and network plumbing, makes every ordering rule testable
//! with plain function calls.
//!
//! ## Ordering per accepted utterance:
//! 1. `interrupt` (only when an older call was still in flight)
//! 2. `processing`
//! 3. dispatch of the upstream call
//! 4. later, exactly one of `ai_response` / `error` for the current call

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::messages::{ClientMessage, ServerMessage, EMPTY_AUDIO_MESSAGE, MALFORMED_INPUT_MESSAGE};
use super::session::{Session, SessionSummary, Settlement};
use crate::error::UpstreamError;
use crate::upstream::{AiAdapter, AiReply, AudioRequest};

/// An upstream call tagged with the sequence it was admitted under.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamCall {
    pub sequence: u64,
    pub request: AudioRequest,
}

/// Something the channel must do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Send an envelope to this channel's client
    Send(ServerMessage),
    /// Start the upstream call, replacing any call still in flight
    Dispatch(UpstreamCall),
}

pub struct SessionCoordinator {
    session: Session,
}

impl SessionCoordinator {
    /// Channel opened: fresh session, not processing.
    pub fn on_open() -> Self {
        let session = Session::open();
        info!(session_id = %session.id, "Session opened");
        Self { session }
    }

    pub fn session_id(&self) -> Uuid {
        self.session.id
    }

    pub fn is_processing(&self) -> bool {
        self.session.is_processing()
    }

    pub fn on_text(&mut self, text: &str) -> Vec<Directive> {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id = %self.session.id, "Malformed envelope: {}", e);
                return vec![Directive::Send(ServerMessage::error(MALFORMED_INPUT_MESSAGE))];
            }
        };

        match message {
            ClientMessage::Audio { audio, language } => self.accept_audio(audio, language),
            ClientMessage::Ping => {
                debug!(session_id = %self.session.id, "Keepalive ping");
                Vec::new()
            }
            ClientMessage::Unknown => {
                debug!(session_id = %self.session.id, "Ignoring envelope with unknown type");
                Vec::new()
            }
        }
    }

    /// Binary frames carry no envelope.
    pub fn on_binary(&mut self, len: usize) -> Vec<Directive> {
        warn!(session_id = %self.session.id, bytes = len, "Unexpected binary frame");
        vec![Directive::Send(ServerMessage::error(MALFORMED_INPUT_MESSAGE))]
    }

    /// Start of a fragmented message. Envelopes always fit one frame, so the
    /// whole message is rejected once; its later fragments are dropped.
    pub fn on_fragmented(&mut self) -> Vec<Directive> {
        warn!(session_id = %self.session.id, "Unexpected fragmented message");
        vec![Directive::Send(ServerMessage::error(MALFORMED_INPUT_MESSAGE))]
    }

    fn accept_audio(&mut self, audio: String, language: Option<String>) -> Vec<Directive> {
        if audio.trim().is_empty() {
            warn!(session_id = %self.session.id, "Audio envelope without payload");
            return vec![Directive::Send(ServerMessage::error(EMPTY_AUDIO_MESSAGE))];
        }

        let admission = self.session.admit();
        let mut directives = Vec::with_capacity(3);

        if admission.superseded {
            info!(
                session_id = %self.session.id,
                sequence = admission.sequence,
                "New utterance supersedes in-flight call"
            );
            directives.push(Directive::Send(ServerMessage::Interrupt));
        }

        debug!(
            session_id = %self.session.id,
            sequence = admission.sequence,
            audio_len = audio.len(),
            language = language.as_deref().unwrap_or("-"),
            "Utterance accepted"
        );

        directives.push(Directive::Send(ServerMessage::Processing));
        directives.push(Directive::Dispatch(UpstreamCall {
            sequence: admission.sequence,
            request: AudioRequest { audio, language },
        }));
        directives
    }

    /// Upstream call `sequence` finished. Returns the envelope to deliver, if any.
    pub fn on_call_finished(
        &mut self,
        sequence: u64,
        outcome: Result<AiReply, UpstreamError>,
    ) -> Option<ServerMessage> {
        match self.session.settle(sequence) {
            Settlement::Closed => {
                debug!(session_id = %self.session.id, sequence, "Completion after close dropped");
                None
            }
            Settlement::Stale => {
                debug!(session_id = %self.session.id, sequence, "Superseded completion dropped");
                None
            }
            Settlement::Current => Some(match outcome {
                Ok(reply) => {
                    info!(
                        session_id = %self.session.id,
                        sequence,
                        language = %reply.language,
                        "Answer ready"
                    );
                    ServerMessage::AiResponse {
                        text: reply.text,
                        audio: reply.audio,
                        language: reply.language,
                    }
                }
                Err(e) => {
                    warn!(session_id = %self.session.id, sequence, "Upstream call failed: {}", e);
                    ServerMessage::error(e.to_string())
                }
            }),
        }
    }

    /// Channel closed. Safe to call more than once.
    pub fn on_close(&mut self) -> SessionSummary {
        if self.session.is_open() {
            self.session.close();
            let summary = self.session.summary();
            info!(
                session_id = %self.session.id,
                utterances = summary.accepted_utterances,
                interrupts = summary.interrupts,
                duration_secs = summary.duration_seconds,
                "Session closed"
            );
            summary
        } else {
            self.session.summary()
        }
    }
}

/// Run one upstream call to completion. A panic inside the adapter becomes an
/// [`UpstreamError::Internal`] so the session always hears back.
pub async fn execute(
    adapter: Arc<dyn AiAdapter>,
    call: UpstreamCall,
) -> (u64, Result<AiReply, UpstreamError>) {
    let UpstreamCall { sequence, request } = call;

    let outcome = match AssertUnwindSafe(adapter.answer(request)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => Err(UpstreamError::Internal(panic_message(payload.as_ref()))),
    };

    (sequence, outcome)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "adapter panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::testing::{PanickingAdapter, StubAdapter};
    use std::sync::atomic::Ordering;

    fn audio_frame(language: &str) -> String {
        ClientMessage::audio("UklGRgAAAAA=", language).to_json()
    }

    fn sent(directives: &[Directive]) -> Vec<ServerMessage> {
        directives
            .iter()
            .filter_map(|d| match d {
                Directive::Send(msg) => Some(msg.clone()),
                Directive::Dispatch(_) => None,
            })
            .collect()
    }

    fn dispatched(directives: &[Directive]) -> Vec<UpstreamCall> {
        directives
            .iter()
            .filter_map(|d| match d {
                Directive::Dispatch(call) => Some(call.clone()),
                Directive::Send(_) => None,
            })
            .collect()
    }

    fn reply(text: &str) -> Result<AiReply, UpstreamError> {
        Ok(AiReply {
            text: text.to_string(),
            audio: None,
            language: "en".to_string(),
        })
    }

    #[test]
    fn test_processing_flag_lifecycle() {
        let mut coordinator = SessionCoordinator::on_open();
        assert!(!coordinator.is_processing());

        let directives = coordinator.on_text(&audio_frame("en"));
        assert!(coordinator.is_processing());
        assert_eq!(sent(&directives), vec![ServerMessage::Processing]);

        let call = dispatched(&directives).remove(0);
        assert_eq!(call.request.language.as_deref(), Some("en"));

        let delivered = coordinator.on_call_finished(call.sequence, reply("Hi there"));
        assert!(!coordinator.is_processing());
        assert_eq!(
            delivered,
            Some(ServerMessage::AiResponse {
                text: "Hi there".to_string(),
                audio: None,
                language: "en".to_string(),
            })
        );
    }

    #[test]
    fn test_overlapping_audio_sends_single_interrupt_first() {
        let mut coordinator = SessionCoordinator::on_open();
        let mut bystander = SessionCoordinator::on_open();
        let _ = bystander.on_text(&audio_frame("en"));

        let first = coordinator.on_text(&audio_frame("en"));
        let second = coordinator.on_text(&audio_frame("hi"));

        assert_eq!(
            sent(&second),
            vec![ServerMessage::Interrupt, ServerMessage::Processing]
        );
        assert!(matches!(second.last(), Some(Directive::Dispatch(_))));

        // The older call's answer never reaches the client.
        let old = dispatched(&first).remove(0);
        let new = dispatched(&second).remove(0);
        assert!(new.sequence > old.sequence);
        assert_eq!(coordinator.on_call_finished(old.sequence, reply("stale")), None);
        assert!(coordinator.is_processing());

        let delivered = coordinator.on_call_finished(new.sequence, reply("fresh"));
        assert!(matches!(delivered, Some(ServerMessage::AiResponse { ref text, .. }) if text == "fresh"));
        assert!(!coordinator.is_processing());

        // Interrupts stay on their own channel.
        assert!(bystander.is_processing());
    }

    #[test]
    fn test_malformed_payload_yields_one_fixed_error() {
        let mut coordinator = SessionCoordinator::on_open();
        let expected = vec![Directive::Send(ServerMessage::error(MALFORMED_INPUT_MESSAGE))];

        for frame in ["{not json", "[1,2,3]", "\"audio\"", r#"{"type":"audio"}"#, r#"{"audio":"AAAA"}"#] {
            assert_eq!(coordinator.on_text(frame), expected, "frame: {}", frame);
            assert!(!coordinator.is_processing());
        }

        let _ = coordinator.on_text(&audio_frame("en"));
        assert_eq!(coordinator.on_text("garbage"), expected);
        assert!(coordinator.is_processing(), "malformed input leaves processing alone");

        assert_eq!(coordinator.on_binary(16), expected);
        assert_eq!(coordinator.on_fragmented(), expected);
        assert!(coordinator.is_processing());
    }

    #[test]
    fn test_empty_audio_is_rejected() {
        let mut coordinator = SessionCoordinator::on_open();
        let directives = coordinator.on_text(r#"{"type":"audio","audio":"","language":"en"}"#);
        assert_eq!(
            directives,
            vec![Directive::Send(ServerMessage::error(EMPTY_AUDIO_MESSAGE))]
        );
        assert!(!coordinator.is_processing());
    }

    #[test]
    fn test_ping_and_unknown_types_are_silent() {
        let mut coordinator = SessionCoordinator::on_open();
        assert!(coordinator.on_text(r#"{"type":"ping"}"#).is_empty());
        assert!(coordinator.on_text(r#"{"type":"subscribe","topic":"x"}"#).is_empty());
        assert!(!coordinator.is_processing());
    }

    #[test]
    fn test_upstream_failure_becomes_error_envelope() {
        let mut coordinator = SessionCoordinator::on_open();
        let call = dispatched(&coordinator.on_text(&audio_frame("en"))).remove(0);

        let delivered = coordinator.on_call_finished(call.sequence, Err(UpstreamError::Status(500)));
        match delivered {
            Some(ServerMessage::Error { message }) => {
                assert!(!message.is_empty());
                assert_eq!(message, "Gemini API error: 500");
            }
            other => panic!("expected error envelope, got {:?}", other),
        }
        assert!(!coordinator.is_processing());
    }

    #[test]
    fn test_close_during_call_drops_completion() {
        let mut coordinator = SessionCoordinator::on_open();
        let call = dispatched(&coordinator.on_text(&audio_frame("en"))).remove(0);

        let summary = coordinator.on_close();
        assert_eq!(summary.accepted_utterances, 1);
        assert!(!coordinator.is_processing());

        assert_eq!(coordinator.on_call_finished(call.sequence, reply("late")), None);
        assert_eq!(
            coordinator.on_call_finished(call.sequence, Err(UpstreamError::Timeout)),
            None
        );

        // Second close is harmless.
        let _ = coordinator.on_close();
    }

    #[tokio::test]
    async fn test_execute_reports_sequence_and_outcome() {
        let adapter = StubAdapter::replying("Revolt RV400 has a 150 km range", "en");
        let calls = adapter.calls.clone();
        let adapter: Arc<dyn AiAdapter> = Arc::new(adapter);

        let call = UpstreamCall {
            sequence: 7,
            request: AudioRequest {
                audio: "AAAA".to_string(),
                language: Some("en".to_string()),
            },
        };
        let (sequence, outcome) = execute(adapter, call).await;
        assert_eq!(sequence, 7);
        assert_eq!(outcome.unwrap().text, "Revolt RV400 has a 150 km range");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_adapter_panic_still_clears_processing() {
        let mut coordinator = SessionCoordinator::on_open();
        let call = dispatched(&coordinator.on_text(&audio_frame("en"))).remove(0);

        let (sequence, outcome) = execute(Arc::new(PanickingAdapter), call).await;
        assert!(matches!(outcome, Err(UpstreamError::Internal(ref msg)) if msg.contains("blew up")));

        let delivered = coordinator.on_call_finished(sequence, outcome);
        assert!(matches!(delivered, Some(ServerMessage::Error { .. })));
        assert!(!coordinator.is_processing());
    }
}
