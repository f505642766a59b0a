//! # Client Session Controller
//!
//! Client-side state machine: recording, what to show, what to say. It is a
//! plain `&mut self` object; the binary feeds it inbound text from the
//! connection and forwards the envelopes it produces.
//!
//! ## Recording lifecycle:
//! 1. **Idle**: nothing captured
//! 2. **Recording**: a [`CaptureStream`] is held; dropping it releases the microphone
//! 3. **Stop**: chunks are joined, base64-encoded and turned into one `audio` envelope
//!
//! ## Inbound envelopes:
//! - `processing` → busy
//! - `ai_response` → transcript entry + speech (or a text fallback)
//! - `interrupt` → speech cancelled
//! - `error` → message surfaced

use super::capture::{select_mime_type, CaptureConstraints, CaptureError, CaptureStream, Microphone};
use super::connection::ConnectionState;
use super::speech::{
    find_voice, has_voice_for, SpeechEvent, SpeechSynthesizer, Utterance, UtteranceId,
};
use crate::language;
use crate::relay::{ClientMessage, ServerMessage};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Oldest entries are dropped beyond this.
pub const TRANSCRIPT_LIMIT: usize = 50;

pub const STATUS_READY: &str = "Ready to listen";
pub const STATUS_RECORDING: &str = "Recording...";
pub const STATUS_PROCESSING: &str = "Processing audio...";
pub const STATUS_SPEAKING: &str = "AI speaking...";
pub const STATUS_INTERRUPTED: &str = "Listening to new input...";

pub const CAPTURE_FAILED_MESSAGE: &str =
    "Failed to start recording. Please check microphone permissions.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    Ai,
    System,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub language: Option<String>,
    pub at: DateTime<Utc>,
}

/// Everything a front end needs to render.
#[derive(Debug, Clone, Default)]
pub struct ViewState {
    pub transcript: VecDeque<TranscriptEntry>,
    pub busy: bool,
    pub status: String,
    pub error: Option<String>,
    pub connection: ConnectionState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// What an inbound envelope did to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    Ignored,
    Busy,
    Answered,
    Interrupted,
    Failed(String),
}

/// Result of switching the selected language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageSwitch {
    pub code: String,
    pub name: String,
    pub voice_available: bool,
}

/// The utterance the engine is currently playing.
struct Speaking {
    id: UtteranceId,
    text: String,
    language: String,
}

enum RecordingState {
    Idle,
    Recording {
        stream: Box<dyn CaptureStream>,
        mime_type: &'static str,
    },
}

pub struct ClientController {
    microphone: Box<dyn Microphone>,
    synthesizer: Box<dyn SpeechSynthesizer>,
    constraints: CaptureConstraints,
    recording: RecordingState,
    language: String,
    view: ViewState,
    stats: ClientStats,
    /// Kept for late engine failures; events for other ids are stale
    speaking: Option<Speaking>,
    next_utterance: UtteranceId,
}

impl ClientController {
    pub fn new(
        microphone: Box<dyn Microphone>,
        synthesizer: Box<dyn SpeechSynthesizer>,
        language: &str,
    ) -> Self {
        Self {
            microphone,
            synthesizer,
            constraints: CaptureConstraints::default(),
            recording: RecordingState::Idle,
            language: language.to_string(),
            view: ViewState {
                status: STATUS_READY.to_string(),
                ..ViewState::default()
            },
            stats: ClientStats::default(),
            speaking: None,
            next_utterance: 0,
        }
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.recording, RecordingState::Recording { .. })
    }

    pub fn voice_available(&self, code: &str) -> bool {
        has_voice_for(&self.synthesizer.voices(), code)
    }

    pub fn set_language(&mut self, code: &str) -> LanguageSwitch {
        self.language = code.to_string();
        let switch = LanguageSwitch {
            code: code.to_string(),
            name: language::display_name(code).to_string(),
            voice_available: self.voice_available(code),
        };
        info!(
            language = %switch.code,
            voice = switch.voice_available,
            "Switched to {}",
            switch.name
        );
        switch
    }

    pub fn dismiss_error(&mut self) {
        self.view.error = None;
    }

    /// Acquire the microphone and start capturing. A no-op while already
    /// recording.
    pub fn start_recording(&mut self) -> Result<(), CaptureError> {
        if self.is_recording() {
            return Ok(());
        }

        // The user talking over the answer silences it
        self.stop_speaking();

        let opened = select_mime_type(self.microphone.as_ref())
            .ok_or(CaptureError::NoSupportedFormat)
            .and_then(|mime_type| {
                self.microphone
                    .open(&self.constraints, mime_type)
                    .map(|stream| (stream, mime_type))
            });

        match opened {
            Ok((stream, mime_type)) => {
                debug!(mime_type, "Recording started");
                self.recording = RecordingState::Recording { stream, mime_type };
                self.view.status = STATUS_RECORDING.to_string();
                Ok(())
            }
            Err(e) => {
                warn!("Error starting recording: {}", e);
                self.recording = RecordingState::Idle;
                self.view.error = Some(CAPTURE_FAILED_MESSAGE.to_string());
                Err(e)
            }
        }
    }

    /// Stop capturing and build the `audio` envelope for what was recorded.
    /// Returns `None` when idle or when nothing was captured.
    pub fn stop_recording(&mut self) -> Option<ClientMessage> {
        let RecordingState::Recording { mut stream, mime_type } =
            std::mem::replace(&mut self.recording, RecordingState::Idle)
        else {
            return None;
        };

        let chunks = stream.take_chunks();
        drop(stream);

        if chunks.is_empty() {
            debug!("Recording stopped with no audio captured");
            self.view.status = STATUS_READY.to_string();
            return None;
        }

        let audio = chunks.concat();
        debug!(mime_type, bytes = audio.len(), "Recording stopped");
        self.view.status = STATUS_PROCESSING.to_string();
        self.stats.messages_sent += 1;

        Some(ClientMessage::audio(STANDARD.encode(&audio), self.language.clone()))
    }

    /// Raw text frame from the connection. Unparseable frames are logged and
    /// ignored.
    pub fn on_inbound_text(&mut self, text: &str) -> Reaction {
        self.stats.messages_received += 1;
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => self.on_envelope(message),
            Err(e) => {
                warn!("Error parsing server message: {}", e);
                Reaction::Ignored
            }
        }
    }

    pub fn on_envelope(&mut self, message: ServerMessage) -> Reaction {
        match message {
            ServerMessage::Processing => {
                self.view.busy = true;
                Reaction::Busy
            }
            ServerMessage::AiResponse { text, language, .. } => {
                self.view.busy = false;
                self.push_entry(Speaker::Ai, text.clone(), Some(language.clone()));
                self.view.status = STATUS_READY.to_string();
                self.speak(text, language);
                Reaction::Answered
            }
            ServerMessage::Interrupt => {
                self.stop_speaking();
                self.view.status = STATUS_INTERRUPTED.to_string();
                self.view.busy = false;
                Reaction::Interrupted
            }
            ServerMessage::Error { message } => {
                self.view.busy = false;
                self.view.error = Some(message.clone());
                Reaction::Failed(message)
            }
            ServerMessage::Unknown => {
                debug!("Unknown message type from server");
                Reaction::Ignored
            }
        }
    }

    /// Progress reported by the speech engine after `speak` returned.
    /// Events for anything but the utterance currently playing are ignored.
    pub fn on_speech_event(&mut self, event: SpeechEvent) {
        let current = self.speaking.as_ref().map(|speaking| speaking.id);
        if current != Some(event.utterance()) {
            debug!(utterance = event.utterance(), ?current, "Ignoring stale speech event");
            return;
        }

        match event {
            SpeechEvent::Started(_) => self.view.status = STATUS_SPEAKING.to_string(),
            SpeechEvent::Finished(_) => {
                self.speaking = None;
                self.view.status = STATUS_READY.to_string();
            }
            SpeechEvent::Failed(_, e) => {
                warn!("Speech engine error: {}", e);
                if let Some(speaking) = self.speaking.take() {
                    self.speech_fallback(&speaking.text, &speaking.language);
                }
            }
        }
    }

    pub fn on_connection_state(&mut self, state: ConnectionState) {
        self.view.connection = state;
        if matches!(state, ConnectionState::ClosedAbnormal | ConnectionState::Failed) {
            self.view.busy = false;
        }
    }

    fn speak(&mut self, text: String, language: String) {
        self.stop_speaking();

        let tag = language::speech_tag(&language);
        let Some(voice) = find_voice(&self.synthesizer.voices(), tag) else {
            debug!(language = %language, tag, "No voice for language");
            self.speech_fallback(&text, &language);
            return;
        };

        self.next_utterance += 1;
        let id = self.next_utterance;
        let mut utterance = Utterance::new(text.clone(), tag);
        utterance.id = id;
        utterance.voice = Some(voice);

        match self.synthesizer.speak(utterance) {
            Ok(()) => self.speaking = Some(Speaking { id, text, language }),
            Err(e) => {
                warn!(language = %language, "Speech failed: {}", e);
                self.speech_fallback(&text, &language);
            }
        }
    }

    fn stop_speaking(&mut self) {
        self.synthesizer.cancel();
        self.speaking = None;
    }

    /// Show the answer as a system note when it cannot be spoken.
    fn speech_fallback(&mut self, text: &str, code: &str) {
        let name = language::display_name(code);
        let note = format!(
            "AI responded in {name}: \"{text}\"\n\nNote: Voice playback for {name} is not supported on this device. The response is displayed as text."
        );
        self.push_entry(Speaker::System, note, Some(code.to_string()));
        self.view.status = STATUS_READY.to_string();
    }

    fn push_entry(&mut self, speaker: Speaker, text: String, language: Option<String>) {
        self.view.transcript.push_back(TranscriptEntry {
            speaker,
            text,
            language,
            at: Utc::now(),
        });
        while self.view.transcript.len() > TRANSCRIPT_LIMIT {
            self.view.transcript.pop_front();
        }
    }
}

impl Drop for ClientController {
    fn drop(&mut self) {
        self.recording = RecordingState::Idle;
        self.synthesizer.cancel();
        info!(
            sent = self.stats.messages_sent,
            received = self.stats.messages_received,
            "Client controller finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::speech::{SpeechError, Voice};
    use crate::relay::coordinator::Directive;
    use crate::relay::SessionCoordinator;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct MicTracker {
        opened: Arc<AtomicUsize>,
        released: Arc<AtomicBool>,
    }

    struct FakeMicrophone {
        chunks: Vec<Vec<u8>>,
        deny: bool,
        tracker: MicTracker,
    }

    struct FakeStream {
        chunks: Vec<Vec<u8>>,
        tracker: MicTracker,
    }

    impl Microphone for FakeMicrophone {
        fn supports(&self, mime_type: &str) -> bool {
            mime_type == "audio/webm"
        }

        fn open(
            &mut self,
            constraints: &CaptureConstraints,
            mime_type: &'static str,
        ) -> Result<Box<dyn CaptureStream>, CaptureError> {
            assert_eq!(constraints, &CaptureConstraints::default());
            assert_eq!(mime_type, "audio/webm");
            if self.deny {
                return Err(CaptureError::PermissionDenied("blocked".to_string()));
            }
            self.tracker.opened.fetch_add(1, Ordering::SeqCst);
            self.tracker.released.store(false, Ordering::SeqCst);
            Ok(Box::new(FakeStream {
                chunks: self.chunks.clone(),
                tracker: self.tracker.clone(),
            }))
        }
    }

    impl CaptureStream for FakeStream {
        fn take_chunks(&mut self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.chunks)
        }
    }

    impl Drop for FakeStream {
        fn drop(&mut self) {
            self.tracker.released.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Default)]
    struct SpeechLog {
        spoken: Arc<Mutex<Vec<Utterance>>>,
        cancels: Arc<AtomicUsize>,
    }

    struct FakeSynthesizer {
        voices: Vec<Voice>,
        fail: bool,
        log: SpeechLog,
    }

    impl SpeechSynthesizer for FakeSynthesizer {
        fn voices(&self) -> Vec<Voice> {
            self.voices.clone()
        }

        fn speak(&mut self, utterance: Utterance) -> Result<(), SpeechError> {
            if self.fail {
                return Err(SpeechError::Engine("audio device busy".to_string()));
            }
            self.log.spoken.lock().unwrap().push(utterance);
            Ok(())
        }

        fn cancel(&mut self) {
            self.log.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn english_voice() -> Vec<Voice> {
        vec![Voice {
            name: "Samantha".to_string(),
            lang: "en-US".to_string(),
        }]
    }

    fn controller(chunks: Vec<Vec<u8>>, fail_speech: bool) -> (ClientController, MicTracker, SpeechLog) {
        let tracker = MicTracker::default();
        let log = SpeechLog::default();
        let microphone = FakeMicrophone {
            chunks,
            deny: false,
            tracker: tracker.clone(),
        };
        let synthesizer = FakeSynthesizer {
            voices: english_voice(),
            fail: fail_speech,
            log: log.clone(),
        };
        (
            ClientController::new(Box::new(microphone), Box::new(synthesizer), "en"),
            tracker,
            log,
        )
    }

    fn answer(text: &str, language: &str) -> ServerMessage {
        ServerMessage::AiResponse {
            text: text.to_string(),
            audio: None,
            language: language.to_string(),
        }
    }

    #[test]
    fn test_recording_produces_base64_audio_envelope() {
        let (mut controller, tracker, _) = controller(vec![b"ab".to_vec(), b"cd".to_vec()], false);

        controller.start_recording().unwrap();
        assert!(controller.is_recording());
        assert_eq!(controller.view().status, STATUS_RECORDING);
        assert!(!tracker.released.load(Ordering::SeqCst));

        let envelope = controller.stop_recording().unwrap();
        assert_eq!(envelope, ClientMessage::audio(STANDARD.encode(b"abcd"), "en"));
        assert!(tracker.released.load(Ordering::SeqCst), "stream released on stop");
        assert!(!controller.is_recording());
        assert_eq!(controller.view().status, STATUS_PROCESSING);
        assert_eq!(controller.stats().messages_sent, 1);

        assert!(controller.stop_recording().is_none());
    }

    #[test]
    fn test_empty_recording_sends_nothing() {
        let (mut controller, _, _) = controller(Vec::new(), false);
        controller.start_recording().unwrap();
        assert!(controller.stop_recording().is_none());
        assert_eq!(controller.stats().messages_sent, 0);
        assert_eq!(controller.view().status, STATUS_READY);
    }

    #[test]
    fn test_capture_failure_surfaces_error_and_stays_idle() {
        let synthesizer = FakeSynthesizer {
            voices: english_voice(),
            fail: false,
            log: SpeechLog::default(),
        };
        let microphone = FakeMicrophone {
            chunks: Vec::new(),
            deny: true,
            tracker: MicTracker::default(),
        };
        let mut controller = ClientController::new(Box::new(microphone), Box::new(synthesizer), "en");

        let err = controller.start_recording().unwrap_err();
        assert!(matches!(err, CaptureError::PermissionDenied(_)));
        assert!(!controller.is_recording());
        assert_eq!(controller.view().error.as_deref(), Some(CAPTURE_FAILED_MESSAGE));

        controller.dismiss_error();
        assert!(controller.view().error.is_none());
    }

    #[test]
    fn test_dropping_controller_releases_microphone() {
        let (mut controller, tracker, log) = controller(vec![b"x".to_vec()], false);
        controller.start_recording().unwrap();
        drop(controller);
        assert!(tracker.released.load(Ordering::SeqCst));
        assert!(log.cancels.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_round_trip_with_relay_coordinator() {
        let (mut controller, _, log) = controller(vec![b"RIFF".to_vec()], false);
        let mut coordinator = SessionCoordinator::on_open();

        controller.start_recording().unwrap();
        let envelope = controller.stop_recording().unwrap();

        let mut call = None;
        for directive in coordinator.on_text(&envelope.to_json()) {
            match directive {
                Directive::Send(message) => {
                    controller.on_inbound_text(&message.to_json());
                }
                Directive::Dispatch(dispatched) => call = Some(dispatched),
            }
        }
        assert!(controller.view().busy);

        let call = call.unwrap();
        assert_eq!(call.request.language.as_deref(), Some("en"));
        let reply = coordinator
            .on_call_finished(
                call.sequence,
                Ok(crate::upstream::AiReply {
                    text: "Hello".to_string(),
                    audio: None,
                    language: "en".to_string(),
                }),
            )
            .unwrap();

        assert_eq!(controller.on_inbound_text(&reply.to_json()), Reaction::Answered);
        assert!(!controller.view().busy);

        let entry = controller.view().transcript.back().unwrap();
        assert_eq!(entry.speaker, Speaker::Ai);
        assert_eq!(entry.text, "Hello");

        let spoken = log.spoken.lock().unwrap();
        assert_eq!(spoken.len(), 1);
        assert_eq!(spoken[0].lang, "en-US");
        assert_eq!(spoken[0].rate, 0.9);
        assert_eq!(controller.stats().messages_received, 2);
    }

    #[test]
    fn test_language_without_voice_falls_back_to_text() {
        let (mut controller, _, log) = controller(Vec::new(), false);

        controller.on_envelope(answer("Vanakkam", "ta"));

        assert!(log.spoken.lock().unwrap().is_empty());
        let transcript = &controller.view().transcript;
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].speaker, Speaker::Ai);
        assert_eq!(transcript[1].speaker, Speaker::System);
        assert!(transcript[1].text.starts_with("AI responded in Tamil: \"Vanakkam\""));
        assert_eq!(controller.view().status, STATUS_READY);
    }

    #[test]
    fn test_speech_failures_fall_back_to_text() {
        let (mut failing, _, _) = controller(Vec::new(), true);
        failing.on_envelope(answer("Hi", "en"));
        assert_eq!(failing.view().transcript.back().unwrap().speaker, Speaker::System);

        let (mut late, _, log) = controller(Vec::new(), false);
        late.on_envelope(answer("Hi", "en"));
        let id = log.spoken.lock().unwrap()[0].id;
        late.on_speech_event(SpeechEvent::Started(id));
        assert_eq!(late.view().status, STATUS_SPEAKING);
        late.on_speech_event(SpeechEvent::Failed(id, SpeechError::Engine("audio lost".into())));
        let last = late.view().transcript.back().unwrap();
        assert_eq!(last.speaker, Speaker::System);
        assert!(last.text.contains("English"));
        assert_eq!(late.view().status, STATUS_READY);
    }

    #[test]
    fn test_cancelled_utterance_failure_is_ignored() {
        let (mut controller, _, log) = controller(Vec::new(), false);
        controller.on_envelope(answer("first", "en"));
        controller.on_envelope(answer("second", "en"));

        let (first, second) = {
            let spoken = log.spoken.lock().unwrap();
            assert_eq!(spoken.len(), 2);
            (spoken[0].id, spoken[1].id)
        };
        assert_ne!(first, second);

        // The engine reports the cancelled first answer after the second was queued
        controller.on_speech_event(SpeechEvent::Failed(first, SpeechError::Engine("interrupted".into())));
        controller.on_speech_event(SpeechEvent::Started(second));

        let transcript = &controller.view().transcript;
        assert_eq!(transcript.len(), 2);
        assert!(transcript.iter().all(|entry| entry.speaker == Speaker::Ai));
        assert_eq!(controller.view().status, STATUS_SPEAKING);

        controller.on_speech_event(SpeechEvent::Finished(second));
        assert_eq!(controller.view().status, STATUS_READY);
        controller.on_speech_event(SpeechEvent::Failed(second, SpeechError::Engine("late".into())));
        assert_eq!(controller.view().transcript.len(), 2);
    }

    #[test]
    fn test_interrupt_and_error_envelopes() {
        let (mut controller, _, log) = controller(Vec::new(), false);
        controller.on_envelope(ServerMessage::Processing);
        let cancels_before = log.cancels.load(Ordering::SeqCst);

        assert_eq!(controller.on_envelope(ServerMessage::Interrupt), Reaction::Interrupted);
        assert!(log.cancels.load(Ordering::SeqCst) > cancels_before);
        assert_eq!(controller.view().status, STATUS_INTERRUPTED);
        assert!(!controller.view().busy);

        controller.on_envelope(ServerMessage::Processing);
        let reaction = controller.on_envelope(ServerMessage::error("Gemini API error: 500"));
        assert_eq!(reaction, Reaction::Failed("Gemini API error: 500".to_string()));
        assert!(!controller.view().busy);
        assert_eq!(controller.view().error.as_deref(), Some("Gemini API error: 500"));

        assert_eq!(controller.on_inbound_text("{broken"), Reaction::Ignored);
        assert_eq!(controller.on_inbound_text(r#"{"type":"transcript"}"#), Reaction::Ignored);
    }

    #[test]
    fn test_transcript_keeps_last_fifty_entries() {
        let (mut controller, _, _) = controller(Vec::new(), false);
        for i in 0..60 {
            controller.on_envelope(answer(&format!("answer {}", i), "en"));
        }
        let transcript = &controller.view().transcript;
        assert_eq!(transcript.len(), TRANSCRIPT_LIMIT);
        assert_eq!(transcript.front().unwrap().text, "answer 10");
        assert_eq!(transcript.back().unwrap().text, "answer 59");
    }

    #[test]
    fn test_language_switch_reports_voice_support() {
        let (mut controller, _, _) = controller(Vec::new(), false);
        let switch = controller.set_language("ta");
        assert_eq!(switch.name, "Tamil");
        assert!(!switch.voice_available);
        assert_eq!(controller.language(), "ta");
        assert!(controller.set_language("en").voice_available);
    }
}
