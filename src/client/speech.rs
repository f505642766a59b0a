//! Speech output behind a [`SpeechSynthesizer`] seam.

use crate::language;
use std::fmt;

pub const SPEECH_RATE: f32 = 0.9;
pub const SPEECH_PITCH: f32 = 1.0;
pub const SPEECH_VOLUME: f32 = 1.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voice {
    pub name: String,
    /// BCP-47 tag, e.g. "hi-IN"
    pub lang: String,
}

/// Identifies one utterance in the engine's progress events.
pub type UtteranceId = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub id: UtteranceId,
    pub text: String,
    pub lang: String,
    pub voice: Option<Voice>,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

impl Utterance {
    pub fn new(text: impl Into<String>, lang: impl Into<String>) -> Self {
        Self {
            id: 0,
            text: text.into(),
            lang: lang.into(),
            voice: None,
            rate: SPEECH_RATE,
            pitch: SPEECH_PITCH,
            volume: SPEECH_VOLUME,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpeechError {
    NoVoice(String),
    Engine(String),
}

impl fmt::Display for SpeechError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeechError::NoVoice(tag) => write!(f, "No voice available for {}", tag),
            SpeechError::Engine(msg) => write!(f, "Speech engine error: {}", msg),
        }
    }
}

impl std::error::Error for SpeechError {}

/// Progress reported by an engine after `speak` has returned, tagged with
/// the id of the utterance it concerns. A cancelled utterance may still
/// report `Failed` after its successor was queued.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechEvent {
    Started(UtteranceId),
    Finished(UtteranceId),
    Failed(UtteranceId, SpeechError),
}

impl SpeechEvent {
    pub fn utterance(&self) -> UtteranceId {
        match self {
            SpeechEvent::Started(id) | SpeechEvent::Finished(id) | SpeechEvent::Failed(id, _) => *id,
        }
    }
}

pub trait SpeechSynthesizer: Send {
    fn voices(&self) -> Vec<Voice>;

    /// Queue `utterance` for playback.
    fn speak(&mut self, utterance: Utterance) -> Result<(), SpeechError>;

    /// Stop the current utterance and drop anything queued.
    fn cancel(&mut self);
}

/// Voice for `tag`: exact tag match first, then any voice sharing the
/// primary language subtag.
pub fn find_voice(voices: &[Voice], tag: &str) -> Option<Voice> {
    voices
        .iter()
        .find(|voice| voice.lang.eq_ignore_ascii_case(tag))
        .or_else(|| {
            let primary = language::primary_subtag(tag);
            voices
                .iter()
                .find(|voice| language::primary_subtag(&voice.lang).eq_ignore_ascii_case(primary))
        })
        .cloned()
}

/// Whether any voice speaks the ISO 639-1 `code`.
pub fn has_voice_for(voices: &[Voice], code: &str) -> bool {
    voices
        .iter()
        .any(|voice| language::primary_subtag(&voice.lang).eq_ignore_ascii_case(code))
}

/// Prints utterances instead of playing them.
pub struct ConsoleSynthesizer {
    voices: Vec<Voice>,
}

impl ConsoleSynthesizer {
    /// One console voice per speech tag.
    pub fn new<I, S>(speech_tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let voices = speech_tags
            .into_iter()
            .map(|tag| {
                let lang: String = tag.into();
                Voice {
                    name: format!("console-{}", lang),
                    lang,
                }
            })
            .collect();
        Self { voices }
    }
}

impl SpeechSynthesizer for ConsoleSynthesizer {
    fn voices(&self) -> Vec<Voice> {
        self.voices.clone()
    }

    fn speak(&mut self, utterance: Utterance) -> Result<(), SpeechError> {
        let voice = utterance
            .voice
            .or_else(|| find_voice(&self.voices, &utterance.lang))
            .ok_or_else(|| SpeechError::NoVoice(utterance.lang.clone()))?;

        println!("[{} x{:.1}] {}", voice.lang, utterance.rate, utterance.text);
        Ok(())
    }

    // Printing is synchronous, there is never anything left to stop.
    fn cancel(&mut self) {}
}
