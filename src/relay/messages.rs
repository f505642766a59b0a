//! Wire envelopes exchanged on the channel.
//!
//! One JSON object per WebSocket text frame, discriminated by `type`:
//!
//! | Direction | type | Fields |
//! |---|---|---|
//! | client → server | `audio` | `audio` (base64), `language` (ISO 639-1) |
//! | client → server | `ping` | - |
//! | server → client | `processing` | - |
//! | server → client | `ai_response` | `text`, `audio` (omitted while unused), `language` |
//! | server → client | `interrupt` | - |
//! | server → client | `error` | `message` |
//!
//! Unknown `type` values deserialize to `Unknown` on both sides so newer peers
//! can add envelopes without breaking older ones.

use serde::{Deserialize, Serialize};

/// Fixed message sent back for any inbound frame that is not a valid envelope.
pub const MALFORMED_INPUT_MESSAGE: &str = "Failed to process audio input";

/// Sent back for an `audio` envelope with nothing in it.
pub const EMPTY_AUDIO_MESSAGE: &str = "No audio data received";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// One captured utterance
    Audio {
        audio: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
    /// Heartbeat keepalive, never answered
    Ping,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The upstream call for the latest utterance has started
    Processing,
    /// Completed answer
    AiResponse {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio: Option<String>,
        language: String,
    },
    /// A newer utterance superseded the in-flight one
    Interrupt,
    /// Recoverable failure, human-readable
    Error { message: String },
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    pub fn audio(audio: impl Into<String>, language: impl Into<String>) -> Self {
        ClientMessage::Audio {
            audio: audio.into(),
            language: Some(language.into()),
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing these plain enums cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Tag as it appears on the wire, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Processing => "processing",
            ServerMessage::AiResponse { .. } => "ai_response",
            ServerMessage::Interrupt => "interrupt",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Unknown => "unknown",
        }
    }
}
