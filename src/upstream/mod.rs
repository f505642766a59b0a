//! # Upstream AI Adapter
//!
//! Translates one captured utterance (base64 audio + language hint) into one
//! request against a hosted generative-language API, and its response into an
//! [`AiReply`] or an [`UpstreamError`].
//!
//! The relay only depends on the [`AiAdapter`] trait, so tests swap in stubs and
//! the session coordinator never sees HTTP details.
//!
//! ## Contract:
//! - Exactly one attempt per invocation; retry policy belongs to the caller
//! - Every failure is recoverable and carries a human-readable message
//! - No side effects beyond the network call

pub mod gemini;

pub use gemini::GeminiAdapter;

use crate::error::UpstreamError;
use async_trait::async_trait;

/// One utterance to answer.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioRequest {
    /// Base64-encoded audio exactly as received from the client
    pub audio: String,
    /// ISO 639-1 language hint, if the client sent one
    pub language: Option<String>,
}

/// A successful answer.
#[derive(Debug, Clone, PartialEq)]
pub struct AiReply {
    pub text: String,
    /// Synthesized audio; reserved, adapters currently return text only
    pub audio: Option<String>,
    pub language: String,
}

#[async_trait]
pub trait AiAdapter: Send + Sync {
    /// Answer one utterance.
    async fn answer(&self, request: AudioRequest) -> Result<AiReply, UpstreamError>;

    /// Identifier of the model behind this adapter (reported by /health).
    fn model(&self) -> &str;
}
