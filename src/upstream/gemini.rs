//! Gemini `generateContent` adapter.
//!
//! # API Reference
//!
//! - Endpoint: `POST {base_url}/models/{model}:generateContent?key={api_key}`
//! - Body: one user turn holding the system instruction as a text part and the
//!   utterance as an `inline_data` part, plus `generation_config`
//! - Answer text: `candidates[0].content.parts[*].text`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{AiAdapter, AiReply, AudioRequest};
use crate::config::GeminiConfig;
use crate::error::UpstreamError;
use crate::language::{self, DEFAULT_LANGUAGE};

const ERROR_BODY_LOG_LIMIT: usize = 512;

/// Fixed system instruction: assistant persona, domain restriction and the
/// "answer in the user's language" rule.
pub fn system_prompt(language: Option<&str>) -> String {
    let language_name = language
        .filter(|code| !code.trim().is_empty())
        .map(language::display_name)
        .unwrap_or("English");

    format!(
        "You are Rev, an AI assistant for Revolt Motors. \
         Answer only questions about Revolt Motors products, services, policies, and company details. \
         Keep responses concise and helpful. \
         Respond in the same language as the user's question ({}).",
        language_name
    )
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text { text: String },
    InlineData { inline_data: InlineData<'a> },
}

#[derive(Debug, Serialize)]
struct InlineData<'a> {
    mime_type: &'a str,
    data: &'a str,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

fn extract_text(response: GenerateContentResponse) -> Result<String, UpstreamError> {
    let content = response
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .ok_or(UpstreamError::EmptyResponse)?;

    let text = content
        .parts
        .into_iter()
        .filter_map(|part| part.text)
        .collect::<Vec<_>>()
        .join("");
    let text = text.trim();

    if text.is_empty() {
        return Err(UpstreamError::EmptyResponse);
    }
    Ok(text.to_string())
}

fn truncate(body: &str, limit: usize) -> &str {
    match body.char_indices().nth(limit) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Adapter for Google's Gemini API.
pub struct GeminiAdapter {
    client: reqwest::Client,
    settings: GeminiConfig,
}

impl GeminiAdapter {
    /// Build the adapter and its HTTP client (timeout applied per request).
    pub fn new(settings: GeminiConfig) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| UpstreamError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, settings })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.model
        )
    }

    fn build_body<'a>(&'a self, request: &'a AudioRequest) -> GenerateContentRequest<'a> {
        GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![
                    Part::Text {
                        text: system_prompt(request.language.as_deref()),
                    },
                    Part::InlineData {
                        inline_data: InlineData {
                            mime_type: &self.settings.audio_mime_type,
                            data: &request.audio,
                        },
                    },
                ],
            }],
            generation_config: GenerationConfig {
                temperature: self.settings.temperature,
                top_p: self.settings.top_p,
                top_k: self.settings.top_k,
            },
        }
    }
}

#[async_trait]
impl AiAdapter for GeminiAdapter {
    async fn answer(&self, request: AudioRequest) -> Result<AiReply, UpstreamError> {
        if self.settings.api_key.trim().is_empty() {
            return Err(UpstreamError::MissingCredentials);
        }

        debug!(
            model = %self.settings.model,
            audio_len = request.audio.len(),
            language = ?request.language,
            "Calling Gemini generateContent"
        );

        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", self.settings.api_key.as_str())])
            .json(&self.build_body(&request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                status = status.as_u16(),
                body = %truncate(&body, ERROR_BODY_LOG_LIMIT),
                "Gemini API error"
            );
            return Err(UpstreamError::Status(status.as_u16()));
        }

        let payload: GenerateContentResponse = response.json().await?;
        let text = extract_text(payload)?;

        let language = request
            .language
            .filter(|code| !code.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());

        Ok(AiReply {
            text,
            audio: None,
            language,
        })
    }

    fn model(&self) -> &str {
        &self.settings.model
    }
}
