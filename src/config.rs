//! # Configuration Management
//!
//! Loads the relay configuration from several layered sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` in the working directory
//! - Environment variables with the `APP__` prefix (`__` separates sections,
//!   e.g. `APP__GEMINI__MODEL=gemini-2.0-flash`)
//! - The short variables deployment platforms and `.env` files usually carry:
//!   `HOST`, `PORT`, `GEMINI_API_KEY`, `MODEL_NAME`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` / `GEMINI_API_KEY` / `MODEL_NAME`
//! 2. `APP__*` environment variables
//! 3. Configuration file (config.toml)
//! 4. Default values
//!
//! The configuration is validated once at startup. A missing Gemini API key is
//! a fatal condition: the server refuses to start.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Sections:
/// - `server`: where the HTTP/WebSocket listener binds
/// - `gemini`: credentials and generation parameters for the upstream AI API
/// - `session`: per-channel limits and liveness timings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub gemini: GeminiConfig,
    pub session: SessionConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Upstream generative-language API settings.
///
/// ## Fields:
/// - `api_key`: Gemini API key (mandatory, never logged or echoed back)
/// - `model`: model identifier, e.g. "gemini-2.0-flash"
/// - `base_url`: API root, overridable for tests and proxies
/// - `request_timeout_secs`: upper bound for one generateContent call
/// - `temperature`, `top_p`, `top_k`: sampling controls forwarded verbatim
/// - `audio_mime_type`: MIME type declared for the inlined audio payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub audio_mime_type: String,
}

/// Per-channel session settings.
///
/// ## Fields:
/// - `heartbeat_interval_secs`: how often the server pings each client
/// - `client_timeout_secs`: silence after which a channel is considered dead
/// - `max_frame_bytes`: largest accepted WebSocket frame (base64 audio is big)
/// - `max_concurrent_sessions`: channels beyond this are refused with 503
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub max_frame_bytes: usize,
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            gemini: GeminiConfig {
                api_key: String::new(),
                model: "gemini-2.0-flash".to_string(),
                base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                request_timeout_secs: 30,
                temperature: 0.7,
                top_p: 0.8,
                top_k: 40,
                audio_mime_type: "audio/webm".to_string(),
            },
            session: SessionConfig {
                heartbeat_interval_secs: 30,
                client_timeout_secs: 90,
                max_frame_bytes: 50 * 1024 * 1024,
                max_concurrent_sessions: 100,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP__GEMINI__REQUEST_TIMEOUT_SECS=20`: Override the upstream timeout
    /// - `PORT=8080`: Special case for deployment platforms
    /// - `GEMINI_API_KEY=...`: The credential, usually supplied through `.env`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(api_key) = env::var("GEMINI_API_KEY") {
            settings = settings.set_override("gemini.api_key", api_key)?;
        }

        if let Ok(model) = env::var("MODEL_NAME") {
            settings = settings.set_override("gemini.model", model)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - The Gemini API key and model are present
    /// - Timeouts are non-zero and the heartbeat fires before the client timeout
    /// - Frame and session limits allow at least something through
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.gemini.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "GEMINI_API_KEY not found in environment variables; create a .env file with your Gemini API key"
            ));
        }

        if self.gemini.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Gemini model name cannot be empty"));
        }

        if self.gemini.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Gemini request timeout must be greater than 0"));
        }

        if self.session.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.session.heartbeat_interval_secs >= self.session.client_timeout_secs {
            return Err(anyhow::anyhow!(
                "Heartbeat interval ({}s) must be shorter than the client timeout ({}s)",
                self.session.heartbeat_interval_secs,
                self.session.client_timeout_secs
            ));
        }

        if self.session.max_frame_bytes == 0 {
            return Err(anyhow::anyhow!("Max frame size must be greater than 0"));
        }

        if self.session.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())
    }

    /// Whether an API key has been supplied (used by the health endpoint).
    pub fn has_api_key(&self) -> bool {
        !self.gemini.api_key.trim().is_empty()
    }
}

impl GeminiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}
