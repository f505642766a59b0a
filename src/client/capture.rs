//! Audio capture behind a [`Microphone`] seam.
//!
//! A microphone hands out a [`CaptureStream`] for the duration of one
//! recording. Dropping the stream releases the device, so every exit path of
//! the controller (stop, error, controller dropped mid-recording) gives the
//! microphone back.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};

/// Container formats in order of preference. The first one the microphone
/// supports is used for the whole recording.
pub const PREFERRED_MIME_TYPES: [&str; 4] = [
    "audio/webm;codecs=opus",
    "audio/webm",
    "audio/mp4",
    "audio/ogg;codecs=opus",
];

/// Encoder bitrate requested from the microphone, tuned for voice.
pub const AUDIO_BITS_PER_SECOND: u32 = 128_000;

/// Fixed capture settings for speech.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub channels: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub bits_per_second: u32,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            bits_per_second: AUDIO_BITS_PER_SECOND,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureError {
    PermissionDenied(String),
    NoSupportedFormat,
    Device(String),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::PermissionDenied(msg) => write!(f, "Microphone permission denied: {}", msg),
            CaptureError::NoSupportedFormat => write!(f, "No supported audio format found"),
            CaptureError::Device(msg) => write!(f, "Microphone error: {}", msg),
        }
    }
}

impl std::error::Error for CaptureError {}

/// A source of encoded audio.
pub trait Microphone: Send {
    /// Whether recordings can be produced in `mime_type`.
    fn supports(&self, mime_type: &str) -> bool;

    /// Acquire the device and start recording.
    fn open(
        &mut self,
        constraints: &CaptureConstraints,
        mime_type: &'static str,
    ) -> Result<Box<dyn CaptureStream>, CaptureError>;
}

/// One live recording. Dropping it releases the device.
pub trait CaptureStream: Send {
    /// Encoded chunks captured since the last call, oldest first.
    fn take_chunks(&mut self) -> Vec<Vec<u8>>;
}

/// First entry of [`PREFERRED_MIME_TYPES`] the microphone can produce.
pub fn select_mime_type(microphone: &dyn Microphone) -> Option<&'static str> {
    PREFERRED_MIME_TYPES
        .iter()
        .copied()
        .find(|mime_type| microphone.supports(mime_type))
}

/// Media type without parameters: `"audio/webm;codecs=opus"` → `"audio/webm"`.
pub fn base_mime_type(mime_type: &str) -> &str {
    mime_type.split(';').next().unwrap_or(mime_type).trim()
}

/// Plays back pre-recorded files as if they were spoken into a microphone.
/// Used by the command-line client; each recording consumes the next queued
/// file as one utterance.
pub struct FileMicrophone {
    pending: VecDeque<PathBuf>,
    chunk_size: usize,
}

impl FileMicrophone {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Queue a file for a later recording.
    pub fn load(&mut self, path: impl Into<PathBuf>) {
        self.pending.push_back(path.into());
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    fn container_of(path: &Path) -> Option<&'static str> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "webm" => Some("audio/webm"),
            "mp4" | "m4a" => Some("audio/mp4"),
            "ogg" | "opus" => Some("audio/ogg"),
            _ => None,
        }
    }
}

impl Microphone for FileMicrophone {
    fn supports(&self, mime_type: &str) -> bool {
        let Some(next) = self.pending.front() else {
            return false;
        };
        match Self::container_of(next) {
            Some(container) => base_mime_type(mime_type) == container,
            // Unknown extension: hand the bytes over under the first preference
            None => true,
        }
    }

    fn open(
        &mut self,
        _constraints: &CaptureConstraints,
        _mime_type: &'static str,
    ) -> Result<Box<dyn CaptureStream>, CaptureError> {
        let path = self
            .pending
            .pop_front()
            .ok_or_else(|| CaptureError::Device("no input file loaded".to_string()))?;

        let bytes = std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                CaptureError::PermissionDenied(path.display().to_string())
            }
            _ => CaptureError::Device(format!("{}: {}", path.display(), e)),
        })?;

        let chunks = bytes.chunks(self.chunk_size).map(<[u8]>::to_vec).collect();
        Ok(Box::new(BufferedStream { chunks }))
    }
}

struct BufferedStream {
    chunks: Vec<Vec<u8>>,
}

impl CaptureStream for BufferedStream {
    fn take_chunks(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.chunks)
    }
}
