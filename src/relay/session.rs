//! # Relay Session
//!
//! Server-side state of one open channel. A [`Session`] is created when the
//! channel opens and dropped when it closes; it is owned by that channel's
//! coordinator and never shared.
//!
//! ## Session Lifecycle:
//! 1. **Open**: `processing == false`, waiting for audio
//! 2. **Processing**: an upstream call is in flight for the latest utterance
//! 3. **Closed**: channel gone, late completions are ignored
//!
//! ## Superseded calls:
//! Every accepted utterance bumps `sequence`. A completion only counts if it
//! carries the current sequence; older ones belong to answers the client was
//! already told to drop with an `interrupt`.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Outcome of accepting a new utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Sequence number the upstream call must report back on completion
    pub sequence: u64,
    /// Whether an older call was still in flight and is now superseded
    pub superseded: bool,
}

/// What a finished call means for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The call was the latest one; `processing` is now false
    Current,
    /// A newer utterance took over; the result must not be delivered
    Stale,
    /// The channel is gone; nothing can be delivered
    Closed,
}

#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub opened_at: DateTime<Utc>,
    processing: bool,
    sequence: u64,
    open: bool,
    accepted: u64,
    interrupts: u64,
}

impl Session {
    pub fn open() -> Self {
        Self {
            id: Uuid::new_v4(),
            opened_at: Utc::now(),
            processing: false,
            sequence: 0,
            open: true,
            accepted: 0,
            interrupts: 0,
        }
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn current_sequence(&self) -> u64 {
        self.sequence
    }

    /// Accept an utterance: read-then-set of `processing` with no suspension
    /// point in between.
    pub fn admit(&mut self) -> Admission {
        let superseded = self.processing;
        if superseded {
            self.interrupts += 1;
        }

        self.sequence += 1;
        self.processing = true;
        self.accepted += 1;

        Admission {
            sequence: self.sequence,
            superseded,
        }
    }

    /// Record the completion of the call tagged `sequence`.
    pub fn settle(&mut self, sequence: u64) -> Settlement {
        if !self.open {
            return Settlement::Closed;
        }
        if sequence != self.sequence {
            return Settlement::Stale;
        }
        self.processing = false;
        Settlement::Current
    }

    pub fn close(&mut self) {
        self.processing = false;
        self.open = false;
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            accepted_utterances: self.accepted,
            interrupts: self.interrupts,
            duration_seconds: Utc::now()
                .signed_duration_since(self.opened_at)
                .num_milliseconds() as f64
                / 1000.0,
        }
    }
}

/// Per-session statistics logged when a channel closes.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub accepted_utterances: u64,
    pub interrupts: u64,
    pub duration_seconds: f64,
}
