//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## What is shared:
//! - **config**: the validated configuration, fixed after startup
//! - **adapter**: the upstream AI adapter, one instance for all sessions
//! - **metrics**: counters updated by the middleware and the relay actors
//!
//! ## Arc<RwLock<T>> Pattern
//! Metrics are written by many requests and channels at once, so they live
//! behind an `RwLock` inside an `Arc`: many readers (the /metrics endpoint) or
//! one writer at a time. Locks are held only for the duration of a counter
//! update, never across an `.await`.
//!
//! A poisoned lock only means another thread panicked mid-update; the counters
//! are still usable, so the guard is recovered instead of propagating the panic.

use crate::config::AppConfig;
use crate::upstream::AiAdapter;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Validated configuration (read-only after startup)
    pub config: Arc<AppConfig>,

    /// Upstream adapter shared by all sessions
    pub adapter: Arc<dyn AiAdapter>,

    /// Counters updated by requests and channels
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected since server start.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// HTTP requests processed (WebSocket upgrades included)
    pub request_count: u64,

    /// HTTP requests answered with 4xx/5xx
    pub error_count: u64,

    /// Channels currently open
    pub active_sessions: u32,

    /// Channels opened since start
    pub total_sessions: u64,

    /// Audio envelopes accepted and dispatched upstream
    pub audio_requests: u64,

    /// `interrupt` envelopes sent
    pub interrupts: u64,

    /// Upstream calls that ended in an `error` envelope
    pub upstream_failures: u64,

    /// Inbound frames answered with the malformed-input error
    pub malformed_messages: u64,

    /// Connections refused because the session limit was reached
    pub rejected_sessions: u64,

    /// Key: "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Statistics for one HTTP endpoint.
///
/// ## Derived values:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// Relay events counted per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEvent {
    AudioAccepted,
    Interrupted,
    UpstreamFailed,
    Malformed,
}

impl AppState {
    pub fn new(config: AppConfig, adapter: Arc<dyn AiAdapter>) -> Self {
        Self {
            config: Arc::new(config),
            adapter,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    fn read_metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.write_metrics().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.write_metrics().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// The first time an endpoint is seen a zeroed [`EndpointMetric`] is
    /// created for it; later requests update that entry.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Reserve a session slot. Returns `false` (and counts the rejection) when
    /// `max_concurrent_sessions` channels are already open.
    ///
    /// Check and increment happen under one write lock, so two upgrades racing
    /// for the last slot cannot both win.
    pub fn try_open_session(&self) -> bool {
        let limit = self.config.session.max_concurrent_sessions;
        let mut metrics = self.write_metrics();

        if metrics.active_sessions as usize >= limit {
            metrics.rejected_sessions += 1;
            return false;
        }

        metrics.active_sessions += 1;
        metrics.total_sessions += 1;
        true
    }

    /// Release a slot taken by [`try_open_session`](Self::try_open_session).
    /// Never underflows.
    pub fn close_session(&self) {
        let mut metrics = self.write_metrics();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    pub fn record_relay_event(&self, event: RelayEvent) {
        let mut metrics = self.write_metrics();
        match event {
            RelayEvent::AudioAccepted => metrics.audio_requests += 1,
            RelayEvent::Interrupted => metrics.interrupts += 1,
            RelayEvent::UpstreamFailed => metrics.upstream_failures += 1,
            RelayEvent::Malformed => metrics.malformed_messages += 1,
        }
    }

    /// Consistent copy of the counters; the lock is released before the
    /// caller serializes anything.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.read_metrics().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) fn test_state(config: AppConfig) -> AppState {
    use crate::upstream::testing::StubAdapter;
    AppState::new(config, Arc::new(StubAdapter::replying("ok", "en")))
}
