//! # rev-voice-relay
//!
//! Voice relay for the Rev assistant. Clients stream one recorded question at
//! a time over a WebSocket; the server forwards it to the Gemini API and sends
//! the answer back on the same connection.
//!
//! ## Server modules:
//! - [`config`], [`error`], [`state`]: configuration, error types, shared state
//! - [`relay`]: envelopes, per-connection session and the coordinator
//! - [`upstream`]: the AI adapter seam and its Gemini implementation
//! - [`websocket`], [`health`], [`handlers`], [`middleware`]: the HTTP surface
//!
//! ## Client modules:
//! - [`client`]: capture, connection, speech and the client controller
//! - [`language`]: supported languages and their speech tags

pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod language;
pub mod middleware;
pub mod relay;
pub mod state;
pub mod upstream;
pub mod websocket;
