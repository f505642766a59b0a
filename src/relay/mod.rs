//! Server side of the voice relay: envelopes, per-channel session state and
//! the coordinator that sequences them.

pub mod coordinator;
pub mod messages;
pub mod session;

pub use coordinator::{execute, Directive, SessionCoordinator, UpstreamCall};
pub use messages::{ClientMessage, ServerMessage};
pub use session::{Session, SessionSummary};
