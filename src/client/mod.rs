//! Client side of the voice relay: capture, connection, speech and the
//! controller tying them together.

pub mod capture;
pub mod connection;
pub mod controller;
pub mod speech;

pub use capture::{CaptureError, FileMicrophone, Microphone};
pub use connection::{ClientConnection, ClientError, ConnectionState, ReconnectPolicy};
pub use controller::{ClientController, Reaction, ViewState};
pub use speech::{ConsoleSynthesizer, SpeechError, SpeechSynthesizer};
