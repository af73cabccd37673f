//! Endpoint side of lanline: one call at a time with another endpoint on the
//! same network, negotiated through the relay and carried over a direct
//! peer connection.

pub mod candidates;
pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod telemetry;

pub use config::{CallConfig, RelayConfig};
pub use error::{CallError, CallFailure};
pub use session::{CallHandle, CallNotice, CallSnapshot, CallState, RemoteEndpoint, SessionDeps};

#[cfg(test)]
mod tests;
