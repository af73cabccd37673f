use thiserror::Error;

use crate::peer::TransportState;
use crate::session::CallState;

/// Errors returned by call operations.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("media access failed: {0}")]
    MediaAccess(String),

    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: CallState,
    },

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("signaling failed: {0}")]
    Signaling(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("call session has shut down")]
    SessionClosed,
}

/// Why a call attempt or established call failed, as reported to the user.
///
/// A remote hangup or decline is not a failure and is reported separately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallFailure {
    #[error("could not access microphone/camera: {0}")]
    MediaAccess(String),

    #[error("remote endpoint is unreachable: {0}")]
    Unreachable(String),

    #[error("call setup failed: {0}")]
    Negotiation(String),

    #[error("call connection {0}; check the network and firewall")]
    Connectivity(TransportState),

    #[error("call was not answered")]
    Unanswered,
}

impl CallFailure {
    pub(crate) fn from_error(error: &CallError) -> Self {
        match error {
            CallError::MediaAccess(detail) => CallFailure::MediaAccess(detail.clone()),
            CallError::Signaling(detail) => CallFailure::Unreachable(detail.clone()),
            other => CallFailure::Negotiation(other.to_string()),
        }
    }
}
