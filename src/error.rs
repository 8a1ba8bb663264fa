//! Error type shared by every fallible operation of the crate.
//!
//! Malformed control packets surface as [`NetplayError::Protocol`]:
//!
//! ```
//! use rollback_netplay::control::wire::decode;
//! use rollback_netplay::NetplayError;
//!
//! let err: NetplayError = decode(&[1, 2, 3]).unwrap_err().into();
//! assert!(matches!(err, NetplayError::Protocol { .. }));
//! assert!(err.to_string().starts_with("Protocol error: "));
//! ```

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::network::codec::CodecError;
use crate::{Frame, PlayerHandle};

/// This enum contains all error messages this library can return. Most API functions will generally return a [`Result<(), NetplayError>`].
///
/// [`Result<(), NetplayError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Hash)]
pub enum NetplayError {
    /// A session is already active; `start_host` / `join` may only be called while inactive.
    AlreadyActive,
    /// When the prediction threshold has been reached, we cannot accept more inputs from the local player.
    PredictionThreshold,
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// The rollback session is not synchronized yet with all remote endpoints.
    NotSynchronized,
    /// An invalid frame number was provided. Frames must be non-negative and within valid ranges.
    InvalidFrame {
        /// The frame that was invalid.
        frame: Frame,
        /// A description of why the frame was invalid.
        reason: String,
    },
    /// An invalid player handle was provided to the rollback engine.
    InvalidPlayer {
        /// The player handle that was invalid.
        player: PlayerHandle,
    },
    /// The transport refused an operation (unknown peer, unreachable address, closed host).
    Transport {
        /// A description of the transport failure.
        context: String,
    },
    /// A control or rollback message failed validation.
    Protocol {
        /// A description of what was malformed.
        context: String,
    },
    /// Serialization or deserialization of data failed.
    Serialization {
        /// A description of what failed to serialize/deserialize.
        context: String,
    },
    /// A state snapshot could not be produced or applied.
    Snapshot {
        /// A description of the snapshot failure.
        context: String,
    },
    /// The simulation driver reported a failure.
    Simulation {
        /// A description of the simulation failure.
        context: String,
    },
    /// An operation did not complete in time.
    Timeout {
        /// What timed out.
        context: String,
    },
    /// An internal error occurred that should not happen under normal operation.
    /// If you encounter this error, please report it as a bug.
    InternalError {
        /// A description of the internal error.
        context: String,
    },
}

impl Display for NetplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetplayError::AlreadyActive => write!(f, "A netplay session is already active."),
            NetplayError::PredictionThreshold => {
                write!(
                    f,
                    "Prediction threshold is reached, cannot proceed without catching up."
                )
            }
            NetplayError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            }
            NetplayError::NotSynchronized => {
                write!(
                    f,
                    "The session is not yet synchronized with all remote sessions."
                )
            }
            NetplayError::InvalidFrame { frame, reason } => {
                write!(f, "Invalid frame {}: {}", frame, reason)
            }
            NetplayError::InvalidPlayer { player } => {
                write!(f, "Invalid player handle {}", player)
            }
            NetplayError::Transport { context } => {
                write!(f, "Transport error: {}", context)
            }
            NetplayError::Protocol { context } => {
                write!(f, "Protocol error: {}", context)
            }
            NetplayError::Serialization { context } => {
                write!(f, "Serialization error: {}", context)
            }
            NetplayError::Snapshot { context } => {
                write!(f, "Snapshot error: {}", context)
            }
            NetplayError::Simulation { context } => {
                write!(f, "Simulation error: {}", context)
            }
            NetplayError::Timeout { context } => {
                write!(f, "Timed out: {}", context)
            }
            NetplayError::InternalError { context } => {
                write!(f, "Internal error (please report as bug): {}", context)
            }
        }
    }
}

impl Error for NetplayError {}

impl From<CodecError> for NetplayError {
    fn from(err: CodecError) -> Self {
        NetplayError::Serialization {
            context: err.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = NetplayError::Transport {
            context: "peer 3 unknown".to_owned(),
        };
        assert_eq!(err.to_string(), "Transport error: peer 3 unknown");

        let err = NetplayError::InvalidFrame {
            frame: Frame::NULL,
            reason: "must be valid".to_owned(),
        };
        assert_eq!(err.to_string(), "Invalid frame NULL_FRAME: must be valid");
    }

    #[test]
    fn codec_errors_become_serialization_errors() {
        let codec_err = crate::network::codec::decode_value::<u32>(&[1, 2]).unwrap_err();
        let err: NetplayError = codec_err.into();
        assert!(matches!(err, NetplayError::Serialization { .. }));
    }
}
