//! [`BridgeError`] – the single error type shared by every `rmbridge` crate.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Stage of the connection sequence that produced a
/// [`BridgeError::Connection`] failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Locating the device on the local network.
    Discovery,
    /// Acknowledging the discovered device.
    Handshake,
    /// Issuing the close / set-IP / set-port / open event sequence.
    Open,
    /// Waiting for the connection-status key to report the new state.
    StatusWait,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Discovery => write!(f, "discovery"),
            Stage::Handshake => write!(f, "handshake"),
            Stage::Open => write!(f, "open"),
            Stage::StatusWait => write!(f, "status-wait"),
        }
    }
}

/// Errors spanning catalog lookups, result decoding, request correlation,
/// discovery, and lifecycle misuse.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Unknown key sub-type {0:#010x}")]
    UnknownKey(u32),

    #[error("Unknown event type {0}")]
    UnknownEventType(u32),

    #[error("Event type {0} is reserved for key operations")]
    ReservedEventType(u32),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Sequence number {0:#x} does not fit in 48 bits")]
    SequenceOverflow(u64),

    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("Remote error {code}: {description}")]
    RemoteError { code: i32, description: String },

    #[error("Listener token {0} is not registered")]
    NotFound(u64),

    #[error("Key {key} does not allow {operation}")]
    AccessDenied {
        key: &'static str,
        operation: &'static str,
    },

    #[error("No matching device found within {0:?}")]
    DiscoveryTimeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Bridge is not connected")]
    NotConnected,

    #[error("Already started")]
    AlreadyStarted,

    #[error("Not started")]
    NotStarted,

    #[error("Native bridge error: {0}")]
    Native(String),

    #[error("Connection failed during {stage}: {source}")]
    Connection {
        stage: Stage,
        #[source]
        source: Box<BridgeError>,
    },
}

impl BridgeError {
    /// Wrap `self` as a failure of the given connection [`Stage`].
    pub fn at_stage(self, stage: Stage) -> Self {
        BridgeError::Connection {
            stage,
            source: Box::new(self),
        }
    }

    /// Convenience constructor for [`BridgeError::Timeout`].
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        BridgeError::Timeout {
            what: what.into(),
            after,
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_wrapping_names_the_stage() {
        let err = BridgeError::DiscoveryTimeout(Duration::from_secs(3)).at_stage(Stage::Discovery);
        let text = err.to_string();
        assert!(text.contains("discovery"));
        assert!(text.contains("No matching device"));
        assert!(matches!(
            err,
            BridgeError::Connection {
                stage: Stage::Discovery,
                ..
            }
        ));
    }

    #[test]
    fn remote_error_display() {
        let err = BridgeError::RemoteError {
            code: 7,
            description: "error 7".to_string(),
        };
        assert_eq!(err.to_string(), "Remote error 7: error 7");
    }
}
