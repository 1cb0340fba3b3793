//! Errors raised by the message channel.

use std::time::Duration;

use teleop_types::TeleopError;
use thiserror::Error;

/// Failures of subscription and request/reply calls.
///
/// `publish` never fails; see [`MessageBus::publish`][crate::bus::MessageBus::publish].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("topic '{name}' carries {bound}, not {requested}")]
    TypeMismatch {
        name: String,
        bound: String,
        requested: String,
    },

    #[error("no endpoint named '{0}' is being served")]
    NoSuchEndpoint(String),

    #[error("endpoint '{0}' is already being served")]
    EndpointTaken(String),

    /// The request may already have taken effect server-side.
    #[error("request to '{endpoint}' timed out after {timeout:?}; outcome unknown")]
    Timeout { endpoint: String, timeout: Duration },

    #[error("endpoint '{0}' closed before replying")]
    Closed(String),
}

impl ChannelError {
    /// `true` when the caller cannot tell whether the request was applied.
    pub fn is_unknown_outcome(&self) -> bool {
        matches!(self, ChannelError::Timeout { .. })
    }
}

impl From<ChannelError> for TeleopError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Timeout { endpoint, timeout } => TeleopError::ChannelTimeout {
                endpoint,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            other => TeleopError::Channel(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_maps_to_channel_timeout() {
        let err = ChannelError::Timeout {
            endpoint: "control/recorder".to_string(),
            timeout: Duration::from_millis(250),
        };
        assert!(err.is_unknown_outcome());
        match TeleopError::from(err) {
            TeleopError::ChannelTimeout { endpoint, timeout_ms } => {
                assert_eq!(endpoint, "control/recorder");
                assert_eq!(timeout_ms, 250);
            }
            other => panic!("unexpected mapping: {other:?}"),
        }
    }

    #[test]
    fn other_errors_map_to_channel() {
        let err = ChannelError::NoSuchEndpoint("control/operator/arm".to_string());
        assert!(!err.is_unknown_outcome());
        assert!(matches!(TeleopError::from(err), TeleopError::Channel(_)));
    }
}
