//! Error types for the QBB fabric

use thiserror::Error;

/// Top-level error type for the QBB fabric
#[derive(Debug, Error)]
pub enum QbbError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),
}

/// Errors raised while decoding or building frames
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Truncated {kind} header: expected {expected} bytes, got {actual}")]
    Truncated {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Priority {0} out of range")]
    InvalidPriority(u16),

    #[error("Invalid ECN codepoint: {0}")]
    InvalidEcn(u8),
}

/// Errors raised while validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid data rate: {0}")]
    InvalidRate(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("{option} requires {requires}")]
    MissingPrerequisite {
        option: &'static str,
        requires: &'static str,
    },
}

impl ConfigError {
    /// Shorthand for an [`ConfigError::InvalidValue`]
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors raised while wiring nodes and links together
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("Unknown node: {0}")]
    UnknownNode(u32),

    #[error("Unknown port {port} on node {node}")]
    UnknownPort { node: u32, port: u32 },

    #[error("No route from node {from} to {destination}")]
    NoRoute { from: u32, destination: String },
}

/// Result type alias for QBB operations
pub type QbbResult<T> = Result<T, QbbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::Truncated {
            kind: "pause",
            expected: 9,
            actual: 4,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("pause"));
        assert!(msg.contains('9'));
        assert!(msg.contains('4'));

        assert!(format!("{}", ProtocolError::InvalidPriority(12)).contains("12"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingPrerequisite {
            option: "wait_for_ack",
            requires: "qcn_enabled",
        };
        assert_eq!(format!("{}", err), "wait_for_ack requires qcn_enabled");

        let err = ConfigError::invalid("gain", "must be in (0, 1]");
        assert!(format!("{}", err).contains("gain"));
    }

    #[test]
    fn test_error_conversion() {
        let err: QbbError = ProtocolError::InvalidEcn(7).into();
        assert!(matches!(err, QbbError::Protocol(_)));

        let err: QbbError = ConfigError::InvalidRate("fast".into()).into();
        assert!(format!("{}", err).contains("fast"));
    }
}
