//! Device error types
//!
//! These are protocol-invariant violations caused by a packet that does not
//! fit the device's state. They abandon the offending packet; the device
//! itself stays consistent and the simulation continues.

use thiserror::Error;

use qbb_core::{ConfigError, FlowKey, ProtocolError};

/// Errors that can occur while a device handles a packet
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Frame could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Configuration rejected at construction
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// ACK, NACK or congestion feedback for a flow this device never sent
    #[error("No flow for {0}")]
    UnknownFlow(FlowKey),

    /// A NACK asked for data the send buffer no longer holds
    #[error("Send buffer of {flow} starts at seq {head}, cannot replay from {requested}")]
    SendBufferMismatch {
        flow: FlowKey,
        head: u32,
        requested: u32,
    },

    /// An ACK arrived while acknowledgements are disabled
    #[error("Received ACK for {0} with ACK interval 0")]
    UnexpectedAck(FlowKey),

    /// Congestion feedback that carries no marked packets
    #[error("Congestion feedback for {0} reports no marked packets")]
    UselessFeedback(FlowKey),
}

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

#[cfg(test)]
mod tests {
    use super::*;
    use qbb_core::Address;

    #[test]
    fn test_error_display() {
        let key = FlowKey::new(Address::new(10, 0, 0, 2), 4000, 3);
        let err = DeviceError::SendBufferMismatch {
            flow: key,
            head: 12,
            requested: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("10.0.0.2:4000/q3"));
        assert!(msg.contains("12"));
        assert!(msg.contains('5'));

        assert!(DeviceError::UnknownFlow(key).to_string().starts_with("No flow"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err: DeviceError = ProtocolError::InvalidPriority(9).into();
        assert!(matches!(err, DeviceError::Protocol(_)));
    }
}
