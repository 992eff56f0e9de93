//! Error types for the protocol.

use thiserror::Error;

/// Protocol errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unsupported protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    /// Message too large.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Unknown frame kind.
    #[error("unknown frame kind: {0}")]
    UnknownFrameKind(u16),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Deserialisation error.
    #[error("deserialisation error: {0}")]
    Deserialisation(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Checks if the stream can keep going after this error.
    ///
    /// Framing is lost after a malformed header or an I/O failure.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Deserialisation(_) | Self::Serialisation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::MessageTooLarge { size: 20, max: 10 };
        assert_eq!(err.to_string(), "message too large: 20 bytes (max 10)");
    }

    #[test]
    fn recoverability() {
        assert!(ProtocolError::Deserialisation("bad".into()).is_recoverable());
        assert!(!ProtocolError::UnknownFrameKind(9).is_recoverable());
        assert!(!ProtocolError::Io(std::io::Error::other("reset")).is_recoverable());
    }
}
