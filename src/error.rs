//! Error types for the RTU master stack
//!
//! Every fallible operation returns [`ModbusResult`]. Line-level failures
//! (timeout, CRC, malformed frames, UART errors) are retried inside a
//! transaction; exception responses and caller mistakes are not.

use thiserror::Error;

use crate::protocol::{ModbusException, ResultKind};

/// Result alias used across the crate
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Errors produced by the codec, the transaction executor, the registry and persistence
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModbusError {
    /// No complete frame arrived before the deadline
    #[error("Timeout during {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Received frame failed CRC validation
    #[error("CRC mismatch: expected 0x{expected:04X}, received 0x{actual:04X}")]
    CrcError { expected: u16, actual: u16 },

    /// Device answered with an exception response
    #[error("Exception 0x{code:02X} for function 0x{function:02X}: {message}")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// Frame passed CRC but is not a valid answer to the request
    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    /// UART or direction-control failure
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Master used before `init` or after `shutdown`
    #[error("Modbus master not initialized")]
    NotInitialized,

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Already exists: {what}")]
    AlreadyExists { what: String },

    #[error("Capacity exhausted: {what}")]
    ResourceExhausted { what: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Unsupported function code 0x{function:02X}")]
    NotSupported { function: u8 },

    /// Key-value persistence failure
    #[error("Storage error: {message}")]
    Storage { message: String },
}

impl ModbusError {
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Builds an exception error with the standard description for `code`
    pub fn exception(function: u8, code: u8) -> Self {
        Self::Exception {
            function,
            code,
            message: ModbusException::description(code).to_string(),
        }
    }

    pub fn invalid_response<S: Into<String>>(message: S) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }

    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn already_exists<S: Into<String>>(what: S) -> Self {
        Self::AlreadyExists { what: what.into() }
    }

    pub fn exhausted<S: Into<String>>(what: S) -> Self {
        Self::ResourceExhausted { what: what.into() }
    }

    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Whether another send/receive cycle may succeed where this one failed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::CrcError { .. }
                | Self::InvalidResponse { .. }
                | Self::Transport { .. }
        )
    }

    /// Exception code carried by an exception response, if any
    pub fn exception_code(&self) -> Option<u8> {
        match self {
            Self::Exception { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Flat status classification used for device health and status reports
    pub fn kind(&self) -> ResultKind {
        match self {
            Self::Timeout { .. } => ResultKind::Timeout,
            Self::CrcError { .. } => ResultKind::CrcError,
            Self::Exception { .. } => ResultKind::Exception,
            Self::Transport { .. } | Self::Storage { .. } => ResultKind::TransportError,
            Self::NotInitialized => ResultKind::NotInitialized,
            Self::InvalidResponse { .. }
            | Self::NotFound { .. }
            | Self::AlreadyExists { .. }
            | Self::ResourceExhausted { .. }
            | Self::InvalidArgument { .. }
            | Self::NotSupported { .. } => ResultKind::InvalidResponse,
        }
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::timeout("serial I/O", 0),
            _ => Self::transport(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_message() {
        let err = ModbusError::exception(0x03, 0x02);
        assert_eq!(err.exception_code(), Some(0x02));
        assert_eq!(
            err.to_string(),
            "Exception 0x02 for function 0x03: Illegal data address"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ModbusError::timeout("receive", 1000).is_retryable());
        assert!(ModbusError::CrcError {
            expected: 1,
            actual: 2
        }
        .is_retryable());
        assert!(ModbusError::transport("short write").is_retryable());
        assert!(!ModbusError::NotInitialized.is_retryable());
        assert!(!ModbusError::not_found("device 3").is_retryable());
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(ModbusError::timeout("x", 1).kind().as_str(), "Timeout");
        assert_eq!(
            ModbusError::CrcError {
                expected: 0,
                actual: 0
            }
            .kind()
            .as_str(),
            "CRC Error"
        );
        assert_eq!(ModbusError::transport("x").kind().as_str(), "UART Error");
        assert_eq!(
            ModbusError::NotInitialized.kind().as_str(),
            "Not Initialized"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let err: ModbusError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, ModbusError::Transport { .. }));
    }
}
