//! Error types for fabricip.

use std::fmt;
use std::io;

/// Result type for fabricip operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// I/O error from socket setup or network operations
    Io(io::Error),
    /// Configuration error (bad file, missing instance/alias, bad reference)
    Config(ConfigError),
    /// A request hit its deadline without a response
    Timeout,
    /// No interface can reach the target, or no peer endpoint is known
    Unreachable,
    /// Service was not discovered within the configured timeout
    ServiceUnavailable,
    /// The runtime has shut down
    Shutdown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Timeout => write!(f, "Request timed out"),
            Error::Unreachable => write!(f, "Target endpoint is unreachable"),
            Error::ServiceUnavailable => write!(f, "Service unavailable"),
            Error::Shutdown => write!(f, "Runtime has shut down"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Configuration error
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}
