use std::io;
use thiserror::Error;

/// Custom error types for the RAMSES-II protocol engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Structural error: {0}")]
    Structure(String),

    #[error("Corrupt address set: {0}")]
    AddrSet(String),

    #[error("Command error: {0}")]
    Command(String),

    #[error("Protocol timeout: {0}")]
    Timeout(String),

    #[error("Binding flow error: {0}")]
    BindFlow(String),

    #[error("Binding retry limit exceeded: {0}")]
    BindRetry(String),

    #[error("Binding timeout: {0}")]
    BindTimeout(String),

    #[error("Corrupt schedule: {0}")]
    Schedule(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new structural error
    pub fn structure(msg: impl Into<String>) -> Self {
        Error::Structure(msg.into())
    }

    /// Creates a new corrupt-address-set error
    pub fn addr_set(msg: impl Into<String>) -> Self {
        Error::AddrSet(msg.into())
    }

    /// Creates a new command validation error
    pub fn command(msg: impl Into<String>) -> Self {
        Error::Command(msg.into())
    }

    /// Creates a new protocol timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    /// Creates a new binding flow error
    pub fn bind_flow(msg: impl Into<String>) -> Self {
        Error::BindFlow(msg.into())
    }

    /// Creates a new binding retry-limit error
    pub fn bind_retry(msg: impl Into<String>) -> Self {
        Error::BindRetry(msg.into())
    }

    /// Creates a new binding timeout error
    pub fn bind_timeout(msg: impl Into<String>) -> Self {
        Error::BindTimeout(msg.into())
    }

    /// Creates a new corrupt schedule error
    pub fn schedule(msg: impl Into<String>) -> Self {
        Error::Schedule(msg.into())
    }

    /// Creates a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::structure("bad frame");
        assert!(matches!(err, Error::Structure(_)));
        assert_eq!(err.to_string(), "Structural error: bad frame");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
