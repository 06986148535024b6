//! Error types for FerroDB
//!
//! Defines a unified error type that can represent errors from every
//! component (store, log, protocol, access control). Error messages are
//! formatted so they can be written directly into an `ERR ...`-style reply.

use std::fmt;
use std::io;

/// Unified error type for FerroDB operations
#[derive(Debug)]
pub enum FerroError {
    /// I/O error (log file operations, socket errors)
    Io(io::Error),
    /// Bad argument count or non-integer where an integer was expected
    Syntax(String),
    /// Invalid DB index, non-positive TTL, and similar range failures
    Range(String),
    /// Missing or failed authentication, or a permission check failure
    Auth(String),
    /// Malformed wire frame (bad RESP array, bad inline split)
    Protocol(String),
    /// Log write/rewrite failure reported back to the caller
    Storage(String),
    /// Fatal startup error (config load, log open, listener bind)
    Fatal(String),
}

impl fmt::Display for FerroError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FerroError::Io(e) => write!(f, "{}", e),
            FerroError::Syntax(msg) => write!(f, "{}", msg),
            FerroError::Range(msg) => write!(f, "{}", msg),
            FerroError::Auth(msg) => write!(f, "{}", msg),
            FerroError::Protocol(msg) => write!(f, "{}", msg),
            FerroError::Storage(msg) => write!(f, "{}", msg),
            FerroError::Fatal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for FerroError {}

impl From<io::Error> for FerroError {
    fn from(e: io::Error) -> Self {
        FerroError::Io(e)
    }
}

impl From<bcrypt::BcryptError> for FerroError {
    fn from(e: bcrypt::BcryptError) -> Self {
        FerroError::Auth(format!("ERR bcrypt error: {}", e))
    }
}

/// Result type alias for FerroDB operations
pub type Result<T> = std::result::Result<T, FerroError>;
