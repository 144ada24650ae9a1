//! Error classification shared by every component
//!
//! Each module defines its own error enum (the way the signaling codec
//! defines `EncodeError`/`DecodeError`). This module only provides the
//! common taxonomy used to decide what happens next:
//!
//! ```text
//! Transient -> retry with backoff, bounded attempts
//! Protocol  -> drop / reject, log, count, never crash
//! Resource  -> fail the request immediately with a typed error
//! Fatal     -> surface to the operator, stop the affected peer / engine
//! ```

use std::fmt;

/// How an error should be handled by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Timeout, packet loss, temporary throttling
    Transient,
    /// Malformed message, failed handshake, replay
    Protocol,
    /// Quota exceeded, too many concurrent operations
    Resource,
    /// Local interface unavailable, identity missing
    Fatal,
}

impl ErrorClass {
    /// Whether an operation failing with this class may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Protocol => write!(f, "protocol"),
            ErrorClass::Resource => write!(f, "resource"),
            ErrorClass::Fatal => write!(f, "fatal"),
        }
    }
}

/// Implemented by every error type in the crate
pub trait Classify {
    fn class(&self) -> ErrorClass;
}
