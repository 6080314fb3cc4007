//! Defines the protocol-level error type.

use thiserror::Error;

/// A generic protocol error.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A payload ended before a field could be read in full.
    #[error("truncated payload: needed {needed} more bytes, {remaining} available")]
    Truncated {
        /// Bytes the current field still required.
        needed: usize,
        /// Bytes left in the payload.
        remaining: usize,
    },
    /// The message is structurally invalid.
    #[error("invalid wire message: {0}")]
    Invalid(String),
    /// An I/O error occurred while reading or writing a frame.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
