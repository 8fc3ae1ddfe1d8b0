//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
///
/// Every variant describes a frame or text line that cannot be turned into a
/// [`Message`](crate::Message). The network engine treats all of them as a
/// malformed frame and drops it without reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer shorter than the header plus the declared payload length
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required by the header and declared payload length
        needed: usize,
        /// Bytes actually present
        available: usize,
    },

    /// Declared payload length exceeds the single-packet limit
    #[error("payload length {0} exceeds maximum")]
    Size(usize),

    /// Unknown command value
    #[error("unknown command {0}")]
    Command(u8),

    /// Unknown payload type value
    #[error("unknown payload type {0}")]
    PayloadType(u8),

    /// Payload length does not match the fixed width of its type
    #[error("payload length {length} invalid for {payload_type:?}")]
    PayloadLength {
        /// Declared payload type
        payload_type: crate::PayloadType,
        /// Declared payload length
        length: usize,
    },

    /// Text bridge line could not be parsed
    #[error("malformed text line: {0}")]
    Text(String),
}
