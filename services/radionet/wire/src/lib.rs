//! Frame layout, typed payloads and the text bridge format for radionet.
//!
//! Every frame fits into a single radio packet of [`MAX_MESSAGE_LENGTH`]
//! bytes. Numeric payloads are little-endian on every platform.
//!
//! ## Wire Format
//!
//! ```text
//! +--------+--------+-------------+--------------------------------------+
//! | byte 0 | last   | byte 3      | version (bits 0-2) | length (3-7)    |
//! | byte 1 | sender | byte 4      | command (0-2) | req ack (3) |        |
//! | byte 2 | dest   |             | is ack (4) | payload type (5-7)      |
//! +--------+--------+-------------+--------------------------------------+
//! | byte 5 | type   | byte 6      | child id                             |
//! +--------+--------+-------------+--------------------------------------+
//! | payload (0..=25 bytes)                                               |
//! +----------------------------------------------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod header;
pub mod message;
pub mod payload;
pub mod text;

// Re-export main types
pub use error::WireError;
pub use header::{
    presentation, Command, Header, InternalType, MessageFlags, AUTO, BROADCAST_ADDRESS,
    GATEWAY_ADDRESS, HEADER_SIZE, LIBRARY_VERSION, MAX_MESSAGE_LENGTH, MAX_PAYLOAD,
    NODE_CHILD_ID, PROTOCOL_VERSION,
};
pub use message::{FrameBuf, Message};
pub use payload::{Payload, PayloadBuf, PayloadType};
pub use text::{parse_from_text, render_as_text};
