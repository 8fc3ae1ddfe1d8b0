//! Fixed frame header.
//!
//! The header is seven bytes. Addresses come first so a relay can route
//! without looking at the payload. Two bytes pack several small fields
//! each. The bit layout is fixed so frames decode the same on every
//! platform.

use crate::payload::PayloadType;
use crate::WireError;
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// Protocol version stamped into every transmitted frame
pub const PROTOCOL_VERSION: u8 = 2;

/// Header size in bytes
pub const HEADER_SIZE: usize = 7;

/// Largest frame the radio carries in a single packet
pub const MAX_MESSAGE_LENGTH: usize = 32;

/// Largest payload that fits next to the header
pub const MAX_PAYLOAD: usize = MAX_MESSAGE_LENGTH - HEADER_SIZE;

/// Address of the gateway (tree root)
pub const GATEWAY_ADDRESS: u8 = 0;

/// Address every listening node receives
pub const BROADCAST_ADDRESS: u8 = 255;

/// Sentinel for "no node id assigned yet" and "parent unknown"
pub const AUTO: u8 = 255;

/// Child id addressing the node itself rather than one of its sensors
pub const NODE_CHILD_ID: u8 = 0;

const VERSION_MASK: u8 = 0x07;
const LENGTH_SHIFT: u8 = 3;
const COMMAND_MASK: u8 = 0x07;
const PAYLOAD_TYPE_SHIFT: u8 = 5;

/// Message commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Node or child sensor presentation
    Presentation = 0,
    /// Set a variable value
    Set = 1,
    /// Request a variable value
    Request = 2,
    /// Network-internal control message
    Internal = 3,
    /// Raw data stream (firmware and similar)
    Stream = 4,
}

impl TryFrom<u8> for Command {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Command::Presentation),
            1 => Ok(Command::Set),
            2 => Ok(Command::Request),
            3 => Ok(Command::Internal),
            4 => Ok(Command::Stream),
            _ => Err(WireError::Command(value)),
        }
    }
}

/// Sub-types of [`Command::Internal`]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InternalType {
    /// Battery level report (percent)
    BatteryLevel = 0,
    /// Time request / response (seconds since epoch)
    Time = 1,
    /// Protocol version request
    Version = 2,
    /// Node asks the gateway for an id
    IdRequest = 3,
    /// Gateway answers with an id
    IdResponse = 4,
    /// Controller inclusion mode
    InclusionMode = 5,
    /// Controller configuration exchange
    Config = 6,
    /// Broadcast search for a parent
    FindParent = 7,
    /// Repeater answer to a parent search, carries its distance
    FindParentResponse = 8,
    /// Free-form log line
    LogMessage = 9,
    /// Child route administration
    Children = 10,
    /// Sketch name
    SketchName = 11,
    /// Sketch version
    SketchVersion = 12,
    /// Reboot request from the gateway
    Reboot = 13,
}

impl InternalType {
    /// Map a raw type byte to an internal sub-type
    pub fn from_u8(value: u8) -> Option<Self> {
        let typ = match value {
            0 => InternalType::BatteryLevel,
            1 => InternalType::Time,
            2 => InternalType::Version,
            3 => InternalType::IdRequest,
            4 => InternalType::IdResponse,
            5 => InternalType::InclusionMode,
            6 => InternalType::Config,
            7 => InternalType::FindParent,
            8 => InternalType::FindParentResponse,
            9 => InternalType::LogMessage,
            10 => InternalType::Children,
            11 => InternalType::SketchName,
            12 => InternalType::SketchVersion,
            13 => InternalType::Reboot,
            _ => return None,
        };
        Some(typ)
    }
}

/// Presentation sub-types describing a node's role
pub mod presentation {
    /// Plain sensor node
    pub const NODE: u8 = 17;
    /// Repeater-capable node
    pub const REPEATER_NODE: u8 = 18;
}

/// Library version announced in node presentations
pub const LIBRARY_VERSION: &str = "1.4";

bitflags! {
    /// Acknowledgement flags, stored in the control byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MessageFlags: u8 {
        /// Receiver should send back an application-level ack
        const REQUEST_ACK = 1 << 3;
        /// This frame is the ack
        const IS_ACK = 1 << 4;
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Previous hop that transmitted the frame
    pub last: u8,
    /// Originating node
    pub sender: u8,
    /// Final destination
    pub destination: u8,
    /// Protocol version (3 bits)
    pub version: u8,
    /// Payload length in bytes
    pub length: u8,
    /// Command
    pub command: Command,
    /// Ack flags
    pub flags: MessageFlags,
    /// Payload representation
    pub payload_type: PayloadType,
    /// Command-specific sub-type
    pub msg_type: u8,
    /// Child sensor id on the sender
    pub child_id: u8,
}

impl Header {
    /// Encode the header (7 bytes)
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.last);
        buf.put_u8(self.sender);
        buf.put_u8(self.destination);
        buf.put_u8((self.version & VERSION_MASK) | (self.length << LENGTH_SHIFT));
        buf.put_u8(
            (self.command as u8 & COMMAND_MASK)
                | self.flags.bits()
                | ((self.payload_type as u8) << PAYLOAD_TYPE_SHIFT),
        );
        buf.put_u8(self.msg_type);
        buf.put_u8(self.child_id);
    }

    /// Decode the header
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        if buf.remaining() < HEADER_SIZE {
            return Err(WireError::Truncated {
                needed: HEADER_SIZE,
                available: buf.remaining(),
            });
        }

        let last = buf.get_u8();
        let sender = buf.get_u8();
        let destination = buf.get_u8();

        let version_length = buf.get_u8();
        let version = version_length & VERSION_MASK;
        let length = version_length >> LENGTH_SHIFT;
        if length as usize > MAX_PAYLOAD {
            return Err(WireError::Size(length as usize));
        }

        let control = buf.get_u8();
        let command = Command::try_from(control & COMMAND_MASK)?;
        let flags = MessageFlags::from_bits_truncate(control);
        let payload_type = PayloadType::try_from(control >> PAYLOAD_TYPE_SHIFT)?;

        let msg_type = buf.get_u8();
        let child_id = buf.get_u8();

        Ok(Self {
            last,
            sender,
            destination,
            version,
            length,
            command,
            flags,
            payload_type,
            msg_type,
            child_id,
        })
    }
}
