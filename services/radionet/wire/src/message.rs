//! The message: the wire unit and the in-memory exchange object.

use crate::header::{
    Command, Header, InternalType, MessageFlags, HEADER_SIZE, MAX_MESSAGE_LENGTH, MAX_PAYLOAD,
    NODE_CHILD_ID, PROTOCOL_VERSION,
};
use crate::payload::Payload;
use crate::WireError;
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Stack buffer sized for the largest frame
pub type FrameBuf = SmallVec<[u8; MAX_MESSAGE_LENGTH]>;

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Previous hop; overwritten by every transmitter
    pub last: u8,
    /// Originating node
    pub sender: u8,
    /// Final destination
    pub destination: u8,
    /// Child sensor on the sender
    pub child_id: u8,
    /// Command
    pub command: Command,
    /// Command-specific sub-type
    pub msg_type: u8,
    /// Protocol version; stamped by the engine just before transmission
    pub version: u8,
    /// Ack flags
    pub flags: MessageFlags,
    /// Payload
    pub payload: Payload,
}

impl Message {
    /// Create a message addressed to the node itself (child 0) with an
    /// empty text payload
    pub fn new(command: Command, msg_type: u8, sender: u8, destination: u8) -> Self {
        Self {
            last: sender,
            sender,
            destination,
            child_id: NODE_CHILD_ID,
            command,
            msg_type,
            version: PROTOCOL_VERSION,
            flags: MessageFlags::empty(),
            payload: Payload::default(),
        }
    }

    /// Internal control message
    pub fn internal(typ: InternalType, sender: u8, destination: u8) -> Self {
        Self::new(Command::Internal, typ as u8, sender, destination)
    }

    /// Set the child sensor id
    pub fn with_child(mut self, child_id: u8) -> Self {
        self.child_id = child_id;
        self
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Ask the destination for an application-level ack
    pub fn with_request_ack(mut self, request_ack: bool) -> Self {
        self.flags.set(MessageFlags::REQUEST_ACK, request_ack);
        self
    }

    /// Whether the receiver should acknowledge
    pub fn request_ack(&self) -> bool {
        self.flags.contains(MessageFlags::REQUEST_ACK)
    }

    /// Whether this message is an ack
    pub fn is_ack(&self) -> bool {
        self.flags.contains(MessageFlags::IS_ACK)
    }

    /// Internal sub-type, if this is a known internal message
    pub fn internal_type(&self) -> Option<InternalType> {
        match self.command {
            Command::Internal => InternalType::from_u8(self.msg_type),
            _ => None,
        }
    }

    /// Whether this is the given internal message
    pub fn is_internal(&self, typ: InternalType) -> bool {
        self.internal_type() == Some(typ)
    }

    /// Acknowledgement for this message, sent back by `from`
    ///
    /// Child id, type and payload are kept. The ack flag replaces the
    /// request flag.
    pub fn ack(&self, from: u8) -> Message {
        let mut ack = self.clone();
        ack.sender = from;
        ack.last = from;
        ack.destination = self.sender;
        ack.flags.remove(MessageFlags::REQUEST_ACK);
        ack.flags.insert(MessageFlags::IS_ACK);
        ack
    }

    /// Header view of this message
    pub fn header(&self) -> Header {
        Header {
            last: self.last,
            sender: self.sender,
            destination: self.destination,
            version: self.version,
            length: self.payload.encoded_len() as u8,
            command: self.command,
            flags: self.flags,
            payload_type: self.payload.payload_type(),
            msg_type: self.msg_type,
            child_id: self.child_id,
        }
    }

    /// Total encoded size
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.encoded_len()
    }

    /// Write header and payload into `buf`. The payload length is not
    /// checked; use [`Message::encode`] for frames bound for the radio.
    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        self.header().encode(buf);
        self.payload.encode(buf);
    }

    /// Encode into a stack-allocated frame
    pub fn encode(&self) -> Result<FrameBuf, WireError> {
        let length = self.payload.encoded_len();
        if length > MAX_PAYLOAD {
            return Err(WireError::Size(length));
        }

        let mut raw = [0u8; MAX_MESSAGE_LENGTH];
        let mut cursor = &mut raw[..];
        self.encode_into(&mut cursor);
        Ok(FrameBuf::from_slice(&raw[..HEADER_SIZE + length]))
    }

    /// Decode a frame. Bytes past the declared payload length are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut cursor = bytes;
        let header = Header::decode(&mut cursor)?;

        let length = header.length as usize;
        if cursor.len() < length {
            return Err(WireError::Truncated {
                needed: HEADER_SIZE + length,
                available: bytes.len(),
            });
        }
        let payload = Payload::decode(header.payload_type, &cursor[..length])?;

        Ok(Self {
            last: header.last,
            sender: header.sender,
            destination: header.destination,
            child_id: header.child_id,
            command: header.command,
            msg_type: header.msg_type,
            version: header.version,
            flags: header.flags,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::PayloadBuf;
    use crate::header::{BROADCAST_ADDRESS, GATEWAY_ADDRESS};

    fn base() -> Message {
        Message::new(Command::Set, 0, 5, GATEWAY_ADDRESS).with_child(2)
    }

    #[test]
    fn test_every_payload_type_survives_the_wire() {
        let payloads = vec![
            Payload::text(""),
            Payload::text(&"a".repeat(MAX_PAYLOAD)),
            Payload::custom(&[]),
            Payload::custom(&[0xAB; MAX_PAYLOAD]),
            Payload::Byte(255),
            Payload::Int16(i16::MIN),
            Payload::UInt16(u16::MAX),
            Payload::Long32(-123_456),
            Payload::ULong32(u32::MAX),
            Payload::float(-12.75, 3),
        ];

        for payload in payloads {
            let msg = base().with_payload(payload).with_request_ack(true);
            let frame = msg.encode().unwrap();
            assert_eq!(frame.len(), msg.encoded_len());
            assert!(frame.len() <= MAX_MESSAGE_LENGTH);
            assert_eq!(Message::decode(&frame).unwrap(), msg);
        }
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let msg = base().with_payload(Payload::ULong32(99));
        let frame = msg.encode().unwrap();
        let err = Message::decode(&frame[..frame.len() - 1]).unwrap_err();
        assert_eq!(
            err,
            WireError::Truncated {
                needed: HEADER_SIZE + 4,
                available: HEADER_SIZE + 3
            }
        );
    }

    #[test]
    fn test_padding_after_payload_ignored() {
        let msg = base().with_payload(Payload::Byte(1));
        let mut frame = msg.encode().unwrap().to_vec();
        frame.resize(MAX_MESSAGE_LENGTH, 0);
        assert_eq!(Message::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_version_is_preserved_not_checked() {
        let mut msg = base();
        msg.version = 1;
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.version, 1);
    }

    #[test]
    fn test_oversized_payload_not_encoded() {
        let msg = base().with_payload(Payload::Text(PayloadBuf::from_slice(&[b'x'; 30])));
        assert_eq!(msg.encode(), Err(WireError::Size(30)));
    }

    #[test]
    fn test_ack_swaps_endpoints() {
        let msg = Message::new(Command::Set, 3, 7, 12)
            .with_child(4)
            .with_payload(Payload::text("on"))
            .with_request_ack(true);
        let ack = msg.ack(12);

        assert_eq!(ack.sender, 12);
        assert_eq!(ack.destination, 7);
        assert!(ack.is_ack());
        assert!(!ack.request_ack());
        assert_eq!(ack.child_id, 4);
        assert_eq!(ack.msg_type, 3);
        assert_eq!(ack.payload, msg.payload);
    }

    #[test]
    fn test_internal_type_only_for_internal_command() {
        let find = Message::internal(InternalType::FindParent, 9, BROADCAST_ADDRESS);
        assert!(find.is_internal(InternalType::FindParent));

        let set = Message::new(Command::Set, InternalType::FindParent as u8, 9, 0);
        assert_eq!(set.internal_type(), None);
    }
}
