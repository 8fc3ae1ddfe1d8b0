//! Text bridge line format.
//!
//! One message per line:
//!
//! ```text
//! node;child;command;type;payload_type;payload\n
//! ```
//!
//! Outbound lines carry the sender in the `node` field. Inbound lines name
//! the destination there and are treated as originating at the gateway.
//! Opaque payloads and stream commands are written as uppercase hex.

use crate::header::{Command, GATEWAY_ADDRESS};
use crate::message::Message;
use crate::payload::{Payload, PayloadBuf, PayloadType};
use crate::WireError;
use std::fmt::Write;

const FIELD_COUNT: usize = 6;

/// Render the payload as text
pub fn payload_text(msg: &Message) -> String {
    if msg.command == Command::Stream {
        let mut raw = Vec::with_capacity(msg.payload.encoded_len());
        msg.payload.encode(&mut raw);
        return hex_upper(&raw);
    }

    match &msg.payload {
        Payload::Text(b) => String::from_utf8_lossy(b).into_owned(),
        Payload::Custom(b) => hex_upper(b),
        Payload::Byte(v) => v.to_string(),
        Payload::Int16(v) => v.to_string(),
        Payload::UInt16(v) => v.to_string(),
        Payload::Long32(v) => v.to_string(),
        Payload::ULong32(v) => v.to_string(),
        Payload::Float32 { value, precision } => format!("{:.*}", *precision as usize, value),
    }
}

/// Render a message as a newline-terminated bridge line
pub fn render_as_text(msg: &Message) -> String {
    format!(
        "{};{};{};{};{};{}\n",
        msg.sender,
        msg.child_id,
        msg.command as u8,
        msg.msg_type,
        msg.payload.payload_type() as u8,
        payload_text(msg)
    )
}

/// Parse a bridge line into a message from the gateway to `node`
pub fn parse_from_text(line: &str) -> Result<Message, WireError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let fields: Vec<&str> = line.splitn(FIELD_COUNT, ';').collect();
    if fields.len() != FIELD_COUNT {
        return Err(WireError::Text(format!(
            "expected {} fields, got {}",
            FIELD_COUNT,
            fields.len()
        )));
    }

    let destination = field_u8(fields[0], "node")?;
    let child_id = field_u8(fields[1], "child")?;
    let command = Command::try_from(field_u8(fields[2], "command")?)?;
    let msg_type = field_u8(fields[3], "type")?;
    let payload_type = PayloadType::try_from(field_u8(fields[4], "payload type")?)?;
    let payload = parse_payload(command, payload_type, fields[5])?;

    Ok(Message::new(command, msg_type, GATEWAY_ADDRESS, destination)
        .with_child(child_id)
        .with_payload(payload))
}

fn parse_payload(command: Command, payload_type: PayloadType, text: &str) -> Result<Payload, WireError> {
    if command == Command::Stream {
        return Payload::decode(payload_type, &hex_decode(text)?);
    }

    let bad = || WireError::Text(format!("invalid {:?} payload {:?}", payload_type, text));
    let payload = match payload_type {
        PayloadType::String => {
            if text.len() > crate::MAX_PAYLOAD {
                return Err(WireError::Size(text.len()));
            }
            Payload::Text(PayloadBuf::from_slice(text.as_bytes()))
        }
        PayloadType::Custom => Payload::decode(payload_type, &hex_decode(text)?)?,
        PayloadType::Byte => Payload::Byte(text.trim().parse().map_err(|_| bad())?),
        PayloadType::Int16 => Payload::Int16(text.trim().parse().map_err(|_| bad())?),
        PayloadType::UInt16 => Payload::UInt16(text.trim().parse().map_err(|_| bad())?),
        PayloadType::Long32 => Payload::Long32(text.trim().parse().map_err(|_| bad())?),
        PayloadType::ULong32 => Payload::ULong32(text.trim().parse().map_err(|_| bad())?),
        PayloadType::Float32 => {
            let text = text.trim();
            let value = text.parse().map_err(|_| bad())?;
            let precision = text
                .split_once('.')
                .map(|(_, decimals)| decimals.len().min(u8::MAX as usize) as u8)
                .unwrap_or(0);
            Payload::Float32 { value, precision }
        }
    };
    Ok(payload)
}

fn field_u8(field: &str, name: &str) -> Result<u8, WireError> {
    field
        .trim()
        .parse()
        .map_err(|_| WireError::Text(format!("invalid {} field {:?}", name, field)))
}

fn hex_upper(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02X}", b);
    }
    out
}

fn hex_decode(text: &str) -> Result<Vec<u8>, WireError> {
    let text = text.trim();
    if text.len() % 2 != 0 {
        return Err(WireError::Text(format!("odd-length hex payload {:?}", text)));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            text.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| WireError::Text(format!("invalid hex payload {:?}", text)))
        })
        .collect()
}
