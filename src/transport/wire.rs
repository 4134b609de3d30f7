//! On-the-wire frame format.
//!
//! Every frame is a length-prefixed packet: 4-byte command id (LE), 1-byte
//! packet type, 4-byte sequence number (LE), then a payload whose atoms are
//! encoded back to back: `i` as i32 LE, `d` as IEEE-754 f64 LE, `s` as a
//! u32-length-prefixed UTF-8 string. There is no format string on the wire
//! itself — the command id tells both sides which format to expect, exactly
//! as the compile-time command table in spec.md §6 describes.

use std::io;

use crate::error::{Result, WidgetError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Req,
    ReqNoAck,
    Ack,
}

impl PacketType {
    fn to_byte(self) -> u8 {
        match self {
            PacketType::Req => 0,
            PacketType::ReqNoAck => 1,
            PacketType::Ack => 2,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(PacketType::Req),
            1 => Ok(PacketType::ReqNoAck),
            2 => Ok(PacketType::Ack),
            other => Err(WidgetError::InvalidArgument(format!("unknown packet type {other}"))),
        }
    }
}

/// A single decoded payload atom.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Double(f64),
    Str(String),
}

impl Value {
    pub fn as_int(&self) -> Result<i32> {
        match self {
            Value::Int(v) => Ok(*v),
            _ => Err(WidgetError::InvalidArgument("expected int atom".into())),
        }
    }

    pub fn as_double(&self) -> Result<f64> {
        match self {
            Value::Double(v) => Ok(*v),
            _ => Err(WidgetError::InvalidArgument("expected double atom".into())),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Str(v) => Ok(v.as_str()),
            _ => Err(WidgetError::InvalidArgument("expected string atom".into())),
        }
    }
}

/// A complete frame: header plus decoded payload atoms.
#[derive(Debug, Clone)]
pub struct Frame {
    pub command_id: u32,
    pub packet_type: PacketType,
    pub sequence: u32,
    pub values: Vec<Value>,
}

impl Frame {
    pub fn new(command_id: u32, packet_type: PacketType, sequence: u32) -> Self {
        Self { command_id, packet_type, sequence, values: Vec::new() }
    }

    pub fn push_int(mut self, v: i32) -> Self {
        self.values.push(Value::Int(v));
        self
    }

    pub fn push_double(mut self, v: f64) -> Self {
        self.values.push(Value::Double(v));
        self
    }

    pub fn push_str(mut self, v: impl Into<String>) -> Self {
        self.values.push(Value::Str(v.into()));
        self
    }

    /// Builds a reply frame preserving the originating frame's sequence
    /// number and command id, as spec.md's "reply" send mode requires.
    pub fn reply_to(request: &Frame) -> Self {
        Self::new(request.command_id, PacketType::Ack, request.sequence)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        for value in &self.values {
            match value {
                Value::Int(v) => {
                    payload.push(b'i');
                    payload.extend_from_slice(&v.to_le_bytes());
                }
                Value::Double(v) => {
                    payload.push(b'd');
                    payload.extend_from_slice(&v.to_le_bytes());
                }
                Value::Str(v) => {
                    payload.push(b's');
                    payload.extend_from_slice(&(v.len() as u32).to_le_bytes());
                    payload.extend_from_slice(v.as_bytes());
                }
            }
        }

        let mut out = Vec::with_capacity(4 + 1 + 4 + 4 + payload.len());
        out.extend_from_slice(&(payload.len() as u32 + 9).to_le_bytes());
        out.extend_from_slice(&self.command_id.to_le_bytes());
        out.push(self.packet_type.to_byte());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&payload);
        out
    }

    /// Decodes one frame's body (the length prefix has already been
    /// stripped and used to size `body` by the caller).
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < 9 {
            return Err(WidgetError::InvalidArgument("frame too short".into()));
        }
        let command_id = u32::from_le_bytes(body[0..4].try_into().unwrap());
        let packet_type = PacketType::from_byte(body[4])?;
        let sequence = u32::from_le_bytes(body[5..9].try_into().unwrap());

        let mut values = Vec::new();
        let mut cursor = 9usize;
        while cursor < body.len() {
            let tag = body[cursor];
            cursor += 1;
            match tag {
                b'i' => {
                    let bytes = read_exact(body, cursor, 4)?;
                    values.push(Value::Int(i32::from_le_bytes(bytes.try_into().unwrap())));
                    cursor += 4;
                }
                b'd' => {
                    let bytes = read_exact(body, cursor, 8)?;
                    values.push(Value::Double(f64::from_le_bytes(bytes.try_into().unwrap())));
                    cursor += 8;
                }
                b's' => {
                    let len_bytes = read_exact(body, cursor, 4)?;
                    let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
                    cursor += 4;
                    let str_bytes = read_exact(body, cursor, len)?;
                    let s = std::str::from_utf8(str_bytes)
                        .map_err(|e| WidgetError::InvalidArgument(e.to_string()))?;
                    values.push(Value::Str(s.to_string()));
                    cursor += len;
                }
                other => {
                    return Err(WidgetError::InvalidArgument(format!("unknown atom tag {other}")))
                }
            }
        }

        Ok(Self { command_id, packet_type, sequence, values })
    }
}

fn read_exact(body: &[u8], at: usize, len: usize) -> Result<&[u8]> {
    body.get(at..at + len)
        .ok_or_else(|| WidgetError::InvalidArgument("truncated frame".into()))
}

/// Reads the 4-byte little-endian length prefix that precedes every frame
/// body on the wire.
pub fn decode_length_prefix(bytes: [u8; 4]) -> usize {
    u32::from_le_bytes(bytes) as usize
}

pub fn io_err(e: io::Error) -> WidgetError {
    WidgetError::Io(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_atom_kind() {
        let frame = Frame::new(42, PacketType::Req, 7)
            .push_int(-5)
            .push_double(3.5)
            .push_str("hello");
        let bytes = frame.encode();
        let len = decode_length_prefix(bytes[0..4].try_into().unwrap());
        assert_eq!(len, bytes.len() - 4);

        let decoded = Frame::decode(&bytes[4..]).unwrap();
        assert_eq!(decoded.command_id, 42);
        assert_eq!(decoded.packet_type, PacketType::Req);
        assert_eq!(decoded.sequence, 7);
        assert_eq!(decoded.values[0].as_int().unwrap(), -5);
        assert_eq!(decoded.values[1].as_double().unwrap(), 3.5);
        assert_eq!(decoded.values[2].as_str().unwrap(), "hello");
    }

    #[test]
    fn reply_preserves_sequence_and_command() {
        let request = Frame::new(9, PacketType::Req, 123);
        let reply = Frame::reply_to(&request).push_int(0);
        assert_eq!(reply.command_id, 9);
        assert_eq!(reply.sequence, 123);
        assert_eq!(reply.packet_type, PacketType::Ack);
    }

    #[test]
    fn rejects_truncated_frame() {
        let bytes = vec![1, 2, 3];
        assert!(Frame::decode(&bytes).is_err());
    }

    #[test]
    fn empty_string_round_trips() {
        let frame = Frame::new(1, PacketType::ReqNoAck, 0).push_str("");
        let bytes = frame.encode();
        let decoded = Frame::decode(&bytes[4..]).unwrap();
        assert_eq!(decoded.values[0].as_str().unwrap(), "");
    }
}
