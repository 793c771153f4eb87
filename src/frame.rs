use bytes::{BufMut, BytesMut};

use crate::errors::WsError;

/// Defines the interpretation of the "Payload data".  If an unknown
/// opcode is received, the receiving endpoint MUST _Fail the
/// WebSocket Connection_.  The following values are defined.
/// - x0 denotes a continuation frame
/// - x1 denotes a text frame
/// - x2 denotes a binary frame
/// - x8 denotes a connection close
/// - x9 denotes a ping
/// - xA denotes a pong
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// - x0 denotes a continuation frame
    Continue,
    /// - x1 denotes a text frame
    Text,
    /// - x2 denotes a binary frame
    Binary,
    /// - x8 denotes a connection close
    Close,
    /// - x9 denotes a ping
    Ping,
    /// - xA denotes a pong
    Pong,
}

impl OpCode {
    /// get corresponding u8 value
    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0,
            OpCode::Text => 1,
            OpCode::Binary => 2,
            OpCode::Close => 8,
            OpCode::Ping => 9,
            OpCode::Pong => 10,
        }
    }

    /// check is close/ping/pong
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// check is text/binary/continuation
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Text | Self::Binary | Self::Continue)
    }
}

/// x3-7 and xB-F are reserved, the rest map onto [OpCode]
#[inline]
pub(crate) fn parse_opcode(val: u8) -> Result<OpCode, u8> {
    match val & 0x0F {
        0 => Ok(OpCode::Continue),
        1 => Ok(OpCode::Text),
        2 => Ok(OpCode::Binary),
        8 => Ok(OpCode::Close),
        9 => Ok(OpCode::Ping),
        10 => Ok(OpCode::Pong),
        other => Err(other),
    }
}

/// xor payload bytes with the 4 byte masking key, in place
#[inline]
pub(crate) fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b ^= mask[i % 4];
    }
}

/// a single websocket transport unit
///
/// masking is a codec concern, payload here is always the clear data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// final fragment flag
    pub fin: bool,
    /// frame opcode
    pub opcode: OpCode,
    /// unmasked payload data
    pub payload: BytesMut,
}

impl Frame {
    /// construct new frame
    pub fn new(fin: bool, opcode: OpCode, data: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(data.len());
        payload.extend_from_slice(data);
        Self {
            fin,
            opcode,
            payload,
        }
    }

    /// helper function to construct a single frame text message
    pub fn text(data: &str) -> Self {
        Self::new(true, OpCode::Text, data.as_bytes())
    }

    /// helper function to construct a single frame binary message
    pub fn binary(data: &[u8]) -> Self {
        Self::new(true, OpCode::Binary, data)
    }

    /// helper function to construct a ping frame
    pub fn ping(data: &[u8]) -> Self {
        assert!(data.len() <= 125);
        Self::new(true, OpCode::Ping, data)
    }

    /// helper function to construct a pong frame
    pub fn pong(data: &[u8]) -> Self {
        assert!(data.len() <= 125);
        Self::new(true, OpCode::Pong, data)
    }

    /// helper function to construct a close frame
    ///
    /// the reason is truncated so that code + reason fit the 125 byte
    /// control frame budget; a close without code carries no payload
    pub fn close(code: impl Into<Option<u16>>, reason: &str) -> Self {
        let mut payload = BytesMut::new();
        if let Some(code) = code.into() {
            payload.put_u16(code);
            payload.extend_from_slice(truncate_utf8(reason, 123).as_bytes());
        }
        Self {
            fin: true,
            opcode: OpCode::Close,
            payload,
        }
    }

    /// close code carried by a close frame payload, if any
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode == OpCode::Close && self.payload.len() >= 2 {
            Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
        } else {
            None
        }
    }

    /// close reason carried by a close frame payload
    ///
    /// decoder validated payload already, lossy conversion never kicks in
    pub fn close_reason(&self) -> String {
        if self.opcode == OpCode::Close && self.payload.len() > 2 {
            String::from_utf8_lossy(&self.payload[2..]).to_string()
        } else {
            String::new()
        }
    }
}

/// cut str down to at most `max` bytes on a char boundary
pub(crate) fn truncate_utf8(source: &str, max: usize) -> &str {
    if source.len() <= max {
        return source;
    }
    let mut end = max;
    while !source.is_char_boundary(end) {
        end -= 1;
    }
    &source[..end]
}

/// one logical application payload, reassembled from data frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// [OpCode::Text] or [OpCode::Binary]
    pub code: OpCode,
    /// complete payload; for text messages guaranteed valid utf-8
    pub data: BytesMut,
}

impl Message {
    /// check message is text
    pub fn is_text(&self) -> bool {
        self.code == OpCode::Text
    }

    /// view payload as str for text messages
    pub fn as_text(&self) -> Option<&str> {
        if self.is_text() {
            std::str::from_utf8(&self.data).ok()
        } else {
            None
        }
    }

    /// consume message, return owned text payload
    pub fn into_text(self) -> Result<String, WsError> {
        String::from_utf8(self.data.to_vec()).map_err(|_| WsError::protocol(
            crate::protocol::close_code::INVALID_PAYLOAD,
            crate::errors::ProtocolError::InvalidUtf8,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_parse_accepts_known_rejects_reserved() {
        assert_eq!(parse_opcode(0x0), Ok(OpCode::Continue));
        assert_eq!(parse_opcode(0x1), Ok(OpCode::Text));
        assert_eq!(parse_opcode(0x2), Ok(OpCode::Binary));
        assert_eq!(parse_opcode(0x8), Ok(OpCode::Close));
        assert_eq!(parse_opcode(0x9), Ok(OpCode::Ping));
        assert_eq!(parse_opcode(0xA), Ok(OpCode::Pong));
        for reserved in (0x3..=0x7).chain(0xB..=0xF) {
            assert_eq!(parse_opcode(reserved), Err(reserved));
        }
    }

    #[test]
    fn mask_is_involution() {
        let mask = [0x12, 0x34, 0x56, 0x78];
        let source = b"some not so random payload bytes".to_vec();
        let mut buf = source.clone();
        apply_mask(&mut buf, mask);
        assert_ne!(buf, source);
        apply_mask(&mut buf, mask);
        assert_eq!(buf, source);
    }

    #[test]
    fn close_frame_payload_layout() {
        let frame = Frame::close(1000, "bye");
        assert_eq!(&frame.payload[..], &[0x03, 0xE8, b'b', b'y', b'e']);
        assert_eq!(frame.close_code(), Some(1000));
        assert_eq!(frame.close_reason(), "bye");

        let frame = Frame::close(None, "ignored without code");
        assert!(frame.payload.is_empty());
        assert_eq!(frame.close_code(), None);
    }

    #[test]
    fn close_reason_truncated_to_control_budget() {
        let long = "x".repeat(200);
        let frame = Frame::close(1001, &long);
        assert_eq!(frame.payload.len(), 125);
    }

    #[test]
    fn truncate_respects_char_boundary() {
        // é is two bytes, cutting at 3 must back off to 2
        assert_eq!(truncate_utf8("éé", 3), "é");
        assert_eq!(truncate_utf8("abc", 3), "abc");
    }
}
