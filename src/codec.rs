use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::{ProtocolError, WsError};
use crate::frame::{apply_mask, parse_opcode, Frame, OpCode};
use crate::protocol::{close_code, is_valid_close_code};

/// which end of the connection this endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// initiated the connection, sends masked frames
    Client,
    /// accepted the connection, sends unmasked frames
    Server,
}

/// default websocket frame encoder
///
/// client role draws a fresh random masking key for every frame,
/// server role never masks
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    /// local role
    pub role: Role,
}

impl Encoder<Frame> for FrameEncoder {
    type Error = WsError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mask: Option<[u8; 4]> = match self.role {
            Role::Client => Some(rand::random()),
            Role::Server => None,
        };
        let len = item.payload.len();
        dst.reserve(14 + len);
        dst.put_u8(((item.fin as u8) << 7) | item.opcode.as_u8());
        let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
        match len {
            0..=125 => dst.put_u8(mask_bit | len as u8),
            126..=65535 => {
                dst.put_u8(mask_bit | 126);
                dst.put_u16(len as u16);
            }
            _ => {
                dst.put_u8(mask_bit | 127);
                dst.put_u64(len as u64);
            }
        }
        if let Some(key) = mask {
            dst.put_slice(&key);
            let payload_start = dst.len();
            dst.put_slice(&item.payload);
            apply_mask(&mut dst[payload_start..], key);
        } else {
            dst.put_slice(&item.payload);
        }
        Ok(())
    }
}

/// default websocket frame decoder
///
/// works over a growing read buffer so a cancelled read (deadline fired
/// mid frame) never desynchronizes the stream
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    /// local role, decides the expected mask direction
    pub role: Role,
    /// largest acceptable single frame payload
    pub max_payload_len: u64,
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = WsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            src.reserve(2 - src.len());
            return Ok(None);
        }
        let b0 = src[0];
        let b1 = src[1];
        if b0 & 0x70 != 0 {
            return Err(WsError::protocol(
                close_code::PROTOCOL_ERROR,
                ProtocolError::InvalidLeadingBits(b0 >> 4),
            ));
        }
        let opcode = parse_opcode(b0).map_err(|code| {
            WsError::protocol(close_code::PROTOCOL_ERROR, ProtocolError::InvalidOpcode(code))
        })?;
        let fin = b0 & 0x80 != 0;
        let masked = b1 & 0x80 != 0;
        match self.role {
            Role::Server if !masked => {
                return Err(WsError::protocol(
                    close_code::PROTOCOL_ERROR,
                    ProtocolError::UnmaskedFrame,
                ));
            }
            Role::Client if masked => {
                return Err(WsError::protocol(
                    close_code::PROTOCOL_ERROR,
                    ProtocolError::MaskedFrame,
                ));
            }
            _ => {}
        }
        let (len_occupied, payload_len) = match b1 & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (2usize, u16::from_be_bytes([src[2], src[3]]) as u64)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&src[2..10]);
                let len = u64::from_be_bytes(arr);
                if len >> 63 != 0 {
                    return Err(WsError::protocol(
                        close_code::PROTOCOL_ERROR,
                        ProtocolError::InvalidExtendedLen,
                    ));
                }
                (8usize, len)
            }
            len => (0usize, len as u64),
        };
        if opcode.is_control() {
            if !fin {
                return Err(WsError::protocol(
                    close_code::PROTOCOL_ERROR,
                    ProtocolError::FragmentedControlFrame,
                ));
            }
            if payload_len > 125 {
                return Err(WsError::protocol(
                    close_code::PROTOCOL_ERROR,
                    ProtocolError::ControlFrameTooBig(payload_len as usize),
                ));
            }
        }
        if payload_len > self.max_payload_len {
            return Err(WsError::protocol(
                close_code::MESSAGE_TOO_BIG,
                ProtocolError::PayloadTooLarge(payload_len, self.max_payload_len),
            ));
        }
        let header_len = 2 + len_occupied + if masked { 4 } else { 0 };
        let expected_len = header_len + payload_len as usize;
        if src.len() < expected_len {
            src.reserve(expected_len - src.len());
            return Ok(None);
        }
        let mut key = [0u8; 4];
        if masked {
            key.copy_from_slice(&src[2 + len_occupied..2 + len_occupied + 4]);
        }
        src.advance(header_len);
        let mut payload = src.split_to(payload_len as usize);
        if masked {
            apply_mask(&mut payload, key);
        }
        if opcode == OpCode::Close {
            check_close_payload(&payload)?;
        }
        Ok(Some(Frame {
            fin,
            opcode,
            payload,
        }))
    }
}

fn check_close_payload(payload: &[u8]) -> Result<(), WsError> {
    match payload.len() {
        0 => Ok(()),
        1 => Err(WsError::protocol(
            close_code::PROTOCOL_ERROR,
            ProtocolError::InvalidCloseFramePayload,
        )),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_valid_close_code(code) {
                return Err(WsError::protocol(
                    close_code::PROTOCOL_ERROR,
                    ProtocolError::InvalidCloseCode(code),
                ));
            }
            if std::str::from_utf8(&payload[2..]).is_err() {
                return Err(WsError::protocol(
                    close_code::INVALID_PAYLOAD,
                    ProtocolError::InvalidUtf8,
                ));
            }
            Ok(())
        }
    }
}

/// frame encoder and decoder in one place, for driving a stream directly
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// encoder half
    pub encoder: FrameEncoder,
    /// decoder half
    pub decoder: FrameDecoder,
}

impl FrameCodec {
    /// construct codec for one role with a frame payload limit
    pub fn new(role: Role, max_payload_len: u64) -> Self {
        Self {
            encoder: FrameEncoder { role },
            decoder: FrameDecoder {
                role,
                max_payload_len,
            },
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WsError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }
}
