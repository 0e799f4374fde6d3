use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{PeerId, PieceBitfield, PieceIdx};

const HANDSHAKE_HEADER: &[u8; 18] = b"P2PFILESHARINGPROJ";
const HANDSHAKE_PADDING_LENGTH: usize = 10;
const HANDSHAKE_PEERID_IDX: usize = HANDSHAKE_HEADER.len() + HANDSHAKE_PADDING_LENGTH;
pub const HANDSHAKE_LENGTH: usize = HANDSHAKE_PEERID_IDX + 4;

/// Longest frame we are willing to buffer. Pieces are the only variable-size
/// payload and are bounded by the configured piece size; anything above this
/// is a corrupt length prefix, not a real message.
pub const MAX_FRAME_LENGTH: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("handshake rejected: {0}")]
    Handshake(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn malformed(reason: impl Into<String>) -> WireError {
    WireError::MalformedFrame(reason.into())
}

#[derive(Debug, Clone)]
pub enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: PieceIdx },
    Bitfield { bitfield: PieceBitfield },
    Request { index: PieceIdx },
    Piece { index: PieceIdx, data: Bytes },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageKind {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
}

impl MessageKind {
    fn from_u8(kind: u8) -> Option<MessageKind> {
        match kind {
            0 => Some(MessageKind::Choke),
            1 => Some(MessageKind::Unchoke),
            2 => Some(MessageKind::Interested),
            3 => Some(MessageKind::NotInterested),
            4 => Some(MessageKind::Have),
            5 => Some(MessageKind::Bitfield),
            6 => Some(MessageKind::Request),
            7 => Some(MessageKind::Piece),
            _ => None,
        }
    }

    fn to_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub peer_id: PeerId,
}

/// Fixed 32 bytes: the ASCII header, 10 zero bytes, then the peer id as four
/// zero-left-padded ASCII digits.
pub fn encode_handshake(peer_id: PeerId) -> [u8; HANDSHAKE_LENGTH] {
    let mut buf = [0u8; HANDSHAKE_LENGTH];
    buf[..HANDSHAKE_HEADER.len()].copy_from_slice(HANDSHAKE_HEADER);
    let digits = format!("{:04}", u32::from(peer_id));
    debug_assert_eq!(digits.len(), 4, "peer ids are validated at config load");
    buf[HANDSHAKE_PEERID_IDX..].copy_from_slice(digits.as_bytes());
    buf
}

pub fn decode_handshake(buf: &[u8; HANDSHAKE_LENGTH]) -> Result<Handshake, WireError> {
    if &buf[..HANDSHAKE_HEADER.len()] != HANDSHAKE_HEADER {
        return Err(WireError::Handshake("header mismatch".to_owned()));
    }
    let digits = std::str::from_utf8(&buf[HANDSHAKE_PEERID_IDX..])
        .map_err(|_| WireError::Handshake("peer id field is not ASCII".to_owned()))?;
    let id: u32 = digits
        .trim_matches(|c: char| c == '\0' || c == ' ')
        .parse()
        .map_err(|_| WireError::Handshake(format!("peer id field {digits:?} is not a number")))?;
    Ok(Handshake {
        peer_id: PeerId::new(id),
    })
}

pub async fn write_handshake_async<W: AsyncWrite + Unpin>(
    mut writer: W,
    peer_id: PeerId,
) -> Result<(), WireError> {
    writer.write_all(&encode_handshake(peer_id)).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_handshake_async<R: AsyncRead + Unpin>(
    mut reader: R,
) -> Result<Handshake, WireError> {
    let mut buf = [0u8; HANDSHAKE_LENGTH];
    reader.read_exact(&mut buf).await?;
    decode_handshake(&buf)
}

/// Encode one message as a full frame: 4-byte big-endian length counting the
/// type byte plus payload, then the type byte, then the payload.
pub fn encode_message(message: &Message) -> Vec<u8> {
    match message {
        Message::Choke => frame(MessageKind::Choke, &[]),
        Message::Unchoke => frame(MessageKind::Unchoke, &[]),
        Message::Interested => frame(MessageKind::Interested, &[]),
        Message::NotInterested => frame(MessageKind::NotInterested, &[]),
        Message::Have { index } => frame(MessageKind::Have, &u32::from(*index).to_be_bytes()),
        Message::Bitfield { bitfield } => frame(MessageKind::Bitfield, &bitfield.to_wire_words()),
        Message::Request { index } => frame(MessageKind::Request, &u32::from(*index).to_be_bytes()),
        Message::Piece { index, data } => {
            let mut payload = Vec::with_capacity(4 + data.len());
            payload.extend_from_slice(&u32::from(*index).to_be_bytes());
            payload.extend_from_slice(data);
            frame(MessageKind::Piece, &payload)
        }
    }
}

fn frame(kind: MessageKind, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 1) as u32;
    let mut buf = Vec::with_capacity(4 + length as usize);
    buf.extend_from_slice(&length.to_be_bytes());
    buf.push(kind.to_u8());
    buf.extend_from_slice(payload);
    buf
}

/// Decode the body of one frame (`buf` holds the type byte plus payload, the
/// length prefix already stripped).
pub fn decode_message(buf: &[u8]) -> Result<Message, WireError> {
    let (&type_byte, payload) = buf
        .split_first()
        .ok_or_else(|| malformed("empty frame"))?;
    let kind = MessageKind::from_u8(type_byte)
        .ok_or_else(|| malformed(format!("unknown message type {type_byte}")))?;

    let fixed = |expected: usize| {
        if payload.len() == expected {
            Ok(())
        } else {
            Err(malformed(format!(
                "{kind:?} payload is {} bytes, expected {expected}",
                payload.len()
            )))
        }
    };

    let message = match kind {
        MessageKind::Choke => {
            fixed(0)?;
            Message::Choke
        }
        MessageKind::Unchoke => {
            fixed(0)?;
            Message::Unchoke
        }
        MessageKind::Interested => {
            fixed(0)?;
            Message::Interested
        }
        MessageKind::NotInterested => {
            fixed(0)?;
            Message::NotInterested
        }
        MessageKind::Have => {
            fixed(4)?;
            Message::Have {
                index: read_index(payload),
            }
        }
        MessageKind::Bitfield => {
            if payload.len() % 4 != 0 {
                return Err(malformed(format!(
                    "Bitfield payload of {} bytes is not a whole number of words",
                    payload.len()
                )));
            }
            Message::Bitfield {
                bitfield: PieceBitfield::from_wire_words(payload),
            }
        }
        MessageKind::Request => {
            fixed(4)?;
            Message::Request {
                index: read_index(payload),
            }
        }
        MessageKind::Piece => {
            if payload.len() < 4 {
                return Err(malformed(format!(
                    "Piece payload is {} bytes, expected at least 4",
                    payload.len()
                )));
            }
            Message::Piece {
                index: read_index(payload),
                data: Bytes::copy_from_slice(&payload[4..]),
            }
        }
    };
    Ok(message)
}

fn read_index(payload: &[u8]) -> PieceIdx {
    PieceIdx::from(u32::from_be_bytes(payload[..4].try_into().unwrap()))
}

/// Read one length prefix, validating it before the body read.
pub async fn read_frame_length_async<R: AsyncRead + Unpin>(
    mut reader: R,
) -> Result<u32, WireError> {
    let length = reader.read_u32().await?;
    if length == 0 {
        return Err(malformed("zero-length frame"));
    }
    if length > MAX_FRAME_LENGTH {
        return Err(malformed(format!("frame length {length} is implausible")));
    }
    Ok(length)
}

pub async fn read_message_async<R: AsyncRead + Unpin>(mut reader: R) -> Result<Message, WireError> {
    let length = read_frame_length_async(&mut reader).await?;
    let mut buf = vec![0u8; length as usize];
    reader.read_exact(&mut buf).await?;
    decode_message(&buf)
}

pub async fn write_message_async<W: AsyncWrite + Unpin>(
    mut writer: W,
    message: &Message,
) -> Result<(), WireError> {
    writer.write_all(&encode_message(message)).await?;
    Ok(())
}
