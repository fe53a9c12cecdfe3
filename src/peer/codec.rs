//! The wire codecs: the fixed-size handshake and the length-prefixed message
//! frame that follows it.
//!
//! Two separate `tokio_util::codec` types are used, exactly as in a
//! `Framed` swap pattern: `HandshakeCodec` only ever decodes/encodes the one
//! 68-byte handshake message, after which the session moves the same
//! underlying buffers over to `PeerCodec` via `FramedParts`.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{PeerId, PieceIndex, Sha1Hash};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";
const HANDSHAKE_LEN: usize = 68;

/// The length, in bytes, a frame's payload may not exceed before the session
/// considers the peer misbehaving and closes the connection.
pub(crate) const MAX_FRAME_LEN: usize = 2 * (crate::BLOCK_LEN as usize);

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid handshake protocol string")]
    InvalidProtocol,
    #[error("frame length {0} exceeds the maximum of {1}")]
    FrameTooLarge(usize, usize),
    #[error("message type {id} payload is too short ({len} bytes)")]
    TruncatedMessage { id: u8, len: usize },
}

/// The fixed 68-byte handshake exchanged before any framed messages.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0u8; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = CodecError;

    fn encode(&mut self, hs: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_u8(19);
        dst.extend_from_slice(&hs.prot);
        dst.extend_from_slice(&hs.reserved);
        dst.extend_from_slice(&hs.info_hash);
        dst.extend_from_slice(&hs.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HANDSHAKE_LEN {
            src.reserve(HANDSHAKE_LEN - src.len());
            return Ok(None);
        }

        let pstrlen = src[0] as usize;
        if pstrlen != PROTOCOL_STRING.len() {
            return Err(CodecError::InvalidProtocol);
        }

        let mut prot = [0u8; 19];
        prot.copy_from_slice(&src[1..20]);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(CodecError::InvalidProtocol);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&src[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&src[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&src[48..68]);

        src.advance(HANDSHAKE_LEN);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// A post-handshake protocol message.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(crate::Bitfield),
    Request { piece_index: PieceIndex, offset: u32, len: u32 },
    Piece { piece_index: PieceIndex, offset: u32, data: Vec<u8> },
    Cancel { piece_index: PieceIndex, offset: u32, len: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Message {
    /// Returns the message's wire id, if it has one. `KeepAlive` has none: it
    /// is the zero-length frame, with no type byte at all.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                dst.reserve(4);
                dst.put_u32(0);
            }
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                dst.reserve(5);
                dst.put_u32(1);
                dst.put_u8(msg.id().expect("non-keepalive message has an id") as u8);
            }
            Message::Have { piece_index } => {
                dst.reserve(9);
                dst.put_u32(5);
                dst.put_u8(MessageId::Have as u8);
                dst.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                dst.reserve(5 + bytes.len());
                dst.put_u32(1 + bytes.len() as u32);
                dst.put_u8(MessageId::Bitfield as u8);
                dst.extend_from_slice(&bytes);
            }
            Message::Request { piece_index, offset, len } => {
                dst.reserve(17);
                dst.put_u32(13);
                dst.put_u8(MessageId::Request as u8);
                dst.put_u32(piece_index as u32);
                dst.put_u32(offset);
                dst.put_u32(len);
            }
            Message::Cancel { piece_index, offset, len } => {
                dst.reserve(17);
                dst.put_u32(13);
                dst.put_u8(MessageId::Cancel as u8);
                dst.put_u32(piece_index as u32);
                dst.put_u32(offset);
                dst.put_u32(len);
            }
            Message::Piece { piece_index, offset, data } => {
                dst.reserve(13 + data.len());
                dst.put_u32(9 + data.len() as u32);
                dst.put_u8(MessageId::Piece as u8);
                dst.put_u32(piece_index as u32);
                dst.put_u32(offset);
                dst.extend_from_slice(&data);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len == 0 {
            // keep-alive: discard and try again in case more frames follow
            src.advance(4);
            return self.decode(src);
        }

        if len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(len, MAX_FRAME_LEN));
        }

        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        let id = src[4];
        let payload = &src[5..4 + len];

        // HAVE/REQUEST/PIECE/CANCEL all carry a fixed-size prefix; a peer
        // that declares a shorter length than its own message type requires
        // is misbehaving, not silently skippable, since we can't tell where
        // the next frame starts without trusting a payload we can't parse.
        let required = match id {
            4 => Some(4),
            6 | 8 => Some(12),
            7 => Some(8),
            _ => None,
        };
        if let Some(required) = required {
            if payload.len() < required {
                return Err(CodecError::TruncatedMessage { id, len: payload.len() });
            }
        }

        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                let piece_index = u32::from_be_bytes(payload[0..4].try_into().unwrap()) as PieceIndex;
                Message::Have { piece_index }
            }
            5 => {
                // caller fits this to the real piece count once it knows it
                let bitfield = crate::Bitfield::from_vec(payload.to_vec());
                Message::Bitfield(bitfield)
            }
            6 => {
                let piece_index = u32::from_be_bytes(payload[0..4].try_into().unwrap()) as PieceIndex;
                let offset = u32::from_be_bytes(payload[4..8].try_into().unwrap());
                let len = u32::from_be_bytes(payload[8..12].try_into().unwrap());
                Message::Request { piece_index, offset, len }
            }
            7 => {
                let piece_index = u32::from_be_bytes(payload[0..4].try_into().unwrap()) as PieceIndex;
                let offset = u32::from_be_bytes(payload[4..8].try_into().unwrap());
                let data = payload[8..].to_vec();
                Message::Piece { piece_index, offset, data }
            }
            8 => {
                let piece_index = u32::from_be_bytes(payload[0..4].try_into().unwrap()) as PieceIndex;
                let offset = u32::from_be_bytes(payload[4..8].try_into().unwrap());
                let len = u32::from_be_bytes(payload[8..12].try_into().unwrap());
                Message::Cancel { piece_index, offset, len }
            }
            _ => {
                // unknown type: we know its length, so skip it and keep
                // decoding in case another full frame is already buffered
                src.advance(4 + len);
                return self.decode(src);
            }
        };

        src.advance(4 + len);
        Ok(Some(msg))
    }
}
