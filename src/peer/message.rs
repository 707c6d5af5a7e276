//! Post-handshake message framing: `length: u32 BE` followed by
//! `length` bytes, the first of which (when `length > 0`) is the
//! message id. `length == 0` is a keep-alive.
use crate::peer::{PeerError, PeerResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::instrument;

/// A parsed peer protocol message (spec §4.3's message taxonomy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    /// An unrecognised message id; consumed but not acted on, per spec.
    Unknown(u8),
}

const CHOKE: u8 = 0;
const UNCHOKE: u8 = 1;
const INTERESTED: u8 = 2;
const NOT_INTERESTED: u8 = 3;
const HAVE: u8 = 4;
const BITFIELD: u8 = 5;
const REQUEST: u8 = 6;
const PIECE: u8 = 7;
const CANCEL: u8 = 8;

impl Message {
    /// Serializes this message into its length-prefixed wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        let id = match self {
            Message::KeepAlive => {
                // length-prefix of 0, no id, no payload.
                return 0u32.to_be_bytes().to_vec();
            }
            Message::Choke => CHOKE,
            Message::Unchoke => UNCHOKE,
            Message::Interested => INTERESTED,
            Message::NotInterested => NOT_INTERESTED,
            Message::Have { piece_index } => {
                payload.write_u32::<BigEndian>(*piece_index).unwrap();
                HAVE
            }
            Message::Bitfield(bits) => {
                payload.extend_from_slice(bits);
                BITFIELD
            }
            Message::Request { index, begin, length } => {
                payload.write_u32::<BigEndian>(*index).unwrap();
                payload.write_u32::<BigEndian>(*begin).unwrap();
                payload.write_u32::<BigEndian>(*length).unwrap();
                REQUEST
            }
            Message::Piece { index, begin, block } => {
                payload.write_u32::<BigEndian>(*index).unwrap();
                payload.write_u32::<BigEndian>(*begin).unwrap();
                payload.extend_from_slice(block);
                PIECE
            }
            Message::Cancel { index, begin, length } => {
                payload.write_u32::<BigEndian>(*index).unwrap();
                payload.write_u32::<BigEndian>(*begin).unwrap();
                payload.write_u32::<BigEndian>(*length).unwrap();
                CANCEL
            }
            Message::Unknown(id) => *id,
        };

        let length = 1 + payload.len() as u32;
        let mut out = Vec::with_capacity(4 + payload.len() + 1);
        out.extend_from_slice(&length.to_be_bytes());
        out.push(id);
        out.extend_from_slice(&payload);
        out
    }

    fn parse(id: u8, payload: Vec<u8>) -> PeerResult<Message> {
        let mut cur = Cursor::new(&payload);
        let msg = match id {
            CHOKE => Message::Choke,
            UNCHOKE => Message::Unchoke,
            INTERESTED => Message::Interested,
            NOT_INTERESTED => Message::NotInterested,
            HAVE => {
                let piece_index = cur
                    .read_u32::<BigEndian>()
                    .map_err(|_| PeerError::ProtocolViolation("truncated HAVE".to_string()))?;
                Message::Have { piece_index }
            }
            BITFIELD => Message::Bitfield(payload),
            REQUEST => {
                let index = cur
                    .read_u32::<BigEndian>()
                    .map_err(|_| PeerError::ProtocolViolation("truncated REQUEST".to_string()))?;
                let begin = cur
                    .read_u32::<BigEndian>()
                    .map_err(|_| PeerError::ProtocolViolation("truncated REQUEST".to_string()))?;
                let length = cur
                    .read_u32::<BigEndian>()
                    .map_err(|_| PeerError::ProtocolViolation("truncated REQUEST".to_string()))?;
                Message::Request { index, begin, length }
            }
            PIECE => {
                let index = cur
                    .read_u32::<BigEndian>()
                    .map_err(|_| PeerError::ProtocolViolation("truncated PIECE".to_string()))?;
                let begin = cur
                    .read_u32::<BigEndian>()
                    .map_err(|_| PeerError::ProtocolViolation("truncated PIECE".to_string()))?;
                let block = payload[8..].to_vec();
                Message::Piece { index, begin, block }
            }
            CANCEL => {
                let index = cur
                    .read_u32::<BigEndian>()
                    .map_err(|_| PeerError::ProtocolViolation("truncated CANCEL".to_string()))?;
                let begin = cur
                    .read_u32::<BigEndian>()
                    .map_err(|_| PeerError::ProtocolViolation("truncated CANCEL".to_string()))?;
                let length = cur
                    .read_u32::<BigEndian>()
                    .map_err(|_| PeerError::ProtocolViolation("truncated CANCEL".to_string()))?;
                Message::Cancel { index, begin, length }
            }
            other => Message::Unknown(other),
        };
        Ok(msg)
    }

    /// Reads one message from `stream`, failing with [`PeerError::Timeout`]
    /// if `deadline` elapses, or [`PeerError::ConnectionClosed`] if the
    /// stream ends before a full frame arrives.
    #[instrument(level = "trace", skip(stream))]
    pub async fn read(stream: &mut TcpStream, deadline: Duration) -> PeerResult<Message> {
        timeout(deadline, Self::read_inner(stream))
            .await
            .map_err(|_| PeerError::Timeout)?
    }

    async fn read_inner(stream: &mut TcpStream) -> PeerResult<Message> {
        let mut len_buf = [0u8; 4];
        read_exact_or_closed(stream, &mut len_buf).await?;
        let length = u32::from_be_bytes(len_buf);

        if length == 0 {
            return Ok(Message::KeepAlive);
        }

        let mut body = vec![0u8; length as usize];
        read_exact_or_closed(stream, &mut body).await?;

        let id = body[0];
        let payload = body[1..].to_vec();
        Message::parse(id, payload)
    }

    /// Writes this message to `stream`.
    #[instrument(level = "trace", skip(stream, self))]
    pub async fn send(&self, stream: &mut TcpStream) -> PeerResult<()> {
        stream.write_all(&self.encode()).await.map_err(PeerError::Io)
    }
}

async fn read_exact_or_closed(stream: &mut TcpStream, buf: &mut [u8]) -> PeerResult<()> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(PeerError::ConnectionClosed),
        Err(e) => Err(PeerError::Io(e)),
    }
}

/// Parses a BITFIELD payload into the set of piece indices it advertises.
/// Bit ordering is MSB-first per byte: byte 0 bit 7 is piece 0.
pub fn bitfield_to_indices(bitfield: &[u8], piece_count: usize) -> Vec<u32> {
    let mut indices = Vec::new();
    for (byte_index, byte) in bitfield.iter().enumerate() {
        for bit in 0..8 {
            if byte & (0x80 >> bit) != 0 {
                let piece_index = byte_index * 8 + bit;
                if piece_index < piece_count {
                    indices.push(piece_index as u32);
                }
                // Trailing bits beyond piece_count are tolerated (spec
                // says "warn but tolerate"); silently dropped here since
                // this crate's ambient logging happens at the call site.
            }
        }
    }
    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_bitfield_decodes_msb_first() {
        // 0b10100000 0b00000000, piece_count=9 -> {0, 2}
        let bits = [0b1010_0000, 0b0000_0000];
        let indices = bitfield_to_indices(&bits, 9);
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn encode_decode_round_trip_for_request() {
        let msg = Message::Request { index: 1, begin: 16384, length: 16384 };
        let bytes = msg.encode();
        // length prefix(4) + id(1) + 3*u32(12) = 17
        assert_eq!(bytes.len(), 17);
        let parsed = Message::parse(bytes[4], bytes[5..].to_vec()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn encode_decode_round_trip_for_piece() {
        let msg = Message::Piece { index: 0, begin: 0, block: vec![1, 2, 3, 4] };
        let bytes = msg.encode();
        let parsed = Message::parse(bytes[4], bytes[5..].to_vec()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn keep_alive_has_zero_length_prefix() {
        let bytes = Message::KeepAlive.encode();
        assert_eq!(bytes, 0u32.to_be_bytes().to_vec());
    }

    #[test]
    fn unknown_ids_are_preserved_not_rejected() {
        let parsed = Message::parse(200, vec![1, 2, 3]).unwrap();
        assert_eq!(parsed, Message::Unknown(200));
    }
}
