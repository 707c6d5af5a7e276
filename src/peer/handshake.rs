//! This module implements the BitTorrent peer handshake protocol.
//!
//! The handshake is the first message exchanged between two peers. It
//! verifies that both peers are participating in the same torrent (via
//! info_hash) and establishes basic protocol compatibility.
use crate::peer::{PeerError, PeerResult};
use crate::HANDSHAKE_LEN;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::instrument;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// A BitTorrent handshake message as defined in the BitTorrent protocol.
///
/// Contains the protocol identifier, reserved bytes for protocol
/// extensions, the info hash identifying the torrent, and the peer ID
/// identifying the remote client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Creates a new handshake with the specified info hash and peer ID.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serializes the handshake into a 68-byte array per spec §4.3:
    /// `pstrlen(1) pstr(19) reserved(8) info_hash(20) peer_id(20)`.
    #[instrument(level = "trace")]
    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = 19;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Reads exactly 68 bytes from `stream` and parses them as a
    /// handshake, rejecting a wrong `pstrlen` or protocol string but
    /// *not* validating the info hash (callers do that with
    /// [`Handshake::validate`] once they know what hash to expect).
    #[instrument(level = "trace", skip(stream))]
    pub async fn read(stream: &mut TcpStream) -> PeerResult<Self> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => PeerError::ConnectionClosed,
            _ => PeerError::Io(e),
        })?;

        let pstrlen = buf[0];
        if pstrlen != 19 {
            return Err(PeerError::HandshakeRejected(format!(
                "invalid pstrlen: {}",
                pstrlen
            )));
        }
        if &buf[1..20] != PROTOCOL.as_slice() {
            return Err(PeerError::HandshakeRejected(
                "invalid protocol string".to_string(),
            ));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Validates that this handshake's info hash matches `expected`.
    pub fn validate(&self, expected_info_hash: [u8; 20]) -> PeerResult<()> {
        if self.info_hash != expected_info_hash {
            return Err(PeerError::HandshakeRejected(format!(
                "info hash mismatch: got {}, expected {}",
                hex::encode(self.info_hash),
                hex::encode(expected_info_hash)
            )));
        }
        Ok(())
    }

    /// Performs a complete handshake over an already-connected stream:
    /// sends our handshake, reads the peer's, and validates its info
    /// hash. The peer_id in the returned handshake is recorded but not
    /// authenticated (spec §4.3).
    #[instrument(level = "trace", skip(stream))]
    pub async fn exchange(
        stream: &mut TcpStream,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> PeerResult<Handshake> {
        let ours = Handshake::new(info_hash, peer_id);
        stream
            .write_all(&ours.serialize())
            .await
            .map_err(PeerError::Io)?;

        let theirs = Handshake::read(stream).await?;
        theirs.validate(info_hash)?;
        Ok(theirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_layout_matches_spec() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = hs.serialize();
        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[1u8; 20]);
        assert_eq!(&bytes[48..68], &[2u8; 20]);
    }

    #[tokio::test]
    async fn s4_mismatched_info_hash_is_rejected() {
        use tokio::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // Respond with a handshake carrying a different info_hash.
            let theirs = Handshake::new([9u8; 20], [3u8; 20]);
            let mut buf = [0u8; 68];
            use tokio::io::AsyncReadExt;
            socket.read_exact(&mut buf).await.unwrap();
            use tokio::io::AsyncWriteExt;
            socket.write_all(&theirs.serialize()).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let result = Handshake::exchange(&mut client, [1u8; 20], [2u8; 20]).await;
        assert!(matches!(result, Err(PeerError::HandshakeRejected(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn s4_matching_info_hash_with_different_peer_id_succeeds() {
        use tokio::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [7u8; 20];

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let theirs = Handshake::new(info_hash, [99u8; 20]);
            let mut buf = [0u8; 68];
            use tokio::io::AsyncReadExt;
            socket.read_exact(&mut buf).await.unwrap();
            use tokio::io::AsyncWriteExt;
            socket.write_all(&theirs.serialize()).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let result = Handshake::exchange(&mut client, info_hash, [2u8; 20]).await;
        let hs = result.unwrap();
        assert_eq!(hs.peer_id, [99u8; 20]);
        server.await.unwrap();
    }
}
