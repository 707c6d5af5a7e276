//! A single connected peer: its socket, handshake-derived identity, and
//! the four choke/interest booleans plus the piece set it has announced.
use crate::peer::{Handshake, Message, PeerError, PeerResult};
use crate::MAX_INFLIGHT_PER_PEER;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument};

/// How long to wait for a TCP connect before giving up on a peer, per
/// spec §4.3. Peer-discovery probes (not implemented by this core; see
/// spec §1's DHT/peerless-discovery non-goal) would use 1s instead.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the next message before treating a peer as
/// stalled.
const READ_TIMEOUT: Duration = Duration::from_secs(15);

/// An established connection to a remote peer, post-handshake.
pub struct PeerConnection {
    pub addr: SocketAddr,
    pub peer_id: [u8; 20],
    stream: TcpStream,

    /// We are choking the peer (refusing its requests).
    pub am_choking: bool,
    /// We have told the peer we are interested in its pieces.
    pub am_interested: bool,
    /// The peer is choking us (ignoring our requests).
    pub peer_choking: bool,
    /// The peer has told us it is interested in our pieces.
    pub peer_interested: bool,

    /// Piece indices this peer has announced via BITFIELD or HAVE.
    pub peer_pieces: HashSet<u32>,

    /// Number of REQUESTs we've sent that haven't resolved (PIECE, or
    /// abandonment on timeout/choke).
    pub inflight: u32,
}

impl PeerConnection {
    /// Connects to `addr` and performs the handshake, failing fast if
    /// either step exceeds [`CONNECT_TIMEOUT`].
    #[instrument(level = "debug", skip(info_hash, our_peer_id))]
    pub async fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
    ) -> PeerResult<Self> {
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout)?
            .map_err(|_| PeerError::PeerUnreachable(addr.to_string()))?;

        let theirs = timeout(
            CONNECT_TIMEOUT,
            Handshake::exchange(&mut stream, info_hash, our_peer_id),
        )
        .await
        .map_err(|_| PeerError::Timeout)??;

        debug!(%addr, peer_id = %hex::encode(theirs.peer_id), "handshake complete");

        Ok(Self {
            addr,
            peer_id: theirs.peer_id,
            stream,
            // Per spec §4.3: both sides start choking and disinterested.
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            peer_pieces: HashSet::new(),
            inflight: 0,
        })
    }

    /// Reads and applies the next message, returning it to the caller.
    /// BITFIELD and HAVE update `peer_pieces` directly; everything else
    /// (choke state, interest) is left for the caller to act on since it
    /// usually needs to touch piece-selection state this type doesn't
    /// own.
    pub async fn recv(&mut self) -> PeerResult<Message> {
        let msg = Message::read(&mut self.stream, READ_TIMEOUT).await?;
        match &msg {
            Message::Choke => self.peer_choking = true,
            Message::Unchoke => self.peer_choking = false,
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Bitfield(bits) => {
                // piece_count isn't known here; callers with an out-of-range
                // bit just get an index that never matches a real piece, so
                // this is the one place we index past the true count (the
                // resolved Open Question only concerns HAVE augmenting
                // instead of replacing the set, not bounds checking here).
                for idx in crate::peer::message::bitfield_to_indices(bits, usize::MAX) {
                    self.peer_pieces.insert(idx);
                }
            }
            Message::Have { piece_index } => {
                // Per the resolved correction: HAVE augments peer_pieces
                // the same as BITFIELD does, rather than being ignored.
                self.peer_pieces.insert(*piece_index);
            }
            _ => {}
        }
        Ok(msg)
    }

    /// Sends a message, decrementing no state itself; callers track
    /// `inflight` around REQUEST/CANCEL/abandonment explicitly.
    pub async fn send(&mut self, msg: &Message) -> PeerResult<()> {
        msg.send(&mut self.stream).await
    }

    /// Sends INTERESTED if not already marked interested.
    pub async fn become_interested(&mut self) -> PeerResult<()> {
        if !self.am_interested {
            self.send(&Message::Interested).await?;
            self.am_interested = true;
        }
        Ok(())
    }

    /// True if this peer can accept another REQUEST without exceeding
    /// the per-peer pipeline cap.
    pub fn can_request_more(&self) -> bool {
        !self.peer_choking && self.inflight < MAX_INFLIGHT_PER_PEER
    }

    /// Clears a single in-flight request slot, used both on successful
    /// PIECE receipt and on abandonment (timeout or CHOKE). The original
    /// implementation left abandoned requests in its pending map forever;
    /// this crate always frees the slot so the peer can be re-used.
    pub fn release_inflight(&mut self) {
        self.inflight = self.inflight.saturating_sub(1);
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.peer_pieces.contains(&index)
    }
}
