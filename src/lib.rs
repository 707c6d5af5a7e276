//! Library root for rstc.
//!
//! Re-exports the core modules: bencode, torrent, peer, piece, download,
//! and tracker.
pub mod bencode;
pub mod download;
pub mod peer;
pub mod piece;
pub mod torrent;
pub mod tracker;

/// Size of a block, the unit of peer REQUEST/PIECE exchange.
pub const BLOCK_SIZE: u32 = 16_384;

/// Length in bytes of a SHA-1 piece digest.
pub const SHA1_LEN: usize = 20;

/// Length in bytes of the peer handshake message.
pub const HANDSHAKE_LEN: usize = 68;

/// Default listening port advertised to trackers (no inbound listener
/// is actually opened by this core; see spec §6).
pub const DEFAULT_PORT: u16 = 6881;

/// Maximum REQUESTs in flight per peer at any instant.
pub const MAX_INFLIGHT_PER_PEER: u32 = 10;

/// Default maximum number of simultaneously connected peers.
pub const MAX_ACTIVE_PEERS: usize = 20;

/// Default number of candidate peers probed from the tracker's peer list.
pub const PROBE_CANDIDATES: usize = 50;
