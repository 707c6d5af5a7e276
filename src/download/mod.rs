//! Orchestrates a torrent download: one worker task per connected peer,
//! piece selection serialized behind a mutex, and overall status exposed
//! through a `watch` channel.
use crate::peer::{Message, PeerConnection, PeerError};
use crate::piece::{PieceManager, PieceState};
use crate::torrent::Metainfo;
use crate::MAX_INFLIGHT_PER_PEER;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("piece assembly error: {0}")]
    Piece(#[from] crate::piece::PieceError),
    #[error("no peers available")]
    NoPeers,
}

pub type DownloadResult<T> = std::result::Result<T, DownloadError>;

/// Overall state of a download, observable via [`Downloader::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadStatus {
    Downloading,
    Paused,
    Completed,
    Error(String),
}

/// Drives the whole-torrent download across a pool of peers.
pub struct Downloader {
    metainfo: Arc<Metainfo>,
    piece_manager: Arc<Mutex<PieceManager>>,
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
    status_tx: watch::Sender<DownloadStatus>,
}

impl Downloader {
    pub fn new(metainfo: Metainfo, our_peer_id: [u8; 20]) -> Self {
        let piece_manager = PieceManager::new(&metainfo);
        let (status_tx, _) = watch::channel(DownloadStatus::Paused);
        Self {
            info_hash: metainfo.info_hash,
            metainfo: Arc::new(metainfo),
            piece_manager: Arc::new(Mutex::new(piece_manager)),
            our_peer_id,
            status_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<DownloadStatus> {
        self.status_tx.subscribe()
    }

    pub async fn progress(&self) -> (usize, usize) {
        self.piece_manager.lock().await.progress()
    }

    /// Connects to candidate peer addresses (probed up to
    /// `candidates.len()`, per spec §5's "probe phase of up to 50
    /// candidates") and drives the download until every piece is
    /// verified complete, then writes the result to `output_dir`. At
    /// most `max_active_peers` hold an open connection simultaneously;
    /// the rest wait on the semaphore and take the slot of whichever
    /// worker exits first (connect failure, protocol violation, or
    /// piece-set exhaustion).
    #[instrument(level = "info", skip(self, candidates, output_dir))]
    pub async fn run(
        &self,
        candidates: Vec<SocketAddr>,
        output_dir: PathBuf,
        max_active_peers: usize,
    ) -> DownloadResult<()> {
        if candidates.is_empty() {
            let _ = self.status_tx.send(DownloadStatus::Error("no peers available".to_string()));
            return Err(DownloadError::NoPeers);
        }

        let _ = self.status_tx.send(DownloadStatus::Downloading);

        let active_slots = Arc::new(Semaphore::new(max_active_peers.max(1)));

        let mut workers = Vec::with_capacity(candidates.len());
        for addr in candidates {
            let piece_manager = self.piece_manager.clone();
            let info_hash = self.info_hash;
            let our_peer_id = self.our_peer_id;
            let active_slots = active_slots.clone();
            workers.push(tokio::spawn(async move {
                let Ok(_permit) = active_slots.acquire_owned().await else {
                    return;
                };
                if let Err(e) = run_peer_worker(addr, info_hash, our_peer_id, piece_manager).await {
                    debug!(%addr, error = %e, "peer worker exited");
                }
            }));
        }

        for worker in workers {
            let _ = worker.await;
        }

        let complete = self.piece_manager.lock().await.is_complete();
        if !complete {
            let _ = self
                .status_tx
                .send(DownloadStatus::Error("download ended with missing pieces".to_string()));
            return Ok(());
        }

        self.piece_manager.lock().await.materialise(&self.metainfo, &output_dir)?;
        info!(path = %output_dir.display(), "download complete, materialised to disk");
        let _ = self.status_tx.send(DownloadStatus::Completed);
        Ok(())
    }
}

/// One peer's worker loop: connect, handshake, exchange bitfield/have
/// state, then repeatedly pick and download a whole piece until the
/// piece manager reports no more absent pieces this peer has.
#[instrument(level = "debug", skip(info_hash, our_peer_id, piece_manager))]
async fn run_peer_worker(
    addr: SocketAddr,
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
    piece_manager: Arc<Mutex<PieceManager>>,
) -> Result<(), PeerError> {
    let mut conn = PeerConnection::connect(addr, info_hash, our_peer_id).await?;
    conn.become_interested().await?;

    loop {
        // Wait for the peer to unchoke us and to have announced at
        // least one piece we still need, draining any messages it sends
        // in the meantime (bitfield/have update conn.peer_pieces as a
        // side effect of recv()).
        while conn.peer_choking {
            conn.recv().await?;
        }

        // Select and reserve (mark InProgress) under the same lock
        // acquisition, so two workers can never be handed the same
        // piece index (spec §5's at-most-one-assembly guarantee).
        let next_piece = {
            let mut mgr = piece_manager.lock().await;
            mgr.reserve_piece_for(&conn.peer_pieces)
        };

        let Some(index) = next_piece else {
            // Either done, or this peer has nothing we need right now;
            // wait for a HAVE and try again, unless everything is done.
            if piece_manager.lock().await.is_complete() {
                return Ok(());
            }
            match conn.recv().await {
                Ok(_) => continue,
                Err(e) => return Err(e),
            }
        };

        if let Err(e) = download_piece(&mut conn, index, &piece_manager).await {
            warn!(%addr, index, error = %e, "piece download failed, releasing for retry");
            piece_manager.lock().await.reset_piece(index).ok();
            if matches!(e, PeerError::ConnectionClosed | PeerError::Io(_)) {
                return Err(e);
            }
        }
    }
}

/// Downloads one whole piece from `conn`, pipelining REQUESTs up to
/// [`MAX_INFLIGHT_PER_PEER`] and releasing the in-flight slot on every
/// resolution path (PIECE, choke, or timeout) so the peer is never left
/// permanently capped. `index` must already be reserved (`InProgress`)
/// by the caller's `reserve_piece_for` call; this function only reads
/// the block layout, it never transitions piece state itself.
async fn download_piece(
    conn: &mut PeerConnection,
    index: u32,
    piece_manager: &Arc<Mutex<PieceManager>>,
) -> Result<(), PeerError> {
    let block_layout = piece_manager
        .lock()
        .await
        .block_layout(index)
        .map_err(|e| PeerError::ProtocolViolation(e.to_string()))?;

    let mut requested = 0usize;
    let mut received = 0usize;
    let total = block_layout.len();

    while received < total {
        while requested < total && conn.can_request_more() {
            let (begin, length) = block_layout[requested];
            conn.send(&Message::Request { index, begin, length }).await?;
            conn.inflight += 1;
            requested += 1;
        }

        match conn.recv().await {
            Ok(Message::Piece { index: got_index, begin, block }) => {
                if got_index != index {
                    continue;
                }
                conn.release_inflight();
                received += 1;
                let state = piece_manager
                    .lock()
                    .await
                    .add_block(index, begin, block)
                    .map_err(|e| PeerError::ProtocolViolation(e.to_string()))?;
                if state == PieceState::Failed {
                    return Err(PeerError::ProtocolViolation("piece hash mismatch".to_string()));
                }
            }
            Ok(Message::Choke) => {
                // Abandon: the peer stopped serving us mid-piece. Clear
                // every slot we'd claimed rather than leaving them
                // pending forever.
                conn.inflight = 0;
                return Err(PeerError::ProtocolViolation("choked mid-piece".to_string()));
            }
            Ok(_) => continue,
            Err(PeerError::Timeout) => {
                conn.inflight = 0;
                return Err(PeerError::Timeout);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::BencodeValue;
    use crate::peer::Handshake;
    use std::collections::HashMap as StdHashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn single_piece_metainfo() -> Metainfo {
        let piece_length = 32_768i64;
        let mut info = StdHashMap::new();
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(piece_length));
        info.insert(b"pieces".to_vec(), BencodeValue::String(vec![0u8; 20]));
        info.insert(b"name".to_vec(), BencodeValue::String(b"f.bin".to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Integer(piece_length));

        let mut root = StdHashMap::new();
        root.insert(
            b"announce".to_vec(),
            BencodeValue::String(b"http://tracker.example/announce".to_vec()),
        );
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));
        Metainfo::parse(BencodeValue::Dict(root)).unwrap()
    }

    #[tokio::test]
    async fn s6_single_peer_full_piece_round_trip() {
        use sha1::{Digest, Sha1};

        let data = vec![7u8; 32_768];
        let mut hasher = Sha1::new();
        hasher.update(&data);
        let digest: [u8; 20] = hasher.finalize().into();

        let mut metainfo = single_piece_metainfo();
        metainfo.pieces_hash = vec![digest];

        let info_hash = metainfo.info_hash;
        let our_peer_id = [1u8; 20];

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut hs_buf = [0u8; 68];
            socket.read_exact(&mut hs_buf).await.unwrap();
            let theirs = Handshake::new(info_hash, [2u8; 20]);
            socket.write_all(&theirs.serialize()).await.unwrap();

            // bitfield announcing piece 0, then unchoke.
            socket.write_all(&Message::Bitfield(vec![0b1000_0000]).encode()).await.unwrap();
            socket.write_all(&Message::Unchoke.encode()).await.unwrap();

            // Wait for an INTERESTED then two REQUESTs, reply with PIECE data.
            for _ in 0..3 {
                let mut len_buf = [0u8; 4];
                socket.read_exact(&mut len_buf).await.unwrap();
                let len = u32::from_be_bytes(len_buf) as usize;
                let mut body = vec![0u8; len];
                socket.read_exact(&mut body).await.unwrap();
                if body.first() == Some(&6) {
                    let begin = u32::from_be_bytes([body[5], body[6], body[7], body[8]]);
                    let length = u32::from_be_bytes([body[9], body[10], body[11], body[12]]) as usize;
                    let block = vec![7u8; length];
                    socket
                        .write_all(&Message::Piece { index: 0, begin, block }.encode())
                        .await
                        .unwrap();
                }
            }
        });

        let piece_manager = Arc::new(Mutex::new(PieceManager::new(&metainfo)));
        let result = run_peer_worker(addr, info_hash, our_peer_id, piece_manager.clone()).await;
        assert!(result.is_ok() || matches!(result, Err(PeerError::ConnectionClosed)));
        assert!(piece_manager.lock().await.is_complete());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn run_never_exceeds_max_active_peers() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use tokio::time::Duration as TokioDuration;

        const TOTAL_CANDIDATES: usize = 6;
        const CAP: usize = 2;

        let metainfo = single_piece_metainfo();
        let info_hash = metainfo.info_hash;

        let current = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut addrs = Vec::with_capacity(TOTAL_CANDIDATES);
        let mut servers = Vec::with_capacity(TOTAL_CANDIDATES);
        for _ in 0..TOTAL_CANDIDATES {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            addrs.push(listener.local_addr().unwrap());
            let current = current.clone();
            let max_seen = max_seen.clone();
            servers.push(tokio::spawn(async move {
                let (mut socket, _) = listener.accept().await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);

                let mut hs_buf = [0u8; 68];
                socket.read_exact(&mut hs_buf).await.unwrap();
                // Hold the slot open briefly so overlapping connect attempts
                // are observable, then let the client see a closed socket.
                tokio::time::sleep(TokioDuration::from_millis(60)).await;
                let theirs = Handshake::new(info_hash, [9u8; 20]);
                socket.write_all(&theirs.serialize()).await.unwrap();
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        let downloader = Downloader::new(metainfo, [1u8; 20]);
        let _ = downloader.run(addrs, std::env::temp_dir(), CAP).await;

        for server in servers {
            server.await.unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= CAP);
    }
}
