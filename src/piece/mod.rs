//! Piece assembly: tracks per-piece download state, assembles and
//! verifies blocks, and materialises completed data to disk.
use crate::torrent::Metainfo;
use crate::BLOCK_SIZE;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{instrument, warn};

#[derive(Debug, Error)]
pub enum PieceError {
    #[error("piece index {0} out of range")]
    IndexOutOfRange(u32),
    #[error("I/O error materialising piece data: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsafe path in file entry: {0}")]
    UnsafePath(String),
    #[error("piece {0} is already being assembled by another worker")]
    AlreadyInProgress(u32),
}

pub type PieceResult<T> = std::result::Result<T, PieceError>;

/// Lifecycle of a single piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Absent,
    InProgress,
    Complete,
    Failed,
}

struct PieceSlot {
    state: PieceState,
    /// block offset (multiple of BLOCK_SIZE) -> received bytes.
    blocks: HashMap<u32, Vec<u8>>,
    size: i64,
}

impl PieceSlot {
    fn new(size: i64) -> Self {
        Self { state: PieceState::Absent, blocks: HashMap::new(), size }
    }

    fn block_count(&self) -> u32 {
        (self.size as u32).div_ceil(BLOCK_SIZE).max(1)
    }

    fn is_complete_locally(&self) -> bool {
        self.blocks.len() as u32 == self.block_count()
            && self.blocks.values().map(|b| b.len() as i64).sum::<i64>() == self.size
    }

    /// Assembles the stored blocks in offset order into one buffer.
    fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size as usize);
        let mut offsets: Vec<&u32> = self.blocks.keys().collect();
        offsets.sort();
        for offset in offsets {
            out.extend_from_slice(&self.blocks[offset]);
        }
        out
    }
}

/// Tracks piece state across the whole torrent and assembles/verifies
/// data as blocks arrive from peers.
pub struct PieceManager {
    piece_length: i64,
    pieces_hash: Vec<[u8; 20]>,
    slots: Vec<PieceSlot>,
}

impl PieceManager {
    pub fn new(metainfo: &Metainfo) -> Self {
        let num_pieces = metainfo.num_pieces();
        let slots = (0..num_pieces)
            .map(|i| PieceSlot::new(metainfo.piece_size(i)))
            .collect();
        Self {
            piece_length: metainfo.info.piece_length,
            pieces_hash: metainfo.pieces_hash.clone(),
            slots,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.slots.len()
    }

    pub fn state_of(&self, index: u32) -> Option<PieceState> {
        self.slots.get(index as usize).map(|s| s.state)
    }

    /// Picks the first piece (lowest index, per spec §4.4's first-fit
    /// policy) that is still `Absent` and that `peer_pieces` advertises.
    /// Read-only: does not reserve the piece. Callers that intend to
    /// download the result should use [`PieceManager::reserve_piece_for`]
    /// instead, which selects and marks `InProgress` atomically.
    pub fn next_piece_for(&self, peer_pieces: &std::collections::HashSet<u32>) -> Option<u32> {
        self.slots
            .iter()
            .enumerate()
            .find(|(i, slot)| slot.state == PieceState::Absent && peer_pieces.contains(&(*i as u32)))
            .map(|(i, _)| i as u32)
    }

    /// Selects the lowest `Absent` piece `peer_pieces` advertises and
    /// marks it `InProgress` in the same call, so the read (selection)
    /// and the write (reservation) happen under one lock acquisition by
    /// the caller. This is what guarantees at-most-one-assembly (spec
    /// §5, testable property 5): two workers calling this under the same
    /// `Mutex<PieceManager>` can never be handed the same index, since
    /// the second caller's scan will no longer see it as `Absent`.
    pub fn reserve_piece_for(&mut self, peer_pieces: &std::collections::HashSet<u32>) -> Option<u32> {
        let index = self.next_piece_for(peer_pieces)?;
        self.init_piece_download(index)
            .expect("next_piece_for only ever returns an Absent index");
        Some(index)
    }

    /// Marks a piece `InProgress`. Rejects a piece already `InProgress`
    /// (or any state other than `Absent`) rather than silently
    /// succeeding, so a re-entrant claim on an already-claimed piece
    /// surfaces as an error instead of letting two workers assemble the
    /// same piece at once.
    pub fn init_piece_download(&mut self, index: u32) -> PieceResult<()> {
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(PieceError::IndexOutOfRange(index))?;
        if slot.state != PieceState::Absent {
            return Err(PieceError::AlreadyInProgress(index));
        }
        slot.state = PieceState::InProgress;
        Ok(())
    }

    /// The block boundaries (offset, length) a piece is divided into,
    /// used by the downloader to issue REQUESTs.
    pub fn block_layout(&self, index: u32) -> PieceResult<Vec<(u32, u32)>> {
        let slot = self.slots.get(index as usize).ok_or(PieceError::IndexOutOfRange(index))?;
        let mut layout = Vec::new();
        let mut offset = 0u32;
        let size = slot.size as u32;
        while offset < size {
            let len = BLOCK_SIZE.min(size - offset);
            layout.push((offset, len));
            offset += len;
        }
        Ok(layout)
    }

    /// Stores a received block and, once a piece's blocks are all
    /// present, verifies it against the SHA-1 digest from the metainfo.
    /// Returns the piece's new state. A block for a piece that isn't
    /// `InProgress` is a stale delivery (after abandonment, or after the
    /// piece already completed/failed) and is dropped silently, per spec
    /// §4.4, rather than corrupting an already-assembled or not-yet-begun
    /// piece.
    #[instrument(level = "debug", skip(self, data))]
    pub fn add_block(&mut self, index: u32, begin: u32, data: Vec<u8>) -> PieceResult<PieceState> {
        let slot = self.slots.get_mut(index as usize).ok_or(PieceError::IndexOutOfRange(index))?;
        if slot.state != PieceState::InProgress {
            return Ok(slot.state);
        }
        slot.blocks.insert(begin, data);

        if !slot.is_complete_locally() {
            return Ok(slot.state);
        }

        let assembled = slot.assemble();
        let mut hasher = Sha1::new();
        hasher.update(&assembled);
        let digest: [u8; 20] = hasher.finalize().into();

        if digest == self.pieces_hash[index as usize] {
            slot.state = PieceState::Complete;
        } else {
            warn!(index, "piece hash mismatch, discarding and retrying");
            slot.blocks.clear();
            slot.state = PieceState::Failed;
        }
        Ok(slot.state)
    }

    /// Resets a failed or abandoned piece back to `Absent` so it can be
    /// re-selected by [`PieceManager::next_piece_for`].
    pub fn reset_piece(&mut self, index: u32) -> PieceResult<()> {
        let slot = self.slots.get_mut(index as usize).ok_or(PieceError::IndexOutOfRange(index))?;
        slot.blocks.clear();
        slot.state = PieceState::Absent;
        Ok(())
    }

    /// Returns `(completed, total)` piece counts.
    pub fn progress(&self) -> (usize, usize) {
        let completed = self.slots.iter().filter(|s| s.state == PieceState::Complete).count();
        (completed, self.slots.len())
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(|s| s.state == PieceState::Complete)
    }

    pub fn completed_data(&self, index: u32) -> Option<Vec<u8>> {
        let slot = self.slots.get(index as usize)?;
        (slot.state == PieceState::Complete).then(|| slot.assemble())
    }

    /// Writes all completed pieces to `output_dir`, laying out a single
    /// file or the multi-file directory tree per the metainfo. Rejects
    /// any file-entry path containing `..` or an absolute segment.
    #[instrument(level = "debug", skip(self, metainfo))]
    pub fn materialise(&self, metainfo: &Metainfo, output_dir: &Path) -> PieceResult<()> {
        let mut full = Vec::with_capacity(metainfo.total_length().max(0) as usize);
        for index in 0..self.slots.len() {
            match self.completed_data(index as u32) {
                Some(data) => full.extend_from_slice(&data),
                None => return Err(PieceError::IndexOutOfRange(index as u32)),
            }
        }

        match &metainfo.info.layout {
            crate::torrent::file::Layout::Single { .. } => {
                validate_safe_path(&metainfo.info.name)?;
                let path = output_dir.join(&metainfo.info.name);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, full)?;
            }
            crate::torrent::file::Layout::Multi { files } => {
                let root = output_dir.join(&metainfo.info.name);
                std::fs::create_dir_all(&root)?;
                let mut cursor = 0usize;
                for file in files {
                    for segment in &file.path {
                        validate_safe_path(segment)?;
                    }
                    let mut path = root.clone();
                    for segment in &file.path {
                        path = path.join(segment);
                    }
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let end = cursor + file.length as usize;
                    std::fs::write(&path, &full[cursor..end])?;
                    cursor = end;
                }
            }
        }
        Ok(())
    }
}

fn validate_safe_path(segment: &str) -> PieceResult<()> {
    if segment == ".." || segment.is_empty() || PathBuf::from(segment).is_absolute() {
        return Err(PieceError::UnsafePath(segment.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::BencodeValue;
    use std::collections::HashMap as StdHashMap;

    fn metainfo_with(total_size: i64, piece_length: i64) -> Metainfo {
        let num_pieces = ((total_size as f64) / (piece_length as f64)).ceil() as usize;
        let pieces = vec![0u8; num_pieces.max(1) * 20];

        let mut info = StdHashMap::new();
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(piece_length));
        info.insert(b"pieces".to_vec(), BencodeValue::String(pieces));
        info.insert(b"name".to_vec(), BencodeValue::String(b"movie.mp4".to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Integer(total_size));

        let mut root = StdHashMap::new();
        root.insert(
            b"announce".to_vec(),
            BencodeValue::String(b"http://tracker.example/announce".to_vec()),
        );
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));

        Metainfo::parse(BencodeValue::Dict(root)).unwrap()
    }

    #[test]
    fn s5_block_assembly_and_digest_verification() {
        let meta = metainfo_with(32_768, 32_768);
        let mut mgr = PieceManager::new(&meta);

        // Real digest for 32768 zero bytes must match metainfo's all-zero
        // piece hash placeholder only if we reuse the same zero content.
        let layout = mgr.block_layout(0).unwrap();
        assert_eq!(layout.len(), 2);

        let mut hasher = Sha1::new();
        let zero_block = vec![0u8; BLOCK_SIZE as usize];
        hasher.update(&zero_block);
        hasher.update(&zero_block);
        let expected: [u8; 20] = hasher.finalize().into();
        mgr.pieces_hash[0] = expected;

        mgr.init_piece_download(0).unwrap();
        let state = mgr.add_block(0, 0, zero_block.clone()).unwrap();
        assert_eq!(state, PieceState::InProgress);
        let state = mgr.add_block(0, BLOCK_SIZE, zero_block).unwrap();
        assert_eq!(state, PieceState::Complete);
    }

    #[test]
    fn hash_mismatch_marks_failed_and_clears_blocks() {
        let meta = metainfo_with(16_384, 16_384);
        let mut mgr = PieceManager::new(&meta);
        mgr.init_piece_download(0).unwrap();
        let state = mgr.add_block(0, 0, vec![1u8; 16_384]).unwrap();
        assert_eq!(state, PieceState::Failed);
    }

    #[test]
    fn next_piece_for_picks_lowest_absent_index_peer_has() {
        let meta = metainfo_with(65_536, 16_384);
        let mgr = PieceManager::new(&meta);
        let mut peer_pieces = std::collections::HashSet::new();
        peer_pieces.insert(2u32);
        peer_pieces.insert(1u32);
        assert_eq!(mgr.next_piece_for(&peer_pieces), Some(1));
    }

    #[test]
    fn reserve_piece_for_is_atomic_across_repeated_calls() {
        // s5 / property 5: a second reservation attempt for the same
        // peer must not return the index the first call already claimed.
        let meta = metainfo_with(32_768, 16_384);
        let mut mgr = PieceManager::new(&meta);
        let mut peer_pieces = std::collections::HashSet::new();
        peer_pieces.insert(0u32);
        peer_pieces.insert(1u32);

        let first = mgr.reserve_piece_for(&peer_pieces);
        assert_eq!(first, Some(0));
        assert_eq!(mgr.state_of(0), Some(PieceState::InProgress));

        let second = mgr.reserve_piece_for(&peer_pieces);
        assert_eq!(second, Some(1));
        assert_eq!(mgr.state_of(1), Some(PieceState::InProgress));

        // Nothing left for this peer: both pieces it advertises are
        // already InProgress, not Absent.
        assert_eq!(mgr.reserve_piece_for(&peer_pieces), None);
    }

    #[test]
    fn init_piece_download_rejects_re_entrant_claim() {
        let meta = metainfo_with(16_384, 16_384);
        let mut mgr = PieceManager::new(&meta);
        mgr.init_piece_download(0).unwrap();
        let result = mgr.init_piece_download(0);
        assert!(matches!(result, Err(PieceError::AlreadyInProgress(0))));
    }

    #[test]
    fn add_block_ignores_stale_delivery_for_non_in_progress_piece() {
        // A block arriving for a piece that was never reserved (still
        // Absent) must not be stored, per spec §4.4's "rejects silently
        // if the piece is not in-progress".
        let meta = metainfo_with(16_384, 16_384);
        let mut mgr = PieceManager::new(&meta);
        let state = mgr.add_block(0, 0, vec![1u8; 16_384]).unwrap();
        assert_eq!(state, PieceState::Absent);

        // Reserve, complete, then simulate a stale duplicate delivery
        // for the same already-Complete piece: it must not corrupt the
        // assembled bytes.
        let mut hasher = Sha1::new();
        hasher.update(&vec![1u8; 16_384]);
        mgr.pieces_hash[0] = hasher.finalize().into();
        mgr.init_piece_download(0).unwrap();
        mgr.add_block(0, 0, vec![1u8; 16_384]).unwrap();
        assert_eq!(mgr.state_of(0), Some(PieceState::Complete));

        let stale = mgr.add_block(0, 0, vec![9u8; 16_384]).unwrap();
        assert_eq!(stale, PieceState::Complete);
        assert_eq!(mgr.completed_data(0).unwrap(), vec![1u8; 16_384]);
    }

    #[test]
    fn rejects_unsafe_path_segments() {
        assert!(validate_safe_path("..").is_err());
        assert!(validate_safe_path("/etc/passwd").is_err());
        assert!(validate_safe_path("ok.txt").is_ok());
    }

    #[test]
    fn materialises_single_file_layout_to_disk() {
        let meta = metainfo_with(16_384, 16_384);
        let mut mgr = PieceManager::new(&meta);

        let data = vec![9u8; 16_384];
        let mut hasher = Sha1::new();
        hasher.update(&data);
        mgr.pieces_hash[0] = hasher.finalize().into();

        mgr.init_piece_download(0).unwrap();
        mgr.add_block(0, 0, data.clone()).unwrap();
        assert_eq!(mgr.state_of(0), Some(PieceState::Complete));

        let tmp = tempfile::tempdir().unwrap();
        mgr.materialise(&meta, tmp.path()).unwrap();

        let written = std::fs::read(tmp.path().join("movie.mp4")).unwrap();
        assert_eq!(written, data);
    }
}
