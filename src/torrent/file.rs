//! Torrent metainfo structure and parsing logic.
//!
//! This module defines the [`Metainfo`] struct and related helpers for
//! parsing, validating, and working with `.torrent` file metadata: the
//! `info` sub-tree's piece layout, the single-file/multi-file file map,
//! and the canonical info-hash.
use crate::bencode::BencodeValue;
use crate::torrent::info_hash;
use crate::torrent::{TorrentError, TorrentResult};

use std::path::PathBuf;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Immutable, parsed view of a `.torrent` descriptor.
#[derive(Debug, PartialEq, Clone)]
pub struct Metainfo {
    pub announce: String,
    pub announce_list: Vec<Vec<String>>,
    pub creation_date: Option<SystemTime>,
    pub comment: String,
    pub created_by: String,
    pub encoding: String,
    pub info: InfoDict,
    pub info_hash: [u8; 20],
    pub pieces_hash: Vec<[u8; 20]>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct InfoDict {
    pub piece_length: i64,
    pub pieces: Vec<u8>,
    pub private: bool,
    pub name: String,
    pub layout: Layout,
}

/// Single-file vs multi-file torrent layout, per spec §3.
#[derive(Debug, PartialEq, Clone)]
pub enum Layout {
    Single { length: i64 },
    Multi { files: Vec<FileEntry> },
}

#[derive(Debug, PartialEq, Clone)]
pub struct FileEntry {
    pub length: i64,
    pub path: Vec<String>,
}

/// Parses the concatenated SHA-1 hashes from the `pieces` string.
///
/// The `pieces` key within the `info` dictionary is a single string
/// (byte sequence) that is a concatenation of 20-byte SHA-1 hashes for
/// each piece of the torrent, in piece-index order.
#[tracing::instrument(level = "trace")]
fn parse_pieces(pieces_bytes: &[u8]) -> TorrentResult<Vec<[u8; 20]>> {
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::InvalidPiecesHashLength);
    }
    let num_pieces = pieces_bytes.len() / 20;
    let mut hashes = Vec::with_capacity(num_pieces);
    for i in 0..num_pieces {
        let start = i * 20;
        let end = start + 20;

        let mut hash_array = [0u8; 20];
        hash_array.copy_from_slice(&pieces_bytes[start..end]);
        hashes.push(hash_array);
    }
    Ok(hashes)
}

/// Parses the (optional) BEP 12 announce-list: a list of tiers, each a
/// list of tracker URLs. Not present in spec.md's explicit field list,
/// but carried over as a supplemental field from original_source.
fn parse_announce_list(value: BencodeValue) -> TorrentResult<Vec<Vec<String>>> {
    let tiers = match value {
        BencodeValue::List(tiers) => tiers,
        _ => return Err(TorrentError::InvalidFormat("announce-list not a list".to_string())),
    };

    let mut result = Vec::with_capacity(tiers.len());
    for tier in tiers {
        let trackers = match tier {
            BencodeValue::List(trackers) => trackers,
            _ => return Err(TorrentError::InvalidFormat("announce-list tier not a list".to_string())),
        };
        let mut tier_vec = Vec::with_capacity(trackers.len());
        for tracker in trackers {
            match tracker {
                BencodeValue::String(s) => {
                    tier_vec.push(String::from_utf8(s).map_err(|e| {
                        TorrentError::InvalidFormat(format!("invalid tracker URL (not UTF-8): {}", e))
                    })?);
                }
                _ => {
                    return Err(TorrentError::InvalidFormat(
                        "tracker URL not a string".to_string(),
                    ));
                }
            }
        }
        result.push(tier_vec);
    }
    Ok(result)
}

fn parse_file_entries(value: &BencodeValue) -> TorrentResult<Vec<FileEntry>> {
    let list = value
        .as_list()
        .ok_or_else(|| TorrentError::InvalidFormat("files is not a list".to_string()))?;

    let mut files = Vec::with_capacity(list.len());
    for file_val in list {
        let file_dict = file_val
            .as_dict()
            .ok_or_else(|| TorrentError::InvalidFormat("file entry not a dict".to_string()))?;

        let length = file_dict
            .get(b"length".as_slice())
            .and_then(BencodeValue::as_integer)
            .ok_or_else(|| TorrentError::MissingField("file length".to_string()))?;

        let path_list = file_dict
            .get(b"path".as_slice())
            .and_then(BencodeValue::as_list)
            .ok_or_else(|| TorrentError::MissingField("file path".to_string()))?;

        let mut path = Vec::with_capacity(path_list.len());
        for segment in path_list {
            let bytes = segment
                .as_bytes()
                .ok_or_else(|| TorrentError::InvalidFormat("path segment not a string".to_string()))?;
            path.push(String::from_utf8(bytes.to_vec()).map_err(|e| {
                TorrentError::InvalidFormat(format!("invalid file path (not UTF-8): {}", e))
            })?);
        }

        files.push(FileEntry { length, path });
    }
    Ok(files)
}

/// Parses the `info` dictionary, detecting single- vs multi-file layout.
///
/// Per spec §4.2: presence of `length` means single-file, presence of
/// `files` means multi-file; presence of both, or neither, is an error.
fn parse_info_dict(value: BencodeValue) -> TorrentResult<InfoDict> {
    let dict = match value {
        BencodeValue::Dict(d) => d,
        _ => return Err(TorrentError::InvalidFormat("info is not a dictionary".to_string())),
    };

    let piece_length = dict
        .get(b"piece length".as_slice())
        .and_then(BencodeValue::as_integer)
        .ok_or_else(|| TorrentError::MissingField("piece length".to_string()))?;
    if piece_length <= 0 {
        return Err(TorrentError::InvalidFormat("piece length must be positive".to_string()));
    }

    let pieces_bytes = dict
        .get(b"pieces".as_slice())
        .and_then(BencodeValue::as_bytes)
        .ok_or_else(|| TorrentError::MissingField("pieces".to_string()))?
        .to_vec();

    let private = matches!(
        dict.get(b"private".as_slice()).and_then(BencodeValue::as_integer),
        Some(1)
    );

    let name = dict
        .get(b"name".as_slice())
        .and_then(BencodeValue::as_bytes)
        .ok_or_else(|| TorrentError::MissingField("name".to_string()))
        .and_then(|s| {
            String::from_utf8(s.to_vec())
                .map_err(|e| TorrentError::InvalidFormat(format!("invalid name (not UTF-8): {}", e)))
        })?;

    let has_length = dict.contains_key(b"length".as_slice());
    let has_files = dict.contains_key(b"files".as_slice());
    let layout = match (has_length, has_files) {
        (true, false) => {
            let length = dict
                .get(b"length".as_slice())
                .and_then(BencodeValue::as_integer)
                .ok_or_else(|| TorrentError::MissingField("length".to_string()))?;
            Layout::Single { length }
        }
        (false, true) => {
            let files = parse_file_entries(dict.get(b"files".as_slice()).unwrap())?;
            Layout::Multi { files }
        }
        (true, true) => {
            return Err(TorrentError::InvalidFormat(
                "info dict has both length and files".to_string(),
            ));
        }
        (false, false) => {
            return Err(TorrentError::InvalidFormat(
                "info dict has neither length nor files".to_string(),
            ));
        }
    };

    Ok(InfoDict {
        piece_length,
        pieces: pieces_bytes,
        private,
        name,
        layout,
    })
}

impl Metainfo {
    /// Total content size: `length`, or the sum of `files[].length`.
    pub fn total_length(&self) -> i64 {
        match &self.info.layout {
            Layout::Single { length } => *length,
            Layout::Multi { files } => files.iter().map(|f| f.length).sum(),
        }
    }

    pub fn is_multi_file(&self) -> bool {
        matches!(self.info.layout, Layout::Multi { .. })
    }

    /// Total number of pieces, derived from the parsed piece digests.
    pub fn num_pieces(&self) -> usize {
        self.pieces_hash.len()
    }

    /// Size of the piece at `index`. Per spec §9, computed directly
    /// from `total_size - (num_pieces - 1) * piece_length` rather than
    /// the buggy `total_size % piece_length or piece_length` trick the
    /// source this spec is based on uses (that trick misfires when
    /// `total_size` is an exact multiple of `piece_length`).
    pub fn piece_size(&self, index: usize) -> i64 {
        if index >= self.num_pieces() {
            return 0;
        }
        if index < self.num_pieces() - 1 {
            self.info.piece_length
        } else {
            let full_pieces_length = (self.num_pieces() - 1) as i64 * self.info.piece_length;
            self.total_length() - full_pieces_length
        }
    }

    /// File paths (relative to the download root) that overlap the byte
    /// range of the piece at `index`. Used by the piece manager to plan
    /// materialisation without re-deriving the byte ranges each time.
    pub fn file_paths_for_piece(&self, index: usize) -> Vec<PathBuf> {
        if index >= self.num_pieces() {
            return Vec::new();
        }
        let piece_start = (index as i64) * self.info.piece_length;
        let piece_end = piece_start + self.piece_size(index);
        let mut result_paths = Vec::new();

        match &self.info.layout {
            Layout::Single { .. } => {
                result_paths.push(PathBuf::from(&self.info.name));
            }
            Layout::Multi { files } => {
                let mut current_data_position: i64 = 0;
                for file_info in files {
                    let file_start = current_data_position;
                    let file_end = file_start + file_info.length;
                    if file_end > piece_start && file_start < piece_end {
                        let mut full_path = PathBuf::from(&self.info.name);
                        for component in &file_info.path {
                            full_path = full_path.join(component);
                        }
                        result_paths.push(full_path);
                    }
                    current_data_position = file_end;
                }
            }
        }
        result_paths
    }

    /// Parses a decoded bencode value into a [`Metainfo`].
    ///
    /// Computes `info_hash` from the canonical re-encoding of the `info`
    /// sub-tree before the dict is consumed field-by-field.
    #[tracing::instrument(level = "debug", skip(data))]
    pub fn parse(data: BencodeValue) -> TorrentResult<Metainfo> {
        let mut dict = match data {
            BencodeValue::Dict(d) => d,
            _ => return Err(TorrentError::InvalidFormat("root is not a dictionary".to_string())),
        };

        let announce_bytes = dict
            .remove(b"announce".as_slice())
            .ok_or_else(|| TorrentError::MissingField("announce".to_string()))?;

        let announce = match announce_bytes {
            BencodeValue::String(s) => String::from_utf8(s).map_err(|e| {
                TorrentError::InvalidFormat(format!("invalid announce URL (not UTF-8): {}", e))
            })?,
            _ => return Err(TorrentError::MissingField("announce (not a string)".to_string())),
        };

        let info_dict_value = dict
            .remove(b"info".as_slice())
            .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;

        let info_dict_map = match &info_dict_value {
            BencodeValue::Dict(d) => d.clone(),
            _ => return Err(TorrentError::InvalidFormat("info is not a dict".to_string())),
        };

        let info = parse_info_dict(info_dict_value)?;

        let announce_list = if let Some(v) = dict.remove(b"announce-list".as_slice()) {
            parse_announce_list(v)?
        } else {
            Vec::new()
        };

        let creation_date = if let Some(v) = dict.remove(b"creation date".as_slice()) {
            match v {
                BencodeValue::Integer(timestamp) => {
                    let secs = timestamp.try_into().map_err(|_| TorrentError::DateParseError)?;
                    Some(UNIX_EPOCH + std::time::Duration::from_secs(secs))
                }
                _ => return Err(TorrentError::InvalidFormat("creation date not an integer".to_string())),
            }
        } else {
            None
        };

        let comment = match dict.remove(b"comment".as_slice()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s).unwrap_or_default(),
            _ => String::new(),
        };
        let created_by = match dict.remove(b"created by".as_slice()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s).unwrap_or_default(),
            _ => String::new(),
        };
        let encoding = match dict.remove(b"encoding".as_slice()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s).unwrap_or_default(),
            _ => String::new(),
        };

        let info_hash = info_hash::calculate_info_hash(&info_dict_map)?;
        let pieces_hash = parse_pieces(&info.pieces)?;

        Ok(Metainfo {
            announce,
            announce_list,
            creation_date,
            comment,
            created_by,
            encoding,
            info,
            info_hash,
            pieces_hash,
        })
    }

    /// Decodes `data` as bencode and parses it as a metainfo descriptor.
    pub fn from_bytes(data: &[u8]) -> TorrentResult<Metainfo> {
        let value = crate::bencode::decoder::decode(data)?;
        Metainfo::parse(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encoder::encode_to_vec;
    use std::collections::HashMap;

    fn single_file_metainfo_bytes(total_size: i64, piece_length: i64) -> Vec<u8> {
        let num_pieces = ((total_size as f64) / (piece_length as f64)).ceil() as usize;
        let pieces = vec![0u8; num_pieces.max(1) * 20];

        let mut info = HashMap::new();
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(piece_length));
        info.insert(b"pieces".to_vec(), BencodeValue::String(pieces));
        info.insert(b"name".to_vec(), BencodeValue::String(b"a".to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Integer(total_size));

        let mut root = HashMap::new();
        root.insert(
            b"announce".to_vec(),
            BencodeValue::String(b"http://tracker.example/announce".to_vec()),
        );
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));

        encode_to_vec(&BencodeValue::Dict(root)).unwrap()
    }

    #[test]
    fn s2_piece_count_and_sizes() {
        // spec.md S2: piece_length=16384, total_size=20000 -> 2 pieces,
        // piece 0 full length, piece 1 the 3616-byte remainder.
        let mut info = HashMap::new();
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(16384));
        info.insert(b"pieces".to_vec(), BencodeValue::String(vec![0u8; 40]));
        info.insert(b"name".to_vec(), BencodeValue::String(b"a".to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Integer(20000));

        let mut root = HashMap::new();
        root.insert(
            b"announce".to_vec(),
            BencodeValue::String(b"http://tracker.example/announce".to_vec()),
        );
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));

        let bytes = encode_to_vec(&BencodeValue::Dict(root)).unwrap();
        let meta = Metainfo::from_bytes(&bytes).unwrap();

        assert_eq!(meta.num_pieces(), 2);
        assert_eq!(meta.piece_size(0), 16384);
        assert_eq!(meta.piece_size(1), 3616);
        assert_eq!(meta.total_length(), 20000);
    }

    #[test]
    fn last_piece_is_full_when_exact_multiple() {
        let bytes = single_file_metainfo_bytes(32768, 16384);
        let meta = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(meta.num_pieces(), 2);
        assert_eq!(meta.piece_size(0), 16384);
        assert_eq!(meta.piece_size(1), 16384);
    }

    #[test]
    fn rejects_info_with_both_length_and_files() {
        let mut info = HashMap::new();
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(16384));
        info.insert(b"pieces".to_vec(), BencodeValue::String(vec![0u8; 20]));
        info.insert(b"name".to_vec(), BencodeValue::String(b"a".to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Integer(10));
        info.insert(b"files".to_vec(), BencodeValue::List(vec![]));

        let mut root = HashMap::new();
        root.insert(b"announce".to_vec(), BencodeValue::String(b"http://t".to_vec()));
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));

        let bytes = encode_to_vec(&BencodeValue::Dict(root)).unwrap();
        assert!(Metainfo::from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_pieces_not_multiple_of_20() {
        let bytes = single_file_metainfo_bytes(100, 16384);
        // Corrupt by re-parsing and re-encoding with a bad pieces length
        // would be more work than it's worth; instead construct directly.
        let mut info = HashMap::new();
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(16384));
        info.insert(b"pieces".to_vec(), BencodeValue::String(vec![0u8; 13]));
        info.insert(b"name".to_vec(), BencodeValue::String(b"a".to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Integer(100));
        let mut root = HashMap::new();
        root.insert(b"announce".to_vec(), BencodeValue::String(b"http://t".to_vec()));
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));
        let bad_bytes = encode_to_vec(&BencodeValue::Dict(root)).unwrap();
        assert!(Metainfo::from_bytes(&bad_bytes).is_err());
        // sanity: the well-formed sibling still parses fine.
        assert!(Metainfo::from_bytes(&bytes).is_ok());
    }
}
