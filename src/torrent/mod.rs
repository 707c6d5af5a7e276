//! Torrent metainfo parsing and error handling logic.
//!
//! This module provides types and error handling for working with `.torrent`
//! files: decoding the bencoded descriptor, deriving the canonical info-hash,
//! and exposing typed accessors (name, piece length, piece digests, file
//! layout, announce URL, total size).
use thiserror::Error;

pub mod file;
pub mod info_hash;

pub use file::{FileEntry, InfoDict, Layout, Metainfo};

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid metainfo: {0}")]
    InvalidFormat(String),

    #[error("missing or invalid field: {0}")]
    MissingField(String),

    #[error("pieces length is not a multiple of 20")]
    InvalidPiecesHashLength,

    #[error("unsafe path in file entry: {0}")]
    UnsafePath(String),

    #[error("date parse error")]
    DateParseError,

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
}

/// Result type for torrent operations.
pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
