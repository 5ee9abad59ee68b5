//! Torrent identity, `.torrent` parsing and torrent discovery

pub mod parsing;
pub mod source;

use std::fmt;

pub use parsing::{BencodeParser, parse_torrent_bytes};
pub use source::{DirectoryTorrentSource, TorrentLoadFailure};

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used as the key of every per-torrent map and identifier cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Parses a 40 character hex string.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidInfoHash` - Not valid hex or not 20 bytes long
    pub fn from_hex(value: &str) -> Result<Self, TorrentError> {
        let bytes = hex::decode(value.trim()).map_err(|e| TorrentError::InvalidInfoHash {
            reason: e.to_string(),
        })?;
        let hash: [u8; 20] = bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| TorrentError::InvalidInfoHash {
                reason: format!("expected 20 bytes, got {}", bytes.len()),
            })?;
        Ok(Self(hash))
    }

    /// First eight bytes as hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Immutable description of a torrent that can be seeded.
///
/// Only what the trackers need to see: the info hash, the declared size
/// and the announce URLs in tracker-preference order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentIdentity {
    pub info_hash: InfoHash,
    pub name: String,
    pub total_size: u64,
    pub announce_urls: Vec<String>,
}

impl TorrentIdentity {
    /// Creates a torrent identity.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - No announce URL was supplied
    pub fn new(
        info_hash: InfoHash,
        name: impl Into<String>,
        total_size: u64,
        announce_urls: Vec<String>,
    ) -> Result<Self, TorrentError> {
        if announce_urls.is_empty() {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "No announce URLs found".to_string(),
            });
        }

        Ok(Self {
            info_hash,
            name: name.into(),
            total_size,
            announce_urls,
        })
    }
}

/// Errors raised while loading torrents or addressing them in the engine.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Failed to parse torrent file: {reason}")]
    InvalidTorrentFile { reason: String },

    #[error("Invalid info hash: {reason}")]
    InvalidInfoHash { reason: String },

    #[error("Torrent {info_hash} not found")]
    TorrentNotFound { info_hash: InfoHash },

    #[error("Torrent {info_hash} is already known")]
    DuplicateTorrent { info_hash: InfoHash },

    #[error("Engine has been shut down")]
    EngineShutdown,

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error")]
    UrlParsing(#[from] url::ParseError),
}
