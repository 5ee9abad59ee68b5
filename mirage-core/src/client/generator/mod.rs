//! Peer-id and key generators with their refresh strategies

pub mod cache;
pub mod key;
pub mod peer_id;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub use cache::{CacheEntry, IDLE_EVICTION_THRESHOLD, IdentifierCache};
pub use key::{KeyAlgorithm, KeyCase, KeyGenerator, KeyGeneratorSpec};
pub use peer_id::{PeerIdAlgorithm, PeerIdAlgorithmSpec, PeerIdGenerator, PeerIdGeneratorSpec};

use crate::torrent::InfoHash;
use crate::tracker::AnnounceEvent;

/// When an identifier is regenerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefreshOn {
    /// One identifier for the whole process lifetime
    Never,
    /// A new identifier for every announce
    Always,
    /// Per torrent, regenerated on every `started` announce
    TorrentVolatile,
    /// Per torrent, kept until evicted for idleness
    TorrentPersistent,
}

/// Storage behind a [`RefreshOn`] value.
#[derive(Debug)]
pub(crate) enum RefreshStrategy {
    Never(String),
    Always,
    TorrentVolatile(IdentifierCache<String>),
    TorrentPersistent(IdentifierCache<String>),
}

impl RefreshStrategy {
    pub(crate) fn new(refresh_on: RefreshOn, generate: impl FnOnce() -> String) -> Self {
        match refresh_on {
            RefreshOn::Never => RefreshStrategy::Never(generate()),
            RefreshOn::Always => RefreshStrategy::Always,
            RefreshOn::TorrentVolatile => RefreshStrategy::TorrentVolatile(IdentifierCache::new()),
            RefreshOn::TorrentPersistent => {
                RefreshStrategy::TorrentPersistent(IdentifierCache::new())
            }
        }
    }

    pub(crate) fn resolve(
        &self,
        info_hash: InfoHash,
        event: AnnounceEvent,
        now: Instant,
        generate: impl Fn() -> String,
    ) -> String {
        match self {
            RefreshStrategy::Never(value) => value.clone(),
            RefreshStrategy::Always => generate(),
            RefreshStrategy::TorrentVolatile(cache) => match event {
                AnnounceEvent::Started => cache.replace(info_hash, generate(), now),
                AnnounceEvent::Stopped => {
                    let value = cache.get_or_insert_with(info_hash, now, &generate);
                    cache.remove(&info_hash);
                    value
                }
                AnnounceEvent::None => cache.get_or_insert_with(info_hash, now, &generate),
            },
            RefreshStrategy::TorrentPersistent(cache) => {
                cache.get_or_insert_with(info_hash, now, &generate)
            }
        }
    }

    pub(crate) fn persistent_cache(&self) -> Option<&IdentifierCache<String>> {
        match self {
            RefreshStrategy::TorrentPersistent(cache) => Some(cache),
            _ => None,
        }
    }

    pub(crate) fn cached_len(&self) -> usize {
        match self {
            RefreshStrategy::TorrentVolatile(cache) | RefreshStrategy::TorrentPersistent(cache) => {
                cache.len()
            }
            RefreshStrategy::Never(_) | RefreshStrategy::Always => 0,
        }
    }
}
