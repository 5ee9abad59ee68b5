//! Command definitions for the seeding engine actor.

use tokio::sync::oneshot;

use crate::torrent::{InfoHash, TorrentError, TorrentIdentity};

/// Commands that can be sent to the seeding engine actor.
///
/// Each command carries a response channel the actor answers on.
#[derive(Debug)]
pub enum SeedingCommand {
    /// Seed a parsed torrent, or queue it when the seeding set is full.
    AddTorrent {
        torrent: TorrentIdentity,
        responder: oneshot::Sender<Result<InfoHash, TorrentError>>,
    },
    /// Parse raw `.torrent` bytes and seed the result.
    AddTorrentBytes {
        name: String,
        bytes: Vec<u8>,
        responder: oneshot::Sender<Result<InfoHash, TorrentError>>,
    },
    /// Stop seeding a torrent, sending a `stopped` announce when needed.
    RemoveTorrent {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    /// Torrents waiting for a free seeding slot, in promotion order.
    QueuedTorrents {
        responder: oneshot::Sender<Vec<TorrentIdentity>>,
    },
    /// Flush `stopped` announces and stop the actor.
    Shutdown { responder: oneshot::Sender<()> },
}
