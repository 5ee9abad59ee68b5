//! Handle for communicating with the seeding engine actor.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot};

use super::AnnouncerRegistry;
use super::commands::SeedingCommand;
use crate::announcer::AnnouncerSnapshot;
use crate::bandwidth::{BandwidthAllocator, SeedStats, Speed};
use crate::torrent::{InfoHash, TorrentError, TorrentIdentity};

/// Cloneable handle to a running seeding engine.
///
/// Mutations go through the actor. Status queries read the shared registry
/// and allocator directly and never wait on the actor.
#[derive(Clone)]
pub struct SeedingEngineHandle {
    sender: mpsc::Sender<SeedingCommand>,
    registry: AnnouncerRegistry,
    allocator: BandwidthAllocator,
    running: Arc<AtomicBool>,
}

impl SeedingEngineHandle {
    pub(crate) fn new(
        sender: mpsc::Sender<SeedingCommand>,
        registry: AnnouncerRegistry,
        allocator: BandwidthAllocator,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            sender,
            registry,
            allocator,
            running,
        }
    }

    /// Starts seeding a torrent, or queues it when the seeding set is full.
    ///
    /// # Errors
    /// - `TorrentError::DuplicateTorrent` - Torrent already seeding or queued
    /// - `TorrentError::EngineShutdown` - Engine is no longer running
    pub async fn add_torrent(&self, torrent: TorrentIdentity) -> Result<InfoHash, TorrentError> {
        let (responder, rx) = oneshot::channel();
        let cmd = SeedingCommand::AddTorrent { torrent, responder };

        self.sender
            .send(cmd)
            .await
            .map_err(|_| TorrentError::EngineShutdown)?;

        rx.await.map_err(|_| TorrentError::EngineShutdown)?
    }

    /// Parses `.torrent` bytes and seeds the result.
    ///
    /// A parse failure is also published as `ClientEvent::TorrentAddFailed`.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Bytes are not a valid torrent
    /// - `TorrentError::DuplicateTorrent` - Torrent already seeding or queued
    /// - `TorrentError::EngineShutdown` - Engine is no longer running
    pub async fn add_torrent_bytes(
        &self,
        name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<InfoHash, TorrentError> {
        let (responder, rx) = oneshot::channel();
        let cmd = SeedingCommand::AddTorrentBytes {
            name: name.into(),
            bytes,
            responder,
        };

        self.sender
            .send(cmd)
            .await
            .map_err(|_| TorrentError::EngineShutdown)?;

        rx.await.map_err(|_| TorrentError::EngineShutdown)?
    }

    /// Stops seeding a torrent. The `stopped` announce is sent in the background.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Torrent neither seeding nor queued
    /// - `TorrentError::EngineShutdown` - Engine is no longer running
    pub async fn remove_torrent(&self, info_hash: InfoHash) -> Result<(), TorrentError> {
        let (responder, rx) = oneshot::channel();
        let cmd = SeedingCommand::RemoveTorrent {
            info_hash,
            responder,
        };

        self.sender
            .send(cmd)
            .await
            .map_err(|_| TorrentError::EngineShutdown)?;

        rx.await.map_err(|_| TorrentError::EngineShutdown)?
    }

    /// Torrents waiting for a free seeding slot.
    pub async fn queued_torrents(&self) -> Result<Vec<TorrentIdentity>, TorrentError> {
        let (responder, rx) = oneshot::channel();
        let cmd = SeedingCommand::QueuedTorrents { responder };

        self.sender
            .send(cmd)
            .await
            .map_err(|_| TorrentError::EngineShutdown)?;

        rx.await.map_err(|_| TorrentError::EngineShutdown)
    }

    /// Snapshot of every active announcer, sorted by name.
    pub fn seeding_announcers(&self) -> Vec<AnnouncerSnapshot> {
        let announcers: Vec<_> = self.registry.read().values().cloned().collect();
        let mut snapshots: Vec<AnnouncerSnapshot> = announcers
            .iter()
            .map(|announcer| announcer.lock().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name).then(a.info_hash.cmp(&b.info_hash)));
        snapshots
    }

    pub fn speed_map(&self) -> HashMap<InfoHash, Speed> {
        self.allocator.speed_map()
    }

    pub fn seed_stats(&self, info_hash: &InfoHash) -> SeedStats {
        self.allocator.stats(info_hash)
    }

    /// Checks if the engine actor is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    /// Shuts the engine down and waits until the `stopped` flush is done.
    ///
    /// Calling it on an engine that already stopped is a no-op.
    pub async fn shutdown(&self) -> Result<(), TorrentError> {
        let (responder, rx) = oneshot::channel();
        let cmd = SeedingCommand::Shutdown { responder };

        if self.sender.send(cmd).await.is_err() {
            return Ok(());
        }

        rx.await.map_err(|_| TorrentError::EngineShutdown)
    }
}
