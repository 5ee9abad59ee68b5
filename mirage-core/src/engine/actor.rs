//! Actor implementation for the seeding engine.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio::sync::mpsc;

use super::AnnouncerRegistry;
use super::commands::SeedingCommand;
use super::core::SeedingEngine;
use super::handle::SeedingEngineHandle;
use crate::bandwidth::{BandwidthAllocator, BandwidthSettings, SwarmWeighted};
use crate::client::ClientDescriptor;
use crate::config::MirageConfig;
use crate::events::{EventSender, SpeedEventForwarder};
use crate::torrent::TorrentIdentity;
use crate::tracker::TrackerTransport;

/// Spawns the seeding engine actor and returns its handle.
///
/// The initial torrents are registered before this returns, so the handle
/// already reports them. Up to `simultaneous_seed` of them announce
/// `started` right away; the rest wait in the queue.
///
/// # Examples
/// ```rust,no_run
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// use std::path::Path;
/// use std::sync::Arc;
///
/// use mirage_core::config::{ClientEnvironment, MirageConfig};
/// use mirage_core::{ClientDescriptor, EventSender, HttpTrackerTransport, spawn_seeding_engine};
///
/// let config = MirageConfig::default();
/// let descriptor =
///     ClientDescriptor::load(Path::new("clients/qbittorrent.client"), ClientEnvironment::detect())
///         .await?;
/// let transport = HttpTrackerTransport::new(&config.network)?;
/// let (events, _receiver) = EventSender::channel();
/// let handle = spawn_seeding_engine(config, Arc::new(descriptor), transport, Vec::new(), events);
/// handle.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub fn spawn_seeding_engine<T>(
    config: MirageConfig,
    descriptor: Arc<ClientDescriptor>,
    transport: T,
    torrents: Vec<TorrentIdentity>,
    events: EventSender,
) -> SeedingEngineHandle
where
    T: TrackerTransport + 'static,
{
    let (sender, receiver) = mpsc::channel(100);
    let registry = AnnouncerRegistry::default();
    let running = Arc::new(AtomicBool::new(true));
    let allocator = BandwidthAllocator::new(
        BandwidthSettings::from_config(&config),
        Arc::new(SwarmWeighted),
        Some(Arc::new(SpeedEventForwarder::new(events.clone()))),
    );

    let mut engine = SeedingEngine::new(
        config,
        descriptor,
        Arc::new(transport),
        allocator.clone(),
        Arc::clone(&registry),
        events,
        Arc::clone(&running),
    );
    engine.start(torrents);

    tokio::spawn(async move {
        run_actor_loop(engine, receiver).await;
    });

    SeedingEngineHandle::new(sender, registry, allocator, running)
}

/// Runs the main actor loop.
///
/// Commands, due announces and finished announce tasks are handled one at
/// a time. Dropping every handle shuts the engine down like `Shutdown`.
async fn run_actor_loop<T>(
    mut engine: SeedingEngine<T>,
    mut receiver: mpsc::Receiver<SeedingCommand>,
) where
    T: TrackerTransport + 'static,
{
    tracing::debug!("Seeding engine actor started");
    let scheduler = engine.scheduler();

    loop {
        tokio::select! {
            command = receiver.recv() => {
                let Some(command) = command else {
                    engine.shutdown().await;
                    break;
                };
                if !handle_command(&mut engine, command).await {
                    break;
                }
            }
            info_hash = scheduler.take() => {
                engine.dispatch(info_hash);
            }
            Some(completion) = engine.next_completion(), if engine.has_in_flight() => {
                engine.on_announce_completed(completion);
            }
        }
    }

    tracing::debug!("Seeding engine actor stopped");
}

/// Handles a single command.
/// Returns true to continue processing, false to shutdown.
async fn handle_command<T>(engine: &mut SeedingEngine<T>, command: SeedingCommand) -> bool
where
    T: TrackerTransport + 'static,
{
    match command {
        SeedingCommand::AddTorrent { torrent, responder } => {
            let result = engine.add_torrent(torrent);
            let _ = responder.send(result);
        }

        SeedingCommand::AddTorrentBytes {
            name,
            bytes,
            responder,
        } => {
            let result = engine.add_torrent_bytes(&name, &bytes);
            let _ = responder.send(result);
        }

        SeedingCommand::RemoveTorrent {
            info_hash,
            responder,
        } => {
            let result = engine.remove_torrent(info_hash);
            let _ = responder.send(result);
        }

        SeedingCommand::QueuedTorrents { responder } => {
            let _ = responder.send(engine.queued_torrents());
        }

        SeedingCommand::Shutdown { responder } => {
            engine.shutdown().await;
            let _ = responder.send(());
            return false;
        }
    }

    true
}
