//! Seeding engine state owned by the actor task.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::future::{BoxFuture, FutureExt, join_all};
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinError};
use tokio::time::Instant;

use super::AnnouncerRegistry;
use crate::announcer::{
    Announcer, AnnouncerPolicy, BandwidthNotifier, EventPublisher, RemovalReason,
    ResponseHandlerChain, Transition,
};
use crate::bandwidth::BandwidthAllocator;
use crate::client::{ClientDescriptor, ConnectionInfo, TemplateError};
use crate::config::MirageConfig;
use crate::events::{ClientEvent, EventSender};
use crate::scheduler::AnnounceScheduler;
use crate::torrent::{InfoHash, TorrentError, TorrentIdentity, parse_torrent_bytes};
use crate::tracker::{
    AnnounceEvent, AnnounceResponse, TrackerError, TrackerRequest, TrackerTransport,
};

type AnnounceOutcome = Result<AnnounceResponse, TrackerError>;

/// Result of one spawned announce task.
#[derive(Debug)]
pub struct AnnounceCompletion {
    info_hash: InfoHash,
    dispatch_id: u64,
    event: AnnounceEvent,
    /// `None` when the task was aborted.
    outcome: Option<AnnounceOutcome>,
}

#[derive(Debug)]
struct InFlight {
    dispatch_id: u64,
    event: AnnounceEvent,
    abort: AbortHandle,
}

/// Announce loop state. Only the actor task touches it.
pub struct SeedingEngine<T> {
    policy: AnnouncerPolicy,
    simultaneous_seed: usize,
    stop_grace_period: Duration,
    descriptor: Arc<ClientDescriptor>,
    transport: Arc<T>,
    connection: ConnectionInfo,
    registry: AnnouncerRegistry,
    queued: VecDeque<TorrentIdentity>,
    scheduler: Arc<AnnounceScheduler<InfoHash>>,
    in_flight: FuturesUnordered<BoxFuture<'static, AnnounceCompletion>>,
    in_flight_tasks: HashMap<InfoHash, InFlight>,
    next_dispatch_id: u64,
    permits: Arc<Semaphore>,
    chain: ResponseHandlerChain,
    allocator: BandwidthAllocator,
    events: EventSender,
    running: Arc<AtomicBool>,
}

impl<T: TrackerTransport + 'static> SeedingEngine<T> {
    pub fn new(
        config: MirageConfig,
        descriptor: Arc<ClientDescriptor>,
        transport: Arc<T>,
        allocator: BandwidthAllocator,
        registry: AnnouncerRegistry,
        events: EventSender,
        running: Arc<AtomicBool>,
    ) -> Self {
        let mut chain = ResponseHandlerChain::new();
        chain.append(Arc::new(BandwidthNotifier::new(allocator.clone())));
        chain.append(Arc::new(EventPublisher::new(events.clone())));

        Self {
            policy: AnnouncerPolicy::from_config(&config),
            simultaneous_seed: config.seed.simultaneous_seed.max(1),
            stop_grace_period: config.network.stop_grace_period,
            descriptor,
            transport,
            connection: ConnectionInfo::from_config(&config.network),
            registry,
            queued: VecDeque::new(),
            scheduler: Arc::new(AnnounceScheduler::new()),
            in_flight: FuturesUnordered::new(),
            in_flight_tasks: HashMap::new(),
            next_dispatch_id: 0,
            permits: Arc::new(Semaphore::new(config.network.max_concurrent_announces.max(1))),
            chain,
            allocator,
            events,
            running,
        }
    }

    pub fn scheduler(&self) -> Arc<AnnounceScheduler<InfoHash>> {
        Arc::clone(&self.scheduler)
    }

    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Next finished announce task, `None` when nothing is in flight.
    pub async fn next_completion(&mut self) -> Option<AnnounceCompletion> {
        self.in_flight.next().await
    }

    /// Publishes `SeedingStarted`, starts the allocator and seeds `torrents`.
    pub fn start(&mut self, torrents: Vec<TorrentIdentity>) {
        let client = self
            .descriptor
            .user_agent()
            .unwrap_or_else(|| "unknown".to_string());
        tracing::info!("Seeding as {} with {} torrents", client, torrents.len());
        self.events.send(ClientEvent::SeedingStarted { client });
        self.allocator.start();

        for torrent in torrents {
            let _ = self.add_torrent(torrent);
        }
    }

    /// Seeds a torrent now, or queues it when every slot is taken.
    ///
    /// # Errors
    /// - `TorrentError::DuplicateTorrent` - Torrent already seeding or queued
    pub fn add_torrent(&mut self, torrent: TorrentIdentity) -> Result<InfoHash, TorrentError> {
        let name = torrent.name.clone();
        self.insert_torrent(torrent)
            .inspect_err(|error| self.report_add_failure(&name, error))
    }

    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Bytes are not a valid torrent
    /// - `TorrentError::DuplicateTorrent` - Torrent already seeding or queued
    pub fn add_torrent_bytes(
        &mut self,
        name: &str,
        bytes: &[u8],
    ) -> Result<InfoHash, TorrentError> {
        parse_torrent_bytes(bytes)
            .and_then(|torrent| self.insert_torrent(torrent))
            .inspect_err(|error| self.report_add_failure(name, error))
    }

    fn insert_torrent(&mut self, torrent: TorrentIdentity) -> Result<InfoHash, TorrentError> {
        let info_hash = torrent.info_hash;
        if self.is_known(&info_hash) {
            return Err(TorrentError::DuplicateTorrent { info_hash });
        }

        if self.seeding_count() < self.simultaneous_seed {
            tracing::info!("Seeding {} ({})", torrent.name, info_hash);
            self.start_announcer(torrent);
        } else {
            tracing::debug!(
                "All {} seeding slots taken, queueing {}",
                self.simultaneous_seed,
                torrent.name
            );
            self.queued.push_back(torrent);
        }
        Ok(info_hash)
    }

    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Torrent neither seeding nor queued
    pub fn remove_torrent(&mut self, info_hash: InfoHash) -> Result<(), TorrentError> {
        if let Some(position) = self
            .queued
            .iter()
            .position(|torrent| torrent.info_hash == info_hash)
        {
            self.queued.remove(position);
            tracing::info!("Dropped queued torrent {}", info_hash.short());
            return Ok(());
        }

        let announcer = self
            .announcer(&info_hash)
            .ok_or(TorrentError::TorrentNotFound { info_hash })?;

        match self.in_flight_tasks.get(&info_hash) {
            Some(task) if task.event == AnnounceEvent::Stopped => return Ok(()),
            Some(_) => self.abort_in_flight(&info_hash),
            None => {}
        }

        let needs_stop = announcer.lock().request_stop(RemovalReason::Requested);
        if needs_stop {
            self.scheduler.insert(info_hash, Instant::now());
        } else {
            self.remove_announcer(info_hash, RemovalReason::Requested);
        }
        Ok(())
    }

    pub fn queued_torrents(&self) -> Vec<TorrentIdentity> {
        self.queued.iter().cloned().collect()
    }

    /// Sends the next announce of a due torrent.
    pub fn dispatch(&mut self, info_hash: InfoHash) {
        if self.in_flight_tasks.contains_key(&info_hash) {
            tracing::debug!("Announce for {} already in flight", info_hash.short());
            return;
        }
        let Some(announcer) = self.announcer(&info_hash) else {
            return;
        };

        let (event, snapshot, stop_reason) = {
            let announcer = announcer.lock();
            (
                announcer.next_event(),
                announcer.snapshot(),
                announcer.stop_reason(),
            )
        };
        let Some(event) = event else {
            self.remove_announcer(info_hash, stop_reason.unwrap_or(RemovalReason::Requested));
            return;
        };

        let request = match self.render_request(event, info_hash, &snapshot.announce_url) {
            Ok(request) => request,
            Err(error) => {
                tracing::error!("Cannot render announce for {}: {}", snapshot.name, error);
                self.events.send(ClientEvent::AnnounceFailed {
                    info_hash,
                    event,
                    reason: error.to_string(),
                });
                self.remove_announcer(info_hash, RemovalReason::TemplateError);
                return;
            }
        };

        announcer.lock().mark_dispatched(event);
        self.chain.will_announce(&snapshot, event);
        tracing::debug!(
            "Announcing {} for {} to {}",
            event,
            snapshot.name,
            request.announce_url
        );

        let dispatch_id = self.next_dispatch_id;
        self.next_dispatch_id += 1;
        let url = request.announce_url.clone();
        let transport = Arc::clone(&self.transport);
        let permits = Arc::clone(&self.permits);
        let task = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            transport.announce(request).await
        });

        self.in_flight_tasks.insert(
            info_hash,
            InFlight {
                dispatch_id,
                event,
                abort: task.abort_handle(),
            },
        );
        self.in_flight.push(
            async move {
                AnnounceCompletion {
                    info_hash,
                    dispatch_id,
                    event,
                    outcome: join_outcome(task.await, url),
                }
            }
            .boxed(),
        );
    }

    /// Feeds a finished announce through the state machine and the chain.
    pub fn on_announce_completed(&mut self, completion: AnnounceCompletion) {
        let AnnounceCompletion {
            info_hash,
            dispatch_id,
            event,
            outcome,
        } = completion;

        let current = self
            .in_flight_tasks
            .get(&info_hash)
            .is_some_and(|task| task.dispatch_id == dispatch_id);
        if !current {
            tracing::trace!("Ignoring stale announce result for {}", info_hash.short());
            return;
        }
        self.in_flight_tasks.remove(&info_hash);

        let (Some(outcome), Some(announcer)) = (outcome, self.announcer(&info_hash)) else {
            return;
        };

        let stats = self.allocator.stats(&info_hash);
        let (transition, snapshot) = {
            let mut announcer = announcer.lock();
            let transition = match &outcome {
                Ok(response) => announcer.on_success(event, response, &stats, &self.policy),
                Err(_) => announcer.on_failure(event, &self.policy),
            };
            (transition, announcer.snapshot())
        };

        match &outcome {
            Ok(response) => self.chain.success(event, &snapshot, response),
            Err(error) => {
                self.chain.failure(event, &snapshot, error);
                if transition == Transition::Remove(RemovalReason::TooManyFailures) {
                    self.chain.too_many_failures(&snapshot, error);
                }
            }
        }

        self.apply_transition(info_hash, transition);
    }

    /// Sends `stopped` for every active torrent and releases all state.
    pub async fn shutdown(&mut self) {
        tracing::info!("Stopping seeding engine");
        self.running.store(false, Ordering::Release);
        self.scheduler.clear();
        self.queued.clear();

        for (_, task) in self.in_flight_tasks.drain() {
            task.abort.abort();
        }
        self.in_flight = FuturesUnordered::new();

        let announcers: Vec<Arc<Mutex<Announcer>>> =
            self.registry.read().values().cloned().collect();
        let mut stops = Vec::new();
        for announcer in &announcers {
            let (needs_stop, snapshot) = {
                let mut announcer = announcer.lock();
                let needs_stop = announcer.request_stop(RemovalReason::Shutdown);
                (needs_stop, announcer.snapshot())
            };
            if !needs_stop {
                continue;
            }

            match self.render_request(
                AnnounceEvent::Stopped,
                snapshot.info_hash,
                &snapshot.announce_url,
            ) {
                Ok(request) => {
                    self.chain.will_announce(&snapshot, AnnounceEvent::Stopped);
                    stops.push((Arc::clone(announcer), request));
                }
                Err(error) => {
                    tracing::error!("Cannot render stop announce for {}: {}", snapshot.name, error);
                }
            }
        }

        let flush = join_all(stops.iter().map(|(_, request)| {
            let transport = Arc::clone(&self.transport);
            let request = request.clone();
            async move { transport.announce(request).await }
        }));

        match tokio::time::timeout(self.stop_grace_period, flush).await {
            Ok(outcomes) => {
                for ((announcer, _), outcome) in stops.iter().zip(outcomes) {
                    self.finish_stop(announcer, &outcome);
                }
            }
            Err(_) => tracing::warn!(
                "{} stop announces did not finish within {:?}",
                stops.len(),
                self.stop_grace_period
            ),
        }

        self.allocator.stop();
        let removed: Vec<InfoHash> = self.registry.write().drain().map(|(hash, _)| hash).collect();
        for info_hash in removed {
            self.events.send(ClientEvent::TorrentRemoved {
                info_hash,
                reason: RemovalReason::Shutdown,
            });
        }
        self.events.send(ClientEvent::SeedingStopped);
        tracing::info!("Seeding engine stopped");
    }

    fn finish_stop(&self, announcer: &Arc<Mutex<Announcer>>, outcome: &AnnounceOutcome) {
        let info_hash = announcer.lock().info_hash();
        let stats = self.allocator.stats(&info_hash);
        let snapshot = {
            let mut announcer = announcer.lock();
            match outcome {
                Ok(response) => {
                    announcer.on_success(AnnounceEvent::Stopped, response, &stats, &self.policy)
                }
                Err(_) => announcer.on_failure(AnnounceEvent::Stopped, &self.policy),
            };
            announcer.snapshot()
        };

        match outcome {
            Ok(response) => self.chain.success(AnnounceEvent::Stopped, &snapshot, response),
            Err(error) => self.chain.failure(AnnounceEvent::Stopped, &snapshot, error),
        }
    }

    fn apply_transition(&mut self, info_hash: InfoHash, transition: Transition) {
        match transition {
            Transition::Reschedule(delay) => {
                self.scheduler.insert(info_hash, Instant::now() + delay);
            }
            Transition::Stop(reason) => {
                tracing::info!("Leaving swarm of {}: {}", info_hash.short(), reason);
                self.scheduler.insert(info_hash, Instant::now());
            }
            Transition::Remove(reason) => self.remove_announcer(info_hash, reason),
        }
    }

    fn render_request(
        &self,
        event: AnnounceEvent,
        info_hash: InfoHash,
        announce_url: &str,
    ) -> Result<TrackerRequest, TemplateError> {
        let stats = self.allocator.stats(&info_hash);
        let query = self
            .descriptor
            .render_query(event, info_hash, &stats, &self.connection)?;
        let headers = self.descriptor.render_headers()?;
        Ok(TrackerRequest {
            announce_url: announce_url.to_string(),
            query,
            headers,
        })
    }

    fn remove_announcer(&mut self, info_hash: InfoHash, reason: RemovalReason) {
        self.scheduler.remove(&info_hash);
        self.abort_in_flight(&info_hash);
        let removed = self.registry.write().remove(&info_hash);
        self.allocator.unregister(&info_hash);

        if let Some(announcer) = removed {
            let name = announcer.lock().torrent().name.clone();
            tracing::info!("Stopped seeding {} ({})", name, reason);
            self.events.send(ClientEvent::TorrentRemoved { info_hash, reason });
        }

        if self.running.load(Ordering::Acquire) {
            self.promote_queued();
        }
    }

    fn promote_queued(&mut self) {
        while self.seeding_count() < self.simultaneous_seed {
            let Some(torrent) = self.queued.pop_front() else {
                break;
            };
            tracing::info!("Promoting queued torrent {}", torrent.name);
            self.start_announcer(torrent);
        }
    }

    fn start_announcer(&mut self, torrent: TorrentIdentity) {
        let info_hash = torrent.info_hash;
        let announcer = Announcer::new(torrent, self.policy.default_interval);
        self.registry
            .write()
            .insert(info_hash, Arc::new(Mutex::new(announcer)));
        self.scheduler.insert(info_hash, Instant::now());
    }

    fn abort_in_flight(&mut self, info_hash: &InfoHash) {
        if let Some(task) = self.in_flight_tasks.remove(info_hash) {
            task.abort.abort();
        }
    }

    fn announcer(&self, info_hash: &InfoHash) -> Option<Arc<Mutex<Announcer>>> {
        self.registry.read().get(info_hash).cloned()
    }

    fn is_known(&self, info_hash: &InfoHash) -> bool {
        let seeding = self.registry.read().contains_key(info_hash);
        seeding || self.queued.iter().any(|torrent| torrent.info_hash == *info_hash)
    }

    fn seeding_count(&self) -> usize {
        self.registry.read().len()
    }

    fn report_add_failure(&self, name: &str, error: &TorrentError) {
        tracing::warn!("Cannot add torrent {}: {}", name, error);
        self.events.send(ClientEvent::TorrentAddFailed {
            name: name.to_string(),
            reason: error.to_string(),
        });
    }
}

fn join_outcome(
    joined: Result<AnnounceOutcome, JoinError>,
    url: String,
) -> Option<AnnounceOutcome> {
    match joined {
        Ok(outcome) => Some(outcome),
        Err(error) if error.is_cancelled() => None,
        Err(error) => Some(Err(TrackerError::ConnectionFailed {
            url,
            reason: format!("announce task failed: {error}"),
        })),
    }
}
