//! Per-torrent announce state machine
//!
//! An [`Announcer`] only knows its torrent and its own progress. The engine
//! owns the set of announcers, performs the requests and applies the
//! [`Transition`] each outcome produces.

pub mod chain;

use std::fmt;
use std::time::Duration;

pub use chain::{AnnounceResponseHandler, BandwidthNotifier, EventPublisher, ResponseHandlerChain};

use crate::bandwidth::{SeedStats, SwarmCounts};
use crate::config::MirageConfig;
use crate::torrent::{InfoHash, TorrentIdentity};
use crate::tracker::{AnnounceEvent, AnnounceResponse};

const MIN_RESCHEDULE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnnouncerState {
    /// Waiting for a successful `started` announce
    PendingStart,
    Active,
    /// One `stopped` announce left to send
    PendingStop,
    Stopped,
    FailedRemoved,
}

impl AnnouncerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AnnouncerState::Stopped | AnnouncerState::FailedRemoved)
    }
}

/// Why a torrent left the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalReason {
    Requested,
    Shutdown,
    TooManyFailures,
    TemplateError,
    NoLeechers,
    RatioReached,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemovalReason::Requested => "removal requested",
            RemovalReason::Shutdown => "engine shutdown",
            RemovalReason::TooManyFailures => "too many announce failures",
            RemovalReason::TemplateError => "client template error",
            RemovalReason::NoLeechers => "no leechers",
            RemovalReason::RatioReached => "upload ratio reached",
        };
        f.write_str(name)
    }
}

/// What the engine must do after an announce completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Announce again after the delay
    Reschedule(Duration),
    /// Send the `stopped` announce now
    Stop(RemovalReason),
    /// Drop the announcer
    Remove(RemovalReason),
}

/// Knobs of the state machine, taken from [`MirageConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct AnnouncerPolicy {
    pub default_interval: Duration,
    pub failure_backoff_base: Duration,
    pub max_consecutive_failures: u32,
    pub keep_torrent_with_zero_leechers: bool,
    pub upload_ratio_target: Option<f64>,
}

impl AnnouncerPolicy {
    pub fn from_config(config: &MirageConfig) -> Self {
        Self {
            default_interval: config.network.default_announce_interval,
            failure_backoff_base: config.network.failure_backoff_base,
            max_consecutive_failures: config.network.max_consecutive_failures.max(1),
            keep_torrent_with_zero_leechers: config.seed.keep_torrent_with_zero_leechers,
            upload_ratio_target: config.seed.upload_ratio_target,
        }
    }
}

impl Default for AnnouncerPolicy {
    fn default() -> Self {
        Self::from_config(&MirageConfig::default())
    }
}

/// Read-only view of an announcer for status queries and handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnouncerSnapshot {
    pub info_hash: InfoHash,
    pub name: String,
    pub total_size: u64,
    pub state: AnnouncerState,
    pub next_event: Option<AnnounceEvent>,
    pub last_known_interval: Duration,
    pub consecutive_failures: u32,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub announce_url: String,
}

#[derive(Debug)]
pub struct Announcer {
    torrent: TorrentIdentity,
    state: AnnouncerState,
    last_known_interval: Duration,
    consecutive_failures: u32,
    last_swarm: Option<SwarmCounts>,
    tracker_index: usize,
    stop_reason: Option<RemovalReason>,
    /// A `started` announce has been handed to the transport
    started_sent: bool,
}

impl Announcer {
    pub fn new(torrent: TorrentIdentity, default_interval: Duration) -> Self {
        Self {
            torrent,
            state: AnnouncerState::PendingStart,
            last_known_interval: default_interval.max(MIN_RESCHEDULE),
            consecutive_failures: 0,
            last_swarm: None,
            tracker_index: 0,
            stop_reason: None,
            started_sent: false,
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.torrent.info_hash
    }

    pub fn torrent(&self) -> &TorrentIdentity {
        &self.torrent
    }

    pub fn state(&self) -> AnnouncerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_known_interval(&self) -> Duration {
        self.last_known_interval
    }

    pub fn last_swarm(&self) -> Option<SwarmCounts> {
        self.last_swarm
    }

    pub fn stop_reason(&self) -> Option<RemovalReason> {
        self.stop_reason
    }

    /// Event of the next announce, `None` once terminal.
    pub fn next_event(&self) -> Option<AnnounceEvent> {
        match self.state {
            AnnouncerState::PendingStart => Some(AnnounceEvent::Started),
            AnnouncerState::Active => Some(AnnounceEvent::None),
            AnnouncerState::PendingStop => Some(AnnounceEvent::Stopped),
            AnnouncerState::Stopped | AnnouncerState::FailedRemoved => None,
        }
    }

    /// Records that an announce with `event` is going out.
    pub fn mark_dispatched(&mut self, event: AnnounceEvent) {
        if event == AnnounceEvent::Started {
            self.started_sent = true;
        }
    }

    /// Tracker currently in use. Rotates on failure.
    pub fn announce_url(&self) -> &str {
        let urls = &self.torrent.announce_urls;
        if urls.is_empty() {
            return "";
        }
        &urls[self.tracker_index % urls.len()]
    }

    /// Asks the announcer to leave the swarm.
    ///
    /// Returns true when a `stopped` announce must be sent. A torrent whose
    /// `started` never went out goes straight to `Stopped`.
    pub fn request_stop(&mut self, reason: RemovalReason) -> bool {
        match self.state {
            AnnouncerState::PendingStart if !self.started_sent => {
                self.stop_reason = Some(reason);
                self.state = AnnouncerState::Stopped;
                false
            }
            AnnouncerState::PendingStart | AnnouncerState::Active => {
                self.stop_reason = Some(reason);
                self.state = AnnouncerState::PendingStop;
                true
            }
            AnnouncerState::PendingStop => true,
            AnnouncerState::Stopped | AnnouncerState::FailedRemoved => false,
        }
    }

    /// Applies a successful response to the announce sent with `event`.
    pub fn on_success(
        &mut self,
        event: AnnounceEvent,
        response: &AnnounceResponse,
        stats: &SeedStats,
        policy: &AnnouncerPolicy,
    ) -> Transition {
        if let Some(reason) = self.terminal_reason() {
            return Transition::Remove(reason);
        }

        self.consecutive_failures = 0;
        self.last_known_interval = response.effective_interval().max(MIN_RESCHEDULE);
        self.last_swarm = Some(SwarmCounts {
            seeders: response.seeders,
            leechers: response.leechers,
        });

        if event == AnnounceEvent::Stopped {
            self.state = AnnouncerState::Stopped;
            return Transition::Remove(self.stop_reason.unwrap_or(RemovalReason::Requested));
        }

        if let Some(reason) = self.pending_stop_reason() {
            return Transition::Stop(reason);
        }
        self.state = AnnouncerState::Active;

        if !policy.keep_torrent_with_zero_leechers && response.leechers == 0 {
            self.request_stop(RemovalReason::NoLeechers);
            return Transition::Stop(RemovalReason::NoLeechers);
        }

        if let Some(target) = policy.upload_ratio_target {
            if self.torrent.total_size > 0
                && stats.uploaded as f64 / self.torrent.total_size as f64 >= target
            {
                self.request_stop(RemovalReason::RatioReached);
                return Transition::Stop(RemovalReason::RatioReached);
            }
        }

        Transition::Reschedule(self.last_known_interval)
    }

    /// Applies a failed announce sent with `event`.
    ///
    /// A failed `stopped` is never retried.
    pub fn on_failure(&mut self, event: AnnounceEvent, policy: &AnnouncerPolicy) -> Transition {
        if let Some(reason) = self.terminal_reason() {
            return Transition::Remove(reason);
        }

        if event == AnnounceEvent::Stopped {
            self.state = AnnouncerState::Stopped;
            return Transition::Remove(self.stop_reason.unwrap_or(RemovalReason::Requested));
        }

        self.consecutive_failures += 1;
        self.rotate_tracker();

        if let Some(reason) = self.pending_stop_reason() {
            return Transition::Stop(reason);
        }

        if self.consecutive_failures >= policy.max_consecutive_failures {
            self.state = AnnouncerState::FailedRemoved;
            return Transition::Remove(RemovalReason::TooManyFailures);
        }

        Transition::Reschedule(self.backoff(policy))
    }

    /// `min(base × 2^(failures-1), last interval)`, at least one second.
    pub fn backoff(&self, policy: &AnnouncerPolicy) -> Duration {
        let exponent = self.consecutive_failures.saturating_sub(1).min(16);
        policy
            .failure_backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.last_known_interval)
            .max(MIN_RESCHEDULE)
    }

    pub fn snapshot(&self) -> AnnouncerSnapshot {
        AnnouncerSnapshot {
            info_hash: self.torrent.info_hash,
            name: self.torrent.name.clone(),
            total_size: self.torrent.total_size,
            state: self.state,
            next_event: self.next_event(),
            last_known_interval: self.last_known_interval,
            consecutive_failures: self.consecutive_failures,
            seeders: self.last_swarm.map(|swarm| swarm.seeders),
            leechers: self.last_swarm.map(|swarm| swarm.leechers),
            announce_url: self.announce_url().to_string(),
        }
    }

    /// Outcomes arriving after the announcer ended only confirm removal.
    fn terminal_reason(&self) -> Option<RemovalReason> {
        match self.state {
            AnnouncerState::Stopped => {
                Some(self.stop_reason.unwrap_or(RemovalReason::Requested))
            }
            AnnouncerState::FailedRemoved => Some(RemovalReason::TooManyFailures),
            _ => None,
        }
    }

    fn pending_stop_reason(&self) -> Option<RemovalReason> {
        (self.state == AnnouncerState::PendingStop)
            .then(|| self.stop_reason.unwrap_or(RemovalReason::Requested))
    }

    fn rotate_tracker(&mut self) {
        let urls = self.torrent.announce_urls.len();
        if urls > 1 {
            self.tracker_index = (self.tracker_index + 1) % urls;
            tracing::debug!(
                "Rotating {} to tracker {}",
                self.torrent.info_hash.short(),
                self.announce_url()
            );
        }
    }
}
