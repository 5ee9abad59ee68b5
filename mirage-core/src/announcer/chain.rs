//! Observers of announce outcomes
//!
//! Handlers run in registration order and every handler sees every
//! notification.

use std::sync::Arc;

use super::AnnouncerSnapshot;
use crate::bandwidth::{BandwidthAllocator, SeedStats, SwarmCounts};
use crate::events::{ClientEvent, EventSender};
use crate::tracker::{AnnounceEvent, AnnounceResponse, TrackerError};

/// Hooks called around each announce. All default to no-ops.
pub trait AnnounceResponseHandler: Send + Sync {
    fn on_will_announce(&self, _announcer: &AnnouncerSnapshot, _event: AnnounceEvent) {}

    fn on_start_success(&self, _announcer: &AnnouncerSnapshot, _response: &AnnounceResponse) {}

    fn on_regular_success(&self, _announcer: &AnnouncerSnapshot, _response: &AnnounceResponse) {}

    fn on_stop_success(&self, _announcer: &AnnouncerSnapshot, _response: &AnnounceResponse) {}

    fn on_start_failure(&self, _announcer: &AnnouncerSnapshot, _error: &TrackerError) {}

    fn on_regular_failure(&self, _announcer: &AnnouncerSnapshot, _error: &TrackerError) {}

    fn on_stop_failure(&self, _announcer: &AnnouncerSnapshot, _error: &TrackerError) {}

    fn on_too_many_failures(&self, _announcer: &AnnouncerSnapshot, _error: &TrackerError) {}
}

#[derive(Default, Clone)]
pub struct ResponseHandlerChain {
    handlers: Vec<Arc<dyn AnnounceResponseHandler>>,
}

impl ResponseHandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, handler: Arc<dyn AnnounceResponseHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn will_announce(&self, announcer: &AnnouncerSnapshot, event: AnnounceEvent) {
        for handler in &self.handlers {
            handler.on_will_announce(announcer, event);
        }
    }

    /// Routes a success to the hook matching the event that was sent.
    pub fn success(
        &self,
        event: AnnounceEvent,
        announcer: &AnnouncerSnapshot,
        response: &AnnounceResponse,
    ) {
        for handler in &self.handlers {
            match event {
                AnnounceEvent::Started => handler.on_start_success(announcer, response),
                AnnounceEvent::None => handler.on_regular_success(announcer, response),
                AnnounceEvent::Stopped => handler.on_stop_success(announcer, response),
            }
        }
    }

    /// Routes a failure to the hook matching the event that was sent.
    pub fn failure(
        &self,
        event: AnnounceEvent,
        announcer: &AnnouncerSnapshot,
        error: &TrackerError,
    ) {
        for handler in &self.handlers {
            match event {
                AnnounceEvent::Started => handler.on_start_failure(announcer, error),
                AnnounceEvent::None => handler.on_regular_failure(announcer, error),
                AnnounceEvent::Stopped => handler.on_stop_failure(announcer, error),
            }
        }
    }

    pub fn too_many_failures(&self, announcer: &AnnouncerSnapshot, error: &TrackerError) {
        for handler in &self.handlers {
            handler.on_too_many_failures(announcer, error);
        }
    }
}

/// Keeps the bandwidth allocator in sync with the seeding set.
pub struct BandwidthNotifier {
    allocator: BandwidthAllocator,
}

impl BandwidthNotifier {
    pub fn new(allocator: BandwidthAllocator) -> Self {
        Self { allocator }
    }
}

fn swarm_of(response: &AnnounceResponse) -> SwarmCounts {
    SwarmCounts {
        seeders: response.seeders,
        leechers: response.leechers,
    }
}

impl AnnounceResponseHandler for BandwidthNotifier {
    fn on_start_success(&self, announcer: &AnnouncerSnapshot, response: &AnnounceResponse) {
        self.allocator
            .register(announcer.info_hash, SeedStats::default(), swarm_of(response));
    }

    fn on_regular_success(&self, announcer: &AnnouncerSnapshot, response: &AnnounceResponse) {
        self.allocator
            .update_swarm(announcer.info_hash, swarm_of(response));
    }

    fn on_stop_success(&self, announcer: &AnnouncerSnapshot, _response: &AnnounceResponse) {
        self.allocator.unregister(&announcer.info_hash);
    }

    fn on_stop_failure(&self, announcer: &AnnouncerSnapshot, _error: &TrackerError) {
        self.allocator.unregister(&announcer.info_hash);
    }

    fn on_too_many_failures(&self, announcer: &AnnouncerSnapshot, _error: &TrackerError) {
        self.allocator.unregister(&announcer.info_hash);
    }
}

/// Forwards announce outcomes to the event channel.
pub struct EventPublisher {
    events: EventSender,
}

impl EventPublisher {
    pub fn new(events: EventSender) -> Self {
        Self { events }
    }

    fn succeeded(
        &self,
        announcer: &AnnouncerSnapshot,
        event: AnnounceEvent,
        response: &AnnounceResponse,
    ) {
        tracing::debug!(
            "Announce {} for {} succeeded: {} seeders, {} leechers, next in {:?}",
            event,
            announcer.name,
            response.seeders,
            response.leechers,
            response.effective_interval()
        );
        self.events.send(ClientEvent::AnnounceSucceeded {
            info_hash: announcer.info_hash,
            event,
            interval: response.effective_interval(),
            seeders: response.seeders,
            leechers: response.leechers,
        });
    }

    fn failed(&self, announcer: &AnnouncerSnapshot, event: AnnounceEvent, error: &TrackerError) {
        tracing::warn!(
            "Announce {} for {} failed ({} in a row): {}",
            event,
            announcer.name,
            announcer.consecutive_failures,
            error
        );
        self.events.send(ClientEvent::AnnounceFailed {
            info_hash: announcer.info_hash,
            event,
            reason: error.to_string(),
        });
    }
}

impl AnnounceResponseHandler for EventPublisher {
    fn on_will_announce(&self, announcer: &AnnouncerSnapshot, event: AnnounceEvent) {
        self.events.send(ClientEvent::WillAnnounce {
            info_hash: announcer.info_hash,
            event,
        });
    }

    fn on_start_success(&self, announcer: &AnnouncerSnapshot, response: &AnnounceResponse) {
        self.succeeded(announcer, AnnounceEvent::Started, response);
    }

    fn on_regular_success(&self, announcer: &AnnouncerSnapshot, response: &AnnounceResponse) {
        self.succeeded(announcer, AnnounceEvent::None, response);
    }

    fn on_stop_success(&self, announcer: &AnnouncerSnapshot, response: &AnnounceResponse) {
        self.succeeded(announcer, AnnounceEvent::Stopped, response);
    }

    fn on_start_failure(&self, announcer: &AnnouncerSnapshot, error: &TrackerError) {
        self.failed(announcer, AnnounceEvent::Started, error);
    }

    fn on_regular_failure(&self, announcer: &AnnouncerSnapshot, error: &TrackerError) {
        self.failed(announcer, AnnounceEvent::None, error);
    }

    fn on_stop_failure(&self, announcer: &AnnouncerSnapshot, error: &TrackerError) {
        self.failed(announcer, AnnounceEvent::Stopped, error);
    }

    fn on_too_many_failures(&self, announcer: &AnnouncerSnapshot, error: &TrackerError) {
        tracing::error!(
            "Giving up on {} after {} failed announces: {}",
            announcer.name,
            announcer.consecutive_failures,
            error
        );
        self.events.send(ClientEvent::TooManyAnnounceFailures {
            info_hash: announcer.info_hash,
            reason: error.to_string(),
        });
    }
}
