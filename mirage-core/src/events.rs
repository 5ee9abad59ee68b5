//! Notifications emitted by the seeding engine

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::announcer::RemovalReason;
use crate::bandwidth::{Speed, SpeedListener};
use crate::torrent::InfoHash;
use crate::tracker::AnnounceEvent;

/// Lifecycle and announce notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Engine started; `client` is the emulated User-Agent.
    SeedingStarted { client: String },
    SeedingStopped,
    SpeedsChanged(HashMap<InfoHash, Speed>),
    TorrentAddFailed {
        name: String,
        reason: String,
    },
    WillAnnounce {
        info_hash: InfoHash,
        event: AnnounceEvent,
    },
    AnnounceSucceeded {
        info_hash: InfoHash,
        event: AnnounceEvent,
        interval: Duration,
        seeders: u32,
        leechers: u32,
    },
    AnnounceFailed {
        info_hash: InfoHash,
        event: AnnounceEvent,
        reason: String,
    },
    /// Emitted once when a torrent exceeds the failure threshold.
    TooManyAnnounceFailures {
        info_hash: InfoHash,
        reason: String,
    },
    TorrentRemoved {
        info_hash: InfoHash,
        reason: RemovalReason,
    },
}

pub type EventReceiver = mpsc::UnboundedReceiver<ClientEvent>;

/// Fire-and-forget sender. A dropped receiver is not an error.
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: Option<mpsc::UnboundedSender<ClientEvent>>,
}

impl EventSender {
    pub fn channel() -> (Self, EventReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// Sender that discards everything.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn send(&self, event: ClientEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }
}

/// Publishes allocator snapshots as [`ClientEvent::SpeedsChanged`].
#[derive(Debug, Clone)]
pub struct SpeedEventForwarder {
    events: EventSender,
}

impl SpeedEventForwarder {
    pub fn new(events: EventSender) -> Self {
        Self { events }
    }
}

impl SpeedListener for SpeedEventForwarder {
    fn speeds_changed(&self, speeds: &HashMap<InfoHash, Speed>) {
        self.events.send(ClientEvent::SpeedsChanged(speeds.clone()));
    }
}
