//! Mirage Core - tracker announce emulation
//!
//! This crate emulates the tracker-facing behaviour of a real BitTorrent
//! client: announce queries and headers rendered byte-for-byte from a client
//! descriptor, stateful peer-id and key generation, simulated upload and
//! download counters, and per-torrent announce scheduling with backoff.
//! No payload data is ever transferred.

pub mod announcer;
pub mod bandwidth;
pub mod client;
pub mod config;
pub mod engine;
pub mod events;
pub mod scheduler;
pub mod torrent;
pub mod tracing_setup;
pub mod tracker;

pub use announcer::{Announcer, AnnouncerSnapshot, AnnouncerState, RemovalReason};
pub use bandwidth::{BandwidthAllocator, SeedStats, Speed, SwarmCounts};
pub use client::{ClientDescriptor, ConnectionInfo, TemplateError};
pub use config::{AppSettings, ConfigError, MirageConfig};
pub use engine::{SeedingEngineHandle, spawn_seeding_engine};
pub use events::{ClientEvent, EventReceiver, EventSender};
pub use scheduler::AnnounceScheduler;
pub use torrent::{InfoHash, TorrentError, TorrentIdentity};
pub use tracker::{
    AnnounceEvent, AnnounceResponse, HttpTrackerTransport, TrackerError, TrackerRequest,
    TrackerTransport,
};

/// Errors that can bubble up from any Mirage subsystem.
#[derive(Debug, thiserror::Error)]
pub enum MirageError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Client descriptor error: {0}")]
    Template(#[from] TemplateError),

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MirageError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            MirageError::Torrent(e) => match e {
                TorrentError::InvalidTorrentFile { reason } => {
                    format!("Invalid torrent file: {reason}")
                }
                TorrentError::TorrentNotFound { info_hash } => {
                    format!("Torrent {info_hash} not found")
                }
                TorrentError::DuplicateTorrent { info_hash } => {
                    format!("Torrent {info_hash} is already seeding")
                }
                TorrentError::EngineShutdown => "Seeding engine is not running".to_string(),
                _ => "Torrent error occurred".to_string(),
            },
            MirageError::Template(e) => format!("Invalid client file: {e}"),
            MirageError::Tracker(e) => format!("Tracker communication failed: {e}"),
            MirageError::Config(e) => format!("Invalid configuration: {e}"),
            MirageError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            MirageError::Config(_)
                | MirageError::Template(_)
                | MirageError::Torrent(TorrentError::InvalidTorrentFile { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, MirageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors() {
        let invalid = MirageError::from(TorrentError::InvalidTorrentFile {
            reason: "Empty file".to_string(),
        });
        assert!(invalid.is_user_error());
        assert_eq!(invalid.user_message(), "Invalid torrent file: Empty file");

        let tracker = MirageError::from(TrackerError::Timeout {
            url: "http://tracker.example.com/announce".to_string(),
        });
        assert!(!tracker.is_user_error());
        assert!(tracker.user_message().starts_with("Tracker communication failed"));

        let template = MirageError::from(TemplateError::MissingKeyGenerator);
        assert!(template.is_user_error());
    }
}
