//! Tracker announce types and the transport seam
//!
//! The engine only ever talks to a [`TrackerTransport`]; the HTTP adapter
//! lives in [`http`] and tests substitute scripted transports.

pub mod http;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

pub use http::{HttpTrackerTransport, parse_announce_response};

/// BitTorrent announce events.
///
/// `None` is the regular periodic announce and has no wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnnounceEvent {
    Started,
    None,
    Stopped,
}

impl AnnounceEvent {
    /// Canonical query value, absent for regular announces.
    pub fn name(self) -> Option<&'static str> {
        match self {
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::None => None,
        }
    }
}

impl fmt::Display for AnnounceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name().unwrap_or("none"))
    }
}

/// Successful tracker answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Delay the tracker asks for before the next announce
    pub interval: Duration,
    /// Lower bound the tracker enforces between announces
    pub min_interval: Option<Duration>,
    /// Number of seeders in the swarm
    pub seeders: u32,
    /// Number of leechers in the swarm
    pub leechers: u32,
}

impl AnnounceResponse {
    /// Interval to wait, honouring `min interval` when it is larger.
    pub fn effective_interval(&self) -> Duration {
        match self.min_interval {
            Some(min) if min > self.interval => min,
            _ => self.interval,
        }
    }
}

/// Fully rendered announce request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerRequest {
    pub announce_url: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
}

impl TrackerRequest {
    /// Announce URL with the query appended verbatim.
    ///
    /// The query is already percent-encoded and must not be touched again.
    pub fn url(&self) -> String {
        let separator = if self.announce_url.contains('?') {
            '&'
        } else {
            '?'
        };
        format!("{}{}{}", self.announce_url, separator, self.query)
    }
}

/// Performs announce requests against a tracker.
#[async_trait]
pub trait TrackerTransport: Send + Sync {
    /// Sends one announce and decodes the tracker answer.
    ///
    /// # Errors
    /// - `TrackerError::ConnectionFailed` / `TrackerError::Timeout` - Network level failure
    /// - `TrackerError::NotFound` / `TrackerError::ServerError` - Tracker answered 404 or 5xx
    /// - `TrackerError::UnexpectedStatus` - Any other non-2xx answer
    /// - `TrackerError::TrackerFailure` - Tracker returned a `failure reason`
    /// - `TrackerError::MalformedResponse` - Body is not a valid announce response
    async fn announce(&self, request: TrackerRequest) -> Result<AnnounceResponse, TrackerError>;
}

/// Errors from a single announce attempt. All of them are retryable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    #[error("Connection to {url} failed: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Tracker {url} timed out")]
    Timeout { url: String },

    #[error("Tracker {url} answered 404")]
    NotFound { url: String },

    #[error("Tracker {url} server error (status {status})")]
    ServerError { url: String, status: u16 },

    #[error("Tracker {url} answered unexpected status {status}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("Tracker refused announce: {reason}")]
    TrackerFailure { reason: String },

    #[error("Malformed tracker response: {reason}")]
    MalformedResponse { reason: String },
}
