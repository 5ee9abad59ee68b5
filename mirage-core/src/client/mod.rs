//! Emulated BitTorrent client
//!
//! A client descriptor renders announce queries and headers exactly like
//! the emulated client would, using stateful peer-id and key generators.

pub mod descriptor;
pub mod encoding;
pub mod generator;
pub mod numwant;

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

pub use descriptor::{ClientDescriptor, ClientDescriptorSpec, HeaderTemplate};
pub use encoding::{HexCase, UrlEncoder};
pub use generator::{KeyGenerator, PeerIdGenerator, RefreshOn};
pub use numwant::NumwantProvider;

use crate::config::NetworkConfig;

/// Errors raised while loading a client descriptor or rendering from it.
///
/// Rendering errors are configuration defects and are never retried.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Placeholder {placeholder} was not recognized while building {context}")]
    UnrecognizedPlaceholder {
        placeholder: String,
        context: &'static str,
    },

    #[error("Client query contains {{key}} but the client has no key generator")]
    MissingKeyGenerator,

    #[error("Invalid identifier generator: {reason}")]
    InvalidGenerator { reason: String },

    #[error("Invalid url encoder pattern '{pattern}': {reason}")]
    InvalidEncoderPattern { pattern: String, reason: String },

    #[error("Invalid client descriptor: {reason}")]
    InvalidDescriptor { reason: String },

    #[error("Failed to parse client file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to read client file: {0}")]
    Io(#[from] std::io::Error),
}

/// Address and port advertised to trackers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub ip: IpAddr,
    pub port: u16,
}

impl ConnectionInfo {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Uses the configured address or the one of the default route.
    pub fn from_config(config: &NetworkConfig) -> Self {
        let ip = config.ip_address.unwrap_or_else(detect_local_ip);
        Self::new(ip, config.port)
    }
}

/// Finds the address of the outgoing interface.
///
/// Connecting a UDP socket only selects a route, no packet is sent.
fn detect_local_ip() -> IpAddr {
    let detected = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip());

    match detected {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            tracing::warn!("Could not detect local address, using loopback: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}
