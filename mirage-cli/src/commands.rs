//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use mirage_core::config::ClientEnvironment;
use mirage_core::torrent::{DirectoryTorrentSource, parse_torrent_bytes};
use mirage_core::{
    AnnounceEvent, AppSettings, ClientDescriptor, ClientEvent, ConnectionInfo, EventSender,
    HttpTrackerTransport, InfoHash, MirageConfig, SeedStats, TorrentIdentity, spawn_seeding_engine,
};

/// Info hash used by `render` when none is given.
const SAMPLE_INFO_HASH: [u8; 20] = *b"mirage-sample-hash!!";

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Seed every torrent of a configuration directory until Ctrl-C
    Run {
        /// Directory holding config.json, clients/ and torrents/
        #[arg(long, default_value = ".")]
        conf: PathBuf,
    },
    /// Print the query and headers a client file produces
    Render {
        /// Path to the client file
        #[arg(long)]
        client: PathBuf,
        /// Announce event to render
        #[arg(long, value_enum, default_value_t = EventArg::Started)]
        event: EventArg,
        /// Info hash to render, as 40 hex characters
        #[arg(long)]
        info_hash: Option<String>,
    },
    /// Print the identity of a .torrent file
    Inspect {
        /// Path to the torrent file
        torrent: PathBuf,
    },
}

/// Announce event as accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EventArg {
    Started,
    None,
    Stopped,
}

impl From<EventArg> for AnnounceEvent {
    fn from(event: EventArg) -> Self {
        match event {
            EventArg::Started => AnnounceEvent::Started,
            EventArg::None => AnnounceEvent::None,
            EventArg::Stopped => AnnounceEvent::Stopped,
        }
    }
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of the command that failed, with context
pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Run { conf } => run(&conf).await,
        Commands::Render {
            client,
            event,
            info_hash,
        } => render(&client, event, info_hash.as_deref()).await,
        Commands::Inspect { torrent } => inspect(&torrent).await,
    }
}

/// Seeds until Ctrl-C, then flushes `stopped` announces.
///
/// # Errors
/// - Configuration, client file or transport setup failed
pub async fn run(conf: &Path) -> Result<()> {
    let settings_path = conf.join("config.json");
    let settings = AppSettings::load(&settings_path)
        .await
        .with_context(|| format!("Failed to load {}", settings_path.display()))?;

    let mut config = MirageConfig::from_env();
    config.seed = settings.to_seed_config()?;

    let client_path = conf.join("clients").join(&config.seed.client_file);
    let descriptor = ClientDescriptor::load(&client_path, config.client.clone())
        .await
        .with_context(|| format!("Failed to load client file {}", client_path.display()))?;

    let source = DirectoryTorrentSource::new(conf.join("torrents"));
    let (torrents, failures) = source
        .load_all()
        .await
        .with_context(|| format!("Failed to scan {}", source.directory().display()))?;
    for failure in failures {
        tracing::warn!("Skipping {}: {}", failure.name, failure.reason);
    }

    let transport =
        HttpTrackerTransport::new(&config.network).context("Failed to build HTTP client")?;
    let (events, mut receiver) = EventSender::channel();
    let handle = spawn_seeding_engine(config, Arc::new(descriptor), transport, torrents, events);

    let printer = tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            log_event(&event);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Interrupted, sending stop announces");

    handle.shutdown().await?;
    printer.abort();
    Ok(())
}

/// Prints a rendered announce for a client file.
///
/// # Errors
/// - Client file invalid, info hash malformed or template rendering failed
pub async fn render(client: &Path, event: EventArg, info_hash: Option<&str>) -> Result<()> {
    let descriptor = ClientDescriptor::load(client, ClientEnvironment::detect())
        .await
        .with_context(|| format!("Failed to load client file {}", client.display()))?;

    let info_hash = match info_hash {
        Some(hex) => InfoHash::from_hex(hex)?,
        None => InfoHash::new(SAMPLE_INFO_HASH),
    };
    let config = MirageConfig::from_env();
    let connection = ConnectionInfo::from_config(&config.network);

    let query =
        descriptor.render_query(event.into(), info_hash, &SeedStats::default(), &connection)?;
    println!("{query}");
    for (name, value) in descriptor.render_headers()? {
        println!("{name}: {value}");
    }

    Ok(())
}

/// Prints the identity of a torrent file as JSON.
///
/// # Errors
/// - File unreadable or not a valid torrent
pub async fn inspect(torrent: &Path) -> Result<()> {
    let identity = load_identity(torrent).await?;
    println!("{}", serde_json::to_string_pretty(&identity_json(&identity))?);
    Ok(())
}

async fn load_identity(path: &Path) -> Result<TorrentIdentity> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let identity = parse_torrent_bytes(&bytes)
        .with_context(|| format!("Invalid torrent file {}", path.display()))?;
    Ok(identity)
}

fn identity_json(identity: &TorrentIdentity) -> serde_json::Value {
    serde_json::json!({
        "infoHash": identity.info_hash.to_string(),
        "name": identity.name,
        "totalSize": identity.total_size,
        "announceUrls": identity.announce_urls,
    })
}

fn log_event(event: &ClientEvent) {
    match event {
        ClientEvent::SeedingStarted { client } => tracing::info!("Seeding as {}", client),
        ClientEvent::SeedingStopped => tracing::info!("Seeding stopped"),
        ClientEvent::SpeedsChanged(speeds) => tracing::debug!(
            "Uploading {} B/s across {} torrents",
            speeds.values().sum::<u64>(),
            speeds.len()
        ),
        ClientEvent::TorrentAddFailed { name, reason } => {
            tracing::warn!("Could not add {}: {}", name, reason)
        }
        ClientEvent::WillAnnounce { info_hash, event } => {
            tracing::trace!("{} announcing {}", info_hash.short(), event)
        }
        ClientEvent::AnnounceSucceeded {
            info_hash,
            event,
            interval,
            seeders,
            leechers,
        } => tracing::info!(
            "{} {}: {} seeders, {} leechers, next in {:?}",
            info_hash.short(),
            event,
            seeders,
            leechers,
            interval
        ),
        ClientEvent::AnnounceFailed {
            info_hash,
            event,
            reason,
        } => tracing::warn!("{} {} failed: {}", info_hash.short(), event, reason),
        ClientEvent::TooManyAnnounceFailures { info_hash, reason } => {
            tracing::error!("{} gave up after repeated failures: {}", info_hash.short(), reason)
        }
        ClientEvent::TorrentRemoved { info_hash, reason } => {
            tracing::info!("{} removed: {}", info_hash.short(), reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE_FILE: &[u8] = b"d8:announce31:http://tracker.example.com/annc4:infod6:lengthi1000e4:name8:test.txt12:piece lengthi32768e6:pieces20:12345678901234567890ee";

    #[test]
    fn test_event_arg_conversion() {
        assert_eq!(AnnounceEvent::from(EventArg::Started), AnnounceEvent::Started);
        assert_eq!(AnnounceEvent::from(EventArg::None), AnnounceEvent::None);
        assert_eq!(AnnounceEvent::from(EventArg::Stopped), AnnounceEvent::Stopped);
    }

    #[tokio::test]
    async fn test_inspect_reads_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.torrent");
        std::fs::write(&path, SINGLE_FILE).unwrap();

        let identity = load_identity(&path).await.unwrap();
        let json = identity_json(&identity);
        assert_eq!(json["name"], "test.txt");
        assert_eq!(json["totalSize"], 1000);
        assert_eq!(json["announceUrls"][0], "http://tracker.example.com/annc");
        assert_eq!(json["infoHash"].as_str().map(str::len), Some(40));
    }

    #[tokio::test]
    async fn test_inspect_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.torrent");
        std::fs::write(&path, b"garbage").unwrap();

        let error = load_identity(&path).await.unwrap_err();
        assert!(error.to_string().contains("Invalid torrent file"));
    }

    #[tokio::test]
    async fn test_run_without_config() {
        let dir = tempfile::tempdir().unwrap();
        let error = run(dir.path()).await.unwrap_err();
        assert!(error.to_string().contains("config.json"));
    }
}
