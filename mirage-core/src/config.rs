//! Centralized configuration for Mirage.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Emulated Java runtime reported through the `{java}` header placeholder.
pub const DEFAULT_JAVA_VERSION: &str = "1.8.0_402";

/// Central configuration for all Mirage components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct MirageConfig {
    pub seed: SeedConfig,
    pub network: NetworkConfig,
    pub client: ClientEnvironment,
    pub simulation: SimulationConfig,
}

/// Seeding behaviour, usually loaded from `config.json`.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedConfig {
    /// Lower bound of the aggregate upload speed in bytes per second
    pub min_upload_rate: u64,
    /// Upper bound of the aggregate upload speed in bytes per second
    pub max_upload_rate: u64,
    /// Maximum number of torrents announced at the same time
    pub simultaneous_seed: usize,
    /// File name of the client descriptor under `clients/`
    pub client_file: String,
    /// Keep seeding torrents whose tracker reports no leechers
    pub keep_torrent_with_zero_leechers: bool,
    /// Stop a torrent once `uploaded / size` reaches this value
    pub upload_ratio_target: Option<f64>,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            min_upload_rate: 30_000,
            max_upload_rate: 160_000,
            simultaneous_seed: 5,
            client_file: "qbittorrent-4.2.5.client".to_string(),
            keep_torrent_with_zero_leechers: true,
            upload_ratio_target: None,
        }
    }
}

/// Tracker communication and announce scheduling configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Port advertised to trackers
    pub port: u16,
    /// Advertised address; detected from the routing table when `None`
    pub ip_address: Option<IpAddr>,
    /// HTTP request timeout for tracker communication
    pub tracker_timeout: Duration,
    /// Maximum number of announce requests in flight
    pub max_concurrent_announces: usize,
    /// Interval used until a tracker reports its own
    pub default_announce_interval: Duration,
    /// First retry delay after a failed announce, doubled per failure
    pub failure_backoff_base: Duration,
    /// Consecutive failures after which a torrent is dropped
    pub max_consecutive_failures: u32,
    /// Upper bound for the STOPPED flush on shutdown
    pub stop_grace_period: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: 49152,
            ip_address: None,
            tracker_timeout: Duration::from_secs(30),
            max_concurrent_announces: num_cpus::get().max(1) * 2,
            default_announce_interval: Duration::from_secs(10),
            failure_backoff_base: Duration::from_secs(5),
            max_consecutive_failures: 5,
            stop_grace_period: Duration::from_secs(5),
        }
    }
}

/// Values substituted into header templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEnvironment {
    /// `{java}`
    pub java_version: String,
    /// `{os}`
    pub os_name: String,
    /// `{locale}`, as a BCP-47 language tag
    pub locale: String,
}

impl Default for ClientEnvironment {
    fn default() -> Self {
        Self::detect()
    }
}

impl ClientEnvironment {
    /// Builds the environment from the host operating system and `LANG`.
    pub fn detect() -> Self {
        let locale = std::env::var("LC_ALL")
            .ok()
            .filter(|value| !value.is_empty())
            .or_else(|| std::env::var("LANG").ok())
            .map(|value| posix_locale_to_language_tag(&value))
            .unwrap_or_else(|| "en-US".to_string());

        Self {
            java_version: DEFAULT_JAVA_VERSION.to_string(),
            os_name: host_os_name(),
            locale,
        }
    }

    /// Fixed values for reproducible tests.
    pub fn for_testing() -> Self {
        Self {
            java_version: DEFAULT_JAVA_VERSION.to_string(),
            os_name: "Linux".to_string(),
            locale: "en-US".to_string(),
        }
    }
}

fn host_os_name() -> String {
    match std::env::consts::OS {
        "linux" => "Linux".to_string(),
        "macos" => "Mac OS X".to_string(),
        other => sysinfo::System::name().unwrap_or_else(|| other.to_string()),
    }
}

/// Converts `en_US.UTF-8` style locales into `en-US`.
pub fn posix_locale_to_language_tag(value: &str) -> String {
    let base = value
        .split(['.', '@'])
        .next()
        .unwrap_or_default()
        .trim();

    if base.is_empty() || base == "C" || base == "POSIX" {
        return "en-US".to_string();
    }

    base.replace('_', "-")
}

/// Bandwidth simulation configuration.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// How often a new aggregate upload speed is drawn
    pub speed_refresh_interval: Duration,
    /// Deterministic seed for reproducible speed draws
    pub deterministic_seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            speed_refresh_interval: Duration::from_secs(5),
            deterministic_seed: None,
        }
    }
}

impl SimulationConfig {
    /// Creates a configuration for deterministic testing.
    pub fn deterministic_testing() -> Self {
        Self {
            speed_refresh_interval: Duration::from_secs(5),
            deterministic_seed: Some(42),
        }
    }
}

impl MirageConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("MIRAGE_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.network.port = port;
            }
        }

        if let Ok(ip) = std::env::var("MIRAGE_IP") {
            if let Ok(ip) = ip.parse::<IpAddr>() {
                config.network.ip_address = Some(ip);
            }
        }

        if let Ok(timeout) = std::env::var("MIRAGE_TRACKER_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.network.tracker_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(max) = std::env::var("MIRAGE_MAX_CONCURRENT_ANNOUNCES") {
            if let Ok(count) = max.parse::<usize>() {
                config.network.max_concurrent_announces = count.max(1);
            }
        }

        if let Ok(java) = std::env::var("MIRAGE_JAVA_VERSION") {
            if !java.trim().is_empty() {
                config.client.java_version = java;
            }
        }

        if let Ok(seed) = std::env::var("MIRAGE_SIMULATION_SEED") {
            if let Ok(seed_value) = seed.parse::<u64>() {
                config.simulation.deterministic_seed = Some(seed_value);
            }
        }

        config
    }

    /// Creates a configuration optimized for testing.
    pub fn for_testing() -> Self {
        Self {
            seed: SeedConfig::default(),
            network: NetworkConfig {
                ip_address: Some(IpAddr::from([127, 0, 0, 1])),
                tracker_timeout: Duration::from_secs(5),
                max_concurrent_announces: 4,
                failure_backoff_base: Duration::from_secs(1),
                max_consecutive_failures: 3,
                stop_grace_period: Duration::from_secs(1),
                ..NetworkConfig::default()
            },
            client: ClientEnvironment::for_testing(),
            simulation: SimulationConfig::deterministic_testing(),
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid setting '{field}': {reason}")]
    InvalidSetting { field: &'static str, reason: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// User-facing seeding settings as stored in `config.json`.
///
/// Upload rates are expressed in kB/s as in the file format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    pub min_upload_rate: u64,
    pub max_upload_rate: u64,
    pub simultaneous_seed: i64,
    pub client: String,
    #[serde(default = "default_keep_zero_leechers")]
    pub keep_torrent_with_zero_leechers: bool,
    #[serde(default = "default_ratio_target")]
    pub upload_ratio_target: f64,
}

fn default_keep_zero_leechers() -> bool {
    true
}

fn default_ratio_target() -> f64 {
    -1.0
}

impl AppSettings {
    /// Parses and validates settings from JSON.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Parse` - Malformed JSON or missing fields
    /// - `ConfigError::InvalidSetting` - A value is out of range
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads and validates settings from a file.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Io` - File could not be read
    /// - `ConfigError::Parse` / `ConfigError::InvalidSetting` - See [`AppSettings::from_json`]
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path).await?;
        Self::from_json(&contents)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// - `ConfigError::InvalidSetting` - The first invalid field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_upload_rate < self.min_upload_rate {
            return Err(ConfigError::InvalidSetting {
                field: "maxUploadRate",
                reason: "must be greater than or equal to minUploadRate".to_string(),
            });
        }

        if self.simultaneous_seed < 1 {
            return Err(ConfigError::InvalidSetting {
                field: "simultaneousSeed",
                reason: "must be at least 1".to_string(),
            });
        }

        if self.client.trim().is_empty() {
            return Err(ConfigError::InvalidSetting {
                field: "client",
                reason: "must not be empty".to_string(),
            });
        }

        let ratio = self.upload_ratio_target;
        if !ratio.is_finite() || (ratio < 0.0 && ratio != -1.0) {
            return Err(ConfigError::InvalidSetting {
                field: "uploadRatioTarget",
                reason: "must be -1 (disabled) or a positive number".to_string(),
            });
        }

        Ok(())
    }

    /// Converts to byte-based seeding configuration.
    ///
    /// # Errors
    ///
    /// - `ConfigError::InvalidSetting` - See [`AppSettings::validate`]
    pub fn to_seed_config(&self) -> Result<SeedConfig, ConfigError> {
        self.validate()?;

        Ok(SeedConfig {
            min_upload_rate: self.min_upload_rate.saturating_mul(1000),
            max_upload_rate: self.max_upload_rate.saturating_mul(1000),
            simultaneous_seed: usize::try_from(self.simultaneous_seed).unwrap_or(usize::MAX),
            client_file: self.client.clone(),
            keep_torrent_with_zero_leechers: self.keep_torrent_with_zero_leechers,
            upload_ratio_target: (self.upload_ratio_target >= 0.0)
                .then_some(self.upload_ratio_target),
        })
    }
}
