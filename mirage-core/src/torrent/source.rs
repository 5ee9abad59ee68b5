//! One-shot discovery of `.torrent` files in a directory

use std::path::{Path, PathBuf};

use super::{TorrentError, TorrentIdentity, parse_torrent_bytes};

/// A torrent file that could not be loaded, with a displayable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentLoadFailure {
    pub name: String,
    pub reason: String,
}

/// Scans a directory for `*.torrent` files.
///
/// Each file is parsed independently; a broken file is reported in the
/// failure list and never prevents the others from loading.
#[derive(Debug, Clone)]
pub struct DirectoryTorrentSource {
    directory: PathBuf,
}

impl DirectoryTorrentSource {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Loads every torrent file, sorted by file name for a stable seeding order.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Io` - The directory itself could not be listed
    pub async fn load_all(
        &self,
    ) -> Result<(Vec<TorrentIdentity>, Vec<TorrentLoadFailure>), TorrentError> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_torrent = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("torrent"));
            if is_torrent && entry.file_type().await?.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut torrents: Vec<TorrentIdentity> = Vec::with_capacity(paths.len());
        let mut failures = Vec::new();

        for path in paths {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let loaded = match tokio::fs::read(&path).await {
                Ok(bytes) => parse_torrent_bytes(&bytes),
                Err(e) => Err(TorrentError::Io(e)),
            };

            match loaded {
                Ok(identity) if torrents.iter().any(|t| t.info_hash == identity.info_hash) => {
                    tracing::warn!("Skipping {}: duplicate of an already loaded torrent", name);
                    failures.push(TorrentLoadFailure {
                        name,
                        reason: format!("Duplicate info hash {}", identity.info_hash),
                    });
                }
                Ok(identity) => {
                    tracing::debug!("Loaded torrent {} ({})", name, identity.info_hash);
                    torrents.push(identity);
                }
                Err(e) => {
                    tracing::warn!("Failed to load torrent file {}: {}", name, e);
                    failures.push(TorrentLoadFailure {
                        name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok((torrents, failures))
    }
}
