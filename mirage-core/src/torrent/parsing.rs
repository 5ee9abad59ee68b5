//! Bencode parsing of `.torrent` files and info hash calculation

use sha1::{Digest, Sha1};

use super::{InfoHash, TorrentError, TorrentIdentity};

// Type aliases for complex bencode types
type BencodeDict<'a> = std::collections::HashMap<&'a [u8], bencode_rs::Value<'a>>;
type ParseResult<T> = Result<T, TorrentError>;

/// Parses raw `.torrent` bytes into the identity the engine seeds.
///
/// # Errors
///
/// - `TorrentError::InvalidTorrentFile` - Malformed bencode or missing fields
pub fn parse_torrent_bytes(torrent_bytes: &[u8]) -> Result<TorrentIdentity, TorrentError> {
    BencodeParser::parse_bencode_data(torrent_bytes)
}

/// Bencode parsing utilities for torrent metadata extraction.
pub struct BencodeParser;

impl BencodeParser {
    /// Parse bencode data and extract the torrent identity
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If bencode parsing or metadata extraction failed
    pub fn parse_bencode_data(torrent_bytes: &[u8]) -> Result<TorrentIdentity, TorrentError> {
        if torrent_bytes.is_empty() {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Empty file".to_string(),
            });
        }

        let parsed = bencode_rs::Value::parse(torrent_bytes).map_err(|e| {
            TorrentError::InvalidTorrentFile {
                reason: format!("Bencode parsing failed: {e:?}"),
            }
        })?;

        let Some(root) = parsed.first() else {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Empty bencode data".to_string(),
            });
        };

        if let bencode_rs::Value::Dictionary(dict) = root {
            Self::extract_identity_from_dict(dict, torrent_bytes)
        } else {
            Err(TorrentError::InvalidTorrentFile {
                reason: "Root element must be dictionary".to_string(),
            })
        }
    }

    fn extract_identity_from_dict(
        dict: &BencodeDict<'_>,
        original_data: &[u8],
    ) -> ParseResult<TorrentIdentity> {
        let info_dict = match dict.get(b"info".as_slice()) {
            Some(bencode_rs::Value::Dictionary(info)) => info,
            Some(_) => {
                return Err(TorrentError::InvalidTorrentFile {
                    reason: "Info field must be dictionary".to_string(),
                });
            }
            None => {
                return Err(TorrentError::InvalidTorrentFile {
                    reason: "Missing 'info' field".to_string(),
                });
            }
        };

        let info_hash = Self::calculate_info_hash(original_data)?;
        let name = Self::extract_bytes_as_string(info_dict, b"name")?;

        let total_size = if let Ok(length) = Self::extract_integer(info_dict, b"length") {
            Self::non_negative(length, "length")?
        } else if let Some(bencode_rs::Value::List(files)) = info_dict.get(b"files".as_slice()) {
            Self::sum_file_lengths(files)?
        } else {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Missing 'files' or 'length' field".to_string(),
            });
        };

        let announce_urls = Self::extract_announce_urls(dict)?;

        TorrentIdentity::new(info_hash, name, total_size, announce_urls)
    }

    /// SHA-1 of the exact bytes of the top-level `info` value.
    fn calculate_info_hash(original_data: &[u8]) -> ParseResult<InfoHash> {
        let (start, end) = Self::locate_top_level_value(original_data, b"info")?;

        let mut hasher = Sha1::new();
        hasher.update(&original_data[start..end]);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&hasher.finalize());

        Ok(InfoHash::new(hash))
    }

    /// Walks the keys of the root dictionary and returns the byte span of
    /// the value stored under `key`.
    fn locate_top_level_value(data: &[u8], key: &[u8]) -> ParseResult<(usize, usize)> {
        if data.first() != Some(&b'd') {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Expected dictionary start".to_string(),
            });
        }

        let mut pos = 1;
        while pos < data.len() && data[pos] != b'e' {
            let key_end = pos + Self::find_bencode_value_end(&data[pos..])?;
            let current_key = Self::string_payload(&data[pos..key_end])?;
            let value_end = key_end + Self::find_bencode_value_end(&data[key_end..])?;
            if current_key == key {
                return Ok((key_end, value_end));
            }
            pos = value_end;
        }

        Err(TorrentError::InvalidTorrentFile {
            reason: format!(
                "Could not find {:?} in data",
                String::from_utf8_lossy(key)
            ),
        })
    }

    fn string_payload(encoded: &[u8]) -> ParseResult<&[u8]> {
        let colon = encoded
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| TorrentError::InvalidTorrentFile {
                reason: "Dictionary key must be a string".to_string(),
            })?;
        Ok(&encoded[colon + 1..])
    }

    /// Find the end position of the bencode value starting at `data[0]`
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If the value is truncated or malformed
    pub fn find_bencode_value_end(data: &[u8]) -> Result<usize, TorrentError> {
        let truncated = || TorrentError::InvalidTorrentFile {
            reason: "Incomplete bencode value".to_string(),
        };

        match data.first() {
            Some(b'd') | Some(b'l') => {
                let mut pos = 1;
                loop {
                    match data.get(pos) {
                        Some(b'e') => return Ok(pos + 1),
                        Some(_) => pos += Self::find_bencode_value_end(&data[pos..])?,
                        None => return Err(truncated()),
                    }
                }
            }
            Some(b'i') => data
                .iter()
                .position(|&b| b == b'e')
                .map(|end| end + 1)
                .ok_or_else(truncated),
            Some(b'0'..=b'9') => {
                let colon = data
                    .iter()
                    .position(|&b| b == b':')
                    .ok_or_else(truncated)?;
                let length: usize = std::str::from_utf8(&data[..colon])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| TorrentError::InvalidTorrentFile {
                        reason: "Invalid string length".to_string(),
                    })?;
                let end = colon + 1 + length;
                if end > data.len() {
                    return Err(truncated());
                }
                Ok(end)
            }
            Some(_) => Err(TorrentError::InvalidTorrentFile {
                reason: "Invalid bencode character".to_string(),
            }),
            None => Err(truncated()),
        }
    }

    fn extract_bytes_as_string(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<String> {
        match dict.get(key) {
            Some(bencode_rs::Value::Bytes(bytes)) => {
                String::from_utf8(bytes.to_vec()).map_err(|_| TorrentError::InvalidTorrentFile {
                    reason: format!("Invalid UTF-8 in field: {:?}", String::from_utf8_lossy(key)),
                })
            }
            _ => Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "Missing or invalid field: {:?}",
                    String::from_utf8_lossy(key)
                ),
            }),
        }
    }

    fn extract_integer(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<i64> {
        match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) => Ok(*value),
            _ => Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "Missing or invalid integer field: {:?}",
                    String::from_utf8_lossy(key)
                ),
            }),
        }
    }

    fn non_negative(value: i64, field: &str) -> ParseResult<u64> {
        u64::try_from(value).map_err(|_| TorrentError::InvalidTorrentFile {
            reason: format!("Negative {field}"),
        })
    }

    fn sum_file_lengths(files: &[bencode_rs::Value<'_>]) -> ParseResult<u64> {
        let mut total = 0u64;
        for file in files {
            let bencode_rs::Value::Dictionary(file_dict) = file else {
                return Err(TorrentError::InvalidTorrentFile {
                    reason: "Invalid file entry type".to_string(),
                });
            };
            let length = Self::extract_integer(file_dict, b"length")?;
            total = total.saturating_add(Self::non_negative(length, "file length")?);
        }
        Ok(total)
    }

    /// Primary `announce` first, then every tier of `announce-list`,
    /// without duplicates.
    fn extract_announce_urls(dict: &BencodeDict<'_>) -> ParseResult<Vec<String>> {
        let mut announce_urls: Vec<String> = Vec::new();

        if let Ok(announce) = Self::extract_bytes_as_string(dict, b"announce") {
            announce_urls.push(announce);
        }

        if let Some(bencode_rs::Value::List(announce_list)) = dict.get(b"announce-list".as_slice())
        {
            for tier in announce_list {
                if let bencode_rs::Value::List(tier_urls) = tier {
                    for url_value in tier_urls {
                        if let bencode_rs::Value::Bytes(url_bytes) = url_value
                            && let Ok(url) = String::from_utf8(url_bytes.to_vec())
                            && !announce_urls.contains(&url)
                        {
                            announce_urls.push(url);
                        }
                    }
                }
            }
        }

        announce_urls.retain(|url| url.starts_with("http://") || url.starts_with("https://"));

        if announce_urls.is_empty() {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "No HTTP announce URLs found".to_string(),
            });
        }

        for url in &announce_urls {
            url::Url::parse(url)?;
        }

        Ok(announce_urls)
    }
}
