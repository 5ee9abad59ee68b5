//! Announce `key` generation

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{RefreshOn, RefreshStrategy};
use crate::client::TemplateError;
use crate::torrent::InfoHash;
use crate::tracker::AnnounceEvent;

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// `keyGenerator` section of a client file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyGeneratorSpec {
    pub refresh_on: RefreshOn,
    pub algorithm: KeyAlgorithm,
    #[serde(default = "default_key_case")]
    pub key_case: KeyCase,
}

fn default_key_case() -> KeyCase {
    KeyCase::None
}

/// Casing applied to generated keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyCase {
    Upper,
    Lower,
    None,
}

impl KeyCase {
    fn apply(self, key: String) -> String {
        match self {
            KeyCase::Upper => key.to_uppercase(),
            KeyCase::Lower => key.to_lowercase(),
            KeyCase::None => key,
        }
    }
}

/// Key algorithm as written in a client file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyAlgorithm {
    /// Random hex of fixed length
    Hash { length: usize },
    /// Random hex of fixed length whose first digit is not zero
    HashNoLeadingZero { length: usize },
    /// Random integer from a range rendered as hex
    DigitRangeTransformedToHexWithoutLeadingZeroes {
        #[serde(rename = "inclusiveLowerBound")]
        inclusive_lower_bound: u64,
        #[serde(rename = "inclusiveUpperBound")]
        inclusive_upper_bound: u64,
    },
}

impl KeyAlgorithm {
    /// # Errors
    /// - `TemplateError::InvalidGenerator` - Zero length or an empty range
    pub fn validate(&self) -> Result<(), TemplateError> {
        match self {
            KeyAlgorithm::Hash { length } | KeyAlgorithm::HashNoLeadingZero { length }
                if *length == 0 =>
            {
                Err(TemplateError::InvalidGenerator {
                    reason: "key length must be at least 1".to_string(),
                })
            }
            KeyAlgorithm::DigitRangeTransformedToHexWithoutLeadingZeroes {
                inclusive_lower_bound,
                inclusive_upper_bound,
            } if inclusive_lower_bound > inclusive_upper_bound => {
                Err(TemplateError::InvalidGenerator {
                    reason: format!(
                        "key range lower bound {inclusive_lower_bound} exceeds upper bound {inclusive_upper_bound}"
                    ),
                })
            }
            _ => Ok(()),
        }
    }

    pub fn generate(&self) -> String {
        let mut rng = rand::rng();
        match self {
            KeyAlgorithm::Hash { length } => (0..*length)
                .map(|_| char::from(HEX_DIGITS[rng.random_range(0..16)]))
                .collect(),
            KeyAlgorithm::HashNoLeadingZero { length } => {
                let mut key = String::with_capacity(*length);
                key.push(char::from(HEX_DIGITS[rng.random_range(1..16)]));
                for _ in 1..*length {
                    key.push(char::from(HEX_DIGITS[rng.random_range(0..16)]));
                }
                key
            }
            KeyAlgorithm::DigitRangeTransformedToHexWithoutLeadingZeroes {
                inclusive_lower_bound,
                inclusive_upper_bound,
            } => {
                let value = rng.random_range(*inclusive_lower_bound..=*inclusive_upper_bound);
                format!("{value:X}")
            }
        }
    }
}

/// Generates announce keys according to the client's refresh strategy.
///
/// Unlike peer ids, the persistent key cache is swept on every call.
#[derive(Debug)]
pub struct KeyGenerator {
    algorithm: KeyAlgorithm,
    key_case: KeyCase,
    refresh: RefreshStrategy,
    sweeps: AtomicUsize,
}

impl KeyGenerator {
    /// # Errors
    /// - `TemplateError::InvalidGenerator` - See [`KeyAlgorithm::validate`]
    pub fn new(
        algorithm: KeyAlgorithm,
        refresh_on: RefreshOn,
        key_case: KeyCase,
    ) -> Result<Self, TemplateError> {
        algorithm.validate()?;
        let refresh = RefreshStrategy::new(refresh_on, || key_case.apply(algorithm.generate()));
        Ok(Self {
            algorithm,
            key_case,
            refresh,
            sweeps: AtomicUsize::new(0),
        })
    }

    /// # Errors
    /// - `TemplateError::InvalidGenerator` - See [`KeyAlgorithm::validate`]
    pub fn from_spec(spec: &KeyGeneratorSpec) -> Result<Self, TemplateError> {
        Self::new(spec.algorithm.clone(), spec.refresh_on, spec.key_case)
    }

    pub fn get(&self, info_hash: InfoHash, event: AnnounceEvent) -> String {
        self.get_at(info_hash, event, Instant::now())
    }

    pub fn get_at(&self, info_hash: InfoHash, event: AnnounceEvent, now: Instant) -> String {
        let key = self.refresh.resolve(info_hash, event, now, || {
            self.key_case.apply(self.algorithm.generate())
        });

        if let Some(cache) = self.refresh.persistent_cache() {
            cache.evict_idle(now);
            self.sweeps.fetch_add(1, Ordering::Relaxed);
        }

        key
    }

    /// Number of eviction sweeps performed so far.
    pub fn sweep_count(&self) -> usize {
        self.sweeps.load(Ordering::Relaxed)
    }

    pub fn cached_torrents(&self) -> usize {
        self.refresh.cached_len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::client::generator::IDLE_EVICTION_THRESHOLD;

    #[test]
    fn test_hash_algorithms() {
        let key = KeyAlgorithm::Hash { length: 8 }.generate();
        assert_eq!(key.len(), 8);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));

        for _ in 0..100 {
            let key = KeyAlgorithm::HashNoLeadingZero { length: 8 }.generate();
            assert_eq!(key.len(), 8);
            assert!(!key.starts_with('0'));
        }
    }

    #[test]
    fn test_digit_range_without_leading_zeroes() {
        let algorithm = KeyAlgorithm::DigitRangeTransformedToHexWithoutLeadingZeroes {
            inclusive_lower_bound: 1,
            inclusive_upper_bound: 255,
        };
        for _ in 0..100 {
            let key = algorithm.generate();
            let value = u64::from_str_radix(&key, 16).unwrap();
            assert!((1..=255).contains(&value));
            assert!(!key.starts_with('0'));
        }

        let fixed = KeyAlgorithm::DigitRangeTransformedToHexWithoutLeadingZeroes {
            inclusive_lower_bound: 3_735_928_559,
            inclusive_upper_bound: 3_735_928_559,
        };
        assert_eq!(fixed.generate(), "DEADBEEF");
    }

    #[test]
    fn test_key_case() {
        let fixed = KeyAlgorithm::DigitRangeTransformedToHexWithoutLeadingZeroes {
            inclusive_lower_bound: 0xabc,
            inclusive_upper_bound: 0xabc,
        };
        let lower = KeyGenerator::new(fixed.clone(), RefreshOn::Always, KeyCase::Lower).unwrap();
        let upper = KeyGenerator::new(fixed, RefreshOn::Always, KeyCase::Upper).unwrap();
        let hash = InfoHash::new([1; 20]);

        assert_eq!(lower.get(hash, AnnounceEvent::None), "abc");
        assert_eq!(upper.get(hash, AnnounceEvent::None), "ABC");
    }

    #[test]
    fn test_invalid_algorithms() {
        assert!(
            KeyGenerator::new(KeyAlgorithm::Hash { length: 0 }, RefreshOn::Never, KeyCase::None)
                .is_err()
        );
        let reversed = KeyAlgorithm::DigitRangeTransformedToHexWithoutLeadingZeroes {
            inclusive_lower_bound: 10,
            inclusive_upper_bound: 1,
        };
        assert!(KeyGenerator::new(reversed, RefreshOn::Never, KeyCase::None).is_err());
    }

    #[test]
    fn test_persistent_key_sweeps_every_call() {
        let generator = KeyGenerator::new(
            KeyAlgorithm::Hash { length: 8 },
            RefreshOn::TorrentPersistent,
            KeyCase::Upper,
        )
        .unwrap();
        let idle = InfoHash::new([1; 20]);
        let busy = InfoHash::new([2; 20]);
        let start = Instant::now();

        let first = generator.get_at(idle, AnnounceEvent::Started, start);
        assert_eq!(generator.get_at(idle, AnnounceEvent::None, start), first);
        assert_eq!(generator.sweep_count(), 2);

        let later = start + IDLE_EVICTION_THRESHOLD;
        generator.get_at(busy, AnnounceEvent::Started, later);
        assert_eq!(generator.sweep_count(), 3);
        assert_eq!(generator.cached_torrents(), 1);

        let regenerated = generator.get_at(idle, AnnounceEvent::None, later);
        assert_eq!(generator.cached_torrents(), 2);
        assert_ne!(regenerated, first);
        assert_eq!(generator.get_at(idle, AnnounceEvent::None, later), regenerated);
    }

    #[test]
    fn test_entry_just_under_threshold_survives() {
        let generator = KeyGenerator::new(
            KeyAlgorithm::Hash { length: 8 },
            RefreshOn::TorrentPersistent,
            KeyCase::None,
        )
        .unwrap();
        let hash = InfoHash::new([1; 20]);
        let start = Instant::now();

        let first = generator.get_at(hash, AnnounceEvent::Started, start);
        let almost = start + IDLE_EVICTION_THRESHOLD - Duration::from_secs(60);
        generator.get_at(InfoHash::new([9; 20]), AnnounceEvent::Started, almost);
        assert_eq!(generator.get_at(hash, AnnounceEvent::None, almost), first);
    }

    #[test]
    fn test_spec_deserialization() {
        let json = r#"{
            "refreshOn": "TORRENT_PERSISTENT",
            "algorithm": {"type": "DIGIT_RANGE_TRANSFORMED_TO_HEX_WITHOUT_LEADING_ZEROES", "inclusiveLowerBound": 1, "inclusiveUpperBound": 2147483647},
            "keyCase": "lower"
        }"#;
        let spec: KeyGeneratorSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.key_case, KeyCase::Lower);
        assert!(KeyGenerator::from_spec(&spec).is_ok());

        let json = r#"{"refreshOn": "NEVER", "algorithm": {"type": "HASH", "length": 8}}"#;
        let spec: KeyGeneratorSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.key_case, KeyCase::None);
    }
}
