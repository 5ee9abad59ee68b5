//! Peer-id generation

use std::iter::Peekable;
use std::str::Chars;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{RefreshOn, RefreshStrategy};
use crate::client::TemplateError;
use crate::torrent::InfoHash;
use crate::tracker::AnnounceEvent;

/// Length of a BitTorrent peer id.
pub const PEER_ID_LENGTH: usize = 20;

/// Persistent peer-id caches are swept once every this many calls.
pub const PEER_ID_SWEEP_PERIOD: u32 = 30;

/// `peerIdGenerator` section of a client file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerIdGeneratorSpec {
    pub refresh_on: RefreshOn,
    pub algorithm: PeerIdAlgorithmSpec,
    pub should_url_encode: bool,
}

/// Peer-id algorithm as written in a client file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerIdAlgorithmSpec {
    Regex {
        pattern: String,
    },
    RandomPoolWithChecksum {
        prefix: String,
        #[serde(rename = "charactersPool")]
        characters_pool: String,
        base: usize,
    },
}

/// Validated peer-id algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerIdAlgorithm {
    /// Literal prefix followed by `count` random members of `class`
    Pattern {
        prefix: String,
        class: Vec<char>,
        count: usize,
    },
    /// Prefix plus pool characters whose indices sum to a multiple of `base`
    RandomPoolWithChecksum {
        prefix: String,
        pool: Vec<char>,
        base: usize,
    },
}

impl PeerIdAlgorithm {
    /// # Errors
    /// - `TemplateError::InvalidGenerator` - Unsupported pattern or inconsistent pool settings
    pub fn from_spec(spec: &PeerIdAlgorithmSpec) -> Result<Self, TemplateError> {
        match spec {
            PeerIdAlgorithmSpec::Regex { pattern } => parse_pattern(pattern),
            PeerIdAlgorithmSpec::RandomPoolWithChecksum {
                prefix,
                characters_pool,
                base,
            } => {
                let pool: Vec<char> = characters_pool.chars().collect();
                if *base == 0 || *base > pool.len() {
                    return Err(invalid(format!(
                        "base must be between 1 and the pool size ({}), got {base}",
                        pool.len()
                    )));
                }
                if prefix.chars().count() >= PEER_ID_LENGTH {
                    return Err(invalid(format!(
                        "prefix '{prefix}' leaves no room for random characters"
                    )));
                }
                Ok(PeerIdAlgorithm::RandomPoolWithChecksum {
                    prefix: prefix.clone(),
                    pool,
                    base: *base,
                })
            }
        }
    }

    pub fn generate(&self) -> String {
        let mut rng = rand::rng();
        match self {
            PeerIdAlgorithm::Pattern {
                prefix,
                class,
                count,
            } => {
                let mut peer_id = prefix.clone();
                for _ in 0..*count {
                    peer_id.push(class[rng.random_range(0..class.len())]);
                }
                peer_id
            }
            PeerIdAlgorithm::RandomPoolWithChecksum { prefix, pool, base } => {
                let random_length = PEER_ID_LENGTH - prefix.chars().count();
                let mut peer_id = prefix.clone();
                let mut total = 0usize;
                for _ in 0..random_length - 1 {
                    let index = rng.random_range(0..*base);
                    total += index;
                    peer_id.push(pool[index]);
                }
                let checksum = (base - total % base) % base;
                peer_id.push(pool[checksum]);
                peer_id
            }
        }
    }
}

fn invalid(reason: String) -> TemplateError {
    TemplateError::InvalidGenerator { reason }
}

/// Parses `<literal prefix>[<class>]{n}`.
fn parse_pattern(pattern: &str) -> Result<PeerIdAlgorithm, TemplateError> {
    let mut chars = pattern.chars().peekable();

    let mut prefix = String::new();
    loop {
        match chars.next() {
            Some('[') => break,
            Some('\\') => prefix.push(read_escape(&mut chars, pattern)?),
            Some(c) if "(){}*+?|^$.".contains(c) => {
                return Err(invalid(format!(
                    "unsupported '{c}' in peer id pattern '{pattern}'"
                )));
            }
            Some(c) => prefix.push(c),
            None => {
                return Err(invalid(format!(
                    "peer id pattern '{pattern}' has no character class"
                )));
            }
        }
    }

    if chars.peek() == Some(&'^') {
        return Err(invalid(format!(
            "negated classes are not supported in '{pattern}'"
        )));
    }

    let mut class = Vec::new();
    loop {
        let start = match chars.next() {
            Some(']') => break,
            Some('\\') => read_escape(&mut chars, pattern)?,
            Some(c) => c,
            None => {
                return Err(invalid(format!(
                    "unterminated character class in '{pattern}'"
                )));
            }
        };

        let mut lookahead = chars.clone();
        let is_range =
            lookahead.next() == Some('-') && !matches!(lookahead.peek(), Some(']') | None);
        if !is_range {
            class.push(start);
            continue;
        }

        chars.next();
        let end = match chars.next() {
            Some('\\') => read_escape(&mut chars, pattern)?,
            Some(c) => c,
            None => {
                return Err(invalid(format!(
                    "unterminated character class in '{pattern}'"
                )));
            }
        };
        if end < start {
            return Err(invalid(format!(
                "reversed range {start:?}-{end:?} in '{pattern}'"
            )));
        }
        class.extend((u32::from(start)..=u32::from(end)).filter_map(char::from_u32));
    }

    if class.is_empty() {
        return Err(invalid(format!("empty character class in '{pattern}'")));
    }

    let quantifier: String = chars.collect();
    let count = quantifier
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .and_then(|digits| digits.parse::<usize>().ok())
        .filter(|count| *count > 0)
        .ok_or_else(|| {
            invalid(format!(
                "expected a '{{n}}' quantifier after the class in '{pattern}'"
            ))
        })?;

    Ok(PeerIdAlgorithm::Pattern {
        prefix,
        class,
        count,
    })
}

fn read_escape(chars: &mut Peekable<Chars<'_>>, pattern: &str) -> Result<char, TemplateError> {
    let bad_escape = || invalid(format!("invalid escape sequence in '{pattern}'"));

    let hex_char = |digits: String| {
        u32::from_str_radix(&digits, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(bad_escape)
    };

    match chars.next() {
        Some('u') => hex_char(chars.by_ref().take(4).collect()),
        Some('x') if chars.peek() == Some(&'{') => {
            chars.next();
            let digits: String = chars.by_ref().take_while(|c| *c != '}').collect();
            hex_char(digits)
        }
        Some('x') => hex_char(chars.by_ref().take(2).collect()),
        Some('n') => Ok('\n'),
        Some('t') => Ok('\t'),
        Some('r') => Ok('\r'),
        Some(c) => Ok(c),
        None => Err(bad_escape()),
    }
}

/// Generates peer ids according to the client's refresh strategy.
///
/// The persistent strategy sweeps idle entries every
/// [`PEER_ID_SWEEP_PERIOD`]th call; the counter lives here.
#[derive(Debug)]
pub struct PeerIdGenerator {
    algorithm: PeerIdAlgorithm,
    refresh: RefreshStrategy,
    should_url_encode: bool,
    calls_since_sweep: Mutex<u32>,
    sweeps: AtomicUsize,
}

impl PeerIdGenerator {
    pub fn new(algorithm: PeerIdAlgorithm, refresh_on: RefreshOn, should_url_encode: bool) -> Self {
        let refresh = RefreshStrategy::new(refresh_on, || algorithm.generate());
        Self {
            algorithm,
            refresh,
            should_url_encode,
            calls_since_sweep: Mutex::new(0),
            sweeps: AtomicUsize::new(0),
        }
    }

    /// # Errors
    /// - `TemplateError::InvalidGenerator` - See [`PeerIdAlgorithm::from_spec`]
    pub fn from_spec(spec: &PeerIdGeneratorSpec) -> Result<Self, TemplateError> {
        let algorithm = PeerIdAlgorithm::from_spec(&spec.algorithm)?;
        Ok(Self::new(algorithm, spec.refresh_on, spec.should_url_encode))
    }

    /// Peer id to announce for `info_hash`.
    pub fn get(&self, info_hash: InfoHash, event: AnnounceEvent) -> String {
        self.get_at(info_hash, event, Instant::now())
    }

    /// Same as [`PeerIdGenerator::get`] with an explicit clock reading.
    pub fn get_at(&self, info_hash: InfoHash, event: AnnounceEvent, now: Instant) -> String {
        let peer_id = self
            .refresh
            .resolve(info_hash, event, now, || self.algorithm.generate());

        if let Some(cache) = self.refresh.persistent_cache() {
            let sweep_due = {
                let mut calls = self.calls_since_sweep.lock();
                *calls += 1;
                if *calls >= PEER_ID_SWEEP_PERIOD {
                    *calls = 0;
                    true
                } else {
                    false
                }
            };
            if sweep_due {
                let evicted = cache.evict_idle(now);
                self.sweeps.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Peer id sweep evicted {} idle entries", evicted);
            }
        }

        peer_id
    }

    pub fn should_url_encode(&self) -> bool {
        self.should_url_encode
    }

    /// Number of eviction sweeps performed so far.
    pub fn sweep_count(&self) -> usize {
        self.sweeps.load(Ordering::Relaxed)
    }

    pub fn cached_torrents(&self) -> usize {
        self.refresh.cached_len()
    }
}
