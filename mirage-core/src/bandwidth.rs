//! Simulated bandwidth shared across seeding torrents
//!
//! A random aggregate upload speed is drawn on every tick and split across
//! the registered torrents. Counters advance with the speed each torrent
//! held since the previous update, so `uploaded` and `downloaded` never
//! decrease and `left` never goes below zero.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::MirageConfig;
use crate::torrent::InfoHash;

/// Bytes per second.
pub type Speed = u64;

/// Counters reported to trackers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

impl SeedStats {
    /// Fresh counters for a torrent with `left` bytes still missing.
    pub fn with_left(left: u64) -> Self {
        Self {
            left,
            ..Self::default()
        }
    }

    /// Advances the counters by `amount` bytes.
    ///
    /// Download only progresses while something is left.
    pub fn advance(&mut self, amount: u64) {
        self.uploaded = self.uploaded.saturating_add(amount);
        if self.left > 0 {
            let downloaded = amount.min(self.left);
            self.downloaded = self.downloaded.saturating_add(downloaded);
            self.left -= downloaded;
        }
    }
}

/// Seeder and leecher counts last reported by a tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwarmCounts {
    pub seeders: u32,
    pub leechers: u32,
}

/// Decides how the aggregate speed is split between torrents.
pub trait AllocationPolicy: Send + Sync + fmt::Debug {
    /// Relative share for a torrent; zero means no bandwidth.
    fn weight(&self, swarm: &SwarmCounts) -> u64;
}

/// Every torrent gets the same share.
#[derive(Debug, Clone, Copy, Default)]
pub struct EqualSplit;

impl AllocationPolicy for EqualSplit {
    fn weight(&self, _swarm: &SwarmCounts) -> u64 {
        1
    }
}

/// Favours torrents with many leechers relative to seeders.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwarmWeighted;

impl AllocationPolicy for SwarmWeighted {
    fn weight(&self, swarm: &SwarmCounts) -> u64 {
        let leechers = u64::from(swarm.leechers);
        let peers = leechers + u64::from(swarm.seeders);
        if leechers == 0 {
            return 0;
        }
        leechers * leechers * 1000 / peers
    }
}

/// Receives the per-torrent speeds after every reallocation.
pub trait SpeedListener: Send + Sync {
    fn speeds_changed(&self, speeds: &HashMap<InfoHash, Speed>);
}

/// Splits `target` proportionally to `weights`.
///
/// The shares always sum to exactly `target`; the rounding remainder is
/// handed out one byte at a time in order. When every weight is zero the
/// split is equal.
pub fn split_target(target: u64, weights: &[u64]) -> Vec<u64> {
    if weights.is_empty() {
        return Vec::new();
    }

    let equal;
    let weights = if weights.iter().all(|weight| *weight == 0) {
        equal = vec![1u64; weights.len()];
        equal.as_slice()
    } else {
        weights
    };

    let total: u128 = weights.iter().map(|weight| u128::from(*weight)).sum();
    let mut shares: Vec<u64> = weights
        .iter()
        .map(|weight| (u128::from(target) * u128::from(*weight) / total) as u64)
        .collect();

    let mut remainder = target - shares.iter().sum::<u64>();
    let eligible: Vec<usize> = (0..weights.len()).filter(|i| weights[*i] > 0).collect();
    let mut next = 0;
    while remainder > 0 {
        shares[eligible[next % eligible.len()]] += 1;
        remainder -= 1;
        next += 1;
    }

    shares
}

/// Allocator settings.
#[derive(Debug, Clone)]
pub struct BandwidthSettings {
    pub min_upload_rate: Speed,
    pub max_upload_rate: Speed,
    pub tick_interval: Duration,
    pub seed: Option<u64>,
}

impl BandwidthSettings {
    pub fn from_config(config: &MirageConfig) -> Self {
        Self {
            min_upload_rate: config.seed.min_upload_rate,
            max_upload_rate: config.seed.max_upload_rate,
            tick_interval: config.simulation.speed_refresh_interval,
            seed: config.simulation.deterministic_seed,
        }
    }
}

#[derive(Debug)]
struct TorrentBandwidth {
    stats: SeedStats,
    swarm: SwarmCounts,
    speed: Speed,
    /// Fraction of a byte not yet credited, in byte-nanoseconds.
    carry: u128,
}

#[derive(Debug)]
struct AllocatorState {
    torrents: BTreeMap<InfoHash, TorrentBandwidth>,
    target: Speed,
    last_update: Instant,
    rng: ChaCha8Rng,
}

struct AllocatorInner {
    settings: BandwidthSettings,
    policy: Arc<dyn AllocationPolicy>,
    listener: Option<Arc<dyn SpeedListener>>,
    state: Mutex<AllocatorState>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

/// Owns every torrent's [`SeedStats`].
///
/// Cloning shares the same allocator. All operations are synchronous and
/// callable from any thread; `start` needs a Tokio runtime.
#[derive(Clone)]
pub struct BandwidthAllocator {
    inner: Arc<AllocatorInner>,
}

impl fmt::Debug for BandwidthAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BandwidthAllocator")
            .field("settings", &self.inner.settings)
            .field("policy", &self.inner.policy)
            .field("torrents", &self.inner.state.lock().torrents.len())
            .finish()
    }
}

impl BandwidthAllocator {
    pub fn new(
        settings: BandwidthSettings,
        policy: Arc<dyn AllocationPolicy>,
        listener: Option<Arc<dyn SpeedListener>>,
    ) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(settings.seed.unwrap_or_else(rand::random));
        let target = draw_target(&mut rng, &settings);

        Self {
            inner: Arc::new(AllocatorInner {
                state: Mutex::new(AllocatorState {
                    torrents: BTreeMap::new(),
                    target,
                    last_update: Instant::now(),
                    rng,
                }),
                settings,
                policy,
                listener,
                ticker: Mutex::new(None),
            }),
        }
    }

    /// Starts the periodic tick task. Calling it again is a no-op.
    pub fn start(&self) {
        let mut ticker = self.inner.ticker.lock();
        if ticker.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!("Bandwidth allocator started outside a Tokio runtime");
            return;
        };

        let weak: Weak<AllocatorInner> = Arc::downgrade(&self.inner);
        let period = self.inner.settings.tick_interval;
        *ticker = Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                BandwidthAllocator { inner }.tick();
            }
        }));
        tracing::debug!("Bandwidth allocator started, tick every {:?}", period);
    }

    /// Stops the tick task. Calling it again is a no-op.
    pub fn stop(&self) {
        if let Some(task) = self.inner.ticker.lock().take() {
            task.abort();
            tracing::debug!("Bandwidth allocator stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .ticker
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Accrues counters, draws a new aggregate speed and redistributes it.
    pub fn tick(&self) {
        let snapshot = {
            let mut state = self.inner.state.lock();
            accrue(&mut state, Instant::now());
            let target = draw_target(&mut state.rng, &self.inner.settings);
            state.target = target;
            self.reallocate(&mut state)
        };
        tracing::trace!("Bandwidth tick: {} torrents", snapshot.len());
        self.notify(&snapshot);
    }

    /// Starts tracking a torrent. Re-registering only updates swarm counts.
    pub fn register(&self, info_hash: InfoHash, initial: SeedStats, swarm: SwarmCounts) {
        self.update(|torrents| {
            torrents
                .entry(info_hash)
                .and_modify(|torrent| torrent.swarm = swarm)
                .or_insert(TorrentBandwidth {
                    stats: initial,
                    swarm,
                    speed: 0,
                    carry: 0,
                });
        });
    }

    /// Updates swarm counts of a tracked torrent.
    pub fn update_swarm(&self, info_hash: InfoHash, swarm: SwarmCounts) {
        self.update(|torrents| {
            if let Some(torrent) = torrents.get_mut(&info_hash) {
                torrent.swarm = swarm;
            }
        });
    }

    /// Stops tracking a torrent, returning its final counters.
    pub fn unregister(&self, info_hash: &InfoHash) -> Option<SeedStats> {
        let mut removed = None;
        self.update(|torrents| {
            removed = torrents.remove(info_hash).map(|torrent| torrent.stats);
        });
        removed
    }

    /// Current counters; an unknown torrent reads as all zero.
    pub fn stats(&self, info_hash: &InfoHash) -> SeedStats {
        let mut state = self.inner.state.lock();
        accrue(&mut state, Instant::now());
        state
            .torrents
            .get(info_hash)
            .map(|torrent| torrent.stats)
            .unwrap_or_default()
    }

    pub fn speed_map(&self) -> HashMap<InfoHash, Speed> {
        let state = self.inner.state.lock();
        state
            .torrents
            .iter()
            .map(|(info_hash, torrent)| (*info_hash, torrent.speed))
            .collect()
    }

    /// Aggregate speed currently being distributed.
    pub fn target_speed(&self) -> Speed {
        self.inner.state.lock().target
    }

    pub fn registered(&self) -> usize {
        self.inner.state.lock().torrents.len()
    }

    fn update(&self, change: impl FnOnce(&mut BTreeMap<InfoHash, TorrentBandwidth>)) {
        let snapshot = {
            let mut state = self.inner.state.lock();
            accrue(&mut state, Instant::now());
            change(&mut state.torrents);
            self.reallocate(&mut state)
        };
        self.notify(&snapshot);
    }

    fn reallocate(&self, state: &mut AllocatorState) -> HashMap<InfoHash, Speed> {
        let weights: Vec<u64> = state
            .torrents
            .values()
            .map(|torrent| self.inner.policy.weight(&torrent.swarm))
            .collect();
        let shares = split_target(state.target, &weights);

        state
            .torrents
            .iter_mut()
            .zip(shares)
            .map(|((info_hash, torrent), share)| {
                torrent.speed = share;
                (*info_hash, share)
            })
            .collect()
    }

    fn notify(&self, snapshot: &HashMap<InfoHash, Speed>) {
        if let Some(listener) = &self.inner.listener {
            listener.speeds_changed(snapshot);
        }
    }
}

fn draw_target(rng: &mut ChaCha8Rng, settings: &BandwidthSettings) -> Speed {
    let min = settings.min_upload_rate.min(settings.max_upload_rate);
    rng.random_range(min..=settings.max_upload_rate)
}

const NANOS_PER_SEC: u128 = 1_000_000_000;

fn accrue(state: &mut AllocatorState, now: Instant) {
    let elapsed = now.saturating_duration_since(state.last_update);
    state.last_update = now;
    if elapsed.is_zero() {
        return;
    }

    let elapsed_ns = elapsed.as_nanos();
    for torrent in state.torrents.values_mut() {
        let owed = u128::from(torrent.speed) * elapsed_ns + torrent.carry;
        torrent.carry = owed % NANOS_PER_SEC;
        let amount = owed / NANOS_PER_SEC;
        torrent.stats.advance(u64::try_from(amount).unwrap_or(u64::MAX));
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[derive(Default)]
    struct RecordingListener {
        snapshots: Mutex<Vec<HashMap<InfoHash, Speed>>>,
    }

    impl SpeedListener for RecordingListener {
        fn speeds_changed(&self, speeds: &HashMap<InfoHash, Speed>) {
            self.snapshots.lock().push(speeds.clone());
        }
    }

    fn settings(min: Speed, max: Speed) -> BandwidthSettings {
        BandwidthSettings {
            min_upload_rate: min,
            max_upload_rate: max,
            tick_interval: Duration::from_secs(5),
            seed: Some(7),
        }
    }

    fn hash(byte: u8) -> InfoHash {
        InfoHash::new([byte; 20])
    }

    #[test]
    fn test_split_distributes_remainder() {
        assert_eq!(split_target(10, &[1, 1, 1]), vec![4, 3, 3]);
        assert_eq!(split_target(100, &[3, 1]), vec![75, 25]);
        assert_eq!(split_target(7, &[0, 0]), vec![4, 3]);
        assert_eq!(split_target(5, &[0, 2]), vec![0, 5]);
        assert!(split_target(5, &[]).is_empty());
    }

    #[test]
    fn test_swarm_weighted_policy() {
        let policy = SwarmWeighted;
        let none = SwarmCounts {
            seeders: 10,
            leechers: 0,
        };
        let busy = SwarmCounts {
            seeders: 1,
            leechers: 9,
        };
        let quiet = SwarmCounts {
            seeders: 9,
            leechers: 1,
        };
        assert_eq!(policy.weight(&none), 0);
        assert!(policy.weight(&busy) > policy.weight(&quiet));
    }

    #[tokio::test(start_paused = true)]
    async fn test_counters_follow_speed() {
        let allocator = BandwidthAllocator::new(settings(1000, 1000), Arc::new(EqualSplit), None);
        allocator.register(hash(1), SeedStats::with_left(1500), SwarmCounts::default());
        allocator.register(hash(2), SeedStats::default(), SwarmCounts::default());
        assert_eq!(allocator.speed_map()[&hash(1)], 500);

        tokio::time::advance(Duration::from_secs(2)).await;
        let downloading = allocator.stats(&hash(1));
        assert_eq!(downloading.uploaded, 1000);
        assert_eq!(downloading.downloaded, 1000);
        assert_eq!(downloading.left, 500);

        tokio::time::advance(Duration::from_secs(4)).await;
        let downloading = allocator.stats(&hash(1));
        assert_eq!(downloading.uploaded, 3000);
        assert_eq!(downloading.downloaded, 1500);
        assert_eq!(downloading.left, 0);

        let seeding = allocator.stats(&hash(2));
        assert_eq!(seeding.uploaded, 3000);
        assert_eq!(seeding.downloaded, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frequent_reads_keep_partial_bytes() {
        let allocator = BandwidthAllocator::new(settings(3, 3), Arc::new(EqualSplit), None);
        allocator.register(hash(1), SeedStats::default(), SwarmCounts::default());

        for _ in 0..4000 {
            tokio::time::advance(Duration::from_micros(500)).await;
            allocator.stats(&hash(1));
        }
        assert_eq!(allocator.stats(&hash(1)).uploaded, 6);

        for _ in 0..10 {
            tokio::time::advance(Duration::from_millis(100)).await;
            allocator.stats(&hash(1));
        }
        assert_eq!(allocator.stats(&hash(1)).uploaded, 9);
    }

    #[test]
    fn test_unknown_torrent_reads_zero() {
        let allocator = BandwidthAllocator::new(settings(10, 20), Arc::new(EqualSplit), None);
        assert_eq!(allocator.stats(&hash(9)), SeedStats::default());
        assert_eq!(allocator.unregister(&hash(9)), None);
    }

    #[test]
    fn test_tick_with_no_torrents_emits_empty_snapshot() {
        let listener = Arc::new(RecordingListener::default());
        let allocator =
            BandwidthAllocator::new(settings(10, 20), Arc::new(EqualSplit), Some(listener.clone()));
        allocator.tick();

        let snapshots = listener.snapshots.lock();
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].is_empty());
    }

    #[test]
    fn test_tick_target_within_bounds_and_fully_allocated() {
        let listener = Arc::new(RecordingListener::default());
        let allocator = BandwidthAllocator::new(
            settings(30_000, 160_000),
            Arc::new(EqualSplit),
            Some(listener.clone()),
        );
        for byte in 1..=3 {
            allocator.register(hash(byte), SeedStats::default(), SwarmCounts::default());
        }

        for _ in 0..20 {
            allocator.tick();
            let target = allocator.target_speed();
            assert!((30_000..=160_000).contains(&target));
            assert_eq!(allocator.speed_map().values().sum::<u64>(), target);
        }
        assert_eq!(listener.snapshots.lock().len(), 3 + 20);
    }

    #[test]
    fn test_seeded_allocators_draw_the_same_speeds() {
        let a = BandwidthAllocator::new(settings(0, 1_000_000), Arc::new(EqualSplit), None);
        let b = BandwidthAllocator::new(settings(0, 1_000_000), Arc::new(EqualSplit), None);
        for _ in 0..5 {
            a.tick();
            b.tick();
            assert_eq!(a.target_speed(), b.target_speed());
        }
    }

    #[test]
    fn test_reregister_keeps_counters() {
        let allocator = BandwidthAllocator::new(settings(10, 10), Arc::new(SwarmWeighted), None);
        allocator.register(hash(1), SeedStats::with_left(42), SwarmCounts::default());
        allocator.register(
            hash(1),
            SeedStats::default(),
            SwarmCounts {
                seeders: 1,
                leechers: 1,
            },
        );
        assert_eq!(allocator.registered(), 1);
        assert_eq!(allocator.stats(&hash(1)).left, 42);
        assert_eq!(allocator.speed_map()[&hash(1)], 10);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let allocator = BandwidthAllocator::new(settings(10, 20), Arc::new(EqualSplit), None);
        allocator.start();
        allocator.start();
        assert!(allocator.is_running());
        allocator.stop();
        allocator.stop();
        assert!(!allocator.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_notifies_listener() {
        let listener = Arc::new(RecordingListener::default());
        let allocator =
            BandwidthAllocator::new(settings(10, 20), Arc::new(EqualSplit), Some(listener.clone()));
        allocator.start();

        tokio::time::sleep(Duration::from_secs(11)).await;
        allocator.stop();
        assert_eq!(listener.snapshots.lock().len(), 2);
    }

    proptest! {
        #[test]
        fn split_always_sums_to_target(
            target in 0u64..10_000_000,
            weights in proptest::collection::vec(0u64..1000, 1..16),
        ) {
            let shares = split_target(target, &weights);
            prop_assert_eq!(shares.len(), weights.len());
            prop_assert_eq!(shares.iter().sum::<u64>(), target);
        }

        #[test]
        fn counters_never_regress(
            left in 0u64..1_000_000,
            steps in proptest::collection::vec(0u64..500_000, 1..32),
        ) {
            let mut stats = SeedStats::with_left(left);
            for amount in steps {
                let before = stats;
                stats.advance(amount);
                prop_assert!(stats.uploaded >= before.uploaded);
                prop_assert!(stats.downloaded >= before.downloaded);
                prop_assert!(stats.left <= before.left);
                prop_assert_eq!(stats.downloaded + stats.left, left);
            }
        }
    }
}
