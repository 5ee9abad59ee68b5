//! Integration tests for the seeding engine.
//!
//! These tests drive the public `SeedingEngineHandle` API against a scripted
//! tracker and check the announce sequence and the events it produces.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mirage_core::config::{ClientEnvironment, MirageConfig};
use mirage_core::{
    AnnounceResponse, ClientDescriptor, ClientEvent, EventReceiver, EventSender, InfoHash,
    RemovalReason, SeedingEngineHandle, TorrentError, TorrentIdentity, TrackerError,
    TrackerRequest, TrackerTransport, spawn_seeding_engine,
};
use parking_lot::Mutex;
use tokio::time::{Instant, sleep};

const CLIENT: &str = r#"{
    "keyGenerator": {
        "algorithm": {"type": "HASH", "length": 8},
        "refreshOn": "TORRENT_PERSISTENT",
        "keyCase": "upper"
    },
    "peerIdGenerator": {
        "algorithm": {"type": "REGEX", "pattern": "-qB4250-[A-Za-z0-9]{12}"},
        "refreshOn": "NEVER",
        "shouldUrlEncode": false
    },
    "urlEncoder": {
        "encodingExclusionPattern": "[A-Za-z0-9_~().!*-]",
        "encodedHexCase": "lower"
    },
    "query": "info_hash={infohash}&peer_id={peerid}&port={port}&uploaded={uploaded}&downloaded={downloaded}&left={left}&corrupt=0&key={key}&event={event}&numwant={numwant}&compact=1",
    "numwant": 200,
    "numwantOnStop": 0,
    "requestHeaders": [
        {"name": "User-Agent", "value": "qBittorrent/4.2.5"},
        {"name": "Accept-Encoding", "value": "gzip"}
    ]
}"#;

const VALID_TORRENT: &[u8] = b"d8:announce31:http://tracker.example.com/annc4:infod6:lengthi1000e4:name8:test.txt12:piece lengthi32768e6:pieces20:12345678901234567890ee";

#[derive(Debug, Clone)]
enum Reply {
    Respond(AnnounceResponse),
    Fail(TrackerError),
}

/// Tracker double that records every request and answers from a script.
#[derive(Clone)]
struct ScriptedTracker {
    requests: Arc<Mutex<Vec<TrackerRequest>>>,
    reply: Reply,
    delay: Duration,
    stop_delay: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl ScriptedTracker {
    fn new(reply: Reply) -> Self {
        Self {
            requests: Arc::default(),
            reply,
            delay: Duration::ZERO,
            stop_delay: Duration::ZERO,
            in_flight: Arc::default(),
            max_in_flight: Arc::default(),
        }
    }

    fn responding(interval: u64, leechers: u32) -> Self {
        Self::new(Reply::Respond(AnnounceResponse {
            interval: Duration::from_secs(interval),
            min_interval: None,
            seeders: 10,
            leechers,
        }))
    }

    fn failing() -> Self {
        Self::new(Reply::Fail(TrackerError::TrackerFailure {
            reason: "unregistered torrent".to_string(),
        }))
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    fn requests(&self) -> Vec<TrackerRequest> {
        self.requests.lock().clone()
    }

    fn events_sent(&self) -> Vec<Option<String>> {
        self.requests()
            .iter()
            .map(|request| query_value(&request.query, "event"))
            .collect()
    }
}

#[async_trait]
impl TrackerTransport for ScriptedTracker {
    async fn announce(&self, request: TrackerRequest) -> Result<AnnounceResponse, TrackerError> {
        let stopping = request.query.contains("event=stopped");
        self.requests.lock().push(request);

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = if stopping { self.stop_delay } else { self.delay };
        if !delay.is_zero() {
            sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match &self.reply {
            Reply::Respond(response) => Ok(*response),
            Reply::Fail(error) => Err(error.clone()),
        }
    }
}

/// Test fixture wiring a scripted tracker into a running engine.
struct EngineTestFixture {
    handle: SeedingEngineHandle,
    tracker: ScriptedTracker,
    events: EventReceiver,
}

impl EngineTestFixture {
    fn spawn(
        config: MirageConfig,
        tracker: ScriptedTracker,
        torrents: Vec<TorrentIdentity>,
    ) -> Self {
        Self::spawn_with_client(config, tracker, torrents, CLIENT)
    }

    fn spawn_with_client(
        config: MirageConfig,
        tracker: ScriptedTracker,
        torrents: Vec<TorrentIdentity>,
        client: &str,
    ) -> Self {
        let descriptor = ClientDescriptor::from_json(client, ClientEnvironment::for_testing())
            .expect("test client file is valid");
        let (events, receiver) = EventSender::channel();
        let handle = spawn_seeding_engine(
            config,
            Arc::new(descriptor),
            tracker.clone(),
            torrents,
            events,
        );

        Self {
            handle,
            tracker,
            events: receiver,
        }
    }

    fn drain_events(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn torrent(byte: u8, name: &str) -> TorrentIdentity {
    TorrentIdentity::new(
        InfoHash::new([byte; 20]),
        name,
        1 << 30,
        vec![format!("http://tracker{byte}.example.com/announce")],
    )
    .expect("announce url present")
}

fn query_value(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name == key).then(|| value.to_string())
    })
}

fn removals(events: &[ClientEvent]) -> Vec<(InfoHash, RemovalReason)> {
    events
        .iter()
        .filter_map(|event| match event {
            ClientEvent::TorrentRemoved { info_hash, reason } => Some((*info_hash, *reason)),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_started_regular_stopped_sequence() {
    let mut fixture = EngineTestFixture::spawn(
        MirageConfig::for_testing(),
        ScriptedTracker::responding(30, 5),
        vec![torrent(1, "ubuntu.iso")],
    );

    sleep(Duration::from_secs(35)).await;
    fixture.handle.shutdown().await.unwrap();

    assert_eq!(
        fixture.tracker.events_sent(),
        vec![Some("started".to_string()), None, Some("stopped".to_string())]
    );

    let requests = fixture.tracker.requests();
    assert!(requests.iter().all(|request| !request.query.contains('{')));
    assert_eq!(requests[0].announce_url, "http://tracker1.example.com/announce");
    assert_eq!(query_value(&requests[0].query, "numwant").as_deref(), Some("200"));
    assert_eq!(query_value(&requests[2].query, "numwant").as_deref(), Some("0"));
    assert_eq!(query_value(&requests[0].query, "uploaded").as_deref(), Some("0"));

    let uploaded: u64 = query_value(&requests[1].query, "uploaded")
        .and_then(|value| value.parse().ok())
        .unwrap();
    assert!(uploaded >= 30_000 * 25, "uploaded only {uploaded}");
    assert_eq!(query_value(&requests[1].query, "left").as_deref(), Some("0"));

    assert_eq!(
        query_value(&requests[0].query, "key"),
        query_value(&requests[2].query, "key")
    );
    assert!(
        requests[0]
            .headers
            .contains(&("User-Agent".to_string(), "qBittorrent/4.2.5".to_string()))
    );

    let events = fixture.drain_events();
    assert_eq!(
        events.first(),
        Some(&ClientEvent::SeedingStarted {
            client: "qBittorrent/4.2.5".to_string()
        })
    );
    assert_eq!(events.last(), Some(&ClientEvent::SeedingStopped));
    assert!(
        events
            .iter()
            .any(|event| matches!(event, ClientEvent::SpeedsChanged(speeds) if !speeds.is_empty()))
    );
    assert!(!fixture.handle.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_too_many_failures_removes_torrent_once() {
    let mut fixture = EngineTestFixture::spawn(
        MirageConfig::for_testing(),
        ScriptedTracker::failing(),
        vec![torrent(2, "debian.iso")],
    );

    sleep(Duration::from_secs(60)).await;

    assert_eq!(fixture.tracker.requests().len(), 3);
    assert!(
        fixture
            .tracker
            .events_sent()
            .iter()
            .all(|event| event.as_deref() == Some("started"))
    );
    assert!(fixture.handle.seeding_announcers().is_empty());

    let events = fixture.drain_events();
    let terminal = events
        .iter()
        .filter(|event| matches!(event, ClientEvent::TooManyAnnounceFailures { .. }))
        .count();
    let failures = events
        .iter()
        .filter(|event| matches!(event, ClientEvent::AnnounceFailed { .. }))
        .count();
    assert_eq!(terminal, 1);
    assert_eq!(failures, 3);
    assert_eq!(
        removals(&events),
        vec![(InfoHash::new([2; 20]), RemovalReason::TooManyFailures)]
    );

    fixture.handle.shutdown().await.unwrap();
    assert_eq!(fixture.tracker.requests().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_between_failures() {
    let fixture = EngineTestFixture::spawn(
        MirageConfig::for_testing(),
        ScriptedTracker::failing(),
        vec![torrent(3, "arch.iso")],
    );

    sleep(Duration::from_millis(500)).await;
    assert_eq!(fixture.tracker.requests().len(), 1);
    let snapshot = &fixture.handle.seeding_announcers()[0];
    assert_eq!(snapshot.consecutive_failures, 1);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(fixture.tracker.requests().len(), 2);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(fixture.tracker.requests().len(), 2);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(fixture.tracker.requests().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_single_outstanding_announce_per_torrent() {
    let fixture = EngineTestFixture::spawn(
        MirageConfig::for_testing(),
        ScriptedTracker::responding(1, 5).with_delay(Duration::from_secs(20)),
        vec![torrent(4, "fedora.iso")],
    );

    sleep(Duration::from_secs(120)).await;

    assert!(fixture.tracker.requests().len() >= 4);
    assert_eq!(fixture.tracker.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_queued_torrent_promoted_on_removal() {
    let mut config = MirageConfig::for_testing();
    config.seed.simultaneous_seed = 2;
    let mut fixture = EngineTestFixture::spawn(
        config,
        ScriptedTracker::responding(1800, 5),
        vec![
            torrent(1, "alpha"),
            torrent(2, "beta"),
            torrent(3, "gamma"),
        ],
    );

    sleep(Duration::from_secs(1)).await;
    let seeding: Vec<String> = fixture
        .handle
        .seeding_announcers()
        .into_iter()
        .map(|snapshot| snapshot.name)
        .collect();
    assert_eq!(seeding, vec!["alpha", "beta"]);
    let queued = fixture.handle.queued_torrents().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].name, "gamma");

    fixture
        .handle
        .remove_torrent(InfoHash::new([1; 20]))
        .await
        .unwrap();
    sleep(Duration::from_secs(1)).await;

    let seeding: Vec<String> = fixture
        .handle
        .seeding_announcers()
        .into_iter()
        .map(|snapshot| snapshot.name)
        .collect();
    assert_eq!(seeding, vec!["beta", "gamma"]);
    assert!(fixture.handle.queued_torrents().await.unwrap().is_empty());

    let events = fixture.drain_events();
    assert_eq!(
        removals(&events),
        vec![(InfoHash::new([1; 20]), RemovalReason::Requested)]
    );
    assert_eq!(
        fixture
            .tracker
            .events_sent()
            .iter()
            .filter(|event| event.as_deref() == Some("stopped"))
            .count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_remove_unknown_torrent() {
    let fixture = EngineTestFixture::spawn(
        MirageConfig::for_testing(),
        ScriptedTracker::responding(1800, 5),
        Vec::new(),
    );

    let result = fixture.handle.remove_torrent(InfoHash::new([9; 20])).await;
    assert!(matches!(result, Err(TorrentError::TorrentNotFound { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_zero_leechers_leaves_swarm() {
    let mut config = MirageConfig::for_testing();
    config.seed.keep_torrent_with_zero_leechers = false;
    let mut fixture = EngineTestFixture::spawn(
        config,
        ScriptedTracker::responding(1800, 0),
        vec![torrent(5, "lonely.iso")],
    );

    sleep(Duration::from_secs(1)).await;

    assert_eq!(
        fixture.tracker.events_sent(),
        vec![Some("started".to_string()), Some("stopped".to_string())]
    );
    assert_eq!(
        removals(&fixture.drain_events()),
        vec![(InfoHash::new([5; 20]), RemovalReason::NoLeechers)]
    );
    assert!(fixture.handle.seeding_announcers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_add_torrent_bytes() {
    let mut fixture = EngineTestFixture::spawn(
        MirageConfig::for_testing(),
        ScriptedTracker::responding(1800, 5),
        Vec::new(),
    );

    let result = fixture
        .handle
        .add_torrent_bytes("broken.torrent", b"not bencode".to_vec())
        .await;
    assert!(matches!(result, Err(TorrentError::InvalidTorrentFile { .. })));

    let info_hash = fixture
        .handle
        .add_torrent_bytes("test.torrent", VALID_TORRENT.to_vec())
        .await
        .unwrap();
    let duplicate = fixture
        .handle
        .add_torrent_bytes("test.torrent", VALID_TORRENT.to_vec())
        .await;
    assert!(matches!(duplicate, Err(TorrentError::DuplicateTorrent { .. })));

    sleep(Duration::from_secs(1)).await;
    let requests = fixture.tracker.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].announce_url, "http://tracker.example.com/annc");

    let failed: Vec<String> = fixture
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            ClientEvent::TorrentAddFailed { name, .. } => Some(name),
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec!["broken.torrent", "test.torrent"]);
    assert_eq!(fixture.handle.seeding_announcers()[0].info_hash, info_hash);
}

#[tokio::test(start_paused = true)]
async fn test_template_error_removes_torrent() {
    let mut client: serde_json::Value = serde_json::from_str(CLIENT).unwrap();
    client.as_object_mut().unwrap().remove("keyGenerator");
    let without_key = client.to_string();
    let mut fixture = EngineTestFixture::spawn_with_client(
        MirageConfig::for_testing(),
        ScriptedTracker::responding(1800, 5),
        vec![torrent(6, "keyless.iso")],
        &without_key,
    );

    sleep(Duration::from_secs(1)).await;

    assert!(fixture.tracker.requests().is_empty());
    assert_eq!(
        removals(&fixture.drain_events()),
        vec![(InfoHash::new([6; 20]), RemovalReason::TemplateError)]
    );
    assert!(fixture.handle.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_stops_within_grace_period() {
    let mut fixture = EngineTestFixture::spawn(
        MirageConfig::for_testing(),
        ScriptedTracker::responding(1800, 5).with_stop_delay(Duration::from_secs(600)),
        vec![torrent(7, "one"), torrent(8, "two")],
    );
    sleep(Duration::from_secs(1)).await;

    let started = Instant::now();
    fixture.handle.shutdown().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let stops = fixture
        .tracker
        .events_sent()
        .iter()
        .filter(|event| event.as_deref() == Some("stopped"))
        .count();
    assert_eq!(stops, 2);

    let events = fixture.drain_events();
    let mut removed = removals(&events);
    removed.sort_by_key(|(info_hash, _)| *info_hash);
    assert_eq!(
        removed,
        vec![
            (InfoHash::new([7; 20]), RemovalReason::Shutdown),
            (InfoHash::new([8; 20]), RemovalReason::Shutdown),
        ]
    );
    assert_eq!(events.last(), Some(&ClientEvent::SeedingStopped));

    assert!(fixture.handle.seeding_announcers().is_empty());
    let after = fixture.handle.add_torrent(torrent(9, "late")).await;
    assert!(matches!(after, Err(TorrentError::EngineShutdown)));
}

#[tokio::test(start_paused = true)]
async fn test_remove_during_started_sends_stopped() {
    let mut fixture = EngineTestFixture::spawn(
        MirageConfig::for_testing(),
        ScriptedTracker::responding(1800, 5).with_delay(Duration::from_secs(10)),
        vec![torrent(10, "slow-start.iso")],
    );

    sleep(Duration::from_secs(1)).await;
    assert_eq!(fixture.tracker.events_sent(), vec![Some("started".to_string())]);

    fixture
        .handle
        .remove_torrent(InfoHash::new([10; 20]))
        .await
        .unwrap();
    sleep(Duration::from_secs(30)).await;

    assert_eq!(
        fixture.tracker.events_sent(),
        vec![Some("started".to_string()), Some("stopped".to_string())]
    );
    assert_eq!(
        removals(&fixture.drain_events()),
        vec![(InfoHash::new([10; 20]), RemovalReason::Requested)]
    );
    assert!(fixture.handle.seeding_announcers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_started_sends_stopped() {
    let mut config = MirageConfig::for_testing();
    config.seed.simultaneous_seed = 1;
    let fixture = EngineTestFixture::spawn(
        config,
        ScriptedTracker::responding(1800, 5).with_delay(Duration::from_secs(10)),
        vec![torrent(11, "seeding"), torrent(12, "queued")],
    );

    sleep(Duration::from_secs(1)).await;
    fixture.handle.shutdown().await.unwrap();

    let requests = fixture.tracker.requests();
    let stops: Vec<&TrackerRequest> = requests
        .iter()
        .filter(|request| query_value(&request.query, "event").as_deref() == Some("stopped"))
        .collect();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].announce_url, "http://tracker11.example.com/announce");
    assert_eq!(requests.len(), 2);
}
