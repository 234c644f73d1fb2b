use rainfeed_agent::{Agent, AgentConfig, MemoryStore};
use rainfeed_bus::{MemoryTopic, SnapshotTopic};
use rainfeed_core::{
    Calibration, FixedClock, Measure, Reading, Record, Section, Snapshot, Station, StationKind,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const T0: i64 = 1_700_000_000;
const FEED: &str = "https://environment.data.gov.uk/flood-monitoring/id/measures/1029TH-level";

struct Harness {
    topic: MemoryTopic,
    store: Arc<MemoryStore>,
    shutdown: CancellationToken,
    agent: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    async fn start(store: MemoryStore, configure: impl FnOnce(&mut AgentConfig)) -> Self {
        let topic = MemoryTopic::with_ack_deadline("gauge-snapshots", Duration::from_millis(100))
            .unwrap();
        let store = Arc::new(store);
        let mut config = AgentConfig::default();
        config.load_interval = Duration::ZERO;
        configure(&mut config);

        let agent = Agent::new(
            config,
            vec![section()],
            Arc::new(topic.clone()),
            store.clone(),
            Arc::new(FixedClock::new(
                chrono::DateTime::from_timestamp(T0, 0).unwrap(),
            )),
        );
        let shutdown = CancellationToken::new();
        let agent = tokio::spawn(agent.run_until(shutdown.clone()));

        let probe = topic.clone();
        wait_until(move || probe.subscribers() == 1).await;

        Self {
            topic,
            store,
            shutdown,
            agent,
        }
    }

    async fn publish(&self, snapshot: &Snapshot) {
        self.topic
            .publish(snapshot, &self.shutdown)
            .await
            .unwrap();
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.agent.await.unwrap().unwrap();
        assert_eq!(self.topic.subscribers(), 0);
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn section() -> Section {
    Section {
        id: "dikler".to_string(),
        name: "Dikler".to_string(),
        calibrations: vec![Calibration {
            url: FEED.to_string(),
            low: Some(0.3),
            high: Some(0.9),
            ..Calibration::default()
        }],
    }
}

fn snapshot(readings: &[(i64, f32)]) -> Snapshot {
    Snapshot::new(
        Station {
            data_url: FEED.to_string(),
            alias_url: "rloi://1029".to_string(),
            human_url: "https://check-for-flooding.service.gov.uk/station/1029".to_string(),
            name: "Bourton Dickler".to_string(),
            river_name: "Dikler".to_string(),
            kind: StationKind::Level,
            unit: "m".to_string(),
            ..Station::default()
        },
        readings
            .iter()
            .map(|&(t, v)| Reading::at_epoch(T0 + t, v).unwrap())
            .collect(),
    )
    .with_trace("corr-1", "cause-1")
}

#[tokio::test]
async fn identical_snapshots_store_once_and_new_reading_stores_again() {
    let h = Harness::start(MemoryStore::new(), |_| {}).await;

    let first = snapshot(&[(100, 0.51)]);
    h.publish(&first).await;
    h.publish(&first).await;
    wait_until(|| h.topic.stats().acked == 2).await;
    assert_eq!(h.store.write_count(), 1);

    h.publish(&snapshot(&[(200, 0.55)])).await;
    wait_until(|| h.topic.stats().acked == 3).await;

    let writes = h.store.writes();
    assert_eq!(writes.len(), 2);
    let measure = &writes[1].measures[0];
    assert_eq!(
        measure
            .readings
            .iter()
            .map(|r| r.event_time.timestamp() - T0)
            .collect::<Vec<_>>(),
        vec![100, 200]
    );
    assert_eq!(measure.calibration.high, Some(0.9));

    h.stop().await;
}

#[tokio::test]
async fn corrupt_payload_is_acknowledged_and_not_redelivered() {
    let h = Harness::start(MemoryStore::new(), |_| {}).await;

    h.topic.publish_raw(b"\xa1\x61v").unwrap();
    wait_until(|| h.topic.stats().acked == 1).await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(h.topic.stats().redelivered, 0);
    assert_eq!(h.store.write_count(), 0);
    assert!(!h.agent.is_finished());

    h.stop().await;
}

#[tokio::test]
async fn failed_store_is_redelivered_and_persisted() {
    let store = MemoryStore::new();
    store.fail_next(1);
    let h = Harness::start(store, |_| {}).await;

    h.publish(&snapshot(&[(100, 0.51)])).await;
    wait_until(|| h.store.write_count() == 1).await;

    let stats = h.topic.stats();
    assert!(stats.redelivered >= 1);
    assert_eq!(h.store.get("dikler").unwrap().measures[0].readings.len(), 1);

    h.stop().await;
}

#[tokio::test]
async fn stored_record_is_extended_not_duplicated() {
    let store = MemoryStore::new();
    let mut record = Record::new("dikler", "Dikler");
    let mut measure = Measure::new(snapshot(&[]).station, section().calibrations[0].clone());
    measure.readings = vec![Reading::at_epoch(T0 + 100, 0.51).unwrap()];
    record.measures.push(measure);
    store.insert(record);

    let h = Harness::start(store, |_| {}).await;
    h.publish(&snapshot(&[(200, 0.55)])).await;
    wait_until(|| h.store.write_count() == 1).await;

    let stored = h.store.get("dikler").unwrap();
    assert_eq!(stored.measures.len(), 1);
    assert_eq!(stored.measures[0].readings.len(), 2);

    h.stop().await;
}

#[tokio::test]
async fn snapshot_sharing_only_station_page_is_dropped() {
    let store = MemoryStore::new();
    let mut record = Record::new("dikler", "Dikler");
    record.measures.push(Measure::new(
        snapshot(&[]).station,
        section().calibrations[0].clone(),
    ));
    store.insert(record);
    let h = Harness::start(store, |_| {}).await;

    // flow gauge at the same station, not calibrated for this section
    let mut flow = snapshot(&[(100, 4.2)]);
    flow.station.data_url = format!("{FEED}-flow");
    flow.station.alias_url = "rloi://1029-flow".to_string();
    flow.station.kind = StationKind::Flow;
    h.publish(&flow).await;
    wait_until(|| h.topic.stats().acked == 1).await;

    h.publish(&snapshot(&[(100, 0.51)])).await;
    wait_until(|| h.store.write_count() == 1).await;

    assert!(!h.agent.is_finished());
    let stored = h.store.get("dikler").unwrap();
    assert_eq!(stored.measures.len(), 1);
    assert_eq!(stored.measures[0].station.alias_url, "rloi://1029");

    h.stop().await;
}

#[tokio::test]
async fn misrouted_snapshot_stops_the_agent() {
    const RETIRED: &str = "https://gauges.example/measures/retired";

    let store = MemoryStore::new();
    let mut record = Record::new("dikler", "Dikler");
    record.measures.push(Measure::new(
        Station {
            data_url: RETIRED.to_string(),
            alias_url: "rloi://retired".to_string(),
            ..Station::default()
        },
        Calibration::default(),
    ));
    store.insert(record);
    let h = Harness::start(store, |_| {}).await;

    // routed by the stored data URL, but neither its identity nor any
    // calibration belongs to the section
    let mut stray = snapshot(&[(100, 0.4)]);
    stray.station.data_url = RETIRED.to_string();
    stray.station.alias_url = "rloi://stray".to_string();
    stray.station.human_url = "https://gauges.example/stray".to_string();
    h.publish(&stray).await;

    let err = timeout(Duration::from_secs(5), h.agent)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(format!("{err:#}").contains("incorrectly routed snapshot"));
    assert_eq!(h.store.write_count(), 0);
}

#[tokio::test]
async fn agent_stops_at_shutdown_deadline() {
    let h = Harness::start(MemoryStore::new(), |config| {
        config.shutdown_after = Duration::from_millis(200);
    })
    .await;

    timeout(Duration::from_secs(5), h.agent)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(h.topic.subscribers(), 0);
}
