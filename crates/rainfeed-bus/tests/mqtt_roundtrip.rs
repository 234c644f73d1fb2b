use rainfeed_bus::{settled, MqttTopic, MqttTopicConfig, SnapshotHandler, SnapshotTopic};
use rainfeed_core::{Reading, Snapshot, Station, StationKind};
use rainfeed_proto::CodecError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn sample_snapshot() -> Snapshot {
    Snapshot::new(
        Station {
            data_url: "https://environment.data.gov.uk/flood-monitoring/id/measures/1029TH-level"
                .to_string(),
            alias_url: "rloi://1029".to_string(),
            name: "Bourton Dickler".to_string(),
            kind: StationKind::Level,
            unit: "m".to_string(),
            ..Station::default()
        },
        vec![Reading::at_epoch(1_700_000_000, 0.42).unwrap()],
    )
    .with_trace(&Uuid::new_v4().to_string(), "")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mqtt_snapshot_roundtrip() {
    if std::env::var("RAINFEED_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set RAINFEED_INTEGRATION=1 to run");
        return;
    }

    let broker = std::env::var("RAINFEED_MQTT_BROKER")
        .unwrap_or_else(|_| "tcp://localhost:1883".to_string());
    let config = MqttTopicConfig {
        broker,
        topic: format!("rainfeed-it-{}", Uuid::new_v4().simple()),
        client_id: format!("pub-{}", Uuid::new_v4()),
        ..MqttTopicConfig::default()
    };
    let topic = Arc::new(MqttTopic::open(config).await.unwrap());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = move |delivery: Result<Snapshot, CodecError>| {
        let _ = tx.send(delivery);
        settled(Ok(()))
    };
    let handler: Arc<dyn SnapshotHandler> = Arc::new(handler);

    let cancel = CancellationToken::new();
    let subscription = tokio::spawn({
        let topic = Arc::clone(&topic);
        let cancel = cancel.clone();
        async move { topic.subscribe("", handler, cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(500)).await;

    let sent = sample_snapshot();
    topic.publish(&sent, &cancel).await.unwrap();

    let received = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout waiting for MQTT message")
        .expect("subscription ended")
        .expect("payload did not decode");

    assert_eq!(received.station.alias_url, sent.station.alias_url);
    assert_eq!(received.correlation_id, sent.correlation_id);
    assert_eq!(received.readings, sent.readings);

    cancel.cancel();
    subscription.await.unwrap().unwrap();
    topic.close().await;
}
