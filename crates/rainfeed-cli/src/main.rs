//! # Rainfeed CLI
//!
//! Command-line utilities for producing, inspecting and importing gauge
//! snapshots.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rainfeed_bus::{MemoryTopic, MqttTopic, MqttTopicConfig, SnapshotTopic};
use rainfeed_core::Snapshot;
use std::env;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod import;
mod publish;

use import::import_archive;
use publish::{publish_all, PublishConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "encode" => {
            let Some(path) = args.get(2) else {
                usage("rainfeed encode <snapshot.json>");
            };
            let snapshot: Snapshot = read_json(Path::new(path))?;
            let bytes = rainfeed_proto::encode(&snapshot).context("Failed to encode")?;
            println!("{}", URL_SAFE_NO_PAD.encode(bytes));
        }
        "decode" => {
            let Some(payload) = args.get(2) else {
                usage("rainfeed decode <payload>");
            };
            let bytes = URL_SAFE_NO_PAD
                .decode(payload.trim())
                .context("Payload is not base64url")?;
            let snapshot = rainfeed_proto::decode(&bytes).context("Failed to decode")?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        "publish" => {
            let Some(path) = args.get(2) else {
                usage("rainfeed publish <snapshots.json>");
            };
            let snapshots: Vec<Snapshot> = read_json(Path::new(path))?;
            publish_snapshots(snapshots).await?;
        }
        "import" => {
            let Some(path) = args.get(2) else {
                usage("rainfeed import <readings.csv>");
            };
            let file =
                File::open(path).with_context(|| format!("Failed to open archive {path}"))?;
            let report = import_archive(BufReader::new(file))?;
            tracing::info!(
                measures = report.snapshots.len(),
                skipped = report.skipped,
                errors = report.errors.len(),
                "Archive imported"
            );
            println!("{}", serde_json::to_string_pretty(&report.snapshots)?);
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn usage(text: &str) -> ! {
    eprintln!("Usage: {text}");
    std::process::exit(1);
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Invalid snapshot JSON in {}", path.display()))
}

async fn publish_snapshots(snapshots: Vec<Snapshot>) -> Result<()> {
    let topic_name =
        env::var("RAINFEED_TOPIC").unwrap_or_else(|_| rainfeed_proto::DEFAULT_TOPIC.to_string());

    let topic: Box<dyn SnapshotTopic> = match env::var("RAINFEED_MQTT_BROKER") {
        Ok(broker) if !broker.is_empty() => Box::new(
            MqttTopic::open(MqttTopicConfig {
                broker,
                topic: topic_name,
                client_id: format!("rainfeed-cli-{}", Uuid::new_v4().simple()),
                ..MqttTopicConfig::default()
            })
            .await
            .context("Failed to connect to MQTT broker")?,
        ),
        _ => {
            tracing::warn!("RAINFEED_MQTT_BROKER not set, publishing to an in-memory topic");
            Box::new(MemoryTopic::open(&topic_name)?)
        }
    };

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });

    let result = publish_all(topic.as_ref(), snapshots, &PublishConfig::default(), &cancel).await;
    topic.close().await;

    let report = result.context("Too many consecutive publish failures")?;
    if report.published == 0 && report.failed > 0 {
        bail!("No snapshot was published");
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"Rainfeed CLI

USAGE:
    rainfeed <COMMAND> [OPTIONS]

COMMANDS:
    encode <snapshot.json>     Encode a JSON snapshot to a base64url wire payload
    decode <payload>           Decode a base64url wire payload to JSON
    publish <snapshots.json>   Publish a JSON array of snapshots, paced over 15 minutes
    import <readings.csv>      Convert an archive CSV to JSON snapshots
    help                       Show this help message

ENVIRONMENT:
    RAINFEED_MQTT_BROKER       Broker for publish (unset: in-memory dry run)
    RAINFEED_TOPIC             Topic for publish (default: gauge-snapshots)

EXAMPLES:
    rainfeed import readings-2016-01-30.csv > snapshots.json
    RAINFEED_MQTT_BROKER=tcp://localhost:1883 rainfeed publish snapshots.json
"#
    );
}
