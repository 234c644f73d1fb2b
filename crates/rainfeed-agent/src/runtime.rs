//! Agent runtime orchestration.

use crate::config::AgentConfig;
use crate::identity::IdentityIndex;
use crate::persistence::{MemoryStore, RecordStore, SqliteStore};
use crate::router::SnapshotRouter;
use crate::writer::RecordWriter;
use anyhow::{anyhow, Context, Result};
use rainfeed_bus::{
    settled, BoxError, MemoryTopic, MqttTopic, MqttTopicConfig, Settlement, SnapshotHandler,
    SnapshotTopic,
};
use rainfeed_core::{Clock, Record, Section, Snapshot, SystemClock};
use rainfeed_proto::CodecError;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The consumer daemon: one writer per section behind one subscription.
pub struct Agent {
    config: AgentConfig,
    sections: Vec<Section>,
    topic: Arc<dyn SnapshotTopic>,
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    router: Arc<SnapshotRouter>,
    identity: Arc<IdentityIndex>,
}

impl Agent {
    /// Create an agent over explicit collaborators.
    #[must_use]
    pub fn new(
        config: AgentConfig,
        sections: Vec<Section>,
        topic: Arc<dyn SnapshotTopic>,
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            sections,
            topic,
            store,
            clock,
            router: Arc::new(SnapshotRouter::new()),
            identity: Arc::new(IdentityIndex::new()),
        }
    }

    /// Create an agent from configuration, connecting to the broker and
    /// opening the database.
    ///
    /// Without a broker the agent runs dry on an in-memory topic and store.
    ///
    /// # Errors
    ///
    /// Returns error if the broker or the database cannot be opened.
    pub async fn connect(config: AgentConfig, sections: Vec<Section>) -> Result<Self> {
        let (topic, store): (Arc<dyn SnapshotTopic>, Arc<dyn RecordStore>) =
            match &config.bus.mqtt_broker {
                Some(broker) => {
                    let topic = MqttTopic::open(MqttTopicConfig {
                        broker: broker.clone(),
                        topic: config.bus.topic.clone(),
                        client_id: format!("rainfeed-agent-{}", Uuid::new_v4().simple()),
                        instance_id: config.bus.instance_id.clone(),
                        ack_deadline: config.bus.ack_deadline,
                        ..MqttTopicConfig::default()
                    })
                    .await
                    .context("Failed to connect to MQTT broker")?;
                    let store = SqliteStore::open(&config.persistence.db_path)
                        .context("Failed to open SQLite database")?;
                    (Arc::new(topic), Arc::new(store))
                }
                None => {
                    tracing::warn!("No MQTT broker configured, running dry on an in-memory topic");
                    let topic =
                        MemoryTopic::with_ack_deadline(&config.bus.topic, config.bus.ack_deadline)
                            .context("Failed to open in-memory topic")?;
                    (Arc::new(topic), Arc::new(MemoryStore::new()))
                }
            };

        Ok(Self::new(config, sections, topic, store, Arc::new(SystemClock)))
    }

    /// Router that incoming snapshots are dispatched through.
    #[must_use]
    pub fn router(&self) -> Arc<SnapshotRouter> {
        Arc::clone(&self.router)
    }

    /// Run until Ctrl+C, the shutdown deadline, or a fatal error.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error of any writer or the subscription.
    pub async fn run(self) -> Result<()> {
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
                signal.cancel();
            }
        });

        self.run_until(shutdown).await
    }

    /// Run until `shutdown` fires, the shutdown deadline, or a fatal error.
    ///
    /// # Errors
    ///
    /// Returns error if a record cannot be loaded at startup, or the first
    /// fatal error of any writer or the subscription.
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<()> {
        let cancel = shutdown.child_token();
        let mut tasks = JoinSet::new();

        let started = self.start_writers(&mut tasks, &cancel).await;
        let outcome = match started {
            Ok(()) => {
                self.subscribe(&mut tasks, &cancel);
                self.supervise(&mut tasks, &shutdown).await
            }
            Err(err) => Err(err),
        };

        cancel.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Ok(Err(err)) = joined {
                tracing::debug!(error = %err, "Task error during shutdown");
            }
        }
        self.topic.close().await;

        match &outcome {
            Ok(()) => tracing::info!("Agent stopped"),
            Err(err) => tracing::error!(error = %format!("{err:#}"), "Agent failed"),
        }
        outcome
    }

    async fn start_writers(
        &self,
        tasks: &mut JoinSet<Result<()>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tracing::info!(sections = self.sections.len(), "Loading section records");

        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 && !self.config.load_interval.is_zero() {
                tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    () = tokio::time::sleep(self.config.load_interval) => {}
                }
            }

            let record = self
                .store
                .load(&section.id)
                .await
                .with_context(|| format!("Failed to load record for section {}", section.id))?
                .unwrap_or_else(|| Record::new(&section.id, &section.name));

            let (listener, inbox) = self.router.listener();
            for calibration in &section.calibrations {
                self.router.register(&calibration.url, &listener);
            }
            // stored measures keep their routes once their calibration is gone;
            // human URLs name the station page and are shared between measures
            for measure in &record.measures {
                self.router.register(&measure.station.data_url, &listener);
                self.router.register(&measure.station.alias_url, &listener);
            }

            tracing::debug!(
                section_id = %section.id,
                measures = record.measures.len(),
                "Starting record writer"
            );
            let writer = RecordWriter::new(
                section.clone(),
                record,
                Arc::clone(&self.identity),
                Arc::clone(&self.store),
                Arc::clone(&self.clock),
                self.config.writer.clone(),
            );
            let section_id = section.id.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                writer
                    .run(inbox, cancel)
                    .await
                    .with_context(|| format!("Record writer for section {section_id} failed"))
            });
        }

        tracing::info!(
            routes = self.router.len(),
            measures = self.identity.len(),
            "Record writers started"
        );
        Ok(())
    }

    fn subscribe(&self, tasks: &mut JoinSet<Result<()>>, cancel: &CancellationToken) {
        let topic = Arc::clone(&self.topic);
        let group = self.config.bus.group.clone();
        let handler = snapshot_handler(Arc::clone(&self.router));
        let cancel = cancel.clone();

        tasks.spawn(async move {
            tracing::info!(topic = %topic.name(), group = %group, "Subscribing to snapshots");
            topic
                .subscribe(&group, handler, cancel.clone())
                .await
                .with_context(|| format!("Subscription to {} failed", topic.name()))?;
            if cancel.is_cancelled() {
                Ok(())
            } else {
                Err(anyhow!("Subscription to {} ended unexpectedly", topic.name()))
            }
        });
    }

    async fn supervise(
        &self,
        tasks: &mut JoinSet<Result<()>>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        tracing::info!("Agent running, press Ctrl+C to stop");
        let deadline = tokio::time::sleep(self.config.shutdown_after);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                () = &mut deadline => {
                    tracing::info!(
                        after_secs = self.config.shutdown_after.as_secs(),
                        "Shutdown deadline reached"
                    );
                    return Ok(());
                }
                joined = tasks.join_next() => match joined {
                    None => return Ok(()),
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(err))) => return Err(err),
                    Some(Err(err)) => return Err(anyhow!(err).context("Agent task panicked")),
                },
            }
        }
    }
}

/// Bus handler that routes decoded snapshots and drops corrupt ones.
///
/// The message settles once every listener answered, so a rejection by any
/// writer leaves it unacknowledged.
#[must_use]
pub fn snapshot_handler(router: Arc<SnapshotRouter>) -> Arc<dyn SnapshotHandler> {
    Arc::new(
        move |delivery: Result<Snapshot, CodecError>| -> Settlement {
            let snapshot = match delivery {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    tracing::error!(
                        event = "snapshot.corrupted",
                        error = %err,
                        "Dropping undecodable snapshot"
                    );
                    return settled(Ok(()));
                }
            };

            let receipts = router.route(Arc::new(snapshot));
            Box::pin(async move {
                for receipt in receipts {
                    receipt.settled().await?;
                }
                Ok::<(), BoxError>(())
            })
        },
    )
}
