//! MQTT-backed snapshot topic.
//!
//! Publishing uses one connection per topic with a single message in
//! flight; a publish waits for the PUBACK carrying its own packet id.
//! Each subscription opens its own connection whose client id is the
//! subscription name qualified by the instance id:
//!
//! - durable groups keep a persistent session (`clean_session = false`) and
//!   subscribe through a shared filter, so unacknowledged messages survive
//!   a restart and group members split the stream
//! - ephemeral subscriptions use a clean session and unsubscribe on exit
//!
//! Acknowledgement is manual: a PUBACK is only sent once the handler's
//! settlement succeeds.

use crate::topic::{dispatch, BusError, RetryQueue, SnapshotHandler, SnapshotTopic};
use async_trait::async_trait;
use chrono::Utc;
use rainfeed_core::Snapshot;
use rainfeed_proto::topics::validate_topic;
use rainfeed_proto::{codec, Subscription};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Configuration for an MQTT snapshot topic.
#[derive(Debug, Clone)]
pub struct MqttTopicConfig {
    /// MQTT broker URL (e.g., <tcp://localhost:1883>)
    pub broker: String,
    /// Topic carrying the snapshot stream
    pub topic: String,
    /// Client ID of the publishing connection
    pub client_id: String,
    /// Stable id of this process among the members of a group; empty
    /// falls back to `client_id`
    pub instance_id: String,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// How long to wait for the broker to accept a connection
    pub connect_timeout: Duration,
    /// Delay before an unacknowledged message is handled again
    pub ack_deadline: Duration,
    /// Consecutive connection errors tolerated by a subscription
    pub max_connection_errors: u32,
}

impl Default for MqttTopicConfig {
    fn default() -> Self {
        Self {
            broker: "tcp://localhost:1883".to_string(),
            topic: rainfeed_proto::DEFAULT_TOPIC.to_string(),
            client_id: "rainfeed-publisher".to_string(),
            instance_id: String::new(),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            ack_deadline: crate::DEFAULT_ACK_DEADLINE,
            max_connection_errors: 3,
        }
    }
}

/// Snapshot topic on an MQTT broker.
pub struct MqttTopic {
    config: MqttTopicConfig,
    host: String,
    port: u16,
    client: AsyncClient,
    acks: Mutex<AckWaiter>,
    driver: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl MqttTopic {
    /// Connect to the broker and open the topic for publishing.
    ///
    /// Opening the same topic again simply reuses the name; MQTT topics
    /// need no provisioning.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Connection`] if the broker does not accept the
    /// connection within the connect timeout.
    pub async fn open(config: MqttTopicConfig) -> Result<Self, BusError> {
        validate_topic(&config.topic)?;
        let (host, port) = parse_mqtt_url(&config.broker)?;

        let mut mqtt_options = MqttOptions::new(&config.client_id, host.clone(), port);
        mqtt_options.set_keep_alive(config.keep_alive);
        mqtt_options.set_inflight(1);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);
        await_connack(&mut eventloop, config.connect_timeout).await?;

        tracing::info!(
            broker = %config.broker,
            topic = %config.topic,
            client_id = %config.client_id,
            "Connected to MQTT broker"
        );

        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let driver = tokio::spawn(drive_publisher(eventloop, ack_tx, shutdown.clone()));

        Ok(Self {
            config,
            host,
            port,
            client,
            acks: Mutex::new(AckWaiter {
                events: ack_rx,
                tracker: AckTracker::default(),
            }),
            driver: Mutex::new(Some(driver)),
            shutdown,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl SnapshotTopic for MqttTopic {
    fn name(&self) -> &str {
        &self.config.topic
    }

    async fn publish(
        &self,
        snapshot: &Snapshot,
        cancel: &CancellationToken,
    ) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        if cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        let payload = codec::encode(snapshot)?;

        // holding the waiter serialises publishes
        let mut guard = self.acks.lock().await;
        let AckWaiter { events, tracker } = &mut *guard;

        tracing::debug!(
            topic = %self.config.topic,
            payload_len = payload.len(),
            alias_url = %snapshot.station.alias_url,
            "Publishing snapshot"
        );

        self.client
            .publish(&self.config.topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        tracker.queued();

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Err(BusError::Cancelled),
                event = events.recv() => match event {
                    Some(event) => {
                        if tracker.observe(event) {
                            return Ok(());
                        }
                    }
                    None => {
                        return Err(BusError::Connection(
                            "publisher event loop stopped".to_string(),
                        ));
                    }
                },
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn subscribe(
        &self,
        group: &str,
        handler: Arc<dyn SnapshotHandler>,
        cancel: CancellationToken,
    ) -> Result<(), BusError> {
        let subscription = Subscription::new(&self.config.topic, group, Utc::now())?;
        let filter = subscription.filter();

        let instance_id = if self.config.instance_id.is_empty() {
            &self.config.client_id
        } else {
            &self.config.instance_id
        };
        let client_id = subscription_client_id(&subscription, instance_id);

        let mut mqtt_options = MqttOptions::new(&client_id, self.host.clone(), self.port);
        mqtt_options.set_keep_alive(self.config.keep_alive);
        mqtt_options.set_clean_session(!subscription.is_durable());
        mqtt_options.set_manual_acks(true);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);
        await_connack(&mut eventloop, self.config.connect_timeout).await?;

        tracing::info!(
            subscription = %subscription.name(),
            client_id = %client_id,
            filter = %filter,
            durable = subscription.is_durable(),
            "Subscribing to snapshot topic"
        );

        client
            .subscribe(&filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        let (retry, mut retries) = RetryQueue::<Publish>::new(self.config.ack_deadline);
        let mut tasks = JoinSet::new();
        let mut consecutive_errors = 0u32;

        let result = loop {
            tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                () = self.shutdown.cancelled() => break Ok(()),
                Some(publish) = retries.recv() => {
                    tracing::debug!(pkid = publish.pkid, "Redelivering snapshot");
                    let payload = publish.payload.clone();
                    let client = client.clone();
                    dispatch(
                        handler.as_ref(),
                        &payload,
                        publish,
                        move |publish| ack(client, publish),
                        &retry,
                        &mut tasks,
                    );
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        consecutive_errors = 0;
                        tracing::debug!(
                            topic = %publish.topic,
                            payload_len = publish.payload.len(),
                            "Received snapshot message"
                        );
                        let payload = publish.payload.clone();
                        let client = client.clone();
                        dispatch(
                            handler.as_ref(),
                            &payload,
                            publish,
                            move |publish| ack(client, publish),
                            &retry,
                            &mut tasks,
                        );
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        consecutive_errors = 0;
                        tracing::info!(filter = %filter, "Subscription acknowledged");
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        consecutive_errors = 0;
                        tracing::info!("Reconnected to MQTT broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        consecutive_errors += 1;
                        tracing::error!(
                            error = %e,
                            consecutive_errors,
                            "MQTT subscription error"
                        );
                        if consecutive_errors >= self.config.max_connection_errors {
                            break Err(BusError::Connection(e.to_string()));
                        }
                        tokio::select! {
                            () = cancel.cancelled() => break Ok(()),
                            () = tokio::time::sleep(Duration::from_secs(5)) => {}
                        }
                    }
                },
            }
        };

        // in-flight merges are dropped; unacknowledged messages come back from the broker
        tasks.abort_all();

        if !subscription.is_durable() {
            if let Err(e) = client.unsubscribe(&filter).await {
                tracing::warn!(error = %e, filter = %filter, "Failed to unsubscribe");
            }
        }
        if let Err(e) = client.disconnect().await {
            tracing::debug!(error = %e, "Disconnect request failed");
        }
        drain_until_disconnect(&mut eventloop).await;

        tracing::info!(subscription = %subscription.name(), "Subscription closed");
        result
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!(error = %e, "Disconnect request failed");
        }
        if let Some(driver) = self.driver.lock().await.take() {
            if tokio::time::timeout(Duration::from_secs(2), driver).await.is_err() {
                tracing::debug!("Publisher event loop did not stop in time");
            }
        }
        self.shutdown.cancel();
        tracing::info!(topic = %self.config.topic, "Topic closed");
    }
}

impl Drop for MqttTopic {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.client.try_disconnect();
        }
        self.shutdown.cancel();
    }
}

/// Client id of one group member's subscription connection.
///
/// Members of a group must not share a client id, or the broker drops the
/// older session each time another member connects. The id only depends on
/// the subscription and the instance, so a restarted member resumes its
/// persistent session.
fn subscription_client_id(subscription: &Subscription, instance_id: &str) -> String {
    format!("{}.{instance_id}", subscription.name())
}

/// Publisher event loop notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublisherEvent {
    /// A PUBLISH left with this packet id
    Sent(u16),
    /// The broker acknowledged this packet id
    Acked(u16),
}

struct AckWaiter {
    events: mpsc::UnboundedReceiver<PublisherEvent>,
    tracker: AckTracker,
}

/// Matches PUBACKs to the publish waiting for them.
///
/// Publishes abandoned on cancellation still go out and get acknowledged
/// later; their events are counted off so only the newest publish's packet
/// id completes a wait.
#[derive(Debug, Default)]
struct AckTracker {
    unsent: usize,
    awaiting: Option<u16>,
}

impl AckTracker {
    /// A publish request was handed to the client.
    fn queued(&mut self) {
        self.unsent += 1;
        self.awaiting = None;
    }

    /// Whether `event` acknowledges the newest publish.
    fn observe(&mut self, event: PublisherEvent) -> bool {
        match event {
            PublisherEvent::Sent(pkid) => {
                // retransmits after a reconnect arrive with nothing unsent
                if self.unsent > 0 {
                    self.unsent -= 1;
                    if self.unsent == 0 {
                        self.awaiting = Some(pkid);
                    }
                }
                false
            }
            PublisherEvent::Acked(pkid) => self.awaiting == Some(pkid),
        }
    }
}

async fn ack(client: AsyncClient, publish: Publish) {
    if let Err(e) = client.ack(&publish).await {
        tracing::warn!(error = %e, pkid = publish.pkid, "Failed to acknowledge message");
    }
}

/// Poll until the broker answers the connection attempt.
async fn await_connack(eventloop: &mut EventLoop, timeout: Duration) -> Result<(), BusError> {
    let connect = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return if ack.code == ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(BusError::Connection(format!(
                            "broker refused connection: {:?}",
                            ack.code
                        )))
                    };
                }
                Ok(_) => {}
                Err(e) => return Err(BusError::Connection(e.to_string())),
            }
        }
    };

    tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| BusError::Connection(format!("no CONNACK within {timeout:?}")))?
}

async fn drive_publisher(
    mut eventloop: EventLoop,
    acks: mpsc::UnboundedSender<PublisherEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            event = eventloop.poll() => match event {
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    if acks.send(PublisherEvent::Sent(pkid)).is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    if acks.send(PublisherEvent::Acked(ack.pkid)).is_err() {
                        break;
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!("Publisher reconnected to MQTT broker");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "MQTT publisher error");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(Duration::from_secs(5)) => {}
                    }
                }
            }
        }
    }
}

async fn drain_until_disconnect(eventloop: &mut EventLoop) {
    let drain = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(2), drain).await;
}

/// Parse MQTT URL into host and port.
fn parse_mqtt_url(input: &str) -> Result<(String, u16), BusError> {
    if input.contains("://") {
        let url =
            Url::parse(input).map_err(|e| BusError::InvalidBrokerUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(BusError::InvalidBrokerUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| BusError::InvalidBrokerUrl(format!("{input}: missing host")))?;
        return Ok((host.to_string(), url.port().unwrap_or(1883)));
    }

    let (host, port) = match input.split_once(':') {
        None => (input, 1883),
        Some((host, port)) => {
            let port = port.parse().map_err(|_| {
                BusError::InvalidBrokerUrl(format!("{input}: invalid port '{port}'"))
            })?;
            (host, port)
        }
    };
    if host.is_empty() {
        return Err(BusError::InvalidBrokerUrl(format!("{input}: missing host")));
    }

    Ok((host.to_string(), port))
}
