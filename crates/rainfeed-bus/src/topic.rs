//! Bus-independent publish/subscribe contract.

use async_trait::async_trait;
use rainfeed_core::Snapshot;
use rainfeed_proto::{codec, CodecError, TopicError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Default time an unacknowledged message waits before redelivery.
pub const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(20);

/// Boxed error returned by handlers to refuse a message.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Future deciding the fate of one delivered message.
///
/// `Ok` acknowledges the message; `Err` leaves it unacknowledged so it is
/// delivered again after the ack deadline.
pub type Settlement = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send + 'static>>;

/// Receives every message of a subscription.
///
/// `handle` is called in delivery order, one message at a time. Work that
/// may take a while belongs in the returned [`Settlement`], which runs
/// concurrently with later deliveries. Payloads that fail to decode arrive
/// as `Err`; acknowledging them is how a corrupt message is dropped.
pub trait SnapshotHandler: Send + Sync + 'static {
    /// Handle one delivery.
    fn handle(&self, delivery: Result<Snapshot, CodecError>) -> Settlement;
}

impl<F> SnapshotHandler for F
where
    F: Fn(Result<Snapshot, CodecError>) -> Settlement + Send + Sync + 'static,
{
    fn handle(&self, delivery: Result<Snapshot, CodecError>) -> Settlement {
        self(delivery)
    }
}

/// A settlement that is already decided.
#[must_use]
pub fn settled(result: Result<(), BoxError>) -> Settlement {
    Box::pin(std::future::ready(result))
}

/// A snapshot stream on a message bus.
#[async_trait]
pub trait SnapshotTopic: Send + Sync {
    /// Topic name.
    fn name(&self) -> &str;

    /// Encode and publish a snapshot, waiting for the bus to accept it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Cancelled`] if `cancel` fires first, or the
    /// encode/transport error otherwise.
    async fn publish(&self, snapshot: &Snapshot, cancel: &CancellationToken)
        -> Result<(), BusError>;

    /// Deliver snapshots to `handler` until `cancel` fires.
    ///
    /// A non-empty `group` is durable and shared between consumers; an
    /// empty group is private to this call and removed when it returns.
    ///
    /// # Errors
    ///
    /// Returns error if the subscription cannot be established or the
    /// connection is lost for good.
    async fn subscribe(
        &self,
        group: &str,
        handler: Arc<dyn SnapshotHandler>,
        cancel: CancellationToken,
    ) -> Result<(), BusError>;

    /// Release the connection. Safe to call more than once.
    async fn close(&self);
}

/// Messages waiting out their ack deadline before being handled again.
pub(crate) struct RetryQueue<M> {
    tx: mpsc::UnboundedSender<M>,
    deadline: Duration,
}

impl<M> Clone for RetryQueue<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            deadline: self.deadline,
        }
    }
}

impl<M: Send + 'static> RetryQueue<M> {
    pub(crate) fn new(deadline: Duration) -> (Self, mpsc::UnboundedReceiver<M>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, deadline }, rx)
    }

    async fn schedule(&self, message: M) {
        tokio::time::sleep(self.deadline).await;
        // receiver gone means the subscription ended; redelivery is the broker's job then
        let _ = self.tx.send(message);
    }
}

/// Decode `payload`, hand it to `handler`, then ack or schedule a retry
/// once the settlement resolves.
pub(crate) fn dispatch<M, A, F>(
    handler: &dyn SnapshotHandler,
    payload: &[u8],
    message: M,
    ack: A,
    retry: &RetryQueue<M>,
    tasks: &mut JoinSet<()>,
) where
    M: Send + 'static,
    A: FnOnce(M) -> F + Send + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let delivery = codec::decode(payload);
    if let Err(err) = &delivery {
        tracing::debug!(error = %err, payload_len = payload.len(), "Undecodable payload");
    }

    let settlement = handler.handle(delivery);
    let retry = retry.clone();
    tasks.spawn(async move {
        match settlement.await {
            Ok(()) => ack(message).await,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    redeliver_in_secs = retry.deadline.as_secs(),
                    "Message not acknowledged"
                );
                retry.schedule(message).await;
            }
        }
    });
}

/// Errors for bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Broker unreachable or connection lost
    #[error("connection error: {0}")]
    Connection(String),
    /// Broker URL could not be parsed
    #[error("invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    /// Operation cancelled before completion
    #[error("operation cancelled")]
    Cancelled,
    /// Topic already closed
    #[error("topic closed")]
    Closed,
    /// Snapshot could not be encoded
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Topic or group name rejected
    #[error(transparent)]
    Topic(#[from] TopicError),
    /// Publish rejected by the client
    #[error("publish error: {0}")]
    Publish(String),
    /// Subscription rejected by the client
    #[error("subscription error: {0}")]
    Subscribe(String),
}
