//! Fan-out of decoded snapshots to in-process listeners.
//!
//! Listeners register under any number of identity URLs. A snapshot is
//! delivered once to every distinct listener registered under its data,
//! alias or human URL. Each delivery carries a reply channel so the sender
//! can wait for every listener to settle before acknowledging the message.

use dashmap::DashMap;
use rainfeed_core::Snapshot;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Identifies one listener for deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Sending half of a listener's inbox.
#[derive(Debug, Clone)]
pub struct Listener {
    id: ListenerId,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Listener {
    /// Listener identity.
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }
}

/// One snapshot handed to one listener.
#[derive(Debug)]
pub struct Delivery {
    /// The routed snapshot, shared between all listeners
    pub snapshot: Arc<Snapshot>,
    listener: ListenerId,
    reply: oneshot::Sender<Result<(), DeliveryError>>,
}

impl Delivery {
    /// Report that the snapshot was handled.
    pub fn accept(self) {
        let _ = self.reply.send(Ok(()));
    }

    /// Report that the snapshot could not be handled.
    pub fn reject(self, reason: impl fmt::Display) {
        let _ = self.reply.send(Err(DeliveryError::Rejected {
            listener: self.listener,
            reason: reason.to_string(),
        }));
    }
}

/// Pending outcome of one delivery.
#[derive(Debug)]
pub struct Receipt {
    listener: ListenerId,
    rx: oneshot::Receiver<Result<(), DeliveryError>>,
}

impl Receipt {
    /// Listener the snapshot went to.
    #[must_use]
    pub fn listener(&self) -> ListenerId {
        self.listener
    }

    /// Wait for the listener to settle the delivery.
    ///
    /// # Errors
    ///
    /// Returns error if the listener rejected the snapshot or stopped
    /// without answering.
    pub async fn settled(self) -> Result<(), DeliveryError> {
        self.rx
            .await
            .unwrap_or(Err(DeliveryError::ListenerStopped(self.listener)))
    }
}

/// Routing table from identity URL to listeners.
#[derive(Debug, Default)]
pub struct SnapshotRouter {
    routes: DashMap<String, Vec<Listener>>,
    next_id: AtomicU64,
}

impl SnapshotRouter {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a listener and the inbox its deliveries arrive on.
    #[must_use]
    pub fn listener(&self) -> (Listener, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        (Listener { id, tx }, rx)
    }

    /// Route snapshots carrying `url` to `listener`. Empty URLs are ignored.
    pub fn register(&self, url: &str, listener: &Listener) {
        if url.is_empty() {
            return;
        }
        let mut listeners = self.routes.entry(url.to_string()).or_default();
        if listeners.iter().all(|existing| existing.id != listener.id) {
            listeners.push(listener.clone());
        }
    }

    /// Deliver a snapshot once to each distinct listener of its URLs.
    ///
    /// Returns one receipt per delivery; an unroutable snapshot yields none.
    #[must_use]
    pub fn route(&self, snapshot: Arc<Snapshot>) -> Vec<Receipt> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for url in snapshot.station.urls() {
            if url.is_empty() {
                continue;
            }
            if let Some(listeners) = self.routes.get(url) {
                for listener in listeners.iter() {
                    if seen.insert(listener.id) {
                        targets.push(listener.clone());
                    }
                }
            }
        }

        if targets.is_empty() {
            tracing::debug!(
                data_url = %snapshot.station.data_url,
                alias_url = %snapshot.station.alias_url,
                "No listener for snapshot"
            );
        }

        targets
            .into_iter()
            .map(|listener| {
                let (reply, rx) = oneshot::channel();
                // a closed inbox drops the reply sender, so the receipt reports it
                let _ = listener.tx.send(Delivery {
                    snapshot: Arc::clone(&snapshot),
                    listener: listener.id,
                    reply,
                });
                Receipt {
                    listener: listener.id,
                    rx,
                }
            })
            .collect()
    }

    /// Number of routed URLs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether nothing is routed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Errors reported back through a [`Receipt`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Listener rejected the snapshot
    #[error("{listener} rejected snapshot: {reason}")]
    Rejected {
        /// Listener that answered
        listener: ListenerId,
        /// Why it was rejected
        reason: String,
    },
    /// Listener went away without answering
    #[error("{0} stopped before settling")]
    ListenerStopped(ListenerId),
}
