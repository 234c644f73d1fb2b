//! In-process snapshot topic.
//!
//! Behaves like a broker topic without the network: payloads are encoded on
//! publish and decoded on delivery, each consumer group receives one copy
//! round-robin among its members, durable groups keep a backlog while no
//! member is connected, and unacknowledged messages are handled again after
//! the ack deadline. Used for dry runs and tests.

use crate::topic::{dispatch, BusError, RetryQueue, SnapshotHandler, SnapshotTopic};
use async_trait::async_trait;
use chrono::Utc;
use rainfeed_core::Snapshot;
use rainfeed_proto::topics::validate_topic;
use rainfeed_proto::{codec, Subscription};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

type Payload = Arc<[u8]>;

/// Delivery counters of a [`MemoryTopic`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryTopicStats {
    /// Messages accepted by `publish`
    pub published: u64,
    /// Messages acknowledged by a handler
    pub acked: u64,
    /// Messages handed to a handler again after a refusal
    pub redelivered: u64,
}

#[derive(Default)]
struct Group {
    durable: bool,
    members: Vec<(u64, mpsc::UnboundedSender<Payload>)>,
    next: usize,
    backlog: Vec<Payload>,
}

impl Group {
    fn offer(&mut self, payload: Payload) {
        while !self.members.is_empty() {
            let idx = self.next % self.members.len();
            match self.members[idx].1.send(payload.clone()) {
                Ok(()) => {
                    self.next = idx + 1;
                    return;
                }
                Err(_) => {
                    self.members.remove(idx);
                }
            }
        }
        if self.durable {
            self.backlog.push(payload);
        }
    }
}

struct Inner {
    name: String,
    ack_deadline: Duration,
    groups: Mutex<HashMap<String, Group>>,
    next_member: AtomicU64,
    published: AtomicU64,
    acked: AtomicU64,
    redelivered: AtomicU64,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Inner {
    fn groups(&self) -> MutexGuard<'_, HashMap<String, Group>> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Snapshot topic living entirely in this process.
#[derive(Clone)]
pub struct MemoryTopic {
    inner: Arc<Inner>,
}

impl MemoryTopic {
    /// Open an in-process topic with the default ack deadline.
    ///
    /// # Errors
    ///
    /// Returns error if the topic name is invalid.
    pub fn open(name: &str) -> Result<Self, BusError> {
        Self::with_ack_deadline(name, crate::DEFAULT_ACK_DEADLINE)
    }

    /// Open an in-process topic with a custom ack deadline.
    ///
    /// # Errors
    ///
    /// Returns error if the topic name is invalid.
    pub fn with_ack_deadline(name: &str, ack_deadline: Duration) -> Result<Self, BusError> {
        validate_topic(name)?;
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                ack_deadline,
                groups: Mutex::new(HashMap::new()),
                next_member: AtomicU64::new(0),
                published: AtomicU64::new(0),
                acked: AtomicU64::new(0),
                redelivered: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Publish an already-encoded payload, valid or not.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Closed`] after [`SnapshotTopic::close`].
    pub fn publish_raw(&self, payload: &[u8]) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let payload: Payload = Arc::from(payload);
        let mut groups = self.inner.groups();
        groups.retain(|_, group| group.durable || !group.members.is_empty());
        for group in groups.values_mut() {
            group.offer(payload.clone());
        }
        self.inner.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Current delivery counters.
    #[must_use]
    pub fn stats(&self) -> MemoryTopicStats {
        MemoryTopicStats {
            published: self.inner.published.load(Ordering::SeqCst),
            acked: self.inner.acked.load(Ordering::SeqCst),
            redelivered: self.inner.redelivered.load(Ordering::SeqCst),
        }
    }

    /// Messages waiting for a member of `group` to connect.
    #[must_use]
    pub fn backlog(&self, group: &str) -> usize {
        let name = format!("{}.{group}", self.inner.name);
        self.inner
            .groups()
            .get(&name)
            .map_or(0, |group| group.backlog.len())
    }

    /// Connected subscribers across all groups.
    #[must_use]
    pub fn subscribers(&self) -> usize {
        self.inner
            .groups()
            .values()
            .map(|group| group.members.len())
            .sum()
    }

    fn join(&self, subscription: &Subscription) -> (u64, mpsc::UnboundedReceiver<Payload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let member = self.inner.next_member.fetch_add(1, Ordering::SeqCst);

        let mut groups = self.inner.groups();
        let group = groups.entry(subscription.name()).or_default();
        group.durable = subscription.is_durable();
        for payload in group.backlog.drain(..) {
            let _ = tx.send(payload);
        }
        group.members.push((member, tx));
        (member, rx)
    }

    fn leave(&self, subscription: &Subscription, member: u64, unacked: Vec<Payload>) {
        let mut groups = self.inner.groups();
        let name = subscription.name();
        let Some(group) = groups.get_mut(&name) else {
            return;
        };
        group.members.retain(|(id, _)| *id != member);
        if subscription.is_durable() {
            for payload in unacked {
                group.offer(payload);
            }
        } else if group.members.is_empty() {
            groups.remove(&name);
        }
    }
}

#[async_trait]
impl SnapshotTopic for MemoryTopic {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn publish(
        &self,
        snapshot: &Snapshot,
        cancel: &CancellationToken,
    ) -> Result<(), BusError> {
        if cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        let payload = codec::encode(snapshot)?;
        self.publish_raw(&payload)
    }

    async fn subscribe(
        &self,
        group: &str,
        handler: Arc<dyn SnapshotHandler>,
        cancel: CancellationToken,
    ) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let subscription = Subscription::new(&self.inner.name, group, Utc::now())?;
        let (member, mut inbox) = self.join(&subscription);
        tracing::info!(
            subscription = %subscription.name(),
            durable = subscription.is_durable(),
            "Subscribed to in-memory topic"
        );

        let unacked: Arc<Mutex<HashMap<u64, Payload>>> = Arc::default();
        let (retry, mut retries) = RetryQueue::<(u64, Payload)>::new(self.inner.ack_deadline);
        let mut tasks = JoinSet::new();
        let mut next_id = 0u64;

        loop {
            let (id, payload) = tokio::select! {
                () = cancel.cancelled() => break,
                () = self.inner.shutdown.cancelled() => break,
                Some(_) = tasks.join_next(), if !tasks.is_empty() => continue,
                Some(message) = retries.recv() => {
                    self.inner.redelivered.fetch_add(1, Ordering::SeqCst);
                    message
                }
                received = inbox.recv() => {
                    let Some(payload) = received else { break };
                    next_id += 1;
                    unacked
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(next_id, payload.clone());
                    (next_id, payload)
                }
            };

            let inner = Arc::clone(&self.inner);
            let pending = Arc::clone(&unacked);
            dispatch(
                handler.as_ref(),
                &payload,
                (id, payload.clone()),
                move |(id, _)| async move {
                    pending
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&id);
                    inner.acked.fetch_add(1, Ordering::SeqCst);
                },
                &retry,
                &mut tasks,
            );
        }

        tasks.abort_all();
        let unacked: Vec<Payload> = unacked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, payload)| payload)
            .collect();
        self.leave(&subscription, member, unacked);
        tracing::info!(subscription = %subscription.name(), "Subscription closed");
        Ok(())
    }

    async fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.shutdown.cancel();
        }
    }
}
