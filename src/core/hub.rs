//! Fan-out of live traffic events to dashboard subscribers.
//!
//! One task owns the subscriber table and is its only reader and writer. Handles talk
//! to it over three bounded queues (add, remove, publish). Each subscriber gets its
//! own bounded queue; a subscriber whose queue is full when an event arrives is dropped
//! on the spot so a slow dashboard never holds up the others.
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use futures_util::{Stream, stream};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::{
    config::LiveConfig,
    core::timescale::{TimeScale, canonical_timestamp},
    tracing_setup::configure_component_tracing,
};

/// One forwarded request as announced to live dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveUpdateEvent {
    /// Service id
    pub id: String,
    pub resource: String,
    pub country: String,
    pub ip: String,
    pub response_code: u16,
    /// Canonical timestamp of the minute bucket the request was counted in
    pub time: String,
}

impl LiveUpdateEvent {
    pub fn now(
        service_id: impl Into<String>,
        resource: impl Into<String>,
        country: impl Into<String>,
        ip: impl Into<String>,
        response_code: u16,
    ) -> Self {
        Self {
            id: service_id.into(),
            resource: resource.into(),
            country: country.into(),
            ip: ip.into(),
            response_code,
            time: canonical_timestamp(TimeScale::Minute.bucket_time(0)),
        }
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HubError {
    /// The hub loop has exited
    #[error("Live update hub is not running")]
    Stopped,

    /// The publish queue is full and the event was discarded
    #[error("Live update hub is saturated, event dropped")]
    Saturated,
}

struct AddRequest {
    queue: mpsc::Sender<Bytes>,
    ack: oneshot::Sender<u64>,
}

/// Cloneable handle to the hub loop.
#[derive(Clone)]
pub struct LiveHub {
    add_tx: mpsc::Sender<AddRequest>,
    remove_tx: mpsc::Sender<u64>,
    publish_tx: mpsc::Sender<LiveUpdateEvent>,
    subscriber_capacity: usize,
    active: Arc<AtomicUsize>,
}

impl LiveHub {
    /// Start the hub loop on the current runtime. It runs until `shutdown` fires or
    /// every handle is dropped.
    pub fn spawn(config: LiveConfig, shutdown: CancellationToken) -> Self {
        let (add_tx, add_rx) = mpsc::channel(config.control_capacity.max(1));
        let (remove_tx, remove_rx) = mpsc::channel(config.control_capacity.max(1));
        let (publish_tx, publish_rx) = mpsc::channel(config.publish_capacity.max(1));
        let active = Arc::new(AtomicUsize::new(0));

        let hub_loop = HubLoop {
            add_rx,
            remove_rx,
            publish_rx,
            subscribers: HashMap::new(),
            next_id: 0,
            active: active.clone(),
        };
        tokio::spawn(
            hub_loop
                .run(shutdown)
                .instrument(configure_component_tracing("live_hub")),
        );

        Self {
            add_tx,
            remove_tx,
            publish_tx,
            subscriber_capacity: config.subscriber_capacity.max(1),
            active,
        }
    }

    /// Register a new subscriber. The subscription is active once this returns.
    pub async fn subscribe(&self) -> Result<Subscription, HubError> {
        let (queue, receiver) = mpsc::channel(self.subscriber_capacity);
        let (ack, ack_rx) = oneshot::channel();
        self.add_tx
            .send(AddRequest { queue, ack })
            .await
            .map_err(|_| HubError::Stopped)?;
        let id = ack_rx.await.map_err(|_| HubError::Stopped)?;
        Ok(Subscription {
            id,
            receiver,
            remove_tx: Some(self.remove_tx.clone()),
        })
    }

    /// Ask the loop to forget a subscription and close its queue.
    pub async fn unsubscribe(&self, mut subscription: Subscription) -> Result<(), HubError> {
        subscription.remove_tx = None;
        self.remove_tx
            .send(subscription.id)
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Queue an event for fan-out, waiting for room in the publish queue.
    pub async fn publish(&self, event: LiveUpdateEvent) -> Result<(), HubError> {
        self.publish_tx
            .send(event)
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Queue an event for fan-out without waiting.
    pub fn try_publish(&self, event: LiveUpdateEvent) -> Result<(), HubError> {
        self.publish_tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => HubError::Saturated,
            TrySendError::Closed(_) => HubError::Stopped,
        })
    }

    /// Number of subscribers currently registered with the loop.
    pub fn subscriber_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        !self.publish_tx.is_closed()
    }
}

/// A registered dashboard's event queue. Dropping it unregisters it.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<Bytes>,
    remove_tx: Option<mpsc::Sender<u64>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next serialized event; `None` once the hub closed this queue.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// Payloads as a stream that unregisters the subscription when dropped.
    pub fn into_stream(self) -> impl Stream<Item = Bytes> + Send + 'static {
        stream::unfold(self, |mut sub| async move {
            let payload = sub.recv().await?;
            Some((payload, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(remove_tx) = self.remove_tx.take() else {
            return;
        };
        let id = self.id;
        match remove_tx.try_send(id) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = remove_tx.send(id).await;
                    });
                }
            }
        }
    }
}

struct HubLoop {
    add_rx: mpsc::Receiver<AddRequest>,
    remove_rx: mpsc::Receiver<u64>,
    publish_rx: mpsc::Receiver<LiveUpdateEvent>,
    subscribers: HashMap<u64, mpsc::Sender<Bytes>>,
    next_id: u64,
    active: Arc<AtomicUsize>,
}

impl HubLoop {
    async fn run(mut self, shutdown: CancellationToken) {
        debug!("Live update hub started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(request) = self.add_rx.recv() => self.add(request),
                Some(id) = self.remove_rx.recv() => self.remove(id),
                Some(event) = self.publish_rx.recv() => self.broadcast(&event),
                else => break,
            }
        }
        self.subscribers.clear();
        self.active.store(0, Ordering::Release);
        info!("Live update hub stopped");
    }

    fn add(&mut self, request: AddRequest) {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.insert(id, request.queue);
        self.active.fetch_add(1, Ordering::AcqRel);
        // The caller may have given up waiting; then there is nobody to register.
        if request.ack.send(id).is_err() {
            self.remove(id);
            return;
        }
        debug!("Live subscriber {} added", id);
    }

    fn remove(&mut self, id: u64) {
        if self.subscribers.remove(&id).is_some() {
            self.active.fetch_sub(1, Ordering::AcqRel);
            debug!("Live subscriber {} removed", id);
        }
    }

    fn broadcast(&mut self, event: &LiveUpdateEvent) {
        let payload = match serde_json::to_vec(event) {
            Ok(json) => Bytes::from(json),
            Err(e) => {
                warn!("Failed to serialize live update event: {}", e);
                return;
            }
        };

        let active = &self.active;
        self.subscribers
            .retain(|id, queue| match queue.try_send(payload.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    active.fetch_sub(1, Ordering::AcqRel);
                    warn!("Dropping slow live subscriber {}", id);
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    active.fetch_sub(1, Ordering::AcqRel);
                    debug!("Live subscriber {} went away", id);
                    false
                }
            });
    }
}
