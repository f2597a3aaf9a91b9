//! Per-application fan-out of upstream traffic.
//!
//! Subscribers get a bounded queue each. A subscriber that lets its
//! queue fill up is dropped so one slow consumer cannot stall the
//! hub; every other subscriber keeps receiving in FIFO order.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::message::{ApplicationId, ApplicationUp};

struct Entry {
    id: u64,
    name: String,
    tx: mpsc::Sender<ApplicationUp>,
}

/// The pub/sub hub distributing upstream events to subscribers.
pub struct Hub {
    capacity: usize,
    next_id: AtomicU64,
    apps: Mutex<HashMap<ApplicationId, Vec<Entry>>>,
    firehose: Mutex<Vec<Entry>>,
}

impl Hub {
    /// `capacity` bounds each subscriber's outstanding-message queue.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Hub {
            capacity,
            next_id: AtomicU64::new(1),
            apps: Mutex::new(HashMap::new()),
            firehose: Mutex::new(Vec::new()),
        })
    }

    /// Registers a subscriber for one application's traffic.
    pub fn subscribe(self: &Arc<Self>, app: &ApplicationId, name: impl Into<String>) -> Subscription {
        let (entry, rx, id) = self.entry(name.into());
        self.apps.lock().expect("hub poisoned").entry(app.clone()).or_default().push(entry);
        Subscription { hub: self.clone(), scope: Some(app.clone()), id, rx }
    }

    /// Registers a subscriber for the traffic of every application;
    /// used by transports that route internally, like webhooks.
    pub fn subscribe_all(self: &Arc<Self>, name: impl Into<String>) -> Subscription {
        let (entry, rx, id) = self.entry(name.into());
        self.firehose.lock().expect("hub poisoned").push(entry);
        Subscription { hub: self.clone(), scope: None, id, rx }
    }

    fn entry(&self, name: String) -> (Entry, mpsc::Receiver<ApplicationUp>, u64) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity.max(1));
        (Entry { id, name, tx }, rx, id)
    }

    /// Broadcasts one upstream event to every subscriber of its
    /// application. Never blocks: full subscriber queues cause the
    /// subscriber to be dropped instead.
    pub fn publish(&self, up: &ApplicationUp) {
        let app = &up.ids.application_id;
        {
            let mut apps = self.apps.lock().expect("hub poisoned");
            if let Some(entries) = apps.get_mut(app) {
                Self::deliver(entries, up);
                if entries.is_empty() {
                    apps.remove(app);
                }
            }
        }
        Self::deliver(&mut self.firehose.lock().expect("hub poisoned"), up);
    }

    fn deliver(entries: &mut Vec<Entry>, up: &ApplicationUp) {
        entries.retain(|entry| match entry.tx.try_send(up.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = %entry.name, device_uid = %up.ids.uid(), "dropping slow subscriber");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    fn unsubscribe(&self, scope: Option<&ApplicationId>, id: u64) {
        match scope {
            Some(app) => {
                let mut apps = self.apps.lock().expect("hub poisoned");
                if let Some(entries) = apps.get_mut(app) {
                    entries.retain(|entry| entry.id != id);
                    if entries.is_empty() {
                        apps.remove(app);
                    }
                }
            }
            None => {
                self.firehose.lock().expect("hub poisoned").retain(|entry| entry.id != id);
            }
        }
        debug!(id, "subscription closed");
    }
}

/// A registered subscriber; deregisters itself on drop.
pub struct Subscription {
    hub: Arc<Hub>,
    scope: Option<ApplicationId>,
    id: u64,
    rx: mpsc::Receiver<ApplicationUp>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("scope", &self.scope)
            .field("id", &self.id)
            .finish()
    }
}

impl Subscription {
    /// The next event, or `None` once the subscription was dropped by
    /// the hub.
    pub async fn recv(&mut self) -> Option<ApplicationUp> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = ApplicationUp;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.scope.as_ref(), self.id);
    }
}
