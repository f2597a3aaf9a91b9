//! Outbound HTTP webhooks: per-application registrations and a
//! best-effort dispatcher with a bounded in-memory queue.
//!
//! The HTTP client itself lives behind [`WebhookSink`]; this module
//! decides what gets delivered where, bounds memory and enforces the
//! per-request timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::WebhookConfig;
use crate::error::Result;
use crate::fanout::Subscription;
use crate::message::{ApplicationId, ApplicationUp, UpKind};

/// A webhook registration: where to deliver, and which upstream kinds
/// to deliver there.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationWebhook {
    pub webhook_id: String,
    pub base_url: String,
    /// Static headers added to every request, e.g. authorization.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Path per event kind; kinds without a path are not delivered.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub paths: HashMap<UpKind, String>,
}

/// Webhook registrations per application.
pub trait WebhookRegistry: Send + Sync {
    fn get<'a>(
        &'a self,
        app: &'a ApplicationId,
        webhook_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ApplicationWebhook>>>;

    /// Upserts (`Some`) or deletes (`None`) a registration.
    fn set<'a>(
        &'a self,
        app: &'a ApplicationId,
        webhook_id: &'a str,
        webhook: Option<ApplicationWebhook>,
    ) -> BoxFuture<'a, Result<()>>;

    fn list<'a>(&'a self, app: &'a ApplicationId)
        -> BoxFuture<'a, Result<Vec<ApplicationWebhook>>>;
}

/// In-memory webhook registry.
#[derive(Default)]
pub struct MemoryWebhookRegistry {
    webhooks: Mutex<HashMap<(ApplicationId, String), ApplicationWebhook>>,
}

impl MemoryWebhookRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WebhookRegistry for MemoryWebhookRegistry {
    fn get<'a>(
        &'a self,
        app: &'a ApplicationId,
        webhook_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ApplicationWebhook>>> {
        Box::pin(async move {
            Ok(self.webhooks.lock().await.get(&(app.clone(), webhook_id.to_owned())).cloned())
        })
    }

    fn set<'a>(
        &'a self,
        app: &'a ApplicationId,
        webhook_id: &'a str,
        webhook: Option<ApplicationWebhook>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let key = (app.clone(), webhook_id.to_owned());
            let mut webhooks = self.webhooks.lock().await;
            match webhook {
                Some(webhook) => {
                    webhooks.insert(key, webhook);
                }
                None => {
                    webhooks.remove(&key);
                }
            }
            Ok(())
        })
    }

    fn list<'a>(
        &'a self,
        app: &'a ApplicationId,
    ) -> BoxFuture<'a, Result<Vec<ApplicationWebhook>>> {
        Box::pin(async move {
            let webhooks = self.webhooks.lock().await;
            let mut out: Vec<_> = webhooks
                .iter()
                .filter(|((a, _), _)| a == app)
                .map(|(_, webhook)| webhook.clone())
                .collect();
            out.sort_by(|a, b| a.webhook_id.cmp(&b.webhook_id));
            Ok(out)
        })
    }
}

/// One outbound delivery, ready for the HTTP client.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Executes webhook requests; returns the HTTP status code.
pub trait WebhookSink: Send + Sync {
    fn deliver(&self, request: WebhookRequest) -> BoxFuture<'static, Result<u16>>;
}

/// Routes upstream events to registered webhooks.
///
/// Deliveries are best-effort: when the bounded queue is full the
/// newest events are dropped and counted, never blocking the hub.
pub struct WebhookDispatcher {
    registry: Arc<dyn WebhookRegistry>,
    tx: mpsc::Sender<WebhookRequest>,
    dropped: AtomicU64,
    delivered: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl WebhookDispatcher {
    pub fn new(
        registry: Arc<dyn WebhookRegistry>,
        sink: Arc<dyn WebhookSink>,
        config: WebhookConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let delivered = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..config.workers.max(1) {
            tokio::spawn(worker(
                sink.clone(),
                config.timeout,
                delivered.clone(),
                failed.clone(),
                rx.clone(),
            ));
        }
        Arc::new(WebhookDispatcher {
            registry,
            tx,
            dropped: AtomicU64::new(0),
            delivered,
            failed,
        })
    }

    /// Consumes a fan-out subscription until it closes.
    pub fn start(self: &Arc<Self>, mut events: Subscription) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(up) = events.recv().await {
                this.enqueue(&up).await;
            }
        })
    }

    /// Queues one event for every registration that wants its kind.
    pub async fn enqueue(&self, up: &ApplicationUp) {
        let app = &up.ids.application_id;
        let webhooks = match self.registry.list(app).await {
            Ok(webhooks) => webhooks,
            Err(err) => {
                warn!(application_id = %app, error = %err, "webhook registry read failed");
                return;
            }
        };
        if webhooks.is_empty() {
            return;
        }
        let body = match serde_json::to_vec(up) {
            Ok(body) => body,
            Err(err) => {
                warn!(application_id = %app, error = %err, "webhook body encoding failed");
                return;
            }
        };
        for webhook in webhooks {
            let Some(path) = webhook.paths.get(&up.up.kind()) else {
                continue;
            };
            let mut headers =
                vec![("Content-Type".to_owned(), "application/json".to_owned())];
            headers.extend(webhook.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
            let request = WebhookRequest {
                url: join_url(&webhook.base_url, path),
                headers,
                body: body.clone(),
            };
            match self.tx.try_send(request) {
                Ok(()) => {}
                Err(TrySendError::Full(request)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(url = %request.url, "webhook queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }

    /// Events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

async fn worker(
    sink: Arc<dyn WebhookSink>,
    timeout: Duration,
    delivered: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    rx: Arc<Mutex<mpsc::Receiver<WebhookRequest>>>,
) {
    loop {
        let request = { rx.lock().await.recv().await };
        let Some(request) = request else {
            return;
        };
        let url = request.url.clone();
        match tokio::time::timeout(timeout, sink.deliver(request)).await {
            Ok(Ok(status)) if (200..300).contains(&status) => {
                delivered.fetch_add(1, Ordering::Relaxed);
                debug!(url = %url, status, "webhook delivered");
            }
            Ok(Ok(status)) => {
                failed.fetch_add(1, Ordering::Relaxed);
                warn!(url = %url, status, "webhook delivery rejected");
            }
            Ok(Err(err)) => {
                failed.fetch_add(1, Ordering::Relaxed);
                warn!(url = %url, error = %err, "webhook delivery failed");
            }
            Err(_) => {
                failed.fetch_add(1, Ordering::Relaxed);
                warn!(url = %url, "webhook delivery timed out");
            }
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_owned()
    } else {
        format!("{base}/{path}")
    }
}
