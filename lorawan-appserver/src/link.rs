//! Application links to the Network Server.
//!
//! One task per linked application holds the uplink stream open and
//! feeds every received message to the processor. Transient failures
//! redial with capped exponential backoff; authorization failures
//! park the link in a failed state without removing the application.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::NetworkServer;
use crate::config::{LinkConfig, LinkMode};
use crate::error::{Error, Result};
use crate::message::{ApplicationId, ApplicationUp};
use crate::registry::LinkRegistry;

/// Consumes the uplink messages a link receives.
pub trait UpHandler: Send + Sync {
    fn handle<'a>(&'a self, up: ApplicationUp) -> BoxFuture<'a, Result<()>>;
}

/// Observable state of one application link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Linked,
    /// Permanently failed; redialing stopped until the link restarts.
    Failed(String),
}

/// Link state plus basic counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: LinkState,
    /// Uplink messages handed to the processor.
    pub forwarded: u64,
    pub last_error: Option<String>,
}

impl LinkStatus {
    fn new() -> Self {
        LinkStatus { state: LinkState::Connecting, forwarded: 0, last_error: None }
    }
}

struct Link {
    stop: watch::Sender<bool>,
    status: watch::Receiver<LinkStatus>,
    task: JoinHandle<()>,
}

/// Maintains one logical NS link per served application.
pub struct LinkManager {
    ns: Arc<dyn NetworkServer>,
    handler: Arc<dyn UpHandler>,
    config: LinkConfig,
    links: Mutex<HashMap<ApplicationId, Link>>,
}

impl LinkManager {
    pub fn new(ns: Arc<dyn NetworkServer>, handler: Arc<dyn UpHandler>, config: LinkConfig) -> Self {
        LinkManager { ns, handler, config, links: Mutex::new(HashMap::new()) }
    }

    /// Starts links for every application registered in the link
    /// registry.
    pub async fn startup(&self, links: &dyn LinkRegistry) -> Result<()> {
        for app in links.list().await? {
            self.start(app);
        }
        Ok(())
    }

    /// Ensures an application is linked when the link mode allows
    /// linking it on demand.
    pub fn ensure(&self, app: &ApplicationId) {
        if self.config.mode == LinkMode::All {
            self.start(app.clone());
        }
    }

    /// Starts the link task for an application. Idempotent while the
    /// task is alive; a finished (failed) link is restarted.
    pub fn start(&self, app: ApplicationId) {
        let mut links = self.links.lock().expect("link manager poisoned");
        if let Some(link) = links.get(&app) {
            if !link.task.is_finished() {
                return;
            }
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(LinkStatus::new());
        let task = tokio::spawn(run_link(
            self.ns.clone(),
            self.handler.clone(),
            self.config.clone(),
            app.clone(),
            status_tx,
            stop_rx,
        ));
        links.insert(app, Link { stop: stop_tx, status: status_rx, task });
    }

    /// Stops the link and its redial loop. Idempotent.
    pub fn stop(&self, app: &ApplicationId) {
        let link = self.links.lock().expect("link manager poisoned").remove(app);
        if let Some(link) = link {
            let _ = link.stop.send(true);
            link.task.abort();
            debug!(application_id = %app, "link stopped");
        }
    }

    pub fn status(&self, app: &ApplicationId) -> Option<LinkStatus> {
        let links = self.links.lock().expect("link manager poisoned");
        links.get(app).map(|link| link.status.borrow().clone())
    }

    /// Stops every link.
    pub fn shutdown(&self) {
        let links: Vec<_> =
            self.links.lock().expect("link manager poisoned").keys().cloned().collect();
        for app in links {
            self.stop(&app);
        }
    }
}

fn is_auth_failure(err: &Error) -> bool {
    matches!(err, Error::PermissionDenied(_) | Error::Unauthenticated)
}

async fn run_link(
    ns: Arc<dyn NetworkServer>,
    handler: Arc<dyn UpHandler>,
    config: LinkConfig,
    app: ApplicationId,
    status: watch::Sender<LinkStatus>,
    mut stop: watch::Receiver<bool>,
) {
    let mut backoff = config.backoff_base;
    loop {
        if *stop.borrow() {
            return;
        }
        status.send_modify(|s| s.state = LinkState::Connecting);
        match ns.link_application(&app).await {
            Ok(mut stream) => {
                info!(application_id = %app, "link established");
                status.send_modify(|s| s.state = LinkState::Linked);
                backoff = config.backoff_base;
                loop {
                    let next = tokio::select! {
                        _ = stop.changed() => return,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(up)) => {
                            if let Err(err) = handler.handle(up).await {
                                warn!(application_id = %app, error = %err, name = err.name(), "uplink dropped");
                                status.send_modify(|s| s.last_error = Some(err.name().into()));
                            }
                            status.send_modify(|s| s.forwarded += 1);
                        }
                        Some(Err(err)) if is_auth_failure(&err) => {
                            warn!(application_id = %app, error = %err, "link authorization failed");
                            status.send_modify(|s| {
                                s.state = LinkState::Failed(err.name().into());
                                s.last_error = Some(err.name().into());
                            });
                            return;
                        }
                        Some(Err(err)) => {
                            warn!(application_id = %app, error = %err, "link broken, redialing");
                            status.send_modify(|s| s.last_error = Some(err.name().into()));
                            break;
                        }
                        None => {
                            debug!(application_id = %app, "link stream ended, redialing");
                            break;
                        }
                    }
                }
            }
            Err(err) if is_auth_failure(&err) => {
                warn!(application_id = %app, error = %err, "link authorization failed");
                status.send_modify(|s| {
                    s.state = LinkState::Failed(err.name().into());
                    s.last_error = Some(err.name().into());
                });
                return;
            }
            Err(err) => {
                warn!(application_id = %app, error = %err, backoff_ms = backoff.as_millis() as u64, "link dial failed");
                status.send_modify(|s| s.last_error = Some(err.name().into()));
            }
        }
        // capped exponential backoff with jitter
        let delay = backoff.mul_f64(1.0 + fastrand::f64() * 0.25);
        tokio::select! {
            _ = stop.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        backoff = (backoff * 2).min(config.backoff_cap);
    }
}
