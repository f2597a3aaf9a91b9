//! A LoRaWAN Application Server core.
//!
//! The server sits between a Network Server, which handles radio-level
//! MAC, and user applications consuming decoded uplinks and submitting
//! downlinks. It keeps per-device cryptographic session state across
//! joins, en/decrypts FRMPayload with the application session key,
//! runs payload formatters, fans upstream traffic out to streaming-RPC,
//! MQTT and webhook subscribers, and manages the per-device downlink
//! queue with server-assigned frame counters.
//!
//! External collaborators (Identity Server, Join Server, Network
//! Server, key vault, formatter sandbox, storage, transport stacks)
//! are reached through the traits in [`cluster`], [`keyvault`],
//! [`formatter`], [`registry`] and [`io::web`].

pub mod cluster;
pub mod config;
pub mod downlink;
pub mod error;
pub mod fanout;
pub mod formatter;
pub mod io;
pub mod keyvault;
pub mod link;
pub mod message;
pub mod process;
pub mod registry;
pub mod session;

#[cfg(test)]
mod test_util;

#[cfg(test)]
mod test;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cluster::{IdentityServer, Peers};
use crate::config::{Config, LinkMode};
use crate::downlink::DownlinkQueue;
use crate::error::Result;
use crate::fanout::{Hub, Subscription};
use crate::formatter::{FormatterRepository, Formatters, ScriptSandbox};
use crate::io::web::{WebhookDispatcher, WebhookRegistry, WebhookSink};
use crate::keyvault::{KeyVault, SessionKeys};
use crate::link::{LinkManager, LinkStatus};
use crate::message::{ApplicationDownlink, ApplicationId, DeviceIds, DownlinkQueueRequest};
use crate::process::Processor;
use crate::registry::{DeviceRegistry, LinkRegistry};
use crate::session::ApplicationLink;

pub use crate::error::Error;

/// Everything the server needs from outside.
pub struct Collaborators {
    pub peers: Arc<dyn Peers>,
    pub key_vault: Arc<dyn KeyVault>,
    pub devices: Arc<dyn DeviceRegistry>,
    pub links: Arc<dyn LinkRegistry>,
    pub webhooks: Arc<dyn WebhookRegistry>,
    pub sandbox: Arc<dyn ScriptSandbox>,
    pub repository: Arc<dyn FormatterRepository>,
    pub webhook_sink: Arc<dyn WebhookSink>,
}

/// The assembled Application Server.
pub struct ApplicationServer {
    config: Config,
    devices: Arc<dyn DeviceRegistry>,
    links: Arc<dyn LinkRegistry>,
    webhooks: Arc<dyn WebhookRegistry>,
    identity_server: Arc<dyn IdentityServer>,
    hub: Arc<Hub>,
    link_manager: LinkManager,
    queue: DownlinkQueue,
    webhook_dispatcher: Arc<WebhookDispatcher>,
    started: AtomicBool,
}

impl ApplicationServer {
    pub fn new(config: Config, collaborators: Collaborators) -> Arc<Self> {
        let Collaborators {
            peers,
            key_vault,
            devices,
            links,
            webhooks,
            sandbox,
            repository,
            webhook_sink,
        } = collaborators;
        let ns = peers.network_server();
        let js = peers.join_server();
        let identity_server = peers.identity_server();

        let keys = Arc::new(SessionKeys::new(key_vault));
        let formatters = Arc::new(Formatters::new(sandbox, repository, config.formatter.deadline));
        let hub = Hub::new(config.fanout.subscriber_queue);
        let processor = Arc::new(Processor::new(
            devices.clone(),
            links.clone(),
            ns.clone(),
            js,
            keys.clone(),
            formatters.clone(),
            hub.clone(),
        ));
        let link_manager = LinkManager::new(ns.clone(), processor, config.link.clone());
        let queue = DownlinkQueue::new(
            devices.clone(),
            links.clone(),
            ns,
            keys,
            formatters,
            config.downlink.clone(),
        );
        let webhook_dispatcher =
            WebhookDispatcher::new(webhooks.clone(), webhook_sink, config.webhook.clone());

        Arc::new(ApplicationServer {
            config,
            devices,
            links,
            webhooks,
            identity_server,
            hub,
            link_manager,
            queue,
            webhook_dispatcher,
            started: AtomicBool::new(false),
        })
    }

    /// Starts background work: NS links for registered applications
    /// and webhook delivery. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if !self.started.swap(true, Ordering::SeqCst) {
            self.webhook_dispatcher.start(self.hub.subscribe_all("webhooks"));
        }
        self.link_manager.startup(self.links.as_ref()).await
    }

    /// Stops all NS links.
    pub fn shutdown(&self) {
        self.link_manager.shutdown();
    }

    /// Registers a subscriber for an application's upstream traffic.
    pub async fn subscribe(&self, app: &ApplicationId, transport: &str) -> Subscription {
        self.link_manager.ensure(app);
        self.hub.subscribe(app, transport)
    }

    pub async fn downlink_queue_push(&self, request: DownlinkQueueRequest) -> Result<()> {
        self.link_manager.ensure(&request.ids.application_id);
        self.queue.push(request).await
    }

    pub async fn downlink_queue_replace(&self, request: DownlinkQueueRequest) -> Result<()> {
        self.link_manager.ensure(&request.ids.application_id);
        self.queue.replace(request).await
    }

    pub async fn downlink_queue_list(&self, ids: &DeviceIds) -> Result<Vec<ApplicationDownlink>> {
        self.queue.list(ids).await
    }

    pub async fn application_link(&self, app: &ApplicationId) -> Result<Option<ApplicationLink>> {
        self.links.get(app).await
    }

    /// Creates, updates or deletes an application's link record, and
    /// starts or stops its NS link accordingly.
    pub async fn set_application_link(
        &self,
        app: &ApplicationId,
        link: Option<ApplicationLink>,
    ) -> Result<()> {
        let delete = link.is_none();
        self.links.set(app, link).await?;
        if delete {
            if self.config.link.mode == LinkMode::Explicit {
                self.link_manager.stop(app);
            }
        } else {
            self.link_manager.start(app.clone());
        }
        Ok(())
    }

    pub fn link_status(&self, app: &ApplicationId) -> Option<LinkStatus> {
        self.link_manager.status(app)
    }

    pub fn identity_server(&self) -> Arc<dyn IdentityServer> {
        self.identity_server.clone()
    }

    pub fn webhooks(&self) -> Arc<dyn WebhookRegistry> {
        self.webhooks.clone()
    }

    pub fn webhook_dispatcher(&self) -> &Arc<WebhookDispatcher> {
        &self.webhook_dispatcher
    }

    /// Device registry access for provisioning and tests.
    pub fn devices(&self) -> Arc<dyn DeviceRegistry> {
        self.devices.clone()
    }
}
