//! Streaming-RPC frontend.
//!
//! The outer RPC transport lives outside this crate; these methods
//! map one-to-one onto the service surface: an upstream subscription
//! stream, the downlink queue operations, and the webhook and link
//! CRUD. Every call authenticates against the Identity Server with an
//! `Authorization` header value and returns explicit errors.

use std::sync::Arc;

use crate::cluster::{parse_authorization, IdentityServer as _, Rights};
use crate::error::Result;
use crate::fanout::Subscription;
use crate::io::web::{ApplicationWebhook, WebhookRegistry as _};
use crate::message::{ApplicationDownlink, ApplicationId, DeviceIds, DownlinkQueueRequest};
use crate::session::ApplicationLink;
use crate::ApplicationServer;

pub struct RpcFrontend {
    server: Arc<ApplicationServer>,
}

impl RpcFrontend {
    pub fn new(server: Arc<ApplicationServer>) -> Self {
        RpcFrontend { server }
    }

    async fn rights(&self, app: &ApplicationId, authorization: &str) -> Result<Rights> {
        let token = parse_authorization(authorization)?;
        self.server.identity_server().application_rights(app, token).await
    }

    /// Opens the upstream event stream for an application. The
    /// returned subscription implements `futures::Stream`.
    pub async fn subscribe(
        &self,
        app: &ApplicationId,
        authorization: &str,
    ) -> Result<Subscription> {
        self.rights(app, authorization).await?.require_read_up()?;
        Ok(self.server.subscribe(app, "rpc").await)
    }

    pub async fn downlink_queue_push(
        &self,
        request: DownlinkQueueRequest,
        authorization: &str,
    ) -> Result<()> {
        self.rights(&request.ids.application_id, authorization).await?.require_write_down()?;
        self.server.downlink_queue_push(request).await
    }

    pub async fn downlink_queue_replace(
        &self,
        request: DownlinkQueueRequest,
        authorization: &str,
    ) -> Result<()> {
        self.rights(&request.ids.application_id, authorization).await?.require_write_down()?;
        self.server.downlink_queue_replace(request).await
    }

    pub async fn downlink_queue_list(
        &self,
        ids: &DeviceIds,
        authorization: &str,
    ) -> Result<Vec<ApplicationDownlink>> {
        self.rights(&ids.application_id, authorization).await?.require_read_up()?;
        self.server.downlink_queue_list(ids).await
    }

    pub async fn get_link(
        &self,
        app: &ApplicationId,
        authorization: &str,
    ) -> Result<Option<ApplicationLink>> {
        self.rights(app, authorization).await?.require_read_up()?;
        self.server.application_link(app).await
    }

    pub async fn set_link(
        &self,
        app: &ApplicationId,
        link: Option<ApplicationLink>,
        authorization: &str,
    ) -> Result<()> {
        self.rights(app, authorization).await?.require_write_down()?;
        self.server.set_application_link(app, link).await
    }

    pub async fn get_webhook(
        &self,
        app: &ApplicationId,
        webhook_id: &str,
        authorization: &str,
    ) -> Result<Option<ApplicationWebhook>> {
        self.rights(app, authorization).await?.require_read_up()?;
        self.server.webhooks().get(app, webhook_id).await
    }

    pub async fn set_webhook(
        &self,
        app: &ApplicationId,
        webhook_id: &str,
        webhook: Option<ApplicationWebhook>,
        authorization: &str,
    ) -> Result<()> {
        self.rights(app, authorization).await?.require_write_down()?;
        self.server.webhooks().set(app, webhook_id, webhook).await
    }

    pub async fn list_webhooks(
        &self,
        app: &ApplicationId,
        authorization: &str,
    ) -> Result<Vec<ApplicationWebhook>> {
        self.rights(app, authorization).await?.require_read_up()?;
        self.server.webhooks().list(app).await
    }
}
