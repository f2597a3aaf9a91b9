//! MQTT broker frontend.
//!
//! The broker wire protocol lives outside this crate; this module
//! implements what makes the frontend an application server: CONNECT
//! authentication against the Identity Server, the topic grammar, and
//! the bridge between topics and the subscription/queue machinery.
//! Downlink publishes get no inline response, so their errors are only
//! observable in the logs.

use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use crate::cluster::{IdentityServer as _, Rights};
use crate::error::{Error, Result};
use crate::fanout::Subscription;
use crate::message::{ApplicationDownlink, ApplicationId, DeviceIds, DownlinkQueueRequest};
use crate::ApplicationServer;

const TOPIC_VERSION: &str = "v3";

/// A parsed MQTT topic of the application server namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    /// `v3/{application id}/devices/{device id}/up`
    Uplink { application_id: String, device_id: String },
    /// `v3/{application id}/devices/{device id}/down/push`
    DownlinkPush { application_id: String, device_id: String },
    /// `v3/{application id}/devices/{device id}/down/replace`
    DownlinkReplace { application_id: String, device_id: String },
}

impl Topic {
    pub fn parse(topic: &str) -> Result<Topic> {
        let segments: Vec<&str> = topic.split('/').collect();
        match segments.as_slice() {
            [TOPIC_VERSION, app, "devices", dev, "up"] => Ok(Topic::Uplink {
                application_id: (*app).to_owned(),
                device_id: (*dev).to_owned(),
            }),
            [TOPIC_VERSION, app, "devices", dev, "down", "push"] => Ok(Topic::DownlinkPush {
                application_id: (*app).to_owned(),
                device_id: (*dev).to_owned(),
            }),
            [TOPIC_VERSION, app, "devices", dev, "down", "replace"] => {
                Ok(Topic::DownlinkReplace {
                    application_id: (*app).to_owned(),
                    device_id: (*dev).to_owned(),
                })
            }
            _ => Err(Error::InvalidArgument(format!("unknown topic {topic}"))),
        }
    }

    pub fn uplink(application_id: &ApplicationId, device_id: &str) -> String {
        format!("{TOPIC_VERSION}/{application_id}/devices/{device_id}/up")
    }
}

/// MQTT filter matching: `+` matches one segment, `#` the rest.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter = filter.split('/');
    let mut topic = topic.split('/');
    loop {
        match (filter.next(), topic.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// JSON body of a downlink publish.
#[derive(Debug, Deserialize)]
struct DownlinkMessages {
    downlinks: Vec<ApplicationDownlink>,
}

/// The broker-facing entry point.
pub struct MqttFrontend {
    server: Arc<ApplicationServer>,
}

impl MqttFrontend {
    pub fn new(server: Arc<ApplicationServer>) -> Self {
        MqttFrontend { server }
    }

    /// CONNECT: the username is the application id, the password an
    /// API key for it.
    pub async fn connect(&self, username: &str, password: &str) -> Result<MqttConnection> {
        let application_id = ApplicationId::new(username);
        let rights = self
            .server
            .identity_server()
            .application_rights(&application_id, password)
            .await?;
        if rights == Rights::default() {
            return Err(Error::PermissionDenied("no application rights".into()));
        }
        let subscription = self.server.subscribe(&application_id, "mqtt").await;
        Ok(MqttConnection {
            server: self.server.clone(),
            application_id,
            rights,
            subscription,
            filters: Vec::new(),
        })
    }
}

/// One authenticated MQTT session.
pub struct MqttConnection {
    server: Arc<ApplicationServer>,
    application_id: ApplicationId,
    rights: Rights,
    subscription: Subscription,
    filters: Vec<String>,
}

impl std::fmt::Debug for MqttConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConnection")
            .field("application_id", &self.application_id)
            .field("rights", &self.rights)
            .field("filters", &self.filters)
            .finish()
    }
}

impl MqttConnection {
    pub fn application_id(&self) -> &ApplicationId {
        &self.application_id
    }

    /// SUBSCRIBE: remembers the filter for upstream matching.
    pub fn subscribe(&mut self, filter: &str) -> Result<()> {
        self.rights.require_read_up()?;
        self.filters.push(filter.to_owned());
        Ok(())
    }

    /// The next outbound PUBLISH matching one of the subscribed
    /// filters, as `(topic, JSON payload)`. `None` once the session's
    /// subscription was closed by the hub.
    pub async fn next_publish(&mut self) -> Option<(String, Vec<u8>)> {
        loop {
            let up = self.subscription.recv().await?;
            let topic = Topic::uplink(&up.ids.application_id, &up.ids.device_id);
            if !self.filters.iter().any(|f| topic_matches(f, &topic)) {
                continue;
            }
            match serde_json::to_vec(&up) {
                Ok(payload) => return Some((topic, payload)),
                Err(err) => {
                    warn!(topic = %topic, error = %err, "upstream message encoding failed");
                }
            }
        }
    }

    /// Inbound PUBLISH on a downlink topic. MQTT has no response for
    /// it, so failures are logged and otherwise swallowed.
    pub async fn publish(&self, topic: &str, payload: &[u8]) {
        if let Err(err) = self.handle_publish(topic, payload).await {
            warn!(
                application_id = %self.application_id,
                topic,
                error = %err,
                name = err.name(),
                "downlink publish failed"
            );
        }
    }

    async fn handle_publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let (application_id, device_id, replace) = match Topic::parse(topic)? {
            Topic::DownlinkPush { application_id, device_id } => {
                (application_id, device_id, false)
            }
            Topic::DownlinkReplace { application_id, device_id } => {
                (application_id, device_id, true)
            }
            Topic::Uplink { .. } => {
                return Err(Error::InvalidArgument("cannot publish on an uplink topic".into()))
            }
        };
        if self.application_id.as_str() != application_id {
            return Err(Error::PermissionDenied(format!("application {application_id}")));
        }
        self.rights.require_write_down()?;
        let body: DownlinkMessages = serde_json::from_slice(payload)
            .map_err(|err| Error::InvalidArgument(format!("downlink body: {err}")))?;
        let request = DownlinkQueueRequest {
            ids: DeviceIds::new(self.application_id.clone(), device_id),
            downlinks: body.downlinks,
        };
        if replace {
            self.server.downlink_queue_replace(request).await
        } else {
            self.server.downlink_queue_push(request).await
        }
    }
}
