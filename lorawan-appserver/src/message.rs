//! The application-layer message model: identifiers, key envelopes,
//! downlink items and the closed set of upstream event kinds.

use lorawan_payload::{AppSKey, DevAddr, DevEui};
use serde::{Deserialize, Serialize};

/// Identifies one application; the tenant scope for devices, links,
/// subscriptions and webhooks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplicationId(String);

impl ApplicationId {
    pub fn new(id: impl Into<String>) -> Self {
        ApplicationId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ApplicationId {
    fn from(v: &str) -> Self {
        ApplicationId(v.to_owned())
    }
}

/// Identifies one end device within an application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceIds {
    pub application_id: ApplicationId,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_eui: Option<DevEui>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_addr: Option<DevAddr>,
}

impl DeviceIds {
    pub fn new(application_id: impl Into<ApplicationId>, device_id: impl Into<String>) -> Self {
        DeviceIds {
            application_id: application_id.into(),
            device_id: device_id.into(),
            dev_eui: None,
            dev_addr: None,
        }
    }

    pub fn with_dev_eui(mut self, dev_eui: DevEui) -> Self {
        self.dev_eui = Some(dev_eui);
        self
    }

    pub fn with_dev_addr(mut self, dev_addr: DevAddr) -> Self {
        self.dev_addr = Some(dev_addr);
        self
    }

    /// Unique identifier string, used for registry keys and log fields.
    pub fn uid(&self) -> String {
        format!("{}.{}", self.application_id, self.device_id)
    }
}

/// Key material, either wrapped under the KEK named by the label or
/// carried in the clear when the label is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEnvelope {
    pub key: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kek_label: String,
}

impl KeyEnvelope {
    pub fn plaintext(key: AppSKey) -> Self {
        KeyEnvelope { key: key.as_ref().to_vec(), kek_label: String::new() }
    }

    pub fn wrapped(key: impl Into<Vec<u8>>, kek_label: impl Into<String>) -> Self {
        KeyEnvelope { key: key.into(), kek_label: kek_label.into() }
    }

    pub fn is_wrapped(&self) -> bool {
        !self.kek_label.is_empty()
    }
}

/// Scheduling priority of a downlink, forwarded to the NS untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownlinkPriority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
}

/// One item of a device's application downlink queue.
///
/// While queued at the NS, `frm_payload` holds ciphertext under the
/// session identified by `session_key_id`; application-facing views
/// carry it decrypted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationDownlink {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub session_key_id: Vec<u8>,
    pub f_port: u8,
    #[serde(default)]
    pub f_cnt: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frm_payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decoded_payload: Option<serde_json::Value>,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub correlation_ids: Vec<String>,
    #[serde(default)]
    pub priority: DownlinkPriority,
}

/// Details of an error reported alongside a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Join-accept notification from the NS.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationJoinAccept {
    pub session_key_id: Vec<u8>,
    /// Wrapped session key; fetched from the Join Server when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_s_key: Option<KeyEnvelope>,
    /// Items the NS dropped from the queue of the superseded session.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalidated_downlinks: Vec<ApplicationDownlink>,
    /// True when the device keeps using its old session until it sends
    /// an uplink on the new one.
    #[serde(default)]
    pub pending_session: bool,
}

/// Decrypted data uplink from the NS.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationUplink {
    pub session_key_id: Vec<u8>,
    pub f_port: u8,
    pub f_cnt: u32,
    pub frm_payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decoded_payload: Option<serde_json::Value>,
    /// Reception metadata (gateways, RSSI, …), passed through opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rx_metadata: Option<serde_json::Value>,
}

/// A downlink the NS failed to deliver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationDownlinkFailed {
    pub downlink: ApplicationDownlink,
    pub error: ErrorDetails,
}

/// Queue contents returned by the NS after it invalidated them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationInvalidatedDownlinks {
    pub downlinks: Vec<ApplicationDownlink>,
    /// Highest downlink frame counter the NS observed.
    pub last_f_cnt_down: u32,
}

/// A solved device location.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
}

/// The closed set of upstream event kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Up {
    JoinAccept(ApplicationJoinAccept),
    UplinkMessage(ApplicationUplink),
    DownlinkQueued(ApplicationDownlink),
    DownlinkSent(ApplicationDownlink),
    DownlinkAck(ApplicationDownlink),
    DownlinkNack(ApplicationDownlink),
    DownlinkFailed(ApplicationDownlinkFailed),
    DownlinkQueueInvalidated(ApplicationInvalidatedDownlinks),
    LocationSolved(ApplicationLocation),
}

/// Discriminant of [`Up`], used to route webhook deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpKind {
    JoinAccept,
    UplinkMessage,
    DownlinkQueued,
    DownlinkSent,
    DownlinkAck,
    DownlinkNack,
    DownlinkFailed,
    DownlinkQueueInvalidated,
    LocationSolved,
}

impl Up {
    pub fn kind(&self) -> UpKind {
        match self {
            Up::JoinAccept(_) => UpKind::JoinAccept,
            Up::UplinkMessage(_) => UpKind::UplinkMessage,
            Up::DownlinkQueued(_) => UpKind::DownlinkQueued,
            Up::DownlinkSent(_) => UpKind::DownlinkSent,
            Up::DownlinkAck(_) => UpKind::DownlinkAck,
            Up::DownlinkNack(_) => UpKind::DownlinkNack,
            Up::DownlinkFailed(_) => UpKind::DownlinkFailed,
            Up::DownlinkQueueInvalidated(_) => UpKind::DownlinkQueueInvalidated,
            Up::LocationSolved(_) => UpKind::LocationSolved,
        }
    }
}

/// One upstream message together with the device it concerns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationUp {
    pub ids: DeviceIds,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub correlation_ids: Vec<String>,
    pub up: Up,
}

/// Request to mutate a device's downlink queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownlinkQueueRequest {
    pub ids: DeviceIds,
    pub downlinks: Vec<ApplicationDownlink>,
}

/// Generates a fresh correlation identifier with the given scope.
pub fn correlation_id(scope: &str) -> String {
    format!("as:{}:{:016x}", scope, fastrand::u64(..))
}
