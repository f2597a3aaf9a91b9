//! Per-device session and registry records.

use std::time::SystemTime;

use lorawan_payload::DevAddr;
use serde::{Deserialize, Serialize};

use crate::formatter::MessageFormatters;
use crate::message::{DeviceIds, KeyEnvelope};

/// The cryptographic context established by one join.
///
/// `app_s_key` stays in whatever envelope it arrived in; unwrapping
/// happens on use through the key vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_key_id: Vec<u8>,
    pub dev_addr: DevAddr,
    pub app_s_key: KeyEnvelope,
    /// Last application downlink frame counter assigned in this session.
    pub last_a_f_cnt_down: u32,
    pub started_at: SystemTime,
}

impl Session {
    pub fn new(session_key_id: Vec<u8>, dev_addr: DevAddr, app_s_key: KeyEnvelope) -> Self {
        Session {
            session_key_id,
            dev_addr,
            app_s_key,
            last_a_f_cnt_down: 0,
            started_at: SystemTime::now(),
        }
    }

    pub fn matches(&self, session_key_id: &[u8]) -> bool {
        self.session_key_id == session_key_id
    }
}

/// Device type identification used for formatter catalog lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionIds {
    pub brand_id: String,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub firmware_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub band_id: String,
}

/// Stored end-device record. Created by provisioning; the server only
/// ever mutates the session fields and the `dev_addr` it mirrors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndDevice {
    pub ids: DeviceIds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_ids: Option<VersionIds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatters: Option<MessageFormatters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_session: Option<Session>,
}

impl EndDevice {
    pub fn new(ids: DeviceIds) -> Self {
        EndDevice { ids, version_ids: None, formatters: None, session: None, pending_session: None }
    }

    /// The session, current or pending, matching the given key identifier.
    pub fn session_for(&self, session_key_id: &[u8]) -> Option<&Session> {
        self.session
            .iter()
            .chain(self.pending_session.iter())
            .find(|s| s.matches(session_key_id))
    }
}

/// Per-application link settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationLink {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_formatters: Option<MessageFormatters>,
}
