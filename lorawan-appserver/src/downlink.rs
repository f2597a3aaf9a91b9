//! The downlink queue engine.
//!
//! Applications push plaintext (or structured) downlinks; the engine
//! encodes, encrypts and stamps them with session key id and frame
//! counter, then forwards the queue mutation to the NS. Counter
//! advances commit only after the NS accepted the mutation.

use std::sync::Arc;
use std::time::Duration;

use lorawan_payload::crypto::{decrypt_frm_payload, encrypt_frm_payload, Direction};
use tracing::warn;

use crate::cluster::NetworkServer;
use crate::config::DownlinkConfig;
use crate::error::{Error, Result};
use crate::formatter::Formatters;
use crate::keyvault::SessionKeys;
use crate::message::{
    correlation_id, ApplicationDownlink, DeviceIds, DownlinkQueueRequest,
};
use crate::registry::{require_device, DeviceRegistry, DeviceTransaction as _, LinkRegistry};

const MIN_F_PORT: u8 = 1;
const MAX_F_PORT: u8 = 223;

enum QueueOp {
    Push,
    Replace,
}

/// Accepts queue mutations from the transports and keeps the NS queue
/// and the device's downlink counters consistent.
pub struct DownlinkQueue {
    devices: Arc<dyn DeviceRegistry>,
    links: Arc<dyn LinkRegistry>,
    ns: Arc<dyn NetworkServer>,
    keys: Arc<SessionKeys>,
    formatters: Arc<Formatters>,
    config: DownlinkConfig,
}

impl DownlinkQueue {
    pub fn new(
        devices: Arc<dyn DeviceRegistry>,
        links: Arc<dyn LinkRegistry>,
        ns: Arc<dyn NetworkServer>,
        keys: Arc<SessionKeys>,
        formatters: Arc<Formatters>,
        config: DownlinkConfig,
    ) -> Self {
        DownlinkQueue { devices, links, ns, keys, formatters, config }
    }

    /// Appends items to the device queue.
    pub async fn push(&self, request: DownlinkQueueRequest) -> Result<()> {
        self.mutate(QueueOp::Push, request).await
    }

    /// Replaces the device queue with the given items.
    pub async fn replace(&self, request: DownlinkQueueRequest) -> Result<()> {
        self.mutate(QueueOp::Replace, request).await
    }

    /// The queued items, with `frm_payload` decrypted for the caller.
    pub async fn list(&self, ids: &DeviceIds) -> Result<Vec<ApplicationDownlink>> {
        let dev = require_device(self.devices.as_ref(), ids).await?;
        let mut items = self.ns.downlink_queue_list(ids).await?;
        for item in &mut items {
            let Some(session) = dev.session_for(&item.session_key_id) else {
                warn!(device_uid = %ids.uid(), f_cnt = item.f_cnt, "queued downlink from unknown session left encrypted");
                continue;
            };
            let key = self
                .keys
                .app_s_key(dev.ids.dev_eui, &session.app_s_key, &session.session_key_id)
                .await?;
            decrypt_frm_payload(
                key.inner(),
                session.dev_addr,
                item.f_cnt,
                Direction::Down,
                &mut item.frm_payload,
            );
        }
        Ok(items)
    }

    async fn mutate(&self, op: QueueOp, request: DownlinkQueueRequest) -> Result<()> {
        let DownlinkQueueRequest { ids, downlinks } = request;
        for item in &downlinks {
            validate(item)?;
        }

        let txn = self.devices.transaction(&ids).await?;
        let Some(mut dev) = txn.device().cloned() else {
            return Err(Error::NotFound(ids.uid()));
        };
        let Some(mut session) = dev.session.clone() else {
            return Err(Error::NotFound(format!("{} has no active session", ids.uid())));
        };
        let key = self
            .keys
            .app_s_key(dev.ids.dev_eui, &session.app_s_key, &session.session_key_id)
            .await?;
        let link = self.links.get(&ids.application_id).await.unwrap_or(None);

        let mut items = Vec::with_capacity(downlinks.len());
        for mut item in downlinks {
            if let Some(decoded) = item.decoded_payload.take() {
                let encoded = self
                    .formatters
                    .encode_downlink(&dev, link.as_ref(), item.f_port, &decoded)
                    .await?
                    .ok_or_else(|| {
                        Error::InvalidArgument("no downlink formatter to encode payload".into())
                    })?;
                for warning in &encoded.warnings {
                    warn!(device_uid = %ids.uid(), warning = %warning, "downlink formatter warning");
                }
                item.frm_payload = encoded.frm_payload;
            }
            let f_cnt = session.last_a_f_cnt_down + 1;
            encrypt_frm_payload(
                key.inner(),
                session.dev_addr,
                f_cnt,
                Direction::Down,
                &mut item.frm_payload,
            );
            session.last_a_f_cnt_down = f_cnt;
            item.f_cnt = f_cnt;
            item.session_key_id = session.session_key_id.clone();
            if item.correlation_ids.is_empty() {
                item.correlation_ids.push(correlation_id("downlink"));
            }
            items.push(item);
        }

        // NS first, commit after: a rejected mutation must not advance
        // the stored counters.
        let mut attempt = 0;
        loop {
            let res = match op {
                QueueOp::Push => self.ns.downlink_queue_push(&ids, items.clone()).await,
                QueueOp::Replace => self.ns.downlink_queue_replace(&ids, items.clone()).await,
            };
            match res {
                Ok(()) => break,
                Err(err) if err.is_transient() && attempt < self.config.ns_retries => {
                    attempt += 1;
                    warn!(device_uid = %ids.uid(), error = %err, attempt, "NS queue mutation failed, retrying");
                    tokio::time::sleep(backoff(self.config.retry_backoff, attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }

        dev.session = Some(session);
        txn.commit(Some(dev)).await?;
        Ok(())
    }
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt - 1)
}

fn validate(item: &ApplicationDownlink) -> Result<()> {
    if !(MIN_F_PORT..=MAX_F_PORT).contains(&item.f_port) {
        return Err(Error::InvalidArgument(format!("FPort {} out of range", item.f_port)));
    }
    match (item.frm_payload.is_empty(), item.decoded_payload.is_some()) {
        (false, true) => {
            Err(Error::InvalidArgument("both FRMPayload and decoded payload set".into()))
        }
        (true, false) => {
            Err(Error::InvalidArgument("neither FRMPayload nor decoded payload set".into()))
        }
        _ => Ok(()),
    }
}
