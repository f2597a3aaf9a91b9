//! Upstream message processing: the per-device session state machine.
//!
//! Every NS message mutates at most one device, and all mutations for
//! a device run inside its registry transaction. NS queue RPCs happen
//! before the transaction commits, so a failed RPC leaves both the
//! stored counters and the NS queue untouched.

use std::sync::Arc;

use futures::future::BoxFuture;
use lorawan_payload::crypto::{decrypt_frm_payload, encrypt_frm_payload, Direction};
use tracing::{info, warn};

use crate::cluster::{JoinServer, NetworkServer};
use crate::error::{Error, Result};
use crate::fanout::Hub;
use crate::formatter::Formatters;
use crate::keyvault::SessionKeys;
use crate::link::UpHandler;
use crate::message::{
    ApplicationDownlink, ApplicationDownlinkFailed, ApplicationInvalidatedDownlinks,
    ApplicationJoinAccept, ApplicationUp, ApplicationUplink, DeviceIds, Up,
};
use crate::registry::{require_device, DeviceRegistry, DeviceTransaction as _, LinkRegistry};
use crate::session::{ApplicationLink, EndDevice, Session};

fn skid_hex(session_key_id: &[u8]) -> String {
    session_key_id.iter().map(|b| format!("{b:02x}")).collect()
}

/// Applies upstream NS messages to device state and emits the
/// resulting application events into the fan-out hub.
pub struct Processor {
    devices: Arc<dyn DeviceRegistry>,
    links: Arc<dyn LinkRegistry>,
    ns: Arc<dyn NetworkServer>,
    js: Arc<dyn JoinServer>,
    keys: Arc<SessionKeys>,
    formatters: Arc<Formatters>,
    hub: Arc<Hub>,
}

impl Processor {
    pub fn new(
        devices: Arc<dyn DeviceRegistry>,
        links: Arc<dyn LinkRegistry>,
        ns: Arc<dyn NetworkServer>,
        js: Arc<dyn JoinServer>,
        keys: Arc<SessionKeys>,
        formatters: Arc<Formatters>,
        hub: Arc<Hub>,
    ) -> Self {
        Processor { devices, links, ns, js, keys, formatters, hub }
    }

    /// Processes one inbound message, emitting zero or one upstream
    /// event. Errors mean the message was dropped; the link keeps
    /// running.
    pub async fn process(&self, up: ApplicationUp) -> Result<()> {
        let ApplicationUp { ids, correlation_ids, up } = up;
        let outbound = match up {
            Up::JoinAccept(join) => self.handle_join_accept(&ids, join).await?,
            Up::UplinkMessage(uplink) => self.handle_uplink(&ids, uplink).await?,
            Up::DownlinkQueued(item) => {
                Some(Up::DownlinkQueued(self.decrypt_echo(&ids, item).await?))
            }
            Up::DownlinkSent(item) => {
                Some(Up::DownlinkSent(self.decrypt_echo(&ids, item).await?))
            }
            Up::DownlinkAck(item) => Some(Up::DownlinkAck(self.decrypt_echo(&ids, item).await?)),
            Up::DownlinkNack(item) => {
                self.handle_nack(&ids, item).await?.map(Up::DownlinkNack)
            }
            Up::DownlinkFailed(failed) => Some(Up::DownlinkFailed(ApplicationDownlinkFailed {
                downlink: self.decrypt_echo(&ids, failed.downlink).await?,
                error: failed.error,
            })),
            Up::DownlinkQueueInvalidated(invalidated) => {
                self.handle_queue_invalidated(&ids, invalidated).await?;
                None
            }
            Up::LocationSolved(location) => Some(Up::LocationSolved(location)),
        };
        if let Some(up) = outbound {
            self.hub.publish(&ApplicationUp { ids, correlation_ids, up });
        }
        Ok(())
    }

    /// Establishes the session negotiated by a join-accept, either as
    /// the current session or, when the device has not switched over
    /// yet, as the pending one.
    async fn handle_join_accept(
        &self,
        ids: &DeviceIds,
        mut join: ApplicationJoinAccept,
    ) -> Result<Option<Up>> {
        let txn = self.devices.transaction(ids).await?;
        let Some(mut dev) = txn.device().cloned() else {
            return Err(Error::NotFound(ids.uid()));
        };

        if dev.session.as_ref().is_some_and(|s| s.matches(&join.session_key_id)) {
            // re-delivery for the session the device is already on
            join.app_s_key = None;
            join.invalidated_downlinks.clear();
            return Ok(Some(Up::JoinAccept(join)));
        }

        let dev_addr = ids
            .dev_addr
            .ok_or_else(|| Error::InvalidArgument("join-accept without DevAddr".into()))?;
        let app_s_key = match join.app_s_key.take() {
            Some(envelope) => envelope,
            None => {
                let dev_eui = dev
                    .ids
                    .dev_eui
                    .ok_or_else(|| Error::InvalidArgument("device has no DevEUI".into()))?;
                self.js.get_app_s_key(dev_eui, &join.session_key_id).await?
            }
        };
        let mut session = Session::new(join.session_key_id.clone(), dev_addr, app_s_key);

        if join.pending_session {
            // The device stays on its old session until it sends an
            // uplink on the new one.
            if !join.invalidated_downlinks.is_empty() {
                warn!(device_uid = %dev.ids.uid(), "pending join-accept carried invalidated downlinks");
                join.invalidated_downlinks.clear();
            }
            if let Some(superseded) = dev.pending_session.replace(session) {
                self.keys.evict(dev.ids.dev_eui, &superseded.session_key_id).await;
            }
            txn.commit(Some(dev)).await?;
        } else {
            let old = dev.session.take();
            let invalidated = std::mem::take(&mut join.invalidated_downlinks);
            if !invalidated.is_empty() {
                let rewritten =
                    self.rewrite_queue(&dev, old.as_ref(), &mut session, invalidated).await?;
                self.ns.downlink_queue_replace(ids, rewritten).await?;
            }
            if let Some(old) = &old {
                self.keys.evict(dev.ids.dev_eui, &old.session_key_id).await;
            }
            if let Some(pending) = dev.pending_session.take() {
                self.keys.evict(dev.ids.dev_eui, &pending.session_key_id).await;
            }
            dev.ids.dev_addr = Some(dev_addr);
            dev.session = Some(session);
            txn.commit(Some(dev)).await?;
            info!(device_uid = %ids.uid(), session_key_id = %skid_hex(&join.session_key_id), "session established");
        }
        Ok(Some(Up::JoinAccept(join)))
    }

    /// Decrypts and formats a data uplink, promoting the pending
    /// session when this is the first uplink on it.
    async fn handle_uplink(
        &self,
        ids: &DeviceIds,
        mut uplink: ApplicationUplink,
    ) -> Result<Option<Up>> {
        let txn = self.devices.transaction(ids).await?;
        let Some(mut dev) = txn.device().cloned() else {
            return Err(Error::NotFound(ids.uid()));
        };

        let session = if dev.session.as_ref().is_some_and(|s| s.matches(&uplink.session_key_id)) {
            drop(txn);
            dev.session.clone().expect("session matched")
        } else if dev
            .pending_session
            .as_ref()
            .is_some_and(|s| s.matches(&uplink.session_key_id))
        {
            let old = dev.session.take();
            let mut promoted = dev.pending_session.take().expect("pending session matched");
            // The old session's queue is void now; rewrite it onto the
            // promoted session before anything else is scheduled.
            let queued = self.ns.downlink_queue_list(ids).await?;
            if !queued.is_empty() {
                let rewritten =
                    self.rewrite_queue(&dev, old.as_ref(), &mut promoted, queued).await?;
                self.ns.downlink_queue_replace(ids, rewritten).await?;
            }
            if let Some(old) = &old {
                self.keys.evict(dev.ids.dev_eui, &old.session_key_id).await;
            }
            dev.ids.dev_addr = Some(promoted.dev_addr);
            dev.session = Some(promoted.clone());
            txn.commit(Some(dev.clone())).await?;
            info!(device_uid = %ids.uid(), session_key_id = %skid_hex(&uplink.session_key_id), "pending session promoted");
            promoted
        } else {
            warn!(
                device_uid = %ids.uid(),
                session_key_id = %skid_hex(&uplink.session_key_id),
                "uplink with unknown session key identifier dropped"
            );
            return Ok(None);
        };

        let key = self
            .keys
            .app_s_key(dev.ids.dev_eui, &session.app_s_key, &session.session_key_id)
            .await?;
        decrypt_frm_payload(
            key.inner(),
            session.dev_addr,
            uplink.f_cnt,
            Direction::Up,
            &mut uplink.frm_payload,
        );

        let link = self.application_link(ids).await;
        match self
            .formatters
            .decode_uplink(&dev, link.as_ref(), uplink.f_port, &uplink.frm_payload)
            .await
        {
            Ok(Some(decoded)) => {
                for warning in &decoded.warnings {
                    warn!(device_uid = %ids.uid(), warning = %warning, "uplink formatter warning");
                }
                uplink.decoded_payload = Some(decoded.data);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(device_uid = %ids.uid(), error = %err, "uplink formatter failed, forwarding raw payload");
            }
        }
        Ok(Some(Up::UplinkMessage(uplink)))
    }

    /// Attaches the plaintext view to a downlink life-cycle echo.
    async fn decrypt_echo(
        &self,
        ids: &DeviceIds,
        mut item: ApplicationDownlink,
    ) -> Result<ApplicationDownlink> {
        let dev = require_device(self.devices.as_ref(), ids).await?;
        let Some(session) = dev.session_for(&item.session_key_id) else {
            warn!(
                device_uid = %ids.uid(),
                session_key_id = %skid_hex(&item.session_key_id),
                "downlink echo for unknown session, forwarding ciphertext"
            );
            return Ok(item);
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
        let link = self.application_link(ids).await;
        match self
            .formatters
            .decode_downlink(&dev, link.as_ref(), item.f_port, &item.frm_payload)
            .await
        {
            Ok(Some(decoded)) => item.decoded_payload = Some(decoded.data),
            Ok(None) => {}
            Err(err) => {
                warn!(device_uid = %ids.uid(), error = %err, "downlink formatter failed on echo");
            }
        }
        Ok(item)
    }

    /// Re-queues a nacked downlink at the head of the NS queue, then
    /// forwards the nack with the plaintext attached.
    async fn handle_nack(
        &self,
        ids: &DeviceIds,
        item: ApplicationDownlink,
    ) -> Result<Option<ApplicationDownlink>> {
        let txn = self.devices.transaction(ids).await?;
        let Some(dev) = txn.device().cloned() else {
            return Err(Error::NotFound(ids.uid()));
        };
        if !dev.session.as_ref().is_some_and(|s| s.matches(&item.session_key_id)) {
            warn!(
                device_uid = %ids.uid(),
                session_key_id = %skid_hex(&item.session_key_id),
                "nack for a session that is not current, not re-queueing"
            );
            drop(txn);
            return self.decrypt_echo(ids, item).await.map(Some);
        }
        // The NS dropped the item when it nacked it; reinsert it ahead
        // of whatever is still queued, counters untouched.
        let mut queue = vec![item.clone()];
        queue.extend(self.ns.downlink_queue_list(ids).await?);
        self.ns.downlink_queue_replace(ids, queue).await?;
        drop(txn);

        self.decrypt_echo(ids, item).await.map(Some)
    }

    /// Reconciles the device queue against the list the NS returned
    /// after invalidating it. Emits no upstream event.
    async fn handle_queue_invalidated(
        &self,
        ids: &DeviceIds,
        invalidated: ApplicationInvalidatedDownlinks,
    ) -> Result<()> {
        let txn = self.devices.transaction(ids).await?;
        let Some(mut dev) = txn.device().cloned() else {
            return Err(Error::NotFound(ids.uid()));
        };
        let Some(mut session) = dev.session.clone() else {
            warn!(device_uid = %ids.uid(), "queue invalidated without an active session");
            return Ok(());
        };
        let key = self
            .keys
            .app_s_key(dev.ids.dev_eui, &session.app_s_key, &session.session_key_id)
            .await?;

        let mut next = session.last_a_f_cnt_down.max(invalidated.last_f_cnt_down);
        let mut rewritten = Vec::with_capacity(invalidated.downlinks.len());
        for mut item in invalidated.downlinks {
            if !session.matches(&item.session_key_id) {
                warn!(
                    device_uid = %ids.uid(),
                    session_key_id = %skid_hex(&item.session_key_id),
                    "dropping invalidated downlink from unknown session"
                );
                continue;
            }
            decrypt_frm_payload(
                key.inner(),
                session.dev_addr,
                item.f_cnt,
                Direction::Down,
                &mut item.frm_payload,
            );
            next += 1;
            encrypt_frm_payload(
                key.inner(),
                session.dev_addr,
                next,
                Direction::Down,
                &mut item.frm_payload,
            );
            item.f_cnt = next;
            rewritten.push(item);
        }
        self.ns.downlink_queue_replace(ids, rewritten).await?;
        session.last_a_f_cnt_down = next;
        dev.session = Some(session);
        txn.commit(Some(dev)).await?;
        Ok(())
    }

    /// Rewrites downlinks queued under `old` onto `new_session`:
    /// decrypt with the old session context, re-encrypt with the new
    /// key and fresh counters. Items from any other session are
    /// dropped.
    async fn rewrite_queue(
        &self,
        dev: &EndDevice,
        old: Option<&Session>,
        new_session: &mut Session,
        items: Vec<ApplicationDownlink>,
    ) -> Result<Vec<ApplicationDownlink>> {
        let Some(old) = old else {
            if !items.is_empty() {
                warn!(device_uid = %dev.ids.uid(), dropped = items.len(), "no previous session, dropping queued downlinks");
            }
            return Ok(Vec::new());
        };
        let old_key =
            self.keys.app_s_key(dev.ids.dev_eui, &old.app_s_key, &old.session_key_id).await?;
        let new_key = self
            .keys
            .app_s_key(dev.ids.dev_eui, &new_session.app_s_key, &new_session.session_key_id)
            .await?;

        let mut out = Vec::with_capacity(items.len());
        for mut item in items {
            if !old.matches(&item.session_key_id) {
                warn!(
                    device_uid = %dev.ids.uid(),
                    session_key_id = %skid_hex(&item.session_key_id),
                    "dropping queued downlink from unknown session"
                );
                continue;
            }
            decrypt_frm_payload(
                old_key.inner(),
                old.dev_addr,
                item.f_cnt,
                Direction::Down,
                &mut item.frm_payload,
            );
            let f_cnt = new_session.last_a_f_cnt_down + 1;
            encrypt_frm_payload(
                new_key.inner(),
                new_session.dev_addr,
                f_cnt,
                Direction::Down,
                &mut item.frm_payload,
            );
            new_session.last_a_f_cnt_down = f_cnt;
            item.session_key_id = new_session.session_key_id.clone();
            item.f_cnt = f_cnt;
            out.push(item);
        }
        Ok(out)
    }

    async fn application_link(&self, ids: &DeviceIds) -> Option<ApplicationLink> {
        match self.links.get(&ids.application_id).await {
            Ok(link) => link,
            Err(err) => {
                warn!(application_id = %ids.application_id, error = %err, "link registry read failed");
                None
            }
        }
    }
}

impl UpHandler for Processor {
    fn handle<'a>(&'a self, up: ApplicationUp) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.process(up))
    }
}
