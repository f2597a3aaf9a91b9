//! Mock collaborators shared by the test suites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;

use futures::future::BoxFuture;
use lorawan_payload::{kek, DevEui, AES128};
use tokio::sync::mpsc;

use crate::cluster::{IdentityServer, JoinServer, NetworkServer, Rights, UpStream};
use crate::error::{Error, Result};
use crate::io::web::{WebhookRequest, WebhookSink};
use crate::message::{
    ApplicationDownlink, ApplicationId, ApplicationUp, DeviceIds, KeyEnvelope,
};

pub const TEST_KEK_LABEL: &str = "test";

/// The RFC 3394 example KEK; envelopes in tests are wrapped under it.
pub fn test_kek() -> AES128 {
    let mut kek = [0u8; 16];
    for (i, b) in kek.iter_mut().enumerate() {
        *b = i as u8;
    }
    AES128(kek)
}

pub fn wrapped_key(key: [u8; 16]) -> KeyEnvelope {
    let mut ciphertext = [0u8; 24];
    kek::wrap(&test_kek(), &key, &mut ciphertext).unwrap();
    KeyEnvelope::wrapped(ciphertext.to_vec(), TEST_KEK_LABEL)
}

/// NS mock: per-device queues, one upstream channel per linked
/// application, and counters for the queue RPCs.
#[derive(Default)]
pub struct MockNetworkServer {
    queues: StdMutex<HashMap<String, Vec<ApplicationDownlink>>>,
    ups: StdMutex<HashMap<ApplicationId, mpsc::UnboundedSender<Result<ApplicationUp>>>>,
    pub push_calls: AtomicU32,
    pub replace_calls: AtomicU32,
    fail_pushes: AtomicU32,
}

impl MockNetworkServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one upstream message into the application's link,
    /// waiting for the link to be established first.
    pub async fn send_up(&self, up: ApplicationUp) {
        loop {
            {
                let ups = self.ups.lock().unwrap();
                if let Some(tx) = ups.get(&up.ids.application_id) {
                    tx.send(Ok(up)).expect("link stream closed");
                    return;
                }
            }
            tokio::task::yield_now().await;
        }
    }

    pub fn queue(&self, ids: &DeviceIds) -> Vec<ApplicationDownlink> {
        self.queues.lock().unwrap().get(&ids.uid()).cloned().unwrap_or_default()
    }

    pub fn set_queue(&self, ids: &DeviceIds, items: Vec<ApplicationDownlink>) {
        self.queues.lock().unwrap().insert(ids.uid(), items);
    }

    /// Makes the next `n` push RPCs fail with a transient error.
    pub fn fail_next_pushes(&self, n: u32) {
        self.fail_pushes.store(n, Ordering::SeqCst);
    }
}

impl NetworkServer for MockNetworkServer {
    fn link_application<'a>(&'a self, ids: &'a ApplicationId) -> BoxFuture<'a, Result<UpStream>> {
        Box::pin(async move {
            let (tx, mut rx) = mpsc::unbounded_channel();
            self.ups.lock().unwrap().insert(ids.clone(), tx);
            let stream: UpStream = Box::pin(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)));
            Ok(stream)
        })
    }

    fn downlink_queue_push<'a>(
        &'a self,
        ids: &'a DeviceIds,
        items: Vec<ApplicationDownlink>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.fail_pushes.load(Ordering::SeqCst) > 0 {
                self.fail_pushes.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Transient("NS unavailable".into()));
            }
            self.push_calls.fetch_add(1, Ordering::SeqCst);
            self.queues.lock().unwrap().entry(ids.uid()).or_default().extend(items);
            Ok(())
        })
    }

    fn downlink_queue_replace<'a>(
        &'a self,
        ids: &'a DeviceIds,
        items: Vec<ApplicationDownlink>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.replace_calls.fetch_add(1, Ordering::SeqCst);
            self.queues.lock().unwrap().insert(ids.uid(), items);
            Ok(())
        })
    }

    fn downlink_queue_list<'a>(
        &'a self,
        ids: &'a DeviceIds,
    ) -> BoxFuture<'a, Result<Vec<ApplicationDownlink>>> {
        Box::pin(async move { Ok(self.queue(ids)) })
    }
}

/// JS mock: session keys registered per `(DevEUI, SessionKeyID)`.
#[derive(Default)]
pub struct MockJoinServer {
    keys: StdMutex<HashMap<(DevEui, Vec<u8>), KeyEnvelope>>,
}

impl MockJoinServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, dev_eui: DevEui, session_key_id: &[u8], envelope: KeyEnvelope) {
        self.keys.lock().unwrap().insert((dev_eui, session_key_id.to_vec()), envelope);
    }
}

impl JoinServer for MockJoinServer {
    fn get_app_s_key<'a>(
        &'a self,
        dev_eui: DevEui,
        session_key_id: &'a [u8],
    ) -> BoxFuture<'a, Result<KeyEnvelope>> {
        Box::pin(async move {
            self.keys
                .lock()
                .unwrap()
                .get(&(dev_eui, session_key_id.to_vec()))
                .cloned()
                .ok_or_else(|| Error::SessionKeyUnknown {
                    dev_eui: dev_eui.to_string(),
                    session_key_id: session_key_id
                        .iter()
                        .map(|b| format!("{b:02x}"))
                        .collect(),
                })
        })
    }
}

/// IS mock: one API key with rights per application.
#[derive(Default)]
pub struct MockIdentityServer {
    keys: StdMutex<HashMap<ApplicationId, (String, Rights)>>,
}

impl MockIdentityServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, app: ApplicationId, api_key: &str, rights: Rights) {
        self.keys.lock().unwrap().insert(app, (api_key.to_owned(), rights));
    }
}

impl IdentityServer for MockIdentityServer {
    fn application_rights<'a>(
        &'a self,
        ids: &'a ApplicationId,
        api_key: &'a str,
    ) -> BoxFuture<'a, Result<Rights>> {
        Box::pin(async move {
            let keys = self.keys.lock().unwrap();
            match keys.get(ids) {
                Some((key, rights)) if key == api_key => Ok(*rights),
                Some(_) => Err(Error::Unauthenticated),
                None => Err(Error::NotFound(ids.to_string())),
            }
        })
    }
}

/// Formatter sandbox used across the suites: uplinks decode to the
/// byte sum, downlinks encode `{"sum": n}` to n `0x01` bytes.
pub struct SumSandbox;

impl crate::formatter::ScriptSandbox for SumSandbox {
    fn decode_uplink<'a>(
        &'a self,
        _language: &'a str,
        _source: &'a str,
        _f_port: u8,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<crate::formatter::DecodedPayload>> {
        let sum: u64 = payload.iter().map(|b| u64::from(*b)).sum();
        Box::pin(async move {
            Ok(crate::formatter::DecodedPayload {
                data: serde_json::json!({ "sum": sum }),
                warnings: vec![],
            })
        })
    }

    fn encode_downlink<'a>(
        &'a self,
        _language: &'a str,
        _source: &'a str,
        _f_port: u8,
        data: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<crate::formatter::EncodedPayload>> {
        Box::pin(async move {
            let sum = data["sum"]
                .as_u64()
                .ok_or_else(|| Error::Formatter("sum is not a number".into()))?;
            Ok(crate::formatter::EncodedPayload {
                frm_payload: vec![0x01; sum as usize],
                warnings: vec![],
            })
        })
    }

    fn decode_downlink<'a>(
        &'a self,
        language: &'a str,
        source: &'a str,
        f_port: u8,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<crate::formatter::DecodedPayload>> {
        self.decode_uplink(language, source, f_port, payload)
    }
}

/// Webhook sink recording delivered requests.
#[derive(Default)]
pub struct RecordingSink {
    pub requests: StdMutex<Vec<WebhookRequest>>,
}

impl WebhookSink for std::sync::Arc<RecordingSink> {
    fn deliver(&self, request: WebhookRequest) -> BoxFuture<'static, Result<u16>> {
        let this = self.clone();
        Box::pin(async move {
            this.requests.lock().unwrap().push(request);
            Ok(200)
        })
    }
}
