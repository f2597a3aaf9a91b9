//! End-to-end harness: a server wired to mock peers, with the usual
//! registered application and device.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use lorawan_payload::crypto::{decrypt_frm_payload, encrypt_frm_payload, Direction};
use lorawan_payload::{DevAddr, DevEui, AES128};

use crate::cluster::{Rights, StaticPeers};
use crate::config::{Config, LinkConfig};
use crate::fanout::Subscription;
use crate::formatter::{EmptyRepository, MessageFormatters, PayloadFormatter};
use crate::io::web::MemoryWebhookRegistry;
use crate::keyvault::StaticKeyVault;
use crate::message::{
    ApplicationDownlink, ApplicationId, ApplicationUp, ApplicationUplink, DeviceIds, Up,
};
use crate::registry::{DeviceRegistry, LinkRegistry, MemoryDeviceRegistry, MemoryLinkRegistry};
use crate::session::{ApplicationLink, EndDevice, Session};
use crate::test_util::{
    test_kek, wrapped_key, MockIdentityServer, MockJoinServer, MockNetworkServer, RecordingSink,
    TEST_KEK_LABEL,
};
use crate::{ApplicationServer, Collaborators};

pub const APP: &str = "app1";
pub const API_KEY: &str = "secret";
pub const DEV: &str = "dev1";

pub fn app() -> ApplicationId {
    ApplicationId::new(APP)
}

pub fn dev_eui() -> DevEui {
    DevEui::from([0x42; 8])
}

pub fn device_ids() -> DeviceIds {
    DeviceIds::new(APP, DEV).with_dev_eui(dev_eui())
}

/// A session whose key, address and identifier are all derived from
/// one byte, matching the fixtures used throughout the suite.
pub fn session(id: u8) -> Session {
    Session::new(vec![id], DevAddr::from([id; 4]), wrapped_key([id; 16]))
}

/// A queue item encrypted the way the server would store it under the
/// session created by [`session`]`(id)`.
pub fn encrypted_downlink(id: u8, f_port: u8, f_cnt: u32, plaintext: &[u8]) -> ApplicationDownlink {
    let mut frm_payload = plaintext.to_vec();
    encrypt_frm_payload(
        &AES128([id; 16]),
        DevAddr::from([id; 4]),
        f_cnt,
        Direction::Down,
        &mut frm_payload,
    );
    ApplicationDownlink {
        session_key_id: vec![id],
        f_port,
        f_cnt,
        frm_payload,
        ..Default::default()
    }
}

/// An uplink as the NS would forward it: FRMPayload still encrypted.
pub fn encrypted_uplink(id: u8, f_port: u8, f_cnt: u32, plaintext: &[u8]) -> ApplicationUplink {
    let mut frm_payload = plaintext.to_vec();
    encrypt_frm_payload(
        &AES128([id; 16]),
        DevAddr::from([id; 4]),
        f_cnt,
        Direction::Up,
        &mut frm_payload,
    );
    ApplicationUplink { session_key_id: vec![id], f_port, f_cnt, frm_payload, ..Default::default() }
}

/// Decrypts a stored queue item of [`session`]`(id)`.
pub fn decrypted(id: u8, item: &ApplicationDownlink) -> Vec<u8> {
    let mut plaintext = item.frm_payload.clone();
    decrypt_frm_payload(
        &AES128([id; 16]),
        DevAddr::from([id; 4]),
        item.f_cnt,
        Direction::Down,
        &mut plaintext,
    );
    plaintext
}

pub struct Harness {
    pub server: Arc<ApplicationServer>,
    pub ns: Arc<MockNetworkServer>,
    pub js: Arc<MockJoinServer>,
    pub is: Arc<MockIdentityServer>,
    pub devices: Arc<MemoryDeviceRegistry>,
    pub webhooks: Arc<MemoryWebhookRegistry>,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    pub async fn put_device(&self, device: EndDevice) {
        let ids = device.ids.clone();
        self.devices.set(&ids, Box::new(move |_| Ok(Some(device)))).await.unwrap();
    }

    pub async fn device(&self, ids: &DeviceIds) -> EndDevice {
        self.devices.get(ids).await.unwrap().expect("device not in registry")
    }

    pub async fn subscribe(&self) -> Subscription {
        self.server.subscribe(&app(), "test").await
    }

    /// Sends one uplink message through the NS link.
    pub async fn send_uplink(&self, dev_addr: DevAddr, uplink: ApplicationUplink) {
        self.ns
            .send_up(ApplicationUp {
                ids: device_ids().with_dev_addr(dev_addr),
                correlation_ids: vec![],
                up: Up::UplinkMessage(uplink),
            })
            .await;
    }
}

/// Builds a running server against mocks, with application `app1`
/// (API key `secret`, sum formatters as link defaults) and device
/// `dev1` registered.
pub async fn setup() -> Harness {
    let ns = Arc::new(MockNetworkServer::new());
    let js = Arc::new(MockJoinServer::new());
    let is = Arc::new(MockIdentityServer::new());
    is.add(app(), API_KEY, Rights::all());

    let devices = Arc::new(MemoryDeviceRegistry::new());
    let links = Arc::new(MemoryLinkRegistry::new());
    let webhooks = Arc::new(MemoryWebhookRegistry::new());
    let sink = Arc::new(RecordingSink::default());

    let script = |name: &str| PayloadFormatter::Script {
        language: "javascript".to_owned(),
        source: format!("function {name}() {{}}"),
    };
    links
        .set(
            &app(),
            Some(ApplicationLink {
                default_formatters: Some(MessageFormatters {
                    up_formatter: script("decodeUplink"),
                    down_formatter: script("encodeDownlink"),
                }),
            }),
        )
        .await
        .unwrap();

    let vault = StaticKeyVault::new(HashMap::from([(TEST_KEK_LABEL.to_owned(), test_kek())]));

    let config = Config {
        link: LinkConfig { backoff_base: Duration::from_millis(10), ..Default::default() },
        ..Default::default()
    };
    let server = ApplicationServer::new(
        config,
        Collaborators {
            peers: Arc::new(StaticPeers {
                network_server: ns.clone(),
                join_server: js.clone(),
                identity_server: is.clone(),
            }),
            key_vault: Arc::new(vault),
            devices: devices.clone(),
            links: links.clone(),
            webhooks: webhooks.clone(),
            sandbox: Arc::new(crate::test_util::SumSandbox),
            repository: Arc::new(EmptyRepository),
            webhook_sink: Arc::new(sink.clone()),
        },
    );
    server.start().await.unwrap();

    let harness = Harness { server, ns, js, is, devices, webhooks, sink };
    harness.put_device(EndDevice::new(device_ids())).await;
    harness
}

/// Waits for the next upstream event on a subscription.
pub async fn recv_up(sub: &mut Subscription) -> ApplicationUp {
    tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("timed out waiting for an upstream event")
        .expect("subscription closed")
}

/// Asserts that no upstream event arrives.
pub async fn expect_no_up(sub: &mut Subscription) {
    match tokio::time::timeout(Duration::from_millis(250), sub.recv()).await {
        Err(_) => {}
        Ok(up) => panic!("expected no upstream event, got {up:?}"),
    }
}

/// Polls an asynchronous condition until it holds.
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
