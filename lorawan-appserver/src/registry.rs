//! Transactional device and link storage.
//!
//! Every state transition for a device goes through an exclusive
//! per-device transaction: lock, inspect, do work, commit. Dropping a
//! transaction without committing leaves the stored record untouched,
//! which is what makes cancellation mid-operation safe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::BoxFuture;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{Error, Result};
use crate::message::{ApplicationId, DeviceIds};
use crate::session::{ApplicationLink, EndDevice};

/// Exclusive read-modify-write handle on one device record.
pub trait DeviceTransaction: Send {
    /// The record as currently stored; `None` if the device does not exist.
    fn device(&self) -> Option<&EndDevice>;

    /// Replaces the stored record (`None` deletes it) and releases the lock.
    fn commit(self: Box<Self>, device: Option<EndDevice>) -> BoxFuture<'static, Result<()>>;
}

/// Closure form of a device mutation: receives the stored record
/// (`None` = create) and returns the record to store (`None` = delete).
pub type SetFn<'a> = Box<dyn FnOnce(Option<EndDevice>) -> Result<Option<EndDevice>> + Send + 'a>;

/// Mapping of devices with per-device transactional access.
pub trait DeviceRegistry: Send + Sync {
    /// Opens an exclusive transaction on one device.
    fn transaction<'a>(
        &'a self,
        ids: &'a DeviceIds,
    ) -> BoxFuture<'a, Result<Box<dyn DeviceTransaction>>>;

    /// Reads a device record without locking it for update.
    fn get<'a>(&'a self, ids: &'a DeviceIds) -> BoxFuture<'a, Result<Option<EndDevice>>>;

    /// All devices of an application.
    fn list<'a>(&'a self, app: &'a ApplicationId) -> BoxFuture<'a, Result<Vec<EndDevice>>>;

    /// Read-modify-write in one call, for mutations that need no
    /// asynchronous work while holding the lock.
    fn set<'a>(
        &'a self,
        ids: &'a DeviceIds,
        f: SetFn<'a>,
    ) -> BoxFuture<'a, Result<Option<EndDevice>>> {
        Box::pin(async move {
            let txn = self.transaction(ids).await?;
            let updated = f(txn.device().cloned())?;
            txn.commit(updated.clone()).await?;
            Ok(updated)
        })
    }
}

/// Mapping of per-application link settings.
pub trait LinkRegistry: Send + Sync {
    fn get<'a>(&'a self, app: &'a ApplicationId) -> BoxFuture<'a, Result<Option<ApplicationLink>>>;

    /// Upserts (`Some`) or deletes (`None`) the link record.
    fn set<'a>(
        &'a self,
        app: &'a ApplicationId,
        link: Option<ApplicationLink>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Applications with a link record.
    fn list<'a>(&'a self) -> BoxFuture<'a, Result<Vec<ApplicationId>>>;
}

type DeviceSlot = Arc<Mutex<Option<EndDevice>>>;

/// In-memory device registry. Backing stores with their own
/// transactions implement [`DeviceRegistry`] directly.
#[derive(Default)]
pub struct MemoryDeviceRegistry {
    devices: StdMutex<HashMap<String, DeviceSlot>>,
}

impl MemoryDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, uid: &str) -> DeviceSlot {
        let mut devices = self.devices.lock().expect("device registry poisoned");
        devices.entry(uid.to_owned()).or_default().clone()
    }
}

struct MemoryDeviceTransaction {
    guard: OwnedMutexGuard<Option<EndDevice>>,
}

impl DeviceTransaction for MemoryDeviceTransaction {
    fn device(&self) -> Option<&EndDevice> {
        self.guard.as_ref()
    }

    fn commit(mut self: Box<Self>, device: Option<EndDevice>) -> BoxFuture<'static, Result<()>> {
        *self.guard = device;
        Box::pin(async { Ok(()) })
    }
}

impl DeviceRegistry for MemoryDeviceRegistry {
    fn transaction<'a>(
        &'a self,
        ids: &'a DeviceIds,
    ) -> BoxFuture<'a, Result<Box<dyn DeviceTransaction>>> {
        let slot = self.slot(&ids.uid());
        Box::pin(async move {
            let guard = slot.lock_owned().await;
            Ok(Box::new(MemoryDeviceTransaction { guard }) as Box<dyn DeviceTransaction>)
        })
    }

    fn get<'a>(&'a self, ids: &'a DeviceIds) -> BoxFuture<'a, Result<Option<EndDevice>>> {
        let slot = self.slot(&ids.uid());
        Box::pin(async move { Ok(slot.lock().await.clone()) })
    }

    fn list<'a>(&'a self, app: &'a ApplicationId) -> BoxFuture<'a, Result<Vec<EndDevice>>> {
        let slots: Vec<DeviceSlot> = {
            let devices = self.devices.lock().expect("device registry poisoned");
            devices.values().cloned().collect()
        };
        Box::pin(async move {
            let mut out = Vec::new();
            for slot in slots {
                if let Some(dev) = slot.lock().await.as_ref() {
                    if &dev.ids.application_id == app {
                        out.push(dev.clone());
                    }
                }
            }
            Ok(out)
        })
    }
}

/// In-memory link registry.
#[derive(Default)]
pub struct MemoryLinkRegistry {
    links: Mutex<HashMap<ApplicationId, ApplicationLink>>,
}

impl MemoryLinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LinkRegistry for MemoryLinkRegistry {
    fn get<'a>(&'a self, app: &'a ApplicationId) -> BoxFuture<'a, Result<Option<ApplicationLink>>> {
        Box::pin(async move { Ok(self.links.lock().await.get(app).cloned()) })
    }

    fn set<'a>(
        &'a self,
        app: &'a ApplicationId,
        link: Option<ApplicationLink>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut links = self.links.lock().await;
            match link {
                Some(link) => {
                    links.insert(app.clone(), link);
                }
                None => {
                    links.remove(app);
                }
            }
            Ok(())
        })
    }

    fn list<'a>(&'a self) -> BoxFuture<'a, Result<Vec<ApplicationId>>> {
        Box::pin(async move {
            let mut apps: Vec<_> = self.links.lock().await.keys().cloned().collect();
            apps.sort();
            Ok(apps)
        })
    }
}

/// Looks a device up, failing with `not_found` when absent.
pub async fn require_device(registry: &dyn DeviceRegistry, ids: &DeviceIds) -> Result<EndDevice> {
    registry.get(ids).await?.ok_or_else(|| Error::NotFound(ids.uid()))
}
