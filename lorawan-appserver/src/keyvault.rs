//! Session key resolution through the cluster key vault.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use lorawan_payload::{kek, AppSKey, DevEui, AES128};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::message::KeyEnvelope;

/// Unwraps key envelopes with the key-encryption keys it holds.
pub trait KeyVault: Send + Sync {
    fn unwrap_key<'a>(
        &'a self,
        kek_label: &'a str,
        ciphertext: &'a [u8],
    ) -> BoxFuture<'a, Result<AppSKey>>;
}

/// Key vault backed by a static KEK table, typically loaded from
/// configuration.
pub struct StaticKeyVault {
    keks: HashMap<String, AES128>,
}

impl StaticKeyVault {
    pub fn new(keks: HashMap<String, AES128>) -> Self {
        StaticKeyVault { keks }
    }
}

impl KeyVault for StaticKeyVault {
    fn unwrap_key<'a>(
        &'a self,
        kek_label: &'a str,
        ciphertext: &'a [u8],
    ) -> BoxFuture<'a, Result<AppSKey>> {
        Box::pin(async move {
            let kek = self
                .keks
                .get(kek_label)
                .ok_or_else(|| Error::NotFound(format!("KEK {kek_label}")))?;
            let key = kek::unwrap_key(kek, ciphertext)
                .map_err(|err| Error::InvalidArgument(format!("key envelope: {err}")))?;
            Ok(AppSKey::from(key.0))
        })
    }
}

/// Resolves session keys from their envelopes, caching unwrapped keys
/// by `(DevEui, SessionKeyID)`. Entries are evicted when the session
/// they belong to is discarded.
pub struct SessionKeys {
    vault: Arc<dyn KeyVault>,
    cache: Mutex<HashMap<(DevEui, Vec<u8>), AppSKey>>,
}

impl SessionKeys {
    pub fn new(vault: Arc<dyn KeyVault>) -> Self {
        SessionKeys { vault, cache: Mutex::new(HashMap::new()) }
    }

    /// Returns the plaintext AppSKey for a session.
    pub async fn app_s_key(
        &self,
        dev_eui: Option<DevEui>,
        envelope: &KeyEnvelope,
        session_key_id: &[u8],
    ) -> Result<AppSKey> {
        if !envelope.is_wrapped() {
            let key: [u8; 16] = envelope.key.as_slice().try_into().map_err(|_| {
                Error::InvalidArgument(format!("AppSKey length {}", envelope.key.len()))
            })?;
            return Ok(AppSKey::from(key));
        }
        if let Some(dev_eui) = dev_eui {
            let cache = self.cache.lock().await;
            if let Some(key) = cache.get(&(dev_eui, session_key_id.to_vec())) {
                return Ok(*key);
            }
        }
        let key = self.vault.unwrap_key(&envelope.kek_label, &envelope.key).await?;
        if let Some(dev_eui) = dev_eui {
            self.cache.lock().await.insert((dev_eui, session_key_id.to_vec()), key);
        }
        Ok(key)
    }

    /// Drops the cache entry for a discarded session.
    pub async fn evict(&self, dev_eui: Option<DevEui>, session_key_id: &[u8]) {
        if let Some(dev_eui) = dev_eui {
            self.cache.lock().await.remove(&(dev_eui, session_key_id.to_vec()));
        }
    }
}
