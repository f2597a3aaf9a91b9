//! Payload formatter resolution and dispatch.
//!
//! A formatter converts between binary FRMPayload and structured JSON.
//! Scripts execute in an external sandbox behind [`ScriptSandbox`];
//! this module only resolves which formatter applies and enforces the
//! execution deadline.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::session::{ApplicationLink, EndDevice, VersionIds};

/// Reference to a payload formatter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum PayloadFormatter {
    /// Leave payloads unformatted.
    #[default]
    None,
    /// Use the formatter registered in the device repository for the
    /// device's version identifiers.
    Repository,
    /// User-supplied script executed in the sandbox.
    Script { language: String, source: String },
}

/// Formatter selection for both traffic directions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageFormatters {
    pub up_formatter: PayloadFormatter,
    pub down_formatter: PayloadFormatter,
}

/// Result of decoding binary payload into a structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecodedPayload {
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Result of encoding a structure into binary payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncodedPayload {
    pub frm_payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Executes formatter scripts in a resource-bounded sandbox.
///
/// Implementations are expected to enforce their own memory and
/// instruction limits; the caller enforces the wall-clock deadline.
pub trait ScriptSandbox: Send + Sync {
    fn decode_uplink<'a>(
        &'a self,
        language: &'a str,
        source: &'a str,
        f_port: u8,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<DecodedPayload>>;

    fn encode_downlink<'a>(
        &'a self,
        language: &'a str,
        source: &'a str,
        f_port: u8,
        data: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<EncodedPayload>>;

    fn decode_downlink<'a>(
        &'a self,
        language: &'a str,
        source: &'a str,
        f_port: u8,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<DecodedPayload>>;
}

/// Looks up catalog formatters by device type.
pub trait FormatterRepository: Send + Sync {
    /// Returns `(language, source)` of the registered formatter, if any.
    fn formatter<'a>(
        &'a self,
        version_ids: &'a VersionIds,
    ) -> BoxFuture<'a, Result<Option<(String, String)>>>;
}

/// A repository with no registered formatters.
#[derive(Debug, Default)]
pub struct EmptyRepository;

impl FormatterRepository for EmptyRepository {
    fn formatter<'a>(
        &'a self,
        _version_ids: &'a VersionIds,
    ) -> BoxFuture<'a, Result<Option<(String, String)>>> {
        Box::pin(async { Ok(None) })
    }
}

#[derive(Clone, Copy)]
enum Dir {
    Up,
    Down,
}

/// Resolves and runs payload formatters with a deadline.
pub struct Formatters {
    sandbox: Arc<dyn ScriptSandbox>,
    repository: Arc<dyn FormatterRepository>,
    deadline: Duration,
}

impl Formatters {
    pub fn new(
        sandbox: Arc<dyn ScriptSandbox>,
        repository: Arc<dyn FormatterRepository>,
        deadline: Duration,
    ) -> Self {
        Formatters { sandbox, repository, deadline }
    }

    /// Decodes an uplink payload. `Ok(None)` means no formatter applies.
    pub async fn decode_uplink(
        &self,
        device: &EndDevice,
        link: Option<&ApplicationLink>,
        f_port: u8,
        payload: &[u8],
    ) -> Result<Option<DecodedPayload>> {
        let Some((language, source)) = self.resolve(device, link, Dir::Up).await? else {
            return Ok(None);
        };
        self.bounded(self.sandbox.decode_uplink(&language, &source, f_port, payload))
            .await
            .map(Some)
    }

    /// Encodes a structured downlink payload into FRMPayload bytes.
    pub async fn encode_downlink(
        &self,
        device: &EndDevice,
        link: Option<&ApplicationLink>,
        f_port: u8,
        data: &serde_json::Value,
    ) -> Result<Option<EncodedPayload>> {
        let Some((language, source)) = self.resolve(device, link, Dir::Down).await? else {
            return Ok(None);
        };
        self.bounded(self.sandbox.encode_downlink(&language, &source, f_port, data))
            .await
            .map(Some)
    }

    /// Decodes an FRMPayload echoed in a downlink life-cycle event.
    pub async fn decode_downlink(
        &self,
        device: &EndDevice,
        link: Option<&ApplicationLink>,
        f_port: u8,
        payload: &[u8],
    ) -> Result<Option<DecodedPayload>> {
        let Some((language, source)) = self.resolve(device, link, Dir::Down).await? else {
            return Ok(None);
        };
        self.bounded(self.sandbox.decode_downlink(&language, &source, f_port, payload))
            .await
            .map(Some)
    }

    async fn bounded<T>(&self, fut: BoxFuture<'_, Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::Formatter("deadline exceeded".into())),
        }
    }

    /// Resolves the formatter script in precedence order: per-device,
    /// per-application default, device repository, none.
    async fn resolve(
        &self,
        device: &EndDevice,
        link: Option<&ApplicationLink>,
        dir: Dir,
    ) -> Result<Option<(String, String)>> {
        let pick = |f: &MessageFormatters| match dir {
            Dir::Up => f.up_formatter.clone(),
            Dir::Down => f.down_formatter.clone(),
        };
        let formatter = device
            .formatters
            .as_ref()
            .map(&pick)
            .or_else(|| link.and_then(|l| l.default_formatters.as_ref()).map(&pick))
            .unwrap_or(PayloadFormatter::Repository);
        match formatter {
            PayloadFormatter::None => Ok(None),
            PayloadFormatter::Script { language, source } => Ok(Some((language, source))),
            PayloadFormatter::Repository => {
                let Some(version_ids) = device.version_ids.as_ref() else {
                    return Ok(None);
                };
                self.repository.formatter(version_ids).await
            }
        }
    }
}
