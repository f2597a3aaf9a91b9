//! Interfaces to the cluster peers the server depends on: the Network
//! Server, the Join Server and the Identity Server. The transport
//! stacks behind these traits live outside this crate.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use lorawan_payload::DevEui;

use crate::error::{Error, Result};
use crate::message::{ApplicationDownlink, ApplicationId, ApplicationUp, DeviceIds, KeyEnvelope};

/// Streaming uplink subscription for one application.
pub type UpStream = BoxStream<'static, Result<ApplicationUp>>;

/// The Network Server, as consumed by this server.
pub trait NetworkServer: Send + Sync {
    /// Opens the uplink stream for an application. The stream ends or
    /// yields an error when the link breaks; the link manager redials.
    fn link_application<'a>(&'a self, ids: &'a ApplicationId) -> BoxFuture<'a, Result<UpStream>>;

    fn downlink_queue_push<'a>(
        &'a self,
        ids: &'a DeviceIds,
        items: Vec<ApplicationDownlink>,
    ) -> BoxFuture<'a, Result<()>>;

    fn downlink_queue_replace<'a>(
        &'a self,
        ids: &'a DeviceIds,
        items: Vec<ApplicationDownlink>,
    ) -> BoxFuture<'a, Result<()>>;

    fn downlink_queue_list<'a>(
        &'a self,
        ids: &'a DeviceIds,
    ) -> BoxFuture<'a, Result<Vec<ApplicationDownlink>>>;
}

/// The Join Server, holder of session key material.
pub trait JoinServer: Send + Sync {
    /// Returns the (usually wrapped) AppSKey for a session.
    fn get_app_s_key<'a>(
        &'a self,
        dev_eui: DevEui,
        session_key_id: &'a [u8],
    ) -> BoxFuture<'a, Result<KeyEnvelope>>;
}

/// Rights an authenticated caller holds on an application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rights {
    pub read_up: bool,
    pub write_down: bool,
}

impl Rights {
    pub const fn all() -> Self {
        Rights { read_up: true, write_down: true }
    }

    pub fn require_read_up(&self) -> Result<()> {
        if self.read_up {
            Ok(())
        } else {
            Err(Error::PermissionDenied("application traffic read".into()))
        }
    }

    pub fn require_write_down(&self) -> Result<()> {
        if self.write_down {
            Ok(())
        } else {
            Err(Error::PermissionDenied("application traffic down write".into()))
        }
    }
}

/// The Identity Server: validates credentials and resolves rights.
pub trait IdentityServer: Send + Sync {
    fn application_rights<'a>(
        &'a self,
        ids: &'a ApplicationId,
        api_key: &'a str,
    ) -> BoxFuture<'a, Result<Rights>>;
}

/// Resolves cluster roles to their clients. Address discovery and
/// connection pooling happen behind this trait.
pub trait Peers: Send + Sync {
    fn network_server(&self) -> Arc<dyn NetworkServer>;
    fn join_server(&self) -> Arc<dyn JoinServer>;
    fn identity_server(&self) -> Arc<dyn IdentityServer>;
}

/// Static peer set, for deployments with fixed cluster addresses.
pub struct StaticPeers {
    pub network_server: Arc<dyn NetworkServer>,
    pub join_server: Arc<dyn JoinServer>,
    pub identity_server: Arc<dyn IdentityServer>,
}

impl Peers for StaticPeers {
    fn network_server(&self) -> Arc<dyn NetworkServer> {
        self.network_server.clone()
    }

    fn join_server(&self) -> Arc<dyn JoinServer> {
        self.join_server.clone()
    }

    fn identity_server(&self) -> Arc<dyn IdentityServer> {
        self.identity_server.clone()
    }
}

/// Parses an `Authorization` header value of the form `Key {token}` or
/// `Bearer {token}`.
pub fn parse_authorization(header: &str) -> Result<&str> {
    let mut parts = header.splitn(2, ' ');
    match (parts.next(), parts.next()) {
        (Some("Key") | Some("Bearer"), Some(token)) if !token.is_empty() => Ok(token),
        _ => Err(Error::Unauthenticated),
    }
}
