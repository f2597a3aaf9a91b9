//! Transports bridging applications to the server: streaming RPC,
//! the MQTT frontend and outbound webhooks.

pub mod mqtt;
pub mod rpc;
pub mod web;
