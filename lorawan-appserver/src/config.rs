//! Server configuration.

use std::time::Duration;

/// Which applications get a link to the Network Server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkMode {
    /// Link every application the server learns about: registered
    /// links at startup, others lazily on first use.
    #[default]
    All,
    /// Link only applications with an explicit link record.
    Explicit,
}

/// Link manager settings.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub mode: LinkMode,
    /// First redial delay after a link failure.
    pub backoff_base: Duration,
    /// Upper bound on the redial delay.
    pub backoff_cap: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            mode: LinkMode::default(),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

/// Downlink queue engine settings.
#[derive(Debug, Clone)]
pub struct DownlinkConfig {
    /// Retries of an NS queue RPC on transient failure.
    pub ns_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for DownlinkConfig {
    fn default() -> Self {
        DownlinkConfig { ns_retries: 2, retry_backoff: Duration::from_millis(100) }
    }
}

/// Payload formatter settings.
#[derive(Debug, Clone)]
pub struct FormatterConfig {
    /// Wall-clock deadline for one sandbox run.
    pub deadline: Duration,
}

impl Default for FormatterConfig {
    fn default() -> Self {
        FormatterConfig { deadline: Duration::from_millis(200) }
    }
}

/// Fan-out hub settings.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Outstanding events per subscriber before it is dropped.
    pub subscriber_queue: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        FanoutConfig { subscriber_queue: 16 }
    }
}

/// Webhook dispatcher settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Pending deliveries held in memory; newest drop when full.
    pub queue_size: usize,
    pub workers: usize,
    /// Per-request delivery timeout.
    pub timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        WebhookConfig { queue_size: 1024, workers: 4, timeout: Duration::from_secs(5) }
    }
}

/// Top-level application server configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub link: LinkConfig,
    pub downlink: DownlinkConfig,
    pub formatter: FormatterConfig,
    pub fanout: FanoutConfig,
    pub webhook: WebhookConfig,
}
