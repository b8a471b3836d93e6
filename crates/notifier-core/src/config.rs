//! Notifier configuration
//!
//! The configuration is loaded once at startup and shared read-only as
//! `Arc<NotifierConfig>` through the [`NotifierContext`](crate::NotifierContext).

use std::path::Path;

use serde::Deserialize;

use crate::error::{NotifierError, Result};
use crate::logging::LoggingConfig;
use crate::transport::SipEndPoint;

/// Default subscription lifetime when SUBSCRIBE has no Expires header
pub const DEFAULT_EXPIRY_SECS: u32 = 3600;

/// Upper bound applied to requested subscription lifetimes
pub const MAX_EXPIRY_SECS: u32 = 86400;

/// Cap on dialogues included in a full-state NOTIFY
pub const MAX_DIALOGUES_FOR_NOTIFY: usize = 25;

/// Environment variable prefix for overrides (`SIP_NOTIFIER__MONITOR_LOOPBACK_PORT=...`)
pub const ENV_PREFIX: &str = "SIP_NOTIFIER";

/// Main notifier configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Channels the transport listens on; at least one is mandatory
    pub sip_sockets: Vec<SipEndPoint>,
    /// Loopback port of the local monitoring process, if any
    pub monitor_loopback_port: Option<u16>,
    /// Proxy all outbound requests are sent through, if any
    pub outbound_proxy: Option<SipEndPoint>,
    pub default_expiry: u32,
    pub max_expiry: u32,
    pub max_dialogues_for_notify: usize,
    /// Capacity of the inbound NOTIFY relay queue
    pub relay_queue_capacity: usize,
    pub logging: LoggingConfig,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            sip_sockets: Vec::new(),
            monitor_loopback_port: None,
            outbound_proxy: None,
            default_expiry: DEFAULT_EXPIRY_SECS,
            max_expiry: MAX_EXPIRY_SECS,
            max_dialogues_for_notify: MAX_DIALOGUES_FOR_NOTIFY,
            relay_queue_capacity: 1000,
            logging: LoggingConfig::default(),
        }
    }
}

impl NotifierConfig {
    /// Load configuration from a file (any format the `config` crate
    /// recognises by extension) with environment overrides applied on top.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let config: NotifierConfig = settings.try_deserialize()?;
        Ok(config)
    }

    /// Check the settings a running notifier cannot do without
    pub fn validate(&self) -> Result<()> {
        if self.sip_sockets.is_empty() {
            return Err(NotifierError::startup(
                "The SIP Notifier cannot start without at least one socket specified to listen on",
            ));
        }
        if self.max_dialogues_for_notify == 0 {
            return Err(NotifierError::startup("max_dialogues_for_notify must be greater than zero"));
        }
        if self.relay_queue_capacity == 0 {
            return Err(NotifierError::startup("relay_queue_capacity must be greater than zero"));
        }
        Ok(())
    }

    /// Lifetime granted for a requested Expires value
    pub fn granted_expiry(&self, requested: Option<u32>) -> u32 {
        requested.unwrap_or(self.default_expiry).min(self.max_expiry)
    }
}
