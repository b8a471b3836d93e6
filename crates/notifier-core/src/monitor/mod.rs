//! Telemetry records and machine events
//!
//! [`MonitorRecord`]s are the human-readable console events the notifier emits
//! for observability. [`MachineEvent`]s flow the other way: they are produced
//! elsewhere in the platform when a dialogue changes and are fanned out to
//! matching subscriptions.

pub mod machine;
pub mod writer;

pub use machine::{MachineEvent, MachineEventKind};
pub use writer::MonitorEventWriter;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Server role that produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MonitorServerType {
    Notifier,
    Proxy,
    Registrar,
    AppServer,
}

/// What a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MonitorEventType {
    Monitor,
    NotifySent,
    NotifierRelay,
    SubscribeAccept,
    SubscribeRenew,
    SubscribeFailed,
    SubscribeAuth,
    NatKeepAlive,
    UnrecognisedMessage,
    Error,
}

/// An immutable telemetry record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorRecord {
    pub server_type: MonitorServerType,
    pub event_type: MonitorEventType,
    pub message: String,
    pub owner: Option<String>,
    pub created: DateTime<Utc>,
}

impl MonitorRecord {
    pub fn new(
        server_type: MonitorServerType,
        event_type: MonitorEventType,
        message: impl Into<String>,
        owner: Option<&str>,
    ) -> Self {
        Self {
            server_type,
            event_type,
            message: message.into(),
            owner: owner.map(str::to_string),
            created: Utc::now(),
        }
    }

    /// Shorthand for records raised by the notifier itself
    pub fn notifier(event_type: MonitorEventType, message: impl Into<String>, owner: Option<&str>) -> Self {
        Self::new(MonitorServerType::Notifier, event_type, message, owner)
    }
}

/// Destination for telemetry records
///
/// Called concurrently from every subscription and request handler, so
/// implementations must be cheap and must not block.
pub trait MonitorSink: Send + Sync {
    fn publish(&self, record: MonitorRecord);
}

/// Sink that writes records to the `tracing` log
#[derive(Debug, Default, Clone)]
pub struct TracingMonitorSink;

impl MonitorSink for TracingMonitorSink {
    fn publish(&self, record: MonitorRecord) {
        info!(
            server = ?record.server_type,
            event = ?record.event_type,
            owner = record.owner.as_deref().unwrap_or("-"),
            "{}",
            record.message
        );
    }
}
